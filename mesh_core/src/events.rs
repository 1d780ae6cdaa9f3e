//! Push/subscribe channel for status and job-lifecycle events.
//!
//! Backed by a `tokio::sync::broadcast` channel. Every subscriber sees every
//! event published after it subscribed, unless it lags behind the channel
//! capacity, in which case the oldest events are dropped for that subscriber.
//! There is no ordering guarantee across event kinds beyond publish order.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use world_engine::{MergeReport, Timestamp};

use crate::orchestrator::{JobId, JobType};
use crate::registry::{NodeId, NodeStatus};

const DEFAULT_CAPACITY: usize = 1024;

/// Events published by the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    Connected,
    Disconnected {
        reason: String,
    },
    NodeRegistered {
        node_id: NodeId,
        service_type: String,
    },
    NodeStatusChanged {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
    NodeReaped {
        node_id: NodeId,
    },
    JobSubmitted {
        job_id: JobId,
        job_type: JobType,
        priority: i32,
    },
    JobStarted {
        job_id: JobId,
        node_id: NodeId,
        attempt: u32,
    },
    JobRetrying {
        job_id: JobId,
        retry_count: u32,
        error: String,
    },
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        error: String,
    },
    WorldSynced {
        at: Timestamp,
        report: MergeReport,
    },
}

impl MeshEvent {
    /// Short event kind name, used for logging and subscriber filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::Connected => "connected",
            MeshEvent::Disconnected { .. } => "disconnected",
            MeshEvent::NodeRegistered { .. } => "node_registered",
            MeshEvent::NodeStatusChanged { .. } => "node_status_changed",
            MeshEvent::NodeReaped { .. } => "node_reaped",
            MeshEvent::JobSubmitted { .. } => "job_submitted",
            MeshEvent::JobStarted { .. } => "job_started",
            MeshEvent::JobRetrying { .. } => "job_retrying",
            MeshEvent::JobCompleted { .. } => "job_completed",
            MeshEvent::JobFailed { .. } => "job_failed",
            MeshEvent::WorldSynced { .. } => "world_synced",
        }
    }
}

/// Cloneable publisher handle for [`MeshEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: MeshEvent) {
        trace!(kind = event.kind(), "publishing mesh event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
