//! Node registry and heartbeat-based health mesh.
//!
//! Nodes register with a descriptor and keep themselves alive with
//! heartbeats. A periodic sweep walks the health state machine:
//!
//! ```text
//! Active --1 missed window--> Degraded --N missed--> Unreachable --grace--> Reaped
//!    ^                           |                        |
//!    +-------- heartbeat --------+------------------------+
//! ```
//!
//! Reaped nodes are removed; a later registration with the same identity
//! gets a fresh node ID.

mod health;
mod node;

pub use health::*;
pub use node::*;

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use world_engine::{SharedClock, Timestamp};

use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};
use crate::shard::ShardedMap;

/// Heartbeats older than this many intervals exclude a node from discovery.
const DISCOVERY_WINDOWS: u32 = 3;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub degraded: usize,
    pub unreachable: usize,
    pub reaped: usize,
}

/// Directory of service instances and their liveness.
pub struct NodeRegistry {
    nodes: ShardedMap<NodeId, Node>,
    identities: ShardedMap<(String, String), NodeId>,
    health: RwLock<MeshHealth>,
    config: RegistryConfig,
    clock: SharedClock,
    events: EventBus,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig, clock: SharedClock, events: EventBus) -> Self {
        Self {
            nodes: ShardedMap::default(),
            identities: ShardedMap::default(),
            health: RwLock::new(MeshHealth::default()),
            config,
            clock,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Maximum heartbeat age for a node to be discoverable.
    pub fn discovery_window(&self) -> Duration {
        self.config.heartbeat_interval() * DISCOVERY_WINDOWS
    }

    /// Register a node, or refresh the existing one with the same
    /// `(service_type, endpoint)` identity.
    pub fn register(&self, descriptor: NodeDescriptor) -> Result<NodeId> {
        descriptor.validate()?;
        let now = self.clock.now();
        let service_type = descriptor.service_type.clone();

        let (id, created) = self.identities.update(descriptor.identity(), |slot| {
            let id = *slot.get_or_insert_with(NodeId::new);
            let created = self.nodes.update(id, |node| match node {
                Some(existing) => {
                    existing.refresh(descriptor, now);
                    false
                }
                None => {
                    *node = Some(Node::register(id, descriptor, now));
                    true
                }
            });
            (id, created)
        });

        if created {
            info!(node_id = %id, service_type = %service_type, "node registered");
            self.events.publish(MeshEvent::NodeRegistered {
                node_id: id,
                service_type,
            });
        } else {
            debug!(node_id = %id, "node re-registered, metadata refreshed");
        }
        self.recompute_health();
        Ok(id)
    }

    /// Record a heartbeat and return the node's resulting status.
    pub fn heartbeat(&self, id: NodeId, heartbeat: Heartbeat) -> Result<NodeStatus> {
        let now = self.clock.now();
        let (from, to) = self
            .nodes
            .modify(&id, |node| {
                let from = node.status;
                node.record_heartbeat(heartbeat, now);
                (from, node.status)
            })
            .ok_or_else(|| MeshError::not_found("node", id))?;

        if from != to {
            self.status_changed(id, from, to);
        }
        self.recompute_health();
        Ok(to)
    }

    /// Active nodes with a recent heartbeat matching `filter`, oldest
    /// registration first.
    pub fn discover(&self, filter: &NodeFilter) -> Vec<Node> {
        let now = self.clock.now();
        let window = self.discovery_window();
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .filter(|n| !n.is_stale(now, window))
            .filter(|n| filter.matches(n))
            .collect();
        nodes.sort_by_key(|n| (n.registered_at, n.id));
        nodes
    }

    pub fn get(&self, id: NodeId) -> Result<Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| MeshError::not_found("node", id))
    }

    /// Every registered node regardless of status.
    pub fn list(&self) -> Vec<Node> {
        let mut nodes = self.nodes.values();
        nodes.sort_by_key(|n| (n.registered_at, n.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Remove a node voluntarily.
    pub fn deregister(&self, id: NodeId) -> Result<Node> {
        let node = self.get(id)?;
        let removed = self.identities.update(
            (node.service_type.clone(), node.endpoint.clone()),
            |slot| {
                if *slot == Some(id) {
                    *slot = None;
                }
                self.nodes.remove(&id)
            },
        );
        let node = removed.ok_or_else(|| MeshError::not_found("node", id))?;
        info!(node_id = %id, "node deregistered");
        self.recompute_health();
        Ok(node)
    }

    /// Walk every node through the health state machine.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut doomed = Vec::new();

        for id in self.nodes.values().into_iter().map(|n| n.id) {
            let Some((from, to, reap)) = self.nodes.modify(&id, |node| self.evaluate(node, now))
            else {
                continue;
            };
            if from != to {
                match to {
                    NodeStatus::Degraded => report.degraded += 1,
                    NodeStatus::Unreachable => report.unreachable += 1,
                    _ => {}
                }
                self.status_changed(id, from, to);
            }
            if reap {
                doomed.push(id);
            }
        }

        for id in doomed {
            if self.reap(id, now) {
                report.reaped += 1;
            }
        }

        self.recompute_health();
        if report != SweepReport::default() {
            debug!(
                degraded = report.degraded,
                unreachable = report.unreachable,
                reaped = report.reaped,
                "registry sweep"
            );
        }
        report
    }

    /// Current aggregate health. Read-only; recomputed on every mutation.
    pub fn health(&self) -> MeshHealth {
        self.health
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            sweep_interval_ms = self.config.sweep_interval_ms,
            "registry sweeper started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.sweep();
                }
            }
        }
        info!("registry sweeper stopped");
    }

    /// Returns `(from, to, reap)` after applying the silence rules to `node`.
    fn evaluate(&self, node: &mut Node, now: Timestamp) -> (NodeStatus, NodeStatus, bool) {
        let from = node.status;
        let interval = self.config.heartbeat_interval().as_millis().max(1);
        let silent = now.saturating_since(node.last_heartbeat).as_millis();
        let missed = u32::try_from(silent / interval).unwrap_or(u32::MAX);

        if missed >= self.config.unreachable_after_missed {
            match node.unreachable_since {
                None => {
                    node.status = NodeStatus::Unreachable;
                    node.unreachable_since = Some(now);
                }
                Some(since) => {
                    node.status = NodeStatus::Unreachable;
                    if now.saturating_since(since) >= self.config.reap_grace() {
                        return (from, node.status, true);
                    }
                }
            }
        } else if missed >= 1 && node.status == NodeStatus::Active {
            node.status = NodeStatus::Degraded;
        }
        (from, node.status, false)
    }

    /// Remove a node that is still past its grace period. A heartbeat that
    /// raced in between evaluation and removal keeps it alive.
    fn reap(&self, id: NodeId, now: Timestamp) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let grace = self.config.reap_grace();
        let removed = self.identities.update(
            (node.service_type.clone(), node.endpoint.clone()),
            |slot| {
                let removed = self.nodes.update(id, |entry| {
                    let expired = entry.as_ref().is_some_and(|n| {
                        n.status == NodeStatus::Unreachable
                            && n.unreachable_since
                                .is_some_and(|since| now.saturating_since(since) >= grace)
                    });
                    if expired {
                        entry.take()
                    } else {
                        None
                    }
                });
                if removed.is_some() && *slot == Some(id) {
                    *slot = None;
                }
                removed
            },
        );

        match removed {
            Some(_) => {
                warn!(node_id = %id, "node reaped after prolonged silence");
                self.status_changed(id, NodeStatus::Unreachable, NodeStatus::Reaped);
                self.events.publish(MeshEvent::NodeReaped { node_id: id });
                true
            }
            None => false,
        }
    }

    fn status_changed(&self, id: NodeId, from: NodeStatus, to: NodeStatus) {
        match to {
            NodeStatus::Active => info!(node_id = %id, %from, "node recovered"),
            _ => warn!(node_id = %id, %from, %to, "node status changed"),
        }
        self.events
            .publish(MeshEvent::NodeStatusChanged { node_id: id, from, to });
    }

    fn recompute_health(&self) {
        let health = MeshHealth::compute(&self.nodes.values());
        *self
            .health
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = health;
    }
}
