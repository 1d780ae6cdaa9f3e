//! Node records and their lifecycle states.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use world_engine::Timestamp;

use crate::error::{MeshError, Result};

/// Unique identifier for a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Liveness state of a node.
///
/// `Active → Degraded → Unreachable → Reaped`. A fresh heartbeat returns
/// Degraded or Unreachable nodes to Active; Reaped is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Degraded,
    Unreachable,
    Reaped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Active => "active",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

/// What a node says about itself when it heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    #[default]
    Healthy,
    /// Alive but asking not to receive new work.
    Degraded,
}

/// A liveness update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub status: ReportedStatus,
    /// Opaque "higher is healthier" score supplied by the node.
    #[serde(default)]
    pub health_score: Option<f64>,
}

impl Heartbeat {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn degraded() -> Self {
        Self {
            status: ReportedStatus::Degraded,
            health_score: None,
        }
    }

    pub fn with_health_score(mut self, score: f64) -> Self {
        self.health_score = Some(score);
        self
    }
}

/// What a node submits to register itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub service_type: String,
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NodeDescriptor {
    pub fn new(service_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            endpoint: endpoint.into(),
            capabilities: BTreeSet::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Registration identity. Re-registering the same identity updates the
    /// existing node instead of creating another.
    pub fn identity(&self) -> (String, String) {
        (self.service_type.clone(), self.endpoint.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_type.trim().is_empty() {
            return Err(MeshError::Validation("service_type must not be empty".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(MeshError::Validation("endpoint must not be empty".into()));
        }
        if self.capabilities.is_empty() {
            return Err(MeshError::Validation(
                "at least one capability is required".into(),
            ));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(MeshError::Validation("capabilities must not be empty".into()));
        }
        Ok(())
    }
}

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub service_type: String,
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    pub status: NodeStatus,
    pub last_heartbeat: Timestamp,
    pub registered_at: Timestamp,
    pub reported: ReportedStatus,
    pub health_score: Option<f64>,
    /// When the node was first seen Unreachable in its current silence.
    pub unreachable_since: Option<Timestamp>,
}

impl Node {
    pub(crate) fn register(id: NodeId, descriptor: NodeDescriptor, now: Timestamp) -> Self {
        Self {
            id,
            service_type: descriptor.service_type,
            endpoint: descriptor.endpoint,
            capabilities: descriptor.capabilities,
            metadata: descriptor.metadata,
            status: NodeStatus::Active,
            last_heartbeat: now,
            registered_at: now,
            reported: ReportedStatus::Healthy,
            health_score: None,
            unreachable_since: None,
        }
    }

    /// Replace advertised capabilities and metadata; counts as a heartbeat.
    pub(crate) fn refresh(&mut self, descriptor: NodeDescriptor, now: Timestamp) {
        self.capabilities = descriptor.capabilities;
        self.metadata = descriptor.metadata;
        self.record_heartbeat(Heartbeat::healthy(), now);
    }

    /// Record a heartbeat. Timestamps never move backwards.
    pub(crate) fn record_heartbeat(&mut self, heartbeat: Heartbeat, now: Timestamp) {
        self.last_heartbeat = self.last_heartbeat.max(now);
        self.reported = heartbeat.status;
        if heartbeat.health_score.is_some() {
            self.health_score = heartbeat.health_score;
        }
        self.unreachable_since = None;
        self.status = match self.reported {
            ReportedStatus::Healthy => NodeStatus::Active,
            ReportedStatus::Degraded => NodeStatus::Degraded,
        };
    }

    /// Whether the node has gone quiet for longer than `window`.
    pub fn is_stale(&self, now: Timestamp, window: std::time::Duration) -> bool {
        now.saturating_since(self.last_heartbeat) > window
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Discovery query. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
}

impl NodeFilter {
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.service_type
            .as_deref()
            .map_or(true, |s| node.service_type == s)
            && self
                .capability
                .as_deref()
                .map_or(true, |c| node.has_capability(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor::new("worker", "node-a").with_capability("maintenance")
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(descriptor().validate().is_ok());
        assert!(NodeDescriptor::new("", "node-a")
            .with_capability("x")
            .validate()
            .is_err());
        assert!(NodeDescriptor::new("worker", " ")
            .with_capability("x")
            .validate()
            .is_err());
        assert!(NodeDescriptor::new("worker", "node-a").validate().is_err());
    }

    #[test]
    fn test_heartbeat_is_monotonic() {
        let mut node = Node::register(NodeId::new(), descriptor(), Timestamp::from_millis(500));
        node.record_heartbeat(Heartbeat::healthy(), Timestamp::from_millis(100));
        assert_eq!(node.last_heartbeat, Timestamp::from_millis(500));
        node.record_heartbeat(Heartbeat::healthy(), Timestamp::from_millis(900));
        assert_eq!(node.last_heartbeat, Timestamp::from_millis(900));
    }

    #[test]
    fn test_reported_degraded_sets_status() {
        let mut node = Node::register(NodeId::new(), descriptor(), Timestamp::from_millis(0));
        node.record_heartbeat(
            Heartbeat::degraded().with_health_score(0.4),
            Timestamp::from_millis(10),
        );
        assert_eq!(node.status, NodeStatus::Degraded);
        assert_eq!(node.health_score, Some(0.4));

        node.record_heartbeat(Heartbeat::healthy(), Timestamp::from_millis(20));
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.health_score, Some(0.4));
    }

    #[test]
    fn test_filter_matches() {
        let node = Node::register(NodeId::new(), descriptor(), Timestamp::from_millis(0));
        assert!(NodeFilter::default().matches(&node));
        assert!(NodeFilter::default().with_capability("maintenance").matches(&node));
        assert!(!NodeFilter::default().with_capability("spawn").matches(&node));
        assert!(!NodeFilter::default().with_service_type("gateway").matches(&node));
    }
}
