//! Aggregate health of the node mesh.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::node::{Node, NodeStatus};

/// Read-only summary recomputed after every registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshHealth {
    pub total: usize,
    pub active: usize,
    pub degraded: usize,
    pub unreachable: usize,
    /// Distinct capabilities offered by Active nodes.
    pub active_capabilities: usize,
    /// Distinct capabilities offered by all registered nodes.
    pub known_capabilities: usize,
    /// `active / total`, weighted by the share of capabilities still served.
    pub score: f64,
    /// Mean of node-reported scores, if any node reports one. Opaque; higher is healthier.
    pub coherence: Option<f64>,
}

impl MeshHealth {
    pub fn compute<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let mut health = MeshHealth::default();
        let mut known = BTreeSet::new();
        let mut served = BTreeSet::new();
        let mut scores = Vec::new();

        for node in nodes {
            health.total += 1;
            known.extend(node.capabilities.iter().map(String::as_str));
            match node.status {
                NodeStatus::Active => {
                    health.active += 1;
                    served.extend(node.capabilities.iter().map(String::as_str));
                }
                NodeStatus::Degraded => health.degraded += 1,
                NodeStatus::Unreachable => health.unreachable += 1,
                NodeStatus::Reaped => {}
            }
            if let Some(score) = node.health_score.filter(|s| s.is_finite()) {
                scores.push(score);
            }
        }

        health.known_capabilities = known.len();
        health.active_capabilities = served.len();
        if health.total > 0 && health.known_capabilities > 0 {
            let liveness = health.active as f64 / health.total as f64;
            let diversity = health.active_capabilities as f64 / health.known_capabilities as f64;
            health.score = liveness * diversity;
        }
        if !scores.is_empty() {
            health.coherence = Some(scores.iter().sum::<f64>() / scores.len() as f64);
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeDescriptor, NodeId};
    use world_engine::Timestamp;

    fn node(caps: &[&str], status: NodeStatus) -> Node {
        let descriptor = caps
            .iter()
            .fold(NodeDescriptor::new("worker", "ep"), |d, c| d.with_capability(*c));
        let mut node = Node::register(NodeId::new(), descriptor, Timestamp::from_millis(0));
        node.status = status;
        node
    }

    #[test]
    fn test_empty_mesh_scores_zero() {
        let health = MeshHealth::compute(std::iter::empty());
        assert_eq!(health.score, 0.0);
        assert_eq!(health.coherence, None);
    }

    #[test]
    fn test_score_weights_capability_diversity() {
        let nodes = vec![
            node(&["a"], NodeStatus::Active),
            node(&["b"], NodeStatus::Unreachable),
        ];
        let health = MeshHealth::compute(&nodes);
        assert_eq!(health.active, 1);
        assert_eq!(health.known_capabilities, 2);
        assert_eq!(health.active_capabilities, 1);
        assert!((health.score - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_redundant_nodes_keep_diversity() {
        let nodes = vec![
            node(&["a"], NodeStatus::Active),
            node(&["a"], NodeStatus::Degraded),
        ];
        let health = MeshHealth::compute(&nodes);
        assert!((health.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_coherence_is_mean_of_reported_scores() {
        let mut a = node(&["a"], NodeStatus::Active);
        a.health_score = Some(0.2);
        let mut b = node(&["a"], NodeStatus::Active);
        b.health_score = Some(0.6);
        let health = MeshHealth::compute(&[a, b]);
        assert!((health.coherence.unwrap() - 0.4).abs() < 1e-9);
    }
}
