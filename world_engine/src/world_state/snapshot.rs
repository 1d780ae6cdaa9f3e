//! Serializable snapshots for checkpointing, replica bootstrap, and backend sync.

use serde::{Deserialize, Serialize};

use crate::entities::{Component, Entity, RegionId};
use crate::time::Timestamp;

/// One entity with all of its components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: Entity,
    pub components: Vec<Component>,
}

/// Full world export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub taken_at: Timestamp,
    pub entities: Vec<EntitySnapshot>,
}

impl WorldSnapshot {
    /// Serialize to JSON for checkpoint files.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a checkpoint produced by [`WorldSnapshot::to_json`].
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// All entities of one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub region: RegionId,
    pub taken_at: Timestamp,
    pub entities: Vec<EntitySnapshot>,
}

/// Outcome of merging remote snapshots into the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Entities that did not exist locally.
    pub inserted: usize,
    /// Local entities replaced by a newer remote version.
    pub updated: usize,
    /// Remote entities that lost last-write-wins (or hit a newer local tombstone).
    pub skipped: usize,
}
