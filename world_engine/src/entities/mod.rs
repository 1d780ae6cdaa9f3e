//! Entity definitions for the world state.

mod components;

pub use components::*;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::time::Timestamp;

/// Unique identifier for all entities in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Create a new random entity ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an entity ID from a specific UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a world region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub String);

impl RegionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An identity in the world. Data lives in components, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,

    /// Free-form classification ("npc", "settlement", ...), indexed for queries.
    pub entity_type: String,

    pub region: RegionId,

    /// Inactive entities stay queryable but systems may skip them.
    pub active: bool,

    /// Component types currently attached.
    pub components: BTreeSet<ComponentType>,

    pub created_at: Timestamp,

    /// Bumped on every change to the entity or its components; drives last-write-wins.
    pub updated_at: Timestamp,
}

impl Entity {
    /// Create a new active entity with no components.
    pub fn new(entity_type: impl Into<String>, region: RegionId, now: Timestamp) -> Self {
        Self {
            id: EntityId::new(),
            entity_type: entity_type.into(),
            region,
            active: true,
            components: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Use a specific ID (replicas, imports).
    pub fn with_id(mut self, id: EntityId) -> Self {
        self.id = id;
        self
    }

    /// Check if the entity has a component of the given type.
    pub fn has_component(&self, component_type: &ComponentType) -> bool {
        self.components.contains(component_type)
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
