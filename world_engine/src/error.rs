//! Error types for the world engine.

use thiserror::Error;

use crate::entities::{ComponentType, EntityId};

/// World store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("component {component_type} not found on entity {entity_id}")]
    ComponentNotFound {
        entity_id: EntityId,
        component_type: ComponentType,
    },

    #[error("component {component_type} already attached to entity {entity_id}")]
    ComponentExists {
        entity_id: EntityId,
        component_type: ComponentType,
    },

    #[error("entity already exists: {0}")]
    EntityExists(EntityId),

    #[error("invalid input: {0}")]
    Invalid(String),

    /// Store indices disagree with the primary maps. Always a programming error.
    #[error("world invariant violated: {0}")]
    InvariantViolation(String),
}

impl WorldError {
    /// Whether the error means "the thing you asked for does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WorldError::EntityNotFound(_) | WorldError::ComponentNotFound { .. }
        )
    }
}

/// Errors raised while pulling from or pushing to the authoritative backend.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error(transparent)]
    World(#[from] WorldError),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Malformed(e.to_string())
    }
}
