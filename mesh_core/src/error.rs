//! Error types for the coordination layer.

use std::time::Duration;
use thiserror::Error;
use world_engine::WorldError;

use crate::config::ConfigError;
use crate::policy::DenyReason;

/// Errors returned by mesh operations.
///
/// The first three kinds are synchronous rejections (nothing happened); the
/// rest describe work that was attempted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MeshError {
    /// Malformed request or unknown enum value. Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown node, job, or entity ID.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The policy gate refused the request.
    #[error("policy denied: {0}")]
    PolicyDenied(DenyReason),

    /// The network client is disconnected; dependents fail fast.
    #[error("not connected: {0}")]
    Connectivity(String),

    /// A remote dispatch exceeded its deadline.
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// A remote dispatch reached the node and failed there.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    World(WorldError),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl MeshError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        MeshError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Connectivity(_) | MeshError::ExecutionTimeout(_) | MeshError::Execution(_)
        )
    }
}

impl From<WorldError> for MeshError {
    fn from(e: WorldError) -> Self {
        match e {
            WorldError::EntityNotFound(id) => MeshError::not_found("entity", id),
            WorldError::ComponentNotFound {
                entity_id,
                component_type,
            } => MeshError::not_found("component", format!("{entity_id}/{component_type}")),
            WorldError::Invalid(msg) => MeshError::Validation(msg),
            other => MeshError::World(other),
        }
    }
}

impl From<ConfigError> for MeshError {
    fn from(e: ConfigError) -> Self {
        MeshError::Config(e.to_string())
    }
}

pub type Result<T, E = MeshError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use world_engine::{ComponentType, EntityId};

    #[test]
    fn test_world_not_found_maps_to_not_found() {
        let id = EntityId::new();
        let err: MeshError = WorldError::EntityNotFound(id).into();
        assert_eq!(err, MeshError::not_found("entity", id));

        let err: MeshError = WorldError::ComponentNotFound {
            entity_id: id,
            component_type: ComponentType::new("health"),
        }
        .into();
        assert!(matches!(err, MeshError::NotFound { kind: "component", .. }));
    }

    #[test]
    fn test_world_invalid_maps_to_validation() {
        let err: MeshError = WorldError::Invalid("empty entity type".into()).into();
        assert_eq!(err, MeshError::Validation("empty entity type".into()));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(MeshError::Connectivity("down".into()).is_retryable());
        assert!(MeshError::ExecutionTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!MeshError::Validation("bad".into()).is_retryable());
        assert!(!MeshError::not_found("job", "x").is_retryable());
    }
}
