//! Component records attached to entities.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EntityId;
use crate::time::Timestamp;

/// Name of a component kind ("position", "health", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentType(pub String);

impl ComponentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Typed data attached to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub entity_id: EntityId,
    pub component_type: ComponentType,

    /// Field map; updates merge into it.
    pub data: Map<String, Value>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Component {
    /// Create a component from a JSON value.
    ///
    /// Non-object values are stored under a single `"value"` field so that later
    /// merges still have named fields to work with.
    pub fn new(
        entity_id: EntityId,
        component_type: ComponentType,
        data: Value,
        now: Timestamp,
    ) -> Self {
        Self {
            entity_id,
            component_type,
            data: into_fields(data),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge supplied fields into this component.
    ///
    /// Top-level fields in `patch` overwrite existing ones; fields not present
    /// in `patch` are preserved.
    pub fn merge(&mut self, patch: Value, now: Timestamp) {
        for (key, value) in into_fields(patch) {
            self.data.insert(key, value);
        }
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Get a single field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

fn into_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
