//! World state management - the entity/component store and its indices.

mod snapshot;

pub use snapshot::*;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::entities::{Component, ComponentType, Entity, EntityId, RegionId};
use crate::error::WorldError;
use crate::time::{system_clock, SharedClock, Timestamp};

/// World state shared between the tick loop, the sync worker, and request handlers.
pub type SharedWorld = Arc<RwLock<WorldState>>;

/// The complete entity/component state of the world.
///
/// Components are stored per type, so the per-type map doubles as the
/// "entities with component X" index. Entity type and region have their own
/// reverse indices. Every mutation keeps all four structures in step; a
/// component is never stored for an entity that is not in `entities`.
#[derive(Debug)]
pub struct WorldState {
    clock: SharedClock,

    /// All live entities by ID.
    entities: HashMap<EntityId, Entity>,

    /// Component type -> (entity -> component).
    components: HashMap<ComponentType, HashMap<EntityId, Component>>,

    /// Index: entity type -> entities.
    by_type: HashMap<String, HashSet<EntityId>>,

    /// Index: region -> entities.
    by_region: HashMap<RegionId, HashSet<EntityId>>,

    /// Destroyed entities and when, so an older remote copy cannot resurrect them.
    tombstones: HashMap<EntityId, Timestamp>,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl WorldState {
    /// Create a new empty world state on the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty world state on the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            entities: HashMap::new(),
            components: HashMap::new(),
            by_type: HashMap::new(),
            by_region: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// Wrap this state for sharing across tasks.
    pub fn into_shared(self) -> SharedWorld {
        Arc::new(RwLock::new(self))
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Create an active entity of the given type in a region.
    pub fn create_entity(
        &mut self,
        entity_type: impl Into<String>,
        region: RegionId,
    ) -> Result<EntityId, WorldError> {
        let entity_type = entity_type.into();
        if entity_type.trim().is_empty() {
            return Err(WorldError::Invalid("entity type must not be empty".into()));
        }
        if region.as_str().trim().is_empty() {
            return Err(WorldError::Invalid("region must not be empty".into()));
        }

        let entity = Entity::new(entity_type, region, self.now());
        let id = entity.id;
        self.index_entity(&entity);
        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Destroy an entity together with every attached component.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<EntitySnapshot, WorldError> {
        let entity = self
            .entities
            .remove(&id)
            .ok_or(WorldError::EntityNotFound(id))?;

        let now = self.now();
        self.unindex_entity(&entity);
        let components = self.detach_all(&entity);
        self.tombstones.insert(id, now);

        Ok(EntitySnapshot { entity, components })
    }

    /// Create several entities in one region, each with its initial components.
    ///
    /// Every entry is checked before the first entity is created: either all
    /// of them land or none do.
    pub fn spawn_entities(
        &mut self,
        region: RegionId,
        entries: Vec<(String, Vec<(ComponentType, Value)>)>,
    ) -> Result<Vec<EntityId>, WorldError> {
        if region.as_str().trim().is_empty() {
            return Err(WorldError::Invalid("region must not be empty".into()));
        }
        for (index, (entity_type, components)) in entries.iter().enumerate() {
            if entity_type.trim().is_empty() {
                return Err(WorldError::Invalid(format!(
                    "entity type must not be empty (entry {index})"
                )));
            }
            let mut types = HashSet::new();
            for (component_type, _) in components {
                if !types.insert(component_type) {
                    return Err(WorldError::Invalid(format!(
                        "component {component_type} listed twice (entry {index})"
                    )));
                }
            }
        }

        let now = self.now();
        let mut ids = Vec::with_capacity(entries.len());
        for (entity_type, components) in entries {
            let mut entity = Entity::new(entity_type, region.clone(), now);
            let id = entity.id;
            for (component_type, data) in components {
                entity.components.insert(component_type.clone());
                self.components
                    .entry(component_type.clone())
                    .or_default()
                    .insert(id, Component::new(id, component_type, data, now));
            }
            self.index_entity(&entity);
            self.entities.insert(id, entity);
            ids.push(id);
        }
        Ok(ids)
    }

    /// Drop tombstones recorded before `before`. Returns how many were dropped.
    ///
    /// Remote copies older than a dropped tombstone are no longer recognised
    /// as stale, so the cutoff must trail the slowest replica.
    pub fn prune_tombstones(&mut self, before: Timestamp) -> usize {
        let len = self.tombstones.len();
        self.tombstones.retain(|_, deleted_at| *deleted_at >= before);
        len - self.tombstones.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Get entity by ID.
    pub fn get_entity(&self, id: EntityId) -> Result<&Entity, WorldError> {
        self.entities.get(&id).ok_or(WorldError::EntityNotFound(id))
    }

    /// Mark an entity active or inactive.
    pub fn set_active(&mut self, id: EntityId, active: bool) -> Result<(), WorldError> {
        let now = self.now();
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::EntityNotFound(id))?;
        if entity.active != active {
            entity.active = active;
            entity.touch(now);
        }
        Ok(())
    }

    /// Activate every entity in a region. Returns how many changed state.
    pub fn activate_region(&mut self, region: &RegionId) -> usize {
        let now = self.now();
        let ids: Vec<EntityId> = self.entities_by_region(region);
        let mut changed = 0;
        for id in ids {
            if let Some(entity) = self.entities.get_mut(&id) {
                if !entity.active {
                    entity.active = true;
                    entity.touch(now);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Iterate over all entities.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// Attach a new component to an entity.
    pub fn add_component(
        &mut self,
        id: EntityId,
        component_type: ComponentType,
        data: Value,
    ) -> Result<(), WorldError> {
        let now = self.now();
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::EntityNotFound(id))?;
        if entity.components.contains(&component_type) {
            return Err(WorldError::ComponentExists {
                entity_id: id,
                component_type,
            });
        }

        entity.components.insert(component_type.clone());
        entity.touch(now);
        self.components
            .entry(component_type.clone())
            .or_default()
            .insert(id, Component::new(id, component_type, data, now));
        Ok(())
    }

    /// Detach a component from an entity.
    pub fn remove_component(
        &mut self,
        id: EntityId,
        component_type: &ComponentType,
    ) -> Result<Component, WorldError> {
        let now = self.now();
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::EntityNotFound(id))?;

        let removed = self
            .components
            .get_mut(component_type)
            .and_then(|store| store.remove(&id))
            .ok_or_else(|| WorldError::ComponentNotFound {
                entity_id: id,
                component_type: component_type.clone(),
            })?;

        entity.components.remove(component_type);
        entity.touch(now);
        if self
            .components
            .get(component_type)
            .is_some_and(|store| store.is_empty())
        {
            self.components.remove(component_type);
        }
        Ok(removed)
    }

    /// Merge fields into an existing component, preserving fields not supplied.
    pub fn update_component(
        &mut self,
        id: EntityId,
        component_type: &ComponentType,
        patch: Value,
    ) -> Result<&Component, WorldError> {
        let now = self.now();
        let entity = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::EntityNotFound(id))?;

        let component = self
            .components
            .get_mut(component_type)
            .and_then(|store| store.get_mut(&id))
            .ok_or_else(|| WorldError::ComponentNotFound {
                entity_id: id,
                component_type: component_type.clone(),
            })?;

        component.merge(patch, now);
        entity.touch(now);
        Ok(component)
    }

    /// Get a component of an entity.
    pub fn get_component(
        &self,
        id: EntityId,
        component_type: &ComponentType,
    ) -> Result<&Component, WorldError> {
        if !self.entities.contains_key(&id) {
            return Err(WorldError::EntityNotFound(id));
        }
        self.components
            .get(component_type)
            .and_then(|store| store.get(&id))
            .ok_or_else(|| WorldError::ComponentNotFound {
                entity_id: id,
                component_type: component_type.clone(),
            })
    }

    /// Get every component attached to an entity.
    pub fn components_of(&self, id: EntityId) -> Result<Vec<&Component>, WorldError> {
        let entity = self.get_entity(id)?;
        Ok(entity
            .components
            .iter()
            .filter_map(|ty| self.components.get(ty).and_then(|store| store.get(&id)))
            .collect())
    }

    pub fn component_count(&self) -> usize {
        self.components.values().map(HashMap::len).sum()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Entities that have a component of the given type.
    pub fn entities_with_component(&self, component_type: &ComponentType) -> Vec<EntityId> {
        sorted(
            self.components
                .get(component_type)
                .map(|store| store.keys().copied().collect())
                .unwrap_or_default(),
        )
    }

    /// Entities that have every one of the given component types.
    ///
    /// An empty type list matches every entity.
    pub fn entities_with_components(&self, component_types: &[ComponentType]) -> Vec<EntityId> {
        if component_types.is_empty() {
            return sorted(self.entities.keys().copied().collect());
        }

        let mut stores = Vec::with_capacity(component_types.len());
        for ty in component_types {
            match self.components.get(ty) {
                Some(store) => stores.push(store),
                None => return Vec::new(),
            }
        }
        // Drive the intersection from the smallest store.
        stores.sort_by_key(|store| store.len());
        let Some((smallest, rest)) = stores.split_first() else {
            return Vec::new();
        };

        sorted(
            smallest
                .keys()
                .filter(|id| rest.iter().all(|other| other.contains_key(id)))
                .copied()
                .collect(),
        )
    }

    /// Entities of the given type.
    pub fn entities_by_type(&self, entity_type: &str) -> Vec<EntityId> {
        sorted(
            self.by_type
                .get(entity_type)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
        )
    }

    /// Entities located in the given region.
    pub fn entities_by_region(&self, region: &RegionId) -> Vec<EntityId> {
        sorted(
            self.by_region
                .get(region)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
        )
    }

    // ------------------------------------------------------------------
    // Snapshots and replication
    // ------------------------------------------------------------------

    /// Snapshot a single entity with its components.
    pub fn snapshot_entity(&self, id: EntityId) -> Result<EntitySnapshot, WorldError> {
        let entity = self.get_entity(id)?.clone();
        let components = self
            .components_of(id)?
            .into_iter()
            .cloned()
            .collect();
        Ok(EntitySnapshot { entity, components })
    }

    /// Snapshot every entity in a region.
    pub fn region_snapshot(&self, region: &RegionId) -> RegionSnapshot {
        RegionSnapshot {
            region: region.clone(),
            taken_at: self.now(),
            entities: self
                .entities_by_region(region)
                .into_iter()
                .filter_map(|id| self.snapshot_entity(id).ok())
                .collect(),
        }
    }

    /// Export the full world for checkpointing or replica bootstrap.
    pub fn export(&self) -> WorldSnapshot {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        WorldSnapshot {
            taken_at: self.now(),
            entities: ids
                .into_iter()
                .filter_map(|id| self.snapshot_entity(id).ok())
                .collect(),
        }
    }

    /// Replace the local state wholesale with a snapshot.
    pub fn import(&mut self, snapshot: WorldSnapshot) -> Result<(), WorldError> {
        let mut entries = Vec::with_capacity(snapshot.entities.len());
        let mut seen = HashSet::new();
        for entry in snapshot.entities {
            let entry = normalize(entry)?;
            if !seen.insert(entry.entity.id) {
                return Err(WorldError::EntityExists(entry.entity.id));
            }
            entries.push(entry);
        }

        self.entities.clear();
        self.components.clear();
        self.by_type.clear();
        self.by_region.clear();
        self.tombstones.clear();
        for entry in entries {
            self.insert_snapshot(entry);
        }
        Ok(())
    }

    /// Upsert remote entities by ID; the newer `updated_at` wins.
    ///
    /// Ties keep the local copy. A remote entity older than a local tombstone
    /// is skipped.
    ///
    /// The whole batch is validated before anything is applied, so a malformed
    /// entry leaves the local state untouched.
    pub fn merge_remote(&mut self, remote: Vec<EntitySnapshot>) -> Result<MergeReport, WorldError> {
        let mut entries = Vec::with_capacity(remote.len());
        let mut seen = HashSet::new();
        for entry in remote {
            let entry = normalize(entry)?;
            if !seen.insert(entry.entity.id) {
                return Err(WorldError::EntityExists(entry.entity.id));
            }
            entries.push(entry);
        }

        let mut report = MergeReport::default();
        for entry in entries {
            let id = entry.entity.id;

            if let Some(deleted_at) = self.tombstones.get(&id) {
                if *deleted_at >= entry.entity.updated_at {
                    report.skipped += 1;
                    continue;
                }
            }

            match self.entities.get(&id).map(|local| local.updated_at) {
                None => {
                    self.tombstones.remove(&id);
                    self.insert_snapshot(entry);
                    report.inserted += 1;
                }
                Some(local_updated) if entry.entity.updated_at > local_updated => {
                    if let Some(old) = self.entities.remove(&id) {
                        self.unindex_entity(&old);
                        self.detach_all(&old);
                    }
                    self.insert_snapshot(entry);
                    report.updated += 1;
                }
                Some(_) => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Verify that indices and component storage agree with the entity map.
    pub fn check_invariants(&self) -> Result<(), WorldError> {
        for (ty, store) in &self.components {
            for (id, component) in store {
                let entity = self.entities.get(id).ok_or_else(|| {
                    WorldError::InvariantViolation(format!(
                        "dangling component {ty} for missing entity {id}"
                    ))
                })?;
                if !entity.components.contains(ty) || component.entity_id != *id {
                    return Err(WorldError::InvariantViolation(format!(
                        "component {ty} on {id} is not registered on the entity"
                    )));
                }
            }
        }

        for (id, entity) in &self.entities {
            for ty in &entity.components {
                if !self
                    .components
                    .get(ty)
                    .is_some_and(|store| store.contains_key(id))
                {
                    return Err(WorldError::InvariantViolation(format!(
                        "entity {id} lists component {ty} with no stored data"
                    )));
                }
            }
            let typed = self
                .by_type
                .get(&entity.entity_type)
                .is_some_and(|ids| ids.contains(id));
            let placed = self
                .by_region
                .get(&entity.region)
                .is_some_and(|ids| ids.contains(id));
            if !typed || !placed {
                return Err(WorldError::InvariantViolation(format!(
                    "entity {id} missing from type or region index"
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Store a component without registering it on any entity.
    #[cfg(test)]
    pub(crate) fn corrupt_with_dangling_component(&mut self, component_type: ComponentType) {
        let id = EntityId::new();
        let now = self.now();
        self.components
            .entry(component_type.clone())
            .or_default()
            .insert(id, Component::new(id, component_type, Value::Null, now));
    }

    fn insert_snapshot(&mut self, entry: EntitySnapshot) {
        let id = entry.entity.id;
        self.index_entity(&entry.entity);
        for component in entry.components {
            self.components
                .entry(component.component_type.clone())
                .or_default()
                .insert(id, component);
        }
        self.entities.insert(id, entry.entity);
    }

    fn index_entity(&mut self, entity: &Entity) {
        self.by_type
            .entry(entity.entity_type.clone())
            .or_default()
            .insert(entity.id);
        self.by_region
            .entry(entity.region.clone())
            .or_default()
            .insert(entity.id);
    }

    fn unindex_entity(&mut self, entity: &Entity) {
        if let Some(ids) = self.by_type.get_mut(&entity.entity_type) {
            ids.remove(&entity.id);
            if ids.is_empty() {
                self.by_type.remove(&entity.entity_type);
            }
        }
        if let Some(ids) = self.by_region.get_mut(&entity.region) {
            ids.remove(&entity.id);
            if ids.is_empty() {
                self.by_region.remove(&entity.region);
            }
        }
    }

    fn detach_all(&mut self, entity: &Entity) -> Vec<Component> {
        let mut removed = Vec::with_capacity(entity.components.len());
        for ty in &entity.components {
            if let Some(store) = self.components.get_mut(ty) {
                if let Some(component) = store.remove(&entity.id) {
                    removed.push(component);
                }
                if store.is_empty() {
                    self.components.remove(ty);
                }
            }
        }
        removed
    }
}

/// Make an incoming snapshot self-consistent: the entity's component set is
/// rebuilt from the components actually carried.
fn normalize(mut entry: EntitySnapshot) -> Result<EntitySnapshot, WorldError> {
    let id = entry.entity.id;
    let mut types = std::collections::BTreeSet::new();
    for component in &entry.components {
        if component.entity_id != id {
            return Err(WorldError::Invalid(format!(
                "component {} belongs to {} but was shipped with {}",
                component.component_type, component.entity_id, id
            )));
        }
        if !types.insert(component.component_type.clone()) {
            return Err(WorldError::ComponentExists {
                entity_id: id,
                component_type: component.component_type.clone(),
            });
        }
    }
    entry.entity.components = types;
    Ok(entry)
}

fn sorted(mut ids: Vec<EntityId>) -> Vec<EntityId> {
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn world() -> (WorldState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        (WorldState::with_clock(clock.clone()), clock)
    }

    fn position() -> ComponentType {
        ComponentType::new("position")
    }

    fn health() -> ComponentType {
        ComponentType::new("health")
    }

    #[test]
    fn test_create_and_get_entity() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();

        let entity = state.get_entity(id).unwrap();
        assert_eq!(entity.entity_type, "npc");
        assert_eq!(entity.region, RegionId::new("north"));
        assert_eq!(state.entities_by_type("npc"), vec![id]);
        assert_eq!(state.entities_by_region(&RegionId::new("north")), vec![id]);
    }

    #[test]
    fn test_create_entity_rejects_empty_type() {
        let (mut state, _) = world();
        assert!(matches!(
            state.create_entity(" ", RegionId::new("north")),
            Err(WorldError::Invalid(_))
        ));
    }

    #[test]
    fn test_destroy_removes_all_components() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(id, position(), json!({"x": 1})).unwrap();
        state.add_component(id, health(), json!({"hp": 5})).unwrap();

        let removed = state.destroy_entity(id).unwrap();
        assert_eq!(removed.components.len(), 2);

        for ty in [position(), health()] {
            let err = state.get_component(id, &ty).unwrap_err();
            assert!(err.is_not_found());
            assert!(state.entities_with_component(&ty).is_empty());
        }
        assert!(state.entities_by_type("npc").is_empty());
        assert_eq!(state.component_count(), 0);
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_destroy_unknown_entity() {
        let (mut state, _) = world();
        let id = EntityId::new();
        assert_eq!(
            state.destroy_entity(id).unwrap_err(),
            WorldError::EntityNotFound(id)
        );
    }

    #[test]
    fn test_component_requires_live_entity() {
        let (mut state, _) = world();
        let ghost = EntityId::new();
        assert_eq!(
            state.add_component(ghost, position(), json!({})).unwrap_err(),
            WorldError::EntityNotFound(ghost)
        );
    }

    #[test]
    fn test_add_component_twice_is_rejected() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(id, position(), json!({"x": 1})).unwrap();
        assert!(matches!(
            state.add_component(id, position(), json!({"x": 2})),
            Err(WorldError::ComponentExists { .. })
        ));
    }

    #[test]
    fn test_update_merges_fields() {
        let (mut state, clock) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state
            .add_component(id, health(), json!({"hp": 10, "max": 10}))
            .unwrap();

        clock.advance(Duration::from_millis(5));
        let updated = state.update_component(id, &health(), json!({"hp": 4})).unwrap();
        assert_eq!(updated.field("hp"), Some(&json!(4)));
        assert_eq!(updated.field("max"), Some(&json!(10)));
        assert_eq!(state.get_entity(id).unwrap().updated_at.as_millis(), 1_005);
    }

    #[test]
    fn test_update_missing_component() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        assert!(matches!(
            state.update_component(id, &health(), json!({"hp": 1})),
            Err(WorldError::ComponentNotFound { .. })
        ));
    }

    #[test]
    fn test_multi_component_query() {
        let (mut state, _) = world();
        let e1 = state.create_entity("npc", RegionId::new("north")).unwrap();
        let e2 = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(e1, position(), json!({"x": 0})).unwrap();
        state.add_component(e1, health(), json!({"hp": 3})).unwrap();
        state.add_component(e2, position(), json!({"x": 9})).unwrap();

        let both = state.entities_with_components(&[position(), health()]);
        assert_eq!(both, vec![e1]);

        state.remove_component(e1, &health()).unwrap();
        assert!(state
            .entities_with_components(&[position(), health()])
            .is_empty());
        assert!(state.entities_with_component(&position()).contains(&e1));
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_query_unknown_component_type() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(id, position(), json!({})).unwrap();
        assert!(state
            .entities_with_components(&[position(), ComponentType::new("mana")])
            .is_empty());
    }

    #[test]
    fn test_activate_region() {
        let (mut state, _) = world();
        let north = RegionId::new("north");
        let a = state.create_entity("npc", north.clone()).unwrap();
        let b = state.create_entity("npc", north.clone()).unwrap();
        let c = state.create_entity("npc", RegionId::new("south")).unwrap();
        for id in [a, b, c] {
            state.set_active(id, false).unwrap();
        }

        assert_eq!(state.activate_region(&north), 2);
        assert!(state.get_entity(a).unwrap().active);
        assert!(!state.get_entity(c).unwrap().active);
    }

    #[test]
    fn test_export_import_round_trip() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(id, position(), json!({"x": 1})).unwrap();
        let snapshot = state.export();

        let (mut replica, _) = world();
        replica.create_entity("stale", RegionId::new("west")).unwrap();
        replica.import(snapshot.clone()).unwrap();

        assert_eq!(replica.entity_count(), 1);
        assert!(replica.entities_by_type("stale").is_empty());
        assert_eq!(
            replica.get_component(id, &position()).unwrap().field("x"),
            Some(&json!(1))
        );
        replica.check_invariants().unwrap();

        let restored = WorldSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_import_rejects_foreign_component() {
        let (mut state, _) = world();
        let id = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.add_component(id, position(), json!({})).unwrap();
        let mut snapshot = state.export();
        snapshot.entities[0].components[0].entity_id = EntityId::new();

        let (mut replica, _) = world();
        assert!(matches!(replica.import(snapshot), Err(WorldError::Invalid(_))));
    }

    #[test]
    fn test_merge_remote_last_write_wins() {
        let (mut authority, clock) = world();
        let id = authority.create_entity("npc", RegionId::new("north")).unwrap();
        authority.add_component(id, health(), json!({"hp": 10})).unwrap();

        let (mut replica, _) = world();
        let report = replica.merge_remote(authority.export().entities).unwrap();
        assert_eq!(report.inserted, 1);

        // Newer authority write replaces the replica copy.
        clock.advance(Duration::from_millis(50));
        authority.update_component(id, &health(), json!({"hp": 3})).unwrap();
        let report = replica.merge_remote(authority.export().entities).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(
            replica.get_component(id, &health()).unwrap().field("hp"),
            Some(&json!(3))
        );

        // Same version again is a no-op.
        let report = replica.merge_remote(authority.export().entities).unwrap();
        assert_eq!(report.skipped, 1);
        replica.check_invariants().unwrap();
    }

    #[test]
    fn test_merge_remote_keeps_newer_local() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let mut authority = WorldState::with_clock(clock.clone());
        let id = authority.create_entity("npc", RegionId::new("north")).unwrap();
        authority.add_component(id, health(), json!({"hp": 10})).unwrap();
        let stale = authority.export().entities;

        let mut replica = WorldState::with_clock(clock.clone());
        replica.merge_remote(stale.clone()).unwrap();
        clock.advance(Duration::from_millis(10));
        replica.update_component(id, &health(), json!({"hp": 1})).unwrap();

        let report = replica.merge_remote(stale).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            replica.get_component(id, &health()).unwrap().field("hp"),
            Some(&json!(1))
        );
    }

    #[test]
    fn test_merge_does_not_resurrect_destroyed_entity() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let mut authority = WorldState::with_clock(clock.clone());
        let id = authority.create_entity("npc", RegionId::new("north")).unwrap();
        let remote = authority.export().entities;

        let mut replica = WorldState::with_clock(clock.clone());
        replica.merge_remote(remote.clone()).unwrap();
        clock.advance(Duration::from_millis(10));
        replica.destroy_entity(id).unwrap();

        let report = replica.merge_remote(remote).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(replica.get_entity(id).is_err());
    }

    #[test]
    fn test_merge_rejects_whole_batch_on_bad_entry() {
        let (mut authority, _) = world();
        let first = authority.create_entity("npc", RegionId::new("north")).unwrap();
        let second = authority.create_entity("npc", RegionId::new("north")).unwrap();
        authority.add_component(second, health(), json!({"hp": 4})).unwrap();
        let third = authority.create_entity("npc", RegionId::new("south")).unwrap();

        let mut bad = authority.snapshot_entity(second).unwrap();
        bad.components[0].entity_id = EntityId::new();
        let batch = vec![
            authority.snapshot_entity(first).unwrap(),
            bad,
            authority.snapshot_entity(third).unwrap(),
        ];

        let (mut replica, _) = world();
        assert!(matches!(replica.merge_remote(batch), Err(WorldError::Invalid(_))));
        assert_eq!(replica.entity_count(), 0);
        assert!(replica.get_entity(first).is_err());
        assert!(replica.get_entity(third).is_err());
    }

    #[test]
    fn test_merge_rejects_duplicate_ids() {
        let (mut authority, _) = world();
        authority.create_entity("npc", RegionId::new("north")).unwrap();
        let mut batch = authority.export().entities;
        batch.push(batch[0].clone());

        let (mut replica, _) = world();
        assert!(matches!(
            replica.merge_remote(batch),
            Err(WorldError::EntityExists(_))
        ));
        assert_eq!(replica.entity_count(), 0);
    }

    #[test]
    fn test_spawn_entities_is_all_or_nothing() {
        let (mut state, _) = world();
        let north = RegionId::new("north");

        let err = state
            .spawn_entities(
                north.clone(),
                vec![
                    ("wolf".into(), vec![(health(), json!({"hp": 5}))]),
                    ("wolf".into(), vec![]),
                    (" ".into(), vec![]),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, WorldError::Invalid(_)));
        assert_eq!(state.entity_count(), 0);
        assert_eq!(state.component_count(), 0);

        let ids = state
            .spawn_entities(
                north.clone(),
                vec![
                    ("wolf".into(), vec![(health(), json!({"hp": 5}))]),
                    ("wolf".into(), vec![]),
                ],
            )
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(state.entities_by_type("wolf").len(), 2);
        assert_eq!(state.entities_with_component(&health()), vec![ids[0]]);
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_prune_tombstones_by_age() {
        let (mut state, clock) = world();
        let old = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.destroy_entity(old).unwrap();
        clock.advance(Duration::from_secs(60));
        let recent = state.create_entity("npc", RegionId::new("north")).unwrap();
        state.destroy_entity(recent).unwrap();
        assert_eq!(state.tombstone_count(), 2);

        let cutoff = Timestamp::from_millis(state.now().as_millis() - 30_000);
        assert_eq!(state.prune_tombstones(cutoff), 1);
        assert_eq!(state.tombstone_count(), 1);
        assert_eq!(state.prune_tombstones(cutoff), 0);
    }

    #[test]
    fn test_region_snapshot() {
        let (mut state, _) = world();
        let north = RegionId::new("north");
        let id = state.create_entity("npc", north.clone()).unwrap();
        state.add_component(id, position(), json!({"x": 2})).unwrap();
        state.create_entity("npc", RegionId::new("south")).unwrap();

        let snapshot = state.region_snapshot(&north);
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entities[0].entity.id, id);
        assert_eq!(snapshot.entities[0].components.len(), 1);
    }
}
