//! Policy-guarded access to the shared world, and the local effects of
//! completed jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};
use world_engine::{
    Component, ComponentType, Entity, EntityId, EntitySnapshot, RegionId, RegionSnapshot,
    SharedWorld, WorldSnapshot,
};

use crate::error::{MeshError, Result};
use crate::orchestrator::{Job, JobEffects, JobPayload, PopulationSpawnPayload};
use crate::policy::{AccountId, PolicyGate};
use crate::registry::NodeRegistry;

/// Consent category every world mutation is checked against.
pub const WORLD_WRITE: &str = "world.write";

/// One entity a node asks to create during population spawn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnedEntity {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub components: serde_json::Map<String, Value>,
}

/// Entity and component operations on the shared world.
///
/// Mutations go through the policy gate first; a denial leaves the world
/// untouched. Reads are not gated.
pub struct WorldService {
    world: SharedWorld,
    gate: Arc<PolicyGate>,
    registry: Arc<NodeRegistry>,
    sync_trigger: Option<Arc<Notify>>,
}

impl WorldService {
    pub fn new(world: SharedWorld, gate: Arc<PolicyGate>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            world,
            gate,
            registry,
            sync_trigger: None,
        }
    }

    /// Notify handle that asks the sync worker for an immediate pull.
    pub fn with_sync_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    fn authorize(&self, account: &AccountId) -> Result<()> {
        self.gate.check(account, WORLD_WRITE).into_result()
    }

    pub async fn create_entity(
        &self,
        account: &AccountId,
        entity_type: &str,
        region: RegionId,
    ) -> Result<EntityId> {
        self.authorize(account)?;
        let id = self
            .world
            .write()
            .await
            .create_entity(entity_type, region.clone())?;
        info!(entity_id = %id, entity_type, region = %region.as_str(), "entity created");
        Ok(id)
    }

    /// Destroy an entity together with all of its components.
    pub async fn destroy_entity(&self, account: &AccountId, id: EntityId) -> Result<EntitySnapshot> {
        self.authorize(account)?;
        let removed = self.world.write().await.destroy_entity(id)?;
        info!(
            entity_id = %id,
            components = removed.components.len(),
            "entity destroyed"
        );
        Ok(removed)
    }

    pub async fn set_active(&self, account: &AccountId, id: EntityId, active: bool) -> Result<()> {
        self.authorize(account)?;
        self.world.write().await.set_active(id, active)?;
        Ok(())
    }

    pub async fn add_component(
        &self,
        account: &AccountId,
        id: EntityId,
        component_type: ComponentType,
        data: Value,
    ) -> Result<Component> {
        self.authorize(account)?;
        let mut world = self.world.write().await;
        world.add_component(id, component_type.clone(), data)?;
        Ok(world.get_component(id, &component_type)?.clone())
    }

    /// Merge `patch` into an existing component.
    pub async fn update_component(
        &self,
        account: &AccountId,
        id: EntityId,
        component_type: &ComponentType,
        patch: Value,
    ) -> Result<Component> {
        self.authorize(account)?;
        let mut world = self.world.write().await;
        Ok(world.update_component(id, component_type, patch)?.clone())
    }

    pub async fn remove_component(
        &self,
        account: &AccountId,
        id: EntityId,
        component_type: &ComponentType,
    ) -> Result<Component> {
        self.authorize(account)?;
        Ok(self
            .world
            .write()
            .await
            .remove_component(id, component_type)?)
    }

    pub async fn get_entity(&self, id: EntityId) -> Result<Entity> {
        Ok(self.world.read().await.get_entity(id)?.clone())
    }

    pub async fn get_component(&self, id: EntityId, component_type: &ComponentType) -> Result<Component> {
        Ok(self
            .world
            .read()
            .await
            .get_component(id, component_type)?
            .clone())
    }

    /// An entity with all of its components.
    pub async fn entity_state(&self, id: EntityId) -> Result<EntitySnapshot> {
        Ok(self.world.read().await.snapshot_entity(id)?)
    }

    pub async fn entities_with_component(&self, component_type: &ComponentType) -> Vec<EntityId> {
        self.world
            .read()
            .await
            .entities_with_component(component_type)
    }

    /// Entities carrying every one of `component_types`.
    pub async fn entities_with_components(&self, component_types: &[ComponentType]) -> Vec<EntityId> {
        self.world
            .read()
            .await
            .entities_with_components(component_types)
    }

    pub async fn entities_by_type(&self, entity_type: &str) -> Vec<EntityId> {
        self.world.read().await.entities_by_type(entity_type)
    }

    pub async fn entities_by_region(&self, region: &RegionId) -> Vec<EntityId> {
        self.world.read().await.entities_by_region(region)
    }

    /// Full snapshot of one region.
    pub async fn region_state(&self, region: &RegionId) -> RegionSnapshot {
        self.world.read().await.region_snapshot(region)
    }

    pub async fn export(&self) -> WorldSnapshot {
        self.world.read().await.export()
    }

    /// Create the entities a node reported for a spawn job, all or none.
    async fn spawn_population(&self, spawn: &PopulationSpawnPayload, result: &Value) -> Result<Vec<EntityId>> {
        let reported: Vec<SpawnedEntity> = match result.get("entities") {
            Some(entities) => serde_json::from_value(entities.clone()).map_err(|e| {
                MeshError::Execution(format!("node returned malformed entities: {e}"))
            })?,
            None => vec![SpawnedEntity::default(); spawn.count as usize],
        };
        if reported.len() > spawn.count as usize {
            return Err(MeshError::Execution(format!(
                "node reported {} entities for a spawn of {}",
                reported.len(),
                spawn.count
            )));
        }

        let entries: Vec<(String, Vec<(ComponentType, Value)>)> = reported
            .into_iter()
            .map(|entity| {
                let entity_type = entity
                    .entity_type
                    .unwrap_or_else(|| spawn.entity_type.clone());
                let components = entity
                    .components
                    .into_iter()
                    .map(|(ty, data)| (ComponentType::new(ty), data))
                    .collect();
                (entity_type, components)
            })
            .collect();

        let region = RegionId::new(spawn.region.clone());
        Ok(self.world.write().await.spawn_entities(region, entries)?)
    }
}

#[async_trait]
impl JobEffects for WorldService {
    async fn apply(&self, job: &Job, result: Value) -> Result<Value> {
        let applied = match job.payload()? {
            JobPayload::RegionActivation(payload) => {
                let region = RegionId::new(payload.region);
                let activated = self.world.write().await.activate_region(&region);
                info!(job_id = %job.id, region = %region.as_str(), activated, "region activated");
                json!({ "activated": activated })
            }
            JobPayload::EntityPopulationSpawn(payload) => {
                let created = self.spawn_population(&payload, &result).await?;
                info!(job_id = %job.id, spawned = created.len(), region = %payload.region, "population spawned");
                json!({ "spawned": created })
            }
            JobPayload::Maintenance(_) => {
                let sweep = self.registry.sweep();
                if let Err(e) = self.world.read().await.check_invariants() {
                    error!(job_id = %job.id, error = %e, "world invariant violated");
                }
                json!({
                    "degraded": sweep.degraded,
                    "unreachable": sweep.unreachable,
                    "reaped": sweep.reaped,
                })
            }
            JobPayload::StateSyncPulse(_) => {
                let triggered = match &self.sync_trigger {
                    Some(trigger) => {
                        trigger.notify_one();
                        true
                    }
                    None => false,
                };
                json!({ "sync_triggered": triggered })
            }
        };
        Ok(json!({ "node": result, "applied": applied }))
    }
}
