//! Job types and the table mapping each to its capability, schema and policy category.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{MeshError, Result};
use crate::policy::RequestClassifier;

/// Upper bound on entities spawned by one population job.
pub const MAX_SPAWN_COUNT: u32 = 10_000;

/// Priority given to jobs the orchestrator schedules on its own.
pub const SYSTEM_PRIORITY: i32 = 0;

/// Every kind of job the orchestrator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    RegionActivation,
    EntityPopulationSpawn,
    #[serde(alias = "maintenance-sweep")]
    Maintenance,
    StateSyncPulse,
}

/// Static facts about a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobProfile {
    pub job_type: JobType,
    /// Capability a node must advertise to run the job.
    pub capability: &'static str,
    /// Consent category checked before the job is accepted.
    pub category: &'static str,
    /// Priority when a user submits without one.
    pub default_priority: i32,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::RegionActivation,
        JobType::EntityPopulationSpawn,
        JobType::Maintenance,
        JobType::StateSyncPulse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::RegionActivation => "region-activation",
            JobType::EntityPopulationSpawn => "entity-population-spawn",
            JobType::Maintenance => "maintenance",
            JobType::StateSyncPulse => "state-sync-pulse",
        }
    }

    pub fn profile(&self) -> JobProfile {
        let (capability, category, default_priority) = match self {
            JobType::RegionActivation => ("region.activate", "world.write", 10),
            JobType::EntityPopulationSpawn => ("population.spawn", "world.write", 10),
            JobType::Maintenance => ("maintenance", "mesh.maintenance", 5),
            JobType::StateSyncPulse => ("state.sync", "world.sync", 5),
        };
        JobProfile {
            job_type: *self,
            capability,
            category,
            default_priority,
        }
    }

    /// Validate job metadata against this type's schema. `null` counts as `{}`.
    pub fn parse_payload(&self, metadata: &Value) -> Result<JobPayload> {
        let payload = match self {
            JobType::RegionActivation => JobPayload::RegionActivation(decode(self, metadata)?),
            JobType::EntityPopulationSpawn => {
                JobPayload::EntityPopulationSpawn(decode(self, metadata)?)
            }
            JobType::Maintenance => JobPayload::Maintenance(decode(self, metadata)?),
            JobType::StateSyncPulse => JobPayload::StateSyncPulse(decode(self, metadata)?),
        };
        payload.validate()?;
        Ok(payload)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "region-activation" => Ok(JobType::RegionActivation),
            "entity-population-spawn" => Ok(JobType::EntityPopulationSpawn),
            "maintenance" | "maintenance-sweep" => Ok(JobType::Maintenance),
            "state-sync-pulse" => Ok(JobType::StateSyncPulse),
            other => Err(MeshError::Validation(format!("unknown job type: {other}"))),
        }
    }
}

fn decode<T: DeserializeOwned>(job_type: &JobType, metadata: &Value) -> Result<T> {
    let value = match metadata {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(value)
        .map_err(|e| MeshError::Validation(format!("invalid {job_type} metadata: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionActivationPayload {
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PopulationSpawnPayload {
    pub region: String,
    pub entity_type: String,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenancePayload {
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncPulsePayload {
    #[serde(default)]
    pub region: Option<String>,
}

/// Validated, typed job metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    RegionActivation(RegionActivationPayload),
    EntityPopulationSpawn(PopulationSpawnPayload),
    Maintenance(MaintenancePayload),
    StateSyncPulse(SyncPulsePayload),
}

impl JobPayload {
    fn validate(&self) -> Result<()> {
        match self {
            JobPayload::RegionActivation(p) if p.region.trim().is_empty() => {
                Err(MeshError::Validation("region must not be empty".into()))
            }
            JobPayload::EntityPopulationSpawn(p) => {
                if p.region.trim().is_empty() || p.entity_type.trim().is_empty() {
                    return Err(MeshError::Validation(
                        "region and entity_type must not be empty".into(),
                    ));
                }
                if p.count == 0 || p.count > MAX_SPAWN_COUNT {
                    return Err(MeshError::Validation(format!(
                        "count must be between 1 and {MAX_SPAWN_COUNT}"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Check the job table once at startup: names round-trip and every entry
/// names a capability and a category.
pub fn verify_job_table() -> Result<()> {
    let mut names = HashSet::new();
    for job_type in JobType::ALL {
        let profile = job_type.profile();
        if profile.job_type != job_type {
            return Err(MeshError::Validation(format!(
                "job table entry for {job_type} describes {}",
                profile.job_type
            )));
        }
        if profile.capability.is_empty() || profile.category.is_empty() {
            return Err(MeshError::Validation(format!(
                "job type {job_type} lacks a capability or category"
            )));
        }
        if profile.default_priority <= SYSTEM_PRIORITY {
            return Err(MeshError::Validation(format!(
                "job type {job_type} must outrank system-scheduled work"
            )));
        }
        if !names.insert(job_type.as_str()) || job_type.as_str().parse::<JobType>()? != job_type {
            return Err(MeshError::Validation(format!(
                "job type name {job_type} is not unique"
            )));
        }
    }
    Ok(())
}

/// Labels job submissions with their job type's consent category.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobTypeClassifier;

impl RequestClassifier for JobTypeClassifier {
    fn classify(&self, request_kind: &str, _payload: &Value) -> Option<String> {
        request_kind
            .parse::<JobType>()
            .ok()
            .map(|job_type| job_type.profile().category.to_string())
    }
}
