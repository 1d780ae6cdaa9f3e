//! Configuration loading for the coordination layer.
//!
//! Configuration is TOML. Every field has a default, so an empty file is a
//! valid configuration:
//!
//! ```toml
//! [network]
//! heartbeat_interval_ms = 5000
//!
//! [policy]
//! free_quota = 10
//!
//! [[orchestrator.recurring]]
//! job_type = "maintenance"
//! every_secs = 300
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Network client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interval between health probes while connected.
    pub heartbeat_interval_ms: u64,
    /// First reconnect delay; doubles per failed attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on the reconnect delay.
    pub backoff_cap_ms: u64,
    /// Default deadline for a request when the caller gives none.
    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Node registry and health mesh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval at which nodes are expected to heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed windows before a node is Unreachable.
    pub unreachable_after_missed: u32,
    /// How long an Unreachable node is kept before it is reaped.
    pub reap_grace_ms: u64,
    /// How often the sweeper re-evaluates node health.
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            unreachable_after_missed: 3,
            reap_grace_ms: 60_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Policy gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Length of the fixed rate-limit window.
    pub window_secs: u64,
    /// Requests per window for Free accounts.
    pub free_quota: u32,
    /// Requests per window for Pro accounts. Enterprise is unlimited.
    pub pro_quota: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            free_quota: 10,
            pro_quota: 100,
        }
    }
}

impl PolicyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// A job the orchestrator submits on its own at a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJobConfig {
    /// Job type name, e.g. `"maintenance"` or `"state-sync-pulse"`.
    pub job_type: String,
    pub every_secs: u64,
    /// Defaults to the job type's system priority.
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl RecurringJobConfig {
    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }
}

/// Job orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Requeues allowed after the first failed attempt.
    pub retry_limit: u32,
    /// Maximum concurrently running dispatches.
    pub max_in_flight: usize,
    /// Deadline for every remote dispatch.
    pub dispatch_timeout_ms: u64,
    /// Dispatcher sleep when nothing is dispatchable; doubles up to the max.
    pub idle_backoff_min_ms: u64,
    pub idle_backoff_max_ms: u64,
    /// Finished jobs kept for inspection; older ones are forgotten.
    pub retain_finished: usize,
    pub recurring: Vec<RecurringJobConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            max_in_flight: 16,
            dispatch_timeout_ms: 30_000,
            idle_backoff_min_ms: 50,
            idle_backoff_max_ms: 2_000,
            retain_finished: 1_000,
            recurring: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn idle_backoff_min(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_min_ms)
    }

    pub fn idle_backoff_max(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_max_ms)
    }
}

/// World engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub tick_hz: u32,
    pub sync_interval_ms: u64,
    /// How long a destroyed entity is remembered against stale remote copies.
    pub tombstone_ttl_ms: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            tick_hz: 60,
            sync_interval_ms: 5_000,
            tombstone_ttl_ms: 3_600_000,
        }
    }
}

impl WorldConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }
}

/// Complete mesh configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub world: WorldConfig,
}

impl MeshConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("network.heartbeat_interval_ms", self.network.heartbeat_interval_ms),
            ("network.backoff_base_ms", self.network.backoff_base_ms),
            ("network.request_timeout_ms", self.network.request_timeout_ms),
            ("registry.heartbeat_interval_ms", self.registry.heartbeat_interval_ms),
            ("registry.sweep_interval_ms", self.registry.sweep_interval_ms),
            ("policy.window_secs", self.policy.window_secs),
            ("orchestrator.dispatch_timeout_ms", self.orchestrator.dispatch_timeout_ms),
            ("orchestrator.idle_backoff_min_ms", self.orchestrator.idle_backoff_min_ms),
            ("world.sync_interval_ms", self.world.sync_interval_ms),
            ("world.tombstone_ttl_ms", self.world.tombstone_ttl_ms),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        if self.network.backoff_base_ms > self.network.backoff_cap_ms {
            return Err(ConfigError::ValidationError(
                "network.backoff_base_ms must not exceed backoff_cap_ms".into(),
            ));
        }
        if self.orchestrator.idle_backoff_min_ms > self.orchestrator.idle_backoff_max_ms {
            return Err(ConfigError::ValidationError(
                "orchestrator.idle_backoff_min_ms must not exceed idle_backoff_max_ms".into(),
            ));
        }
        if self.registry.unreachable_after_missed == 0 {
            return Err(ConfigError::ValidationError(
                "registry.unreachable_after_missed must be > 0".into(),
            ));
        }
        if self.orchestrator.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_in_flight must be > 0".into(),
            ));
        }
        if self.world.tick_hz == 0 {
            return Err(ConfigError::ValidationError("world.tick_hz must be > 0".into()));
        }

        let mut seen = HashSet::new();
        for job in &self.orchestrator.recurring {
            if job.every_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "recurring job {} needs every_secs > 0",
                    job.job_type
                )));
            }
            if !seen.insert(job.job_type.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate recurring job: {}",
                    job.job_type
                )));
            }
        }
        Ok(())
    }
}
