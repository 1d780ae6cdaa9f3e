//! # Mesh Core (The Cortex)
//!
//! The coordination layer of The Cortex. It keeps a live picture of which
//! remote nodes exist and what they can do, gates every caller-initiated
//! action behind consent and rate limits, and schedules asynchronous jobs onto
//! capable nodes. Completed jobs land in the `world_engine` entity-component
//! store.
//!
//! ## Core Components
//!
//! - **network**: Resilient client with heartbeats and exponential reconnect backoff
//! - **registry**: Node registration, discovery, and the aggregate health metric
//! - **policy**: Append-only consent ledger plus tiered per-account rate limiting
//! - **orchestrator**: Priority job queue, capability-based dispatch, bounded retries
//! - **world_service**: Policy-guarded access to the shared world state
//! - **gateway**: Transport-agnostic request handlers for the external API
//! - **runtime**: Wiring of all services and their background loops
//!
//! ## Design Philosophy
//!
//! - **Reject early**: Validation and policy failures return before anything is queued
//! - **Degrade, don't crash**: Losing the backend pauses dispatch; reconnect resumes it
//! - **One writer per key**: Shared registries are sharded and mutated only through their operations

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod network;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod shard;
pub mod world_service;

pub use config::*;
pub use error::*;
pub use events::*;
pub use gateway::*;
pub use network::*;
pub use orchestrator::*;
pub use policy::*;
pub use registry::*;
pub use runtime::*;
pub use world_service::*;
