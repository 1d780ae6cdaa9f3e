//! # World Engine
//!
//! The entity-component world state of The Cortex. Entities are bare
//! identities placed in a region; typed components carry their data. The
//! crate holds the store and its query indices, the fixed-rate tick loop that
//! runs systems over it, and the worker that reconciles a replica with the
//! authoritative backend.
//!
//! This crate knows nothing about accounts, policy, or jobs; callers that need
//! guarded mutation wrap it (see `mesh_core::world_service`).

pub mod entities;
pub mod error;
pub mod sync;
pub mod systems;
pub mod time;
pub mod world_state;

pub use entities::*;
pub use error::*;
pub use sync::*;
pub use systems::*;
pub use time::*;
pub use world_state::*;
