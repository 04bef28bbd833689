//! Container lifecycle orchestration.
//!
//! - `core` - The [`Orchestrator`] itself: startup, persistence, autosave
//! - `lifecycle` - create, stop, start, restore, delete and snapshot
//! - `status` - Status projection and drift reconciliation
//! - `guards` - Per-name operation exclusion
//! - `saga` - Compensating actions for multi-step operations
//! - `builder` - Fluent construction with runtime and relay selection

mod builder;
mod core;
mod guards;
mod lifecycle;
mod saga;
mod status;

pub use builder::OrchestratorBuilder;
pub use core::Orchestrator;
pub use lifecycle::{
    validate_name, CreateOptions, DeleteResult, SnapshotResult, StartResult, StopOptions,
    StopResult,
};
pub use status::{ContainerStatus, Drift, ReconcileReport};
