//! Persistent state for devbox.
//!
//! This module holds the durable projection of the orchestrator's state:
//!
//! - Container records (runtime id, lifecycle state, image, limits, credentials)
//! - Tunnel bindings of running containers
//! - Snapshot history per container
//!
//! # Architecture
//!
//! State lives in two JSON files under `.devbox/` by default. Both are
//! rewritten whole with write-then-rename on every save; a file that exists
//! but does not parse stops startup with [`Error::CorruptState`].
//!
//! [`Error::CorruptState`]: crate::Error::CorruptState

mod store;
mod types;

pub use store::StateStore;
pub use types::{
    ContainerRecord, ImageFile, LifecycleState, PersistedState, SnapshotRecord, TunnelBinding,
    TunnelFile,
};
