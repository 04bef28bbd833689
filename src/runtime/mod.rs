//! Container runtime seam.
//!
//! The orchestrator only talks to the runtime through [`ContainerRuntime`]:
//! create-with-spec, start, stop, remove, commit-to-image, inspect and list.
//! [`DockerRuntime`] drives the `docker` CLI; [`InMemoryRuntime`] keeps
//! containers in a map and supports failure injection for tests.

pub mod bootstrap;
pub mod docker;
pub mod error;
pub mod memory;

pub use docker::{check_daemon_with_retry, DockerRuntime};
pub use error::RuntimeError;
pub use memory::{InMemoryRuntime, RuntimeOp};

use crate::config::{ResourceLimits, VolumeMount};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Label set on every container this crate creates.
pub const MANAGED_LABEL: &str = "devbox.managed";
/// Label carrying the logical container name.
pub const NAME_LABEL: &str = "devbox.name";

/// Everything needed to instantiate a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub network: Option<String>,
    pub resources: ResourceLimits,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Shell script run with `/bin/bash -c`; image default command when `None`
    pub command: Option<String>,
    pub working_dir: Option<String>,
    pub restart_retries: u32,
}

/// Runtime view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Raw runtime status ("running", "exited", "created", ...)
    pub status: String,
    pub image: String,
    /// Address reachable from the relay host
    pub ip_address: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container. Returns the runtime id.
    #[must_use = "the container id identifies the created container"]
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container: &str) -> Result<(), RuntimeError>;

    /// Stop a container. Stopping a stopped container succeeds.
    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container. Removing a missing container succeeds.
    async fn remove(&self, container: &str) -> Result<(), RuntimeError>;

    /// Commit the container filesystem to `image_ref` (`repository:tag`).
    async fn commit(
        &self,
        container: &str,
        image_ref: &str,
        message: &str,
    ) -> Result<(), RuntimeError>;

    /// Delete an image. Deleting a missing image succeeds.
    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError>;

    /// `None` when the runtime does not know the container.
    async fn inspect(&self, container: &str) -> Result<Option<RuntimeInfo>, RuntimeError>;

    /// All containers carrying [`MANAGED_LABEL`].
    async fn list(&self) -> Result<Vec<RuntimeInfo>, RuntimeError>;

    /// Image references (`repository:tag`) stored under `repository`.
    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError>;
}

/// Bound a runtime call by `timeout`, reporting expiry as [`RuntimeError::Timeout`].
pub async fn with_timeout<T, F>(
    timeout: Duration,
    command: &str,
    call: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::timeout(command, timeout)),
    }
}
