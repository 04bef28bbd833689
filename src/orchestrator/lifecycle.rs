//! Lifecycle operations: create, stop, start, restore, delete and snapshot.
//!
//! Each operation holds the per-name guard for its whole duration, drives the
//! runtime, then updates tunnels and snapshot history, then persists. Steps
//! that completed register a compensation on a [`Saga`]; a later failure runs
//! them newest first. Timed-out calls are never compensated because their
//! effect is unknown: the container goes to `unknown` instead.

use super::core::Orchestrator;
use super::saga::Saga;
use crate::config::{ResourceLimits, ServiceKind, VolumeMount};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::state::{ContainerRecord, LifecycleState, SnapshotRecord, TunnelBinding};
use crate::tunnel::{describe_bindings, OpenFailure};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

const MAX_NAME_LENGTH: usize = 63;
const STOP_SNAPSHOT_MESSAGE: &str = "Snapshot on stop";

/// Per-create overrides. Unset fields fall back to `container` in config.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Supplied credentials; missing ones come from config or are generated
    pub credentials: Credentials,
    pub resources: Option<ResourceLimits>,
    pub volumes: Option<Vec<VolumeMount>>,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Commit the stopped container to a new snapshot
    pub keep_history: bool,
    pub commit_message: Option<String>,
}

/// A container that is running with its services published.
#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub name: String,
    pub state: LifecycleState,
    pub container_id: Option<String>,
    pub image: String,
    /// Public port per service
    pub ports: BTreeMap<ServiceKind, u16>,
    pub bindings: Vec<TunnelBinding>,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub name: String,
    pub state: LifecycleState,
    pub released_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evicted: Vec<SnapshotRecord>,
    /// Evicted images the runtime refused to delete
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unremoved_images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub name: String,
    pub released_ports: Vec<u16>,
    pub removed_snapshots: Vec<SnapshotRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unremoved_images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub name: String,
    pub snapshot: SnapshotRecord,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evicted: Vec<SnapshotRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unremoved_images: Vec<String>,
}

/// Check a container name: 1-63 characters from `[a-zA-Z0-9_.-]`,
/// starting with a letter or digit.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "must be 1-{} characters long",
            MAX_NAME_LENGTH
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("must start with a letter or digit".to_string()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(invalid(format!("contains '{}'", c)));
    }
    Ok(())
}

impl Orchestrator {
    /// Create and start a container, then publish its services.
    ///
    /// Returns the public port of every configured service and the
    /// credentials in effect. A failure before the container is running
    /// leaves no record behind.
    pub async fn create(
        &self,
        name: &str,
        image: &str,
        options: CreateOptions,
    ) -> Result<StartResult> {
        validate_name(name)?;
        if image.trim().is_empty() {
            return Err(Error::Validation("image must not be empty".to_string()));
        }
        let resources = options
            .resources
            .unwrap_or_else(|| self.config.container.resources.clone());
        resources.validate()?;
        let volumes = options
            .volumes
            .unwrap_or_else(|| self.config.container.volumes.clone());
        for volume in &volumes {
            volume.validate()?;
        }

        let _guard = self.guards.try_acquire(name, "create")?;
        let credentials = Credentials::resolve(&self.config.services, &options.credentials);
        {
            let mut ledger = self.ledger.lock();
            if ledger.containers.contains_key(name) {
                return Err(Error::Conflict {
                    name: name.to_string(),
                    reason: "already exists".to_string(),
                });
            }
            ledger.containers.insert(
                name.to_string(),
                ContainerRecord::new(
                    name,
                    image,
                    resources.clone(),
                    volumes.clone(),
                    credentials.clone(),
                ),
            );
        }
        info!(container = %name, image = %image, "Creating container");

        let mut saga = Saga::new("create", name);
        let spec = self.container_spec(name, image, &resources, &volumes, &credentials);
        let container_id = match self
            .call_runtime("docker create", self.runtime.create(&spec))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let cause = self.runtime_error("create", name, e);
                return Err(self.abort_start(name, saga, cause, Vec::new(), None).await);
            }
        };
        self.update(name, |record, _| record.container_id = Some(container_id.clone()));
        saga.completed(format!("container {}", name), move || {
            async move {
                self.call_runtime("docker rm", self.runtime.remove(name))
                    .await
                    .map_err(Error::from)
            }
            .boxed()
        });

        if let Err(e) = self
            .call_runtime("docker start", self.runtime.start(name))
            .await
        {
            let cause = self.runtime_error("create", name, e);
            return Err(self.abort_start(name, saga, cause, Vec::new(), None).await);
        }

        let bindings = match self.bring_up(name, &credentials).await {
            Ok(bindings) => bindings,
            Err(failure) => return Err(self.abort_publish(name, saga, failure, None).await),
        };

        self.mark_running(name, bindings);
        self.persist().await;
        info!(container = %name, "Container created");
        self.start_result(name)
    }

    /// Stop a container.
    ///
    /// Tunnels are torn down first, then the container is stopped, then it is
    /// snapshotted when `keep_history` is set. A failed snapshot leaves the
    /// container stopped and is reported as a partial failure.
    pub async fn stop(&self, name: &str, options: StopOptions) -> Result<StopResult> {
        let _guard = self.guards.try_acquire(name, "stop")?;
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if record.state == LifecycleState::Stale {
            return Err(Error::Conflict {
                name: name.to_string(),
                reason: "no longer exists in the runtime; start it to re-create it".to_string(),
            });
        }

        let released_ports = self.close_tunnels(name, "stop", record.state).await?;

        let mut saga = Saga::new("stop", name);
        if record.state == LifecycleState::Running && !released_ports.is_empty() {
            saga.completed("re-publish tunnels", move || {
                async move { self.republish(name).await }.boxed()
            });
        }
        match self
            .call_runtime("docker stop", self.runtime.stop(name))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                self.mark_stale(name);
                self.persist().await;
                return Err(Error::RuntimeFailure(e));
            }
            Err(e) => {
                let cause = self.runtime_error("stop", name, e);
                return Err(self
                    .abort_start(name, saga, cause, Vec::new(), Some(record.state))
                    .await);
            }
        }

        self.transition(name, LifecycleState::Stopped);
        self.persist().await;
        info!(container = %name, released = released_ports.len(), "Container stopped");

        let mut result = StopResult {
            name: name.to_string(),
            state: LifecycleState::Stopped,
            released_ports,
            snapshot: None,
            evicted: Vec::new(),
            unremoved_images: Vec::new(),
        };
        if !options.keep_history {
            return Ok(result);
        }

        let message = options
            .commit_message
            .unwrap_or_else(|| STOP_SNAPSHOT_MESSAGE.to_string());
        match self.commit_stopped(name, &message).await {
            Ok(snapshot) => {
                result.snapshot = Some(snapshot.snapshot);
                result.evicted = snapshot.evicted;
                result.unremoved_images = snapshot.unremoved_images;
                Ok(result)
            }
            Err(e) if e.is_timeout() => Err(e),
            Err(e) => Err(Error::PartialFailure {
                operation: "stop".to_string(),
                container: name.to_string(),
                cause: Box::new(e),
                unreconciled: vec![format!("snapshot of {}", name)],
            }),
        }
    }

    /// Start a stopped container on fresh public ports.
    ///
    /// A stale container, or one the runtime lost since it was stopped, is
    /// re-created from its recorded image.
    pub async fn start(&self, name: &str) -> Result<StartResult> {
        let _guard = self.guards.try_acquire(name, "start")?;
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        match record.state {
            LifecycleState::Stopped => {}
            LifecycleState::Stale => return self.relaunch("start", name, record.image).await,
            LifecycleState::Running => {
                return Err(Error::Conflict {
                    name: name.to_string(),
                    reason: "is already running".to_string(),
                })
            }
            other => return Err(refresh_first(name, other)),
        }

        info!(container = %name, "Starting container");
        let mut saga = Saga::new("start", name);
        match self
            .call_runtime("docker start", self.runtime.start(name))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(container = %name, "Container is gone from the runtime; re-creating it");
                self.mark_stale(name);
                return self.relaunch("start", name, record.image).await;
            }
            Err(e) => {
                let cause = self.runtime_error("start", name, e);
                return Err(self
                    .abort_start(name, saga, cause, Vec::new(), Some(LifecycleState::Stopped))
                    .await);
            }
        }
        saga.completed(format!("running container {}", name), move || {
            async move {
                self.call_runtime("docker stop", self.runtime.stop(name))
                    .await
                    .map_err(Error::from)
            }
            .boxed()
        });

        let bindings = match self.bring_up(name, &record.credentials).await {
            Ok(bindings) => bindings,
            Err(failure) => {
                return Err(self
                    .abort_publish(name, saga, failure, Some(LifecycleState::Stopped))
                    .await)
            }
        };

        self.mark_running(name, bindings);
        self.persist().await;
        info!(container = %name, "Container started");
        self.start_result(name)
    }

    /// Replace the container with one created from a snapshot image and start it.
    ///
    /// `version_tag` may be a bare tag or a full image reference; `None`
    /// restores the newest snapshot.
    pub async fn start_from_snapshot(
        &self,
        name: &str,
        version_tag: Option<&str>,
    ) -> Result<StartResult> {
        let _guard = self.guards.try_acquire(name, "restore")?;
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let snapshot = self.snapshots.restore(name, version_tag)?;

        match record.state {
            LifecycleState::Stopped | LifecycleState::Stale => {}
            LifecycleState::Running => {
                return Err(Error::Conflict {
                    name: name.to_string(),
                    reason: "is running; stop it before restoring a snapshot".to_string(),
                })
            }
            other => return Err(refresh_first(name, other)),
        }

        info!(
            container = %name,
            tag = %snapshot.version_tag,
            "Restoring container from snapshot"
        );
        self.relaunch("restore", name, snapshot.image_ref).await
    }

    /// Tear down tunnels, stop and remove the container, and forget it.
    ///
    /// Snapshot history survives unless `remove_snapshots` is set.
    pub async fn delete(&self, name: &str, remove_snapshots: bool) -> Result<DeleteResult> {
        let _guard = self.guards.try_acquire(name, "delete")?;
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let previous = record.state;

        self.transition(name, LifecycleState::Deleting);
        let released_ports = self.close_tunnels(name, "delete", previous).await?;

        if previous != LifecycleState::Stale {
            let mut saga = Saga::new("delete", name);
            if previous == LifecycleState::Running && !released_ports.is_empty() {
                saga.completed("re-publish tunnels", move || {
                    async move { self.republish(name).await }.boxed()
                });
            }
            match self
                .call_runtime("docker stop", self.runtime.stop(name))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let cause = self.runtime_error("delete", name, e);
                    return Err(self
                        .abort_start(name, saga, cause, Vec::new(), Some(previous))
                        .await);
                }
            }
        }

        if let Err(e) = self
            .call_runtime("docker rm", self.runtime.remove(name))
            .await
        {
            let cause = self.runtime_error("delete", name, e);
            if cause.is_timeout() {
                return Err(self.enter_unknown(name, cause).await);
            }
            let settled = if previous == LifecycleState::Stale {
                LifecycleState::Stale
            } else {
                LifecycleState::Stopped
            };
            self.transition(name, settled);
            self.persist().await;
            return Err(cause);
        }

        let removed_snapshots = if remove_snapshots {
            self.snapshots.purge(name)
        } else {
            Vec::new()
        };
        self.forget(name);
        self.persist().await;
        let unremoved_images = self.snapshots.delete_images(&removed_snapshots).await;

        info!(
            container = %name,
            released = released_ports.len(),
            snapshots_removed = removed_snapshots.len(),
            "Container deleted"
        );
        Ok(DeleteResult {
            name: name.to_string(),
            released_ports,
            removed_snapshots,
            unremoved_images,
        })
    }

    /// Commit a stopped container to a new snapshot without other changes.
    pub async fn snapshot(&self, name: &str, message: &str) -> Result<SnapshotResult> {
        let _guard = self.guards.try_acquire(name, "snapshot")?;
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if record.state != LifecycleState::Stopped {
            return Err(Error::Conflict {
                name: name.to_string(),
                reason: format!(
                    "must be stopped before it can be snapshotted (state: {})",
                    record.state
                ),
            });
        }
        self.commit_stopped(name, message).await
    }

    /// Snapshot a container that is known to be stopped, then delete
    /// evicted images once the new history is saved.
    async fn commit_stopped(&self, name: &str, message: &str) -> Result<SnapshotResult> {
        self.transition(name, LifecycleState::Snapshotting);
        match self.snapshots.commit(name, message).await {
            Ok(outcome) => {
                self.transition(name, LifecycleState::Stopped);
                self.persist().await;
                let unremoved_images = self.snapshots.delete_images(&outcome.evicted).await;
                Ok(SnapshotResult {
                    name: name.to_string(),
                    snapshot: outcome.record,
                    evicted: outcome.evicted,
                    unremoved_images,
                })
            }
            Err(e) => {
                let cause = self.classify("snapshot", name, e);
                if cause.is_timeout() {
                    return Err(self.enter_unknown(name, cause).await);
                }
                warn!(container = %name, error = %cause, "Snapshot failed");
                self.transition(name, LifecycleState::Stopped);
                self.persist().await;
                Err(cause)
            }
        }
    }

    /// Remove the current container, create a new one from `image` and
    /// start it with fresh tunnels. The record must be stopped or stale.
    async fn relaunch(
        &self,
        operation: &'static str,
        name: &str,
        image: String,
    ) -> Result<StartResult> {
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        if let Err(e) = self
            .call_runtime("docker rm", self.runtime.remove(name))
            .await
        {
            let cause = self.runtime_error(operation, name, e);
            if cause.is_timeout() {
                return Err(self.enter_unknown(name, cause).await);
            }
            return Err(cause);
        }
        self.mark_stale(name);

        let mut saga = Saga::new(operation, name);
        let spec = self.container_spec(
            name,
            &image,
            &record.resources,
            &record.volumes,
            &record.credentials,
        );
        let container_id = match self
            .call_runtime("docker create", self.runtime.create(&spec))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let cause = self.runtime_error(operation, name, e);
                return Err(self
                    .abort_start(name, saga, cause, Vec::new(), Some(LifecycleState::Stale))
                    .await);
            }
        };
        self.update(name, |record, _| {
            record.container_id = Some(container_id.clone());
            record.image = image.clone();
        });
        let previous_image = record.image;
        saga.completed(format!("container {}", name), move || {
            async move {
                self.call_runtime("docker rm", self.runtime.remove(name))
                    .await?;
                self.update(name, |record, _| {
                    record.container_id = None;
                    record.image = previous_image;
                });
                Ok::<(), Error>(())
            }
            .boxed()
        });

        if let Err(e) = self
            .call_runtime("docker start", self.runtime.start(name))
            .await
        {
            let cause = self.runtime_error(operation, name, e);
            return Err(self
                .abort_start(name, saga, cause, Vec::new(), Some(LifecycleState::Stale))
                .await);
        }

        let bindings = match self.bring_up(name, &record.credentials).await {
            Ok(bindings) => bindings,
            Err(failure) => {
                return Err(self
                    .abort_publish(name, saga, failure, Some(LifecycleState::Stale))
                    .await)
            }
        };

        self.mark_running(name, bindings);
        self.persist().await;
        info!(container = %name, image = %image, "Container re-created and started");
        self.start_result(name)
    }

    /// Close every tunnel of `name`. On failure the bindings that could not
    /// be closed are kept, and if some were closed the container goes to
    /// `unknown`. Returns the released ports.
    async fn close_tunnels(
        &self,
        name: &str,
        operation: &str,
        previous: LifecycleState,
    ) -> Result<Vec<u16>> {
        let mut bindings = self.bindings(name);
        let before: Vec<u16> = bindings.iter().map(|b| b.public_port).collect();

        match self.tunnels.close_all(name, &mut bindings).await {
            Ok(()) => {
                self.set_bindings(name, Vec::new());
                Ok(before)
            }
            Err(cause) => {
                let closed_some = bindings.len() < before.len();
                let unreconciled = describe_bindings(&bindings);
                let settled = if closed_some {
                    LifecycleState::Unknown
                } else {
                    previous
                };
                self.update(name, |record, slot| {
                    record.transition(settled);
                    *slot = bindings;
                });
                self.persist().await;

                if closed_some {
                    Err(Error::PartialFailure {
                        operation: operation.to_string(),
                        container: name.to_string(),
                        cause: Box::new(cause),
                        unreconciled,
                    })
                } else {
                    Err(cause)
                }
            }
        }
    }

    /// Inspect the now running container and publish its services.
    async fn bring_up(
        &self,
        name: &str,
        credentials: &Credentials,
    ) -> std::result::Result<Vec<TunnelBinding>, OpenFailure> {
        let (container_id, ip) = match self.container_address(name).await {
            Ok(address) => address,
            Err(e) => {
                return Err(OpenFailure::RolledBack(self.runtime_error(
                    "inspect",
                    name,
                    e,
                )))
            }
        };
        self.update(name, |record, _| {
            record.container_id = Some(container_id);
            record.ip_address = Some(ip.clone());
        });
        self.tunnels
            .open_all(name, &ip, &self.endpoints(credentials))
            .await
    }

    /// Publish the services of an already running container again.
    pub(super) async fn republish(&self, name: &str) -> Result<()> {
        let record = self
            .record(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let (_, ip) = self.container_address(name).await?;
        match self
            .tunnels
            .open_all(name, &ip, &self.endpoints(&record.credentials))
            .await
        {
            Ok(bindings) => {
                self.update(name, |record, slot| {
                    record.ip_address = Some(ip);
                    *slot = bindings;
                });
                Ok(())
            }
            Err(OpenFailure::RolledBack(cause)) => Err(cause),
            Err(OpenFailure::Partial { cause, remaining }) => {
                self.set_bindings(name, remaining);
                Err(cause)
            }
            Err(OpenFailure::Unsettled {
                cause, established, ..
            }) => {
                self.set_bindings(name, established);
                Err(cause)
            }
        }
    }

    /// Settle a failed publish step.
    async fn abort_publish(
        &self,
        name: &str,
        saga: Saga<'_>,
        failure: OpenFailure,
        settle: Option<LifecycleState>,
    ) -> Error {
        match failure {
            OpenFailure::RolledBack(cause) => {
                self.abort_start(name, saga, cause, Vec::new(), settle).await
            }
            OpenFailure::Partial { cause, remaining } => {
                self.abort_start(name, saga, cause, remaining, settle).await
            }
            OpenFailure::Unsettled {
                cause,
                established,
                pending_port,
            } => {
                let cause = if cause.is_timeout() {
                    cause
                } else {
                    let mut unreconciled = describe_bindings(&established);
                    unreconciled.push(format!(
                        "unconfirmed tunnel on public port {}",
                        pending_port
                    ));
                    Error::PartialFailure {
                        operation: saga.operation().to_string(),
                        container: name.to_string(),
                        cause: Box::new(cause),
                        unreconciled,
                    }
                };
                self.set_bindings(name, established);
                self.enter_unknown(name, cause).await
            }
        }
    }

    /// Compensate a failed operation and settle the record.
    ///
    /// `remaining` are bindings the failing step could not remove; they are
    /// kept on the record. When compensation leaves nothing behind the
    /// record goes to `settle`, or is dropped when `settle` is `None`.
    /// Anything left behind makes the container `unknown`.
    async fn abort_start(
        &self,
        name: &str,
        saga: Saga<'_>,
        cause: Error,
        remaining: Vec<TunnelBinding>,
        settle: Option<LifecycleState>,
    ) -> Error {
        if cause.is_timeout() {
            self.update(name, |_, slot| slot.extend(remaining));
            return self.enter_unknown(name, cause).await;
        }

        let err = saga.compensate(cause, describe_bindings(&remaining)).await;
        let clean = !matches!(err, Error::PartialFailure { .. });
        match settle {
            None if clean => {
                self.forget(name);
            }
            _ => {
                let state = if clean {
                    settle.unwrap_or(LifecycleState::Unknown)
                } else {
                    LifecycleState::Unknown
                };
                self.update(name, |record, slot| {
                    record.transition(state);
                    if state != LifecycleState::Running {
                        record.ip_address = None;
                    }
                    slot.extend(remaining);
                });
            }
        }
        self.persist().await;
        warn!(container = %name, error = %err, "Operation rolled back");
        err
    }

    pub(super) fn mark_running(&self, name: &str, bindings: Vec<TunnelBinding>) {
        self.update(name, |record, slot| {
            record.transition(LifecycleState::Running);
            *slot = bindings;
        });
    }

    /// The runtime no longer has the container.
    pub(super) fn mark_stale(&self, name: &str) {
        self.update(name, |record, _| {
            record.container_id = None;
            record.ip_address = None;
            record.transition(LifecycleState::Stale);
        });
    }

    fn start_result(&self, name: &str) -> Result<StartResult> {
        let ledger = self.ledger.lock();
        let record = ledger
            .containers
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let bindings = ledger.tunnels.get(name).cloned().unwrap_or_default();

        Ok(StartResult {
            name: record.name.clone(),
            state: record.state,
            container_id: record.container_id.clone(),
            image: record.image.clone(),
            ports: bindings
                .iter()
                .map(|b| (b.service_type, b.public_port))
                .collect(),
            bindings,
            credentials: record.credentials.clone(),
        })
    }
}

fn refresh_first(name: &str, state: LifecycleState) -> Error {
    Error::Conflict {
        name: name.to_string(),
        reason: format!(
            "is {}; refresh it with `devbox status {}` first",
            state, name
        ),
    }
}
