use super::guards::OperationGuards;
use crate::config::{Config, ResourceLimits, VolumeMount};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::lock_order::{LockId, OrderedMutex};
use crate::port::{PortAllocator, PortOwner, PortUsage};
use crate::relay::TunnelRelay;
use crate::runtime::{
    self, bootstrap, ContainerRuntime, ContainerSpec, RuntimeError, MANAGED_LABEL, NAME_LABEL,
};
use crate::snapshot::SnapshotManager;
use crate::state::{ContainerRecord, LifecycleState, PersistedState, StateStore, TunnelBinding};
use crate::tunnel::{ServiceEndpoint, TunnelCoordinator};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Container records and the bindings of running containers.
#[derive(Debug, Default)]
pub(super) struct Ledger {
    pub containers: BTreeMap<String, ContainerRecord>,
    pub tunnels: BTreeMap<String, Vec<TunnelBinding>>,
}

/// The control plane for dev containers.
///
/// The Orchestrator drives each container through its lifecycle and keeps
/// three independently failing resources consistent: the container
/// runtime, the tunnel relay, and the persisted state files.
///
/// # Concurrency Model
///
/// - Every method takes `&self`; wrap the orchestrator in an `Arc` to share it
/// - At most one lifecycle operation runs per container name. A second one
///   fails fast with [`Error::Busy`]; operations on different names run
///   concurrently
/// - Shared maps (records, snapshot history, port pool) sit behind short
///   [`OrderedMutex`] critical sections that are never held across an
///   `.await`
/// - Runtime and relay calls are bounded by timeouts. A timed-out call
///   leaves its container `unknown` until a status refresh
///
/// # Lock Ordering (to prevent deadlocks)
///
/// 1. `guards` (per-name operation table)
/// 2. `ledger` (records and bindings)
/// 3. `history` (snapshot history, inside [`SnapshotManager`])
/// 4. `ports` (inside [`PortAllocator`])
///
/// # Example
///
/// ```no_run
/// use devbox::{Config, Orchestrator};
/// use devbox::orchestrator::CreateOptions;
///
/// # async fn example() -> Result<(), devbox::Error> {
/// let orchestrator = Orchestrator::builder()
///     .config(Config::default())
///     .work_dir(std::path::PathBuf::from("."))
///     .build()
///     .await?;
///
/// let created = orchestrator
///     .create("c1", "nvidia/cuda:12.2.0-devel-ubuntu22.04", CreateOptions::default())
///     .await?;
/// println!("ssh on public port {:?}", created.ports);
///
/// orchestrator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    pub(super) config: Config,
    work_dir: PathBuf,
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) ports: Arc<PortAllocator>,
    pub(super) tunnels: TunnelCoordinator,
    pub(super) snapshots: SnapshotManager,
    store: StateStore,
    pub(super) ledger: OrderedMutex<Ledger>,
    pub(super) guards: OperationGuards,
    pub(super) runtime_timeout: Duration,
    /// Serializes state snapshots with their writes so saves land in order
    persist_lock: tokio::sync::Mutex<()>,
    /// Set by every mutation, cleared by a successful save
    dirty: AtomicBool,
    initialized: AtomicBool,
    autosave_shutdown: Arc<Notify>,
    autosave_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create a builder for constructing an `Orchestrator` with a fluent API.
    ///
    /// This is the preferred way to create an orchestrator as it validates
    /// the config, picks runtime and relay, and calls `initialize()`.
    pub fn builder() -> crate::orchestrator::OrchestratorBuilder {
        crate::orchestrator::OrchestratorBuilder::new()
    }

    /// Assemble an orchestrator. No I/O happens until [`initialize`].
    ///
    /// [`initialize`]: Orchestrator::initialize
    pub fn new(
        config: Config,
        work_dir: PathBuf,
        runtime: Arc<dyn ContainerRuntime>,
        relay: Arc<dyn TunnelRelay>,
    ) -> Self {
        let runtime_timeout = config.runtime.timeout();
        let ports = Arc::new(PortAllocator::new(&config.ports));
        let tunnels = TunnelCoordinator::new(
            relay,
            Arc::clone(&ports),
            config.relay.timeout(),
            config.relay.teardown_retries,
        );
        let snapshots =
            SnapshotManager::new(Arc::clone(&runtime), &config.snapshots, runtime_timeout);
        let (tunnel_path, image_path) = config.persistence.resolve(&work_dir);

        Self {
            store: StateStore::new(tunnel_path, image_path),
            config,
            work_dir,
            runtime,
            ports,
            tunnels,
            snapshots,
            ledger: OrderedMutex::new(LockId::Ledger, Ledger::default()),
            guards: OperationGuards::new(),
            runtime_timeout,
            persist_lock: tokio::sync::Mutex::new(()),
            dirty: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            autosave_shutdown: Arc::new(Notify::new()),
            autosave_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Load persisted state and reconcile it against the runtime.
    ///
    /// 1. Reads both state files. Unreadable state is [`Error::CorruptState`]
    ///    and aborts startup
    /// 2. Re-reserves the public ports of recorded bindings
    /// 3. Adopts snapshot images that lack a record
    /// 4. Refreshes every container against the runtime
    /// 5. Saves, then deletes images evicted by step 3
    ///
    /// Runs once; later calls return immediately.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Orchestrator already initialized");
            return Ok(());
        }

        let state = self.store.load()?;
        let PersistedState {
            containers,
            tunnels,
            snapshots,
        } = state;

        let mut claims = Vec::new();
        for (name, bindings) in &tunnels {
            for binding in bindings {
                claims.push((
                    binding.public_port,
                    PortOwner::new(name.clone(), binding.service_type),
                ));
            }
        }
        let mut names: BTreeSet<String> = containers.keys().cloned().collect();
        names.extend(snapshots.keys().cloned());

        self.snapshots.load(snapshots);
        {
            let mut ledger = self.ledger.lock();
            ledger.containers = containers;
            ledger.tunnels = tunnels;
        }
        for (port, owner) in claims {
            self.ports
                .mark_allocated(port, owner)
                .map_err(|e| Error::CorruptState {
                    path: self.store.tunnel_path().to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        let names: Vec<String> = names.into_iter().collect();
        let (adopted, evicted) = self.snapshots.recover(&names).await?;
        if adopted > 0 {
            self.mark_dirty();
        }

        let report = self.reconcile().await;
        info!(
            containers = report.checked,
            drifted = report.drifted.len(),
            errors = report.errors.len(),
            "Orchestrator initialized"
        );

        if self.dirty.load(Ordering::SeqCst) {
            self.flush().await?;
        }
        if !evicted.is_empty() {
            self.snapshots.delete_images(&evicted).await;
        }
        Ok(())
    }

    /// Start the periodic flush task when `persistence.autosave_interval` is set.
    ///
    /// The task holds a weak reference and exits once the orchestrator is
    /// dropped or [`shutdown`](Orchestrator::shutdown) is called.
    pub async fn start_autosave(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.persistence.autosave_interval() else {
            return false;
        };

        let weak = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.autosave_shutdown);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        let Some(orchestrator) = weak.upgrade() else {
                            break;
                        };
                        if orchestrator.dirty.load(Ordering::SeqCst) {
                            if let Err(e) = orchestrator.flush().await {
                                warn!(error = %e, "Autosave failed");
                            }
                        }
                    }
                }
            }
            debug!("Autosave task stopped");
        });

        *self.autosave_task.lock().await = Some(handle);
        info!(interval = ?interval, "Autosave enabled");
        true
    }

    /// Stop the autosave task and write any pending changes.
    pub async fn shutdown(&self) {
        self.autosave_shutdown.notify_one();
        let handle = self.autosave_task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Autosave task did not stop in time");
            }
        }

        if self.dirty.load(Ordering::SeqCst) {
            if let Err(e) = self.flush().await {
                error!(error = %e, "Failed to save state on shutdown");
            }
        }
    }

    /// Write the current state now.
    pub async fn flush(&self) -> Result<()> {
        let _serial = self.persist_lock.lock().await;
        self.dirty.store(false, Ordering::SeqCst);
        let state = self.export_state();
        if let Err(e) = self.store.save(&state).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Everything that would be persisted, as of now.
    pub fn export_state(&self) -> PersistedState {
        let (containers, tunnels) = {
            let ledger = self.ledger.lock();
            (ledger.containers.clone(), ledger.tunnels.clone())
        };
        PersistedState {
            containers,
            tunnels,
            snapshots: self.snapshots.export(),
        }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn port_usage(&self) -> PortUsage {
        self.ports.usage()
    }

    pub(super) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Record a mutation and save it when `save_on_mutation` is on.
    ///
    /// A failed save is logged and left for the next save or autosave: the
    /// in-memory state is already correct and the operation has happened.
    pub(super) async fn persist(&self) {
        self.mark_dirty();
        if !self.config.persistence.save_on_mutation {
            return;
        }
        if let Err(e) = self.flush().await {
            error!(error = %e, "Failed to save state; will retry on next save");
        }
    }

    pub(super) fn record(&self, name: &str) -> Option<ContainerRecord> {
        self.ledger.lock().containers.get(name).cloned()
    }

    pub(super) fn bindings(&self, name: &str) -> Vec<TunnelBinding> {
        self.ledger
            .lock()
            .tunnels
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Mutate the record of `name` and its bindings under the ledger lock.
    pub(super) fn update<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ContainerRecord, &mut Vec<TunnelBinding>) -> R,
    ) -> Option<R> {
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;
        let record = ledger.containers.get_mut(name)?;
        let bindings = ledger.tunnels.entry(name.to_string()).or_default();
        let result = f(record, bindings);
        let empty = bindings.is_empty();
        if empty {
            ledger.tunnels.remove(name);
        }
        Some(result)
    }

    pub(super) fn set_bindings(&self, name: &str, bindings: Vec<TunnelBinding>) {
        self.update(name, |_, slot| *slot = bindings);
    }

    pub(super) fn transition(&self, name: &str, state: LifecycleState) {
        self.update(name, |record, _| record.transition(state));
    }

    /// Drop the record of `name` and its bindings.
    pub(super) fn forget(&self, name: &str) -> Option<ContainerRecord> {
        let mut ledger = self.ledger.lock();
        ledger.tunnels.remove(name);
        ledger.containers.remove(name)
    }

    /// The effect of a timed-out call is unknown: mark the container
    /// `unknown`, persist, and hand back the timeout without compensating.
    pub(super) async fn enter_unknown(&self, name: &str, cause: Error) -> Error {
        warn!(container = %name, error = %cause, "Container state is now unknown");
        self.transition(name, LifecycleState::Unknown);
        self.persist().await;
        cause
    }

    /// Bound a runtime call by the configured runtime timeout.
    pub(super) async fn call_runtime<T>(
        &self,
        command: &str,
        call: impl Future<Output = std::result::Result<T, RuntimeError>>,
    ) -> std::result::Result<T, RuntimeError> {
        runtime::with_timeout(self.runtime_timeout, command, call).await
    }

    /// Convert a runtime error, turning timeouts into [`Error::Timeout`].
    pub(super) fn runtime_error(&self, operation: &str, name: &str, err: RuntimeError) -> Error {
        match err {
            RuntimeError::Timeout { timeout, .. } => Error::Timeout {
                operation: operation.to_string(),
                container: name.to_string(),
                after: timeout,
            },
            other => Error::RuntimeFailure(other),
        }
    }

    /// Same as [`runtime_error`](Self::runtime_error) for errors that were
    /// already converted by a collaborator.
    pub(super) fn classify(&self, operation: &str, name: &str, err: Error) -> Error {
        match err {
            Error::RuntimeFailure(e) => self.runtime_error(operation, name, e),
            Error::RelayFailure(e) if e.is_timeout() => Error::Timeout {
                operation: operation.to_string(),
                container: name.to_string(),
                after: self.config.relay.timeout(),
            },
            other => other,
        }
    }

    /// Internal address of a running container.
    pub(super) async fn container_address(
        &self,
        name: &str,
    ) -> std::result::Result<(String, String), RuntimeError> {
        let info = self
            .call_runtime("docker inspect", self.runtime.inspect(name))
            .await?
            .ok_or_else(|| RuntimeError::not_found(name))?;
        match info.ip_address.filter(|ip| !ip.is_empty()) {
            Some(ip) => Ok((info.id, ip)),
            None => Err(RuntimeError::Unexpected {
                command: "docker inspect".to_string(),
                detail: format!("container {} has no IP address", name),
            }),
        }
    }

    /// One endpoint per configured service, with the container's credentials.
    pub(super) fn endpoints(&self, credentials: &Credentials) -> Vec<ServiceEndpoint> {
        self.config
            .services
            .iter()
            .map(|(kind, service)| ServiceEndpoint {
                kind: *kind,
                internal_port: service.port,
                credential: credentials.for_service(*kind),
            })
            .collect()
    }

    /// Whether `bindings` hold exactly one binding per configured service.
    pub(super) fn bindings_complete(&self, bindings: &[TunnelBinding]) -> bool {
        let kinds: BTreeSet<_> = bindings.iter().map(|b| b.service_type).collect();
        bindings.len() == self.config.services.len()
            && self.config.services.keys().all(|k| kinds.contains(k))
    }

    pub(super) fn container_spec(
        &self,
        name: &str,
        image: &str,
        resources: &ResourceLimits,
        volumes: &[VolumeMount],
        credentials: &Credentials,
    ) -> ContainerSpec {
        let container = &self.config.container;
        let command = container.command.clone().or_else(|| {
            Some(bootstrap::startup_script(
                &self.config.services,
                &bootstrap::BootstrapCredentials {
                    root_password: credentials.root_password.as_deref(),
                    notebook_token: credentials.notebook_token.as_deref(),
                },
            ))
        });

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(NAME_LABEL.to_string(), name.to_string());

        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            hostname: container.hostname.clone(),
            network: container.network.clone(),
            resources: resources.clone(),
            volumes: volumes.to_vec(),
            env: credentials.env(),
            labels,
            command,
            working_dir: None,
            restart_retries: container.restart_retries,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Best effort; call shutdown() to also flush pending changes
        self.autosave_shutdown.notify_one();
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("work_dir", &self.work_dir)
            .field("runtime_timeout", &self.runtime_timeout)
            .field("tunnel_state_file", &self.store.tunnel_path())
            .field("image_mapping_file", &self.store.image_path())
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish()
    }
}
