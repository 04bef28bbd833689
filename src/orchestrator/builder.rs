use super::Orchestrator;
use crate::config::{Config, RelayKind};
use crate::error::{Error, Result};
use crate::relay::{InMemoryRelay, NpsRelay, TunnelRelay};
use crate::runtime::{check_daemon_with_retry, ContainerRuntime, DockerRuntime, RuntimeError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DAEMON_CHECK_ATTEMPTS: u32 = 5;
const DAEMON_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for constructing an `Orchestrator` with a fluent API.
///
/// This builder pattern makes orchestrator initialization less error-prone by:
/// - Ensuring `initialize()` is called automatically
/// - Validating configuration before construction
/// - Picking the runtime and relay from config unless given explicitly
///
/// # Example
///
/// ```no_run
/// use devbox::{Config, Orchestrator};
/// use devbox::relay::InMemoryRelay;
/// use devbox::runtime::InMemoryRuntime;
/// use std::path::PathBuf;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), devbox::Error> {
/// let orchestrator = Orchestrator::builder()
///     .config(Config::default())
///     .work_dir(PathBuf::from("."))
///     .runtime(Arc::new(InMemoryRuntime::new()))
///     .relay(Arc::new(InMemoryRelay::new()))
///     .build()
///     .await?;
/// // initialize() is called automatically
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<Config>,
    work_dir: Option<PathBuf>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    relay: Option<Arc<dyn TunnelRelay>>,
}

impl OrchestratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// This is required to build the orchestrator.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the directory relative state file paths resolve against.
    ///
    /// If not set, defaults to the current directory (".").
    pub fn work_dir(mut self, dir: PathBuf) -> Self {
        self.work_dir = Some(dir);
        self
    }

    /// Use `runtime` instead of the docker CLI.
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Use `relay` instead of the one named by `relay.kind`.
    pub fn relay(mut self, relay: Arc<dyn TunnelRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Build the orchestrator and initialize it.
    ///
    /// This method performs the following steps:
    /// 1. Validates the configuration
    /// 2. Waits for the docker daemon when no runtime was supplied
    /// 3. Creates the orchestrator instance
    /// 4. Calls `initialize()` automatically
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Config is not set or invalid
    /// - The docker daemon does not answer
    /// - Initialization fails (see [`Orchestrator::initialize`])
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self
            .config
            .ok_or_else(|| Error::Validation("config is required".to_string()))?;
        config.validate()?;

        let runtime: Arc<dyn ContainerRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None => {
                if !check_daemon_with_retry(DAEMON_CHECK_ATTEMPTS, DAEMON_CHECK_TIMEOUT).await {
                    return Err(Error::RuntimeFailure(RuntimeError::DaemonUnavailable));
                }
                Arc::new(DockerRuntime::new(config.runtime.timeout()))
            }
        };
        let relay: Arc<dyn TunnelRelay> = match self.relay {
            Some(relay) => relay,
            None => match config.relay.kind {
                RelayKind::Nps => Arc::new(NpsRelay::new(&config.relay)?),
                RelayKind::Memory => Arc::new(InMemoryRelay::new()),
            },
        };

        let work_dir = self.work_dir.unwrap_or_else(|| PathBuf::from("."));
        let orchestrator = Orchestrator::new(config, work_dir, runtime, relay);
        orchestrator.initialize().await?;

        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InMemoryRuntime;

    #[tokio::test]
    async fn test_builder_requires_config() {
        let result = OrchestratorBuilder::new().build().await;
        match result {
            Err(Error::Validation(msg)) => assert!(msg.contains("config is required")),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let mut config = Config::default();
        config.ports.start = 20000;
        config.ports.end = 10000;

        let result = OrchestratorBuilder::new()
            .config(config)
            .runtime(Arc::new(InMemoryRuntime::new()))
            .relay(Arc::new(InMemoryRelay::new()))
            .build()
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_builder_initializes_from_empty_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = OrchestratorBuilder::new()
            .config(Config::default())
            .work_dir(dir.path().to_path_buf())
            .runtime(Arc::new(InMemoryRuntime::new()))
            .relay(Arc::new(InMemoryRelay::new()))
            .build()
            .await
            .unwrap();

        assert!(orchestrator.list().await.is_empty());
        assert!(!orchestrator.has_unsaved_changes());
    }
}
