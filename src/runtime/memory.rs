//! In-process container runtime.
//!
//! Keeps containers and images in maps. Tests use the injection hooks to
//! make individual calls fail or stall, and to simulate containers that
//! exit or disappear behind the orchestrator's back.

use super::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Create,
    Start,
    Stop,
    Remove,
    Commit,
    RemoveImage,
    Inspect,
    List,
    ListImages,
}

#[derive(Debug, Clone)]
struct MemContainer {
    id: String,
    spec: ContainerSpec,
    running: bool,
    ip_address: String,
}

impl MemContainer {
    fn info(&self) -> RuntimeInfo {
        RuntimeInfo {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            running: self.running,
            status: if self.running { "running" } else { "exited" }.to_string(),
            image: self.spec.image.clone(),
            ip_address: self.running.then(|| self.ip_address.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemContainer>,
    images: BTreeSet<String>,
    failures: HashMap<RuntimeOp, u32>,
    delays: HashMap<RuntimeOp, Duration>,
    calls: HashMap<RuntimeOp, u32>,
    next_id: u64,
}

impl MemoryState {
    fn find_mut(&mut self, key: &str) -> Option<&mut MemContainer> {
        if self.containers.contains_key(key) {
            return self.containers.get_mut(key);
        }
        self.containers.values_mut().find(|c| c.id == key)
    }

    fn name_of(&self, key: &str) -> Option<String> {
        if self.containers.contains_key(key) {
            return Some(key.to_string());
        }
        self.containers
            .values()
            .find(|c| c.id == key)
            .map(|c| c.spec.name.clone())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    state: Mutex<MemoryState>,
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: RuntimeOp) {
        self.fail_times(op, 1);
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail_times(&self, op: RuntimeOp, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// Stall every call of `op` for `delay` before it takes effect.
    pub fn delay(&self, op: RuntimeOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    pub fn clear_delay(&self, op: RuntimeOp) {
        self.state.lock().delays.remove(&op);
    }

    /// Number of times `op` was invoked, including failed calls.
    pub fn calls(&self, op: RuntimeOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// The container process exits on its own.
    pub fn simulate_exit(&self, name: &str) {
        if let Some(c) = self.state.lock().find_mut(name) {
            c.running = false;
        }
    }

    /// The container is removed outside of devbox.
    pub fn simulate_removal(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(name) = state.name_of(name) {
            state.containers.remove(&name);
        }
    }

    /// Seed an image as if it had been committed earlier.
    pub fn add_image(&self, image_ref: &str) {
        self.state.lock().images.insert(image_ref.to_string());
    }

    pub fn has_image(&self, image_ref: &str) -> bool {
        self.state.lock().images.contains(image_ref)
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn container(&self, name: &str) -> Option<RuntimeInfo> {
        let state = self.state.lock();
        state.containers.get(name).map(MemContainer::info)
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        let state = self.state.lock();
        state.containers.get(name).map(|c| c.spec.clone())
    }

    /// Record the call, apply any configured stall, then consume one injected failure.
    async fn enter(&self, op: RuntimeOp, target: &str) -> Result<(), RuntimeError> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::cmd_failed(
                    format!("{:?} {}", op, target),
                    "injected failure",
                    Some(1),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.enter(RuntimeOp::Create, &spec.name).await?;
        let mut state = self.state.lock();
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::cmd_failed(
                "docker create",
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
                Some(125),
            ));
        }
        state.next_id += 1;
        let n = state.next_id;
        let container = MemContainer {
            id: format!("{:064x}", n),
            spec: spec.clone(),
            running: false,
            ip_address: format!("172.17.{}.{}", (n / 250) % 250, n % 250 + 2),
        };
        let id = container.id.clone();
        state.containers.insert(spec.name.clone(), container);
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Start, container).await?;
        let mut state = self.state.lock();
        let c = state
            .find_mut(container)
            .ok_or_else(|| RuntimeError::not_found(container))?;
        c.running = true;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Stop, container).await?;
        let mut state = self.state.lock();
        let c = state
            .find_mut(container)
            .ok_or_else(|| RuntimeError::not_found(container))?;
        c.running = false;
        Ok(())
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Remove, container).await?;
        let mut state = self.state.lock();
        if let Some(name) = state.name_of(container) {
            state.containers.remove(&name);
        }
        Ok(())
    }

    async fn commit(
        &self,
        container: &str,
        image_ref: &str,
        _message: &str,
    ) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::Commit, container).await?;
        let mut state = self.state.lock();
        if state.find_mut(container).is_none() {
            return Err(RuntimeError::not_found(container));
        }
        state.images.insert(image_ref.to_string());
        Ok(())
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        self.enter(RuntimeOp::RemoveImage, image_ref).await?;
        self.state.lock().images.remove(image_ref);
        Ok(())
    }

    async fn inspect(&self, container: &str) -> Result<Option<RuntimeInfo>, RuntimeError> {
        self.enter(RuntimeOp::Inspect, container).await?;
        let mut state = self.state.lock();
        Ok(state.find_mut(container).map(|c| c.info()))
    }

    async fn list(&self) -> Result<Vec<RuntimeInfo>, RuntimeError> {
        self.enter(RuntimeOp::List, "").await?;
        let state = self.state.lock();
        Ok(state.containers.values().map(MemContainer::info).collect())
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        self.enter(RuntimeOp::ListImages, repository).await?;
        let prefix = format!("{}:", repository);
        let state = self.state.lock();
        Ok(state
            .images
            .iter()
            .filter(|i| i.starts_with(&prefix))
            .cloned()
            .collect())
    }
}
