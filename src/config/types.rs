//! Core configuration types.
//!
//! This module contains the root [`Config`] struct and the section structs
//! of `devbox.yaml`. Every section has serde defaults so a minimal file only
//! needs to name what differs.

use super::{parse_duration_string, ResourceLimits, ServiceConfig, ServiceKind, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for devbox.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: PortConfig,

    /// Services tunneled for every container, keyed by kind
    #[serde(default = "default_services")]
    pub services: BTreeMap<ServiceKind, ServiceConfig>,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: PortConfig::default(),
            services: default_services(),
            container: ContainerConfig::default(),
            snapshots: SnapshotConfig::default(),
            persistence: PersistenceConfig::default(),
            runtime: RuntimeConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

fn default_services() -> BTreeMap<ServiceKind, ServiceConfig> {
    ServiceKind::ALL
        .iter()
        .map(|kind| (*kind, ServiceConfig::default_for(*kind)))
        .collect()
}

/// How free public ports are picked from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Lowest free port first
    Sequential,
    /// Uniform draw over free ports
    #[default]
    Random,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Public port pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,

    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Ports inside the range that are never handed out
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub reserved: BTreeSet<u16>,

    #[serde(default)]
    pub strategy: AllocationStrategy,

    /// Sub-ranges tried first by the random strategy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefer_ranges: Vec<PortRange>,
}

fn default_port_start() -> u16 {
    10000
}

fn default_port_end() -> u16 {
    20000
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            reserved: BTreeSet::new(),
            strategy: AllocationStrategy::default(),
            prefer_ranges: Vec::new(),
        }
    }
}

impl PortConfig {
    pub fn range(&self) -> PortRange {
        PortRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// Runtime settings shared by all created containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Docker network to attach to (default bridge when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// `on-failure` restart retries
    #[serde(default = "default_restart_retries")]
    pub restart_retries: u32,

    /// Replaces the generated bootstrap script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
}

fn default_hostname() -> String {
    "devbox".to_string()
}

fn default_restart_retries() -> u32 {
    3
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            network: None,
            restart_retries: default_restart_retries(),
            command: None,
            resources: ResourceLimits::default(),
            volumes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Snapshots kept per container; older ones are evicted and their images deleted
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Snapshot images are named `<prefix><container>:<tag>`
    #[serde(default = "default_repository_prefix")]
    pub repository_prefix: String,
}

fn default_max_history() -> usize {
    5
}

fn default_repository_prefix() -> String {
    "devbox-snapshot/".to_string()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            repository_prefix: default_repository_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_tunnel_state_file")]
    pub tunnel_state_file: PathBuf,

    #[serde(default = "default_image_mapping_file")]
    pub image_mapping_file: PathBuf,

    /// Write both files after every lifecycle transition
    #[serde(default = "default_save_on_mutation")]
    pub save_on_mutation: bool,

    /// Periodic flush of pending changes (e.g. "5m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autosave_interval: Option<String>,
}

fn default_tunnel_state_file() -> PathBuf {
    PathBuf::from(".devbox/tunnels.json")
}

fn default_image_mapping_file() -> PathBuf {
    PathBuf::from(".devbox/images.json")
}

fn default_save_on_mutation() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            tunnel_state_file: default_tunnel_state_file(),
            image_mapping_file: default_image_mapping_file(),
            save_on_mutation: default_save_on_mutation(),
            autosave_interval: None,
        }
    }
}

impl PersistenceConfig {
    /// Resolve relative file paths against `base`.
    pub fn resolve(&self, base: &Path) -> (PathBuf, PathBuf) {
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        (
            resolve(&self.tunnel_state_file),
            resolve(&self.image_mapping_file),
        )
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        self.autosave_interval
            .as_deref()
            .and_then(parse_duration_string)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound for a single container runtime call
    #[serde(default = "default_runtime_timeout")]
    pub timeout: String,
}

fn default_runtime_timeout() -> String {
    "120s".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: default_runtime_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration_string(&self.timeout).unwrap_or(Duration::from_secs(120))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayKind {
    /// NPS relay server HTTP API
    #[default]
    Nps,
    /// In-process relay that routes nothing; for local dry runs
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub kind: RelayKind,

    #[serde(default = "default_relay_address")]
    pub address: String,

    #[serde(default)]
    pub auth_key: String,

    /// Relay-side client the tunnels are attached to
    #[serde(default = "default_client_id")]
    pub client_id: u32,

    /// Upper bound for a single relay call
    #[serde(default = "default_relay_timeout")]
    pub timeout: String,

    /// Attempts to look up the tunnel id after registration
    #[serde(default = "default_relay_retries")]
    pub lookup_retries: u32,

    /// Attempts per tunnel when deregistering
    #[serde(default = "default_relay_retries")]
    pub teardown_retries: u32,
}

fn default_relay_address() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_client_id() -> u32 {
    2
}

fn default_relay_timeout() -> String {
    "10s".to_string()
}

fn default_relay_retries() -> u32 {
    3
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            kind: RelayKind::default(),
            address: default_relay_address(),
            auth_key: String::new(),
            client_id: default_client_id(),
            timeout: default_relay_timeout(),
            lookup_retries: default_relay_retries(),
            teardown_retries: default_relay_retries(),
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration_string(&self.timeout).unwrap_or(Duration::from_secs(10))
    }
}
