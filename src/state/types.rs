use crate::config::{ResourceLimits, ServiceKind, VolumeMount};
use crate::credentials::Credentials;
use crate::relay::TunnelId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a managed container.
///
/// A container with no record is absent. `Unknown` follows a timed-out
/// runtime or relay call whose effect could not be observed; `Stale` means
/// the runtime no longer reports the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Creating,
    Running,
    Stopped,
    Snapshotting,
    Deleting,
    Unknown,
    Stale,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Creating => "creating",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Snapshotting => "snapshotting",
            LifecycleState::Deleting => "deleting",
            LifecycleState::Unknown => "unknown",
            LifecycleState::Stale => "stale",
        }
    }

    /// States only observed while an operation is in flight. Finding one at
    /// load time means the process died mid-operation.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            LifecycleState::Creating | LifecycleState::Snapshotting | LifecycleState::Deleting
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one managed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,

    /// Runtime container id, absent while creating or once stale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    pub state: LifecycleState,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Image the current runtime container was created from
    pub image: String,

    /// Image given at create time
    pub base_image: String,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,

    #[serde(default)]
    pub credentials: Credentials,

    /// Last internal address reported by the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl ContainerRecord {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        resources: ResourceLimits,
        volumes: Vec<VolumeMount>,
        credentials: Credentials,
    ) -> Self {
        let image = image.into();
        let now = Utc::now();
        Self {
            name: name.into(),
            container_id: None,
            state: LifecycleState::Creating,
            created_at: now,
            updated_at: now,
            base_image: image.clone(),
            image,
            resources,
            volumes,
            credentials,
            ip_address: None,
        }
    }

    pub fn transition(&mut self, state: LifecycleState) {
        if self.state != state {
            tracing::debug!(
                container = %self.name,
                from = %self.state,
                to = %state,
                "Lifecycle transition"
            );
        }
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// One published service of a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelBinding {
    pub service_type: ServiceKind,
    pub internal_port: u16,
    pub public_port: u16,
    pub tunnel_id: TunnelId,
    /// Password or token in effect when the binding was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// One committed snapshot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub version_tag: String,
    pub image_ref: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// Contents of the tunnel-state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelFile {
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerRecord>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, Vec<TunnelBinding>>,
}

/// Contents of the image-mapping file: history per container, oldest first.
pub type ImageFile = BTreeMap<String, Vec<SnapshotRecord>>;

/// Everything devbox persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub containers: BTreeMap<String, ContainerRecord>,
    pub tunnels: BTreeMap<String, Vec<TunnelBinding>>,
    pub snapshots: BTreeMap<String, Vec<SnapshotRecord>>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.snapshots.is_empty()
    }

    pub fn bindings(&self, name: &str) -> &[TunnelBinding] {
        self.tunnels.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn history(&self, name: &str) -> &[SnapshotRecord] {
        self.snapshots.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}
