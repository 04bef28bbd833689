//! Tunnel relay seam.
//!
//! A relay maps a public port to `container_ip:internal_port`. The
//! orchestrator only needs [`TunnelRelay::register`] and
//! [`TunnelRelay::deregister`]; [`NpsRelay`] speaks the NPS server HTTP API
//! and [`InMemoryRelay`] records tunnels in a map.

pub mod error;
pub mod memory;
pub mod nps;

pub use error::RelayError;
pub use memory::InMemoryRelay;
pub use nps::NpsRelay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-assigned tunnel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelId(pub String);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        TunnelId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub public_port: u16,
    /// `host:port` the relay forwards to
    pub target: String,
    /// Free-form label shown in the relay UI
    pub remark: String,
}

#[async_trait]
pub trait TunnelRelay: Send + Sync {
    async fn register(&self, request: &TunnelRequest) -> Result<TunnelId, RelayError>;

    /// Removing a tunnel the relay no longer knows is success.
    async fn deregister(&self, tunnel_id: &TunnelId) -> Result<(), RelayError>;
}
