//! Configuration parsing and types.
//!
//! The configuration file (`devbox.yaml`) is parsed into typed structs and
//! validated up front so that lifecycle operations never see a malformed
//! option:
//!
//! - `types` - Root [`Config`] and the per-section structs
//! - `service` - Exposed container services ([`ServiceKind`], [`ServiceConfig`])
//! - `resources` - Container resource limits and volume mounts
//! - `duration` - Human-readable durations ("30s", "5m")
//! - `parser` - YAML loading
//! - `validation` - Fail-fast validation

mod duration;
mod parser;
mod resources;
mod service;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use resources::*;
pub use service::*;
pub use types::*;
