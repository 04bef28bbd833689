//! # devbox
//!
//! Lifecycle and tunnel orchestration for GPU development containers.
//!
//! ## Features
//!
//! - **Container Lifecycle**: Create, stop, start, restore and delete dev containers with a per-name state machine
//! - **Tunneled Services**: SSH, notebook and application ports published through a tunnel relay on pooled public ports
//! - **Snapshot History**: Commit stopped containers to versioned images with bounded, oldest-first eviction
//! - **Crash Consistency**: Atomic state files, saga compensation on partial failure, reconciliation against the runtime at startup
//! - **Timeouts**: Bounded runtime and relay calls; a timed-out operation leaves the container `unknown` until refreshed
//!
//! ## Quick Start
//!
//! ```no_run
//! use devbox::{Orchestrator, Parser};
//! use devbox::orchestrator::{CreateOptions, StopOptions};
//!
//! # async fn example() -> Result<(), devbox::Error> {
//! let config = Parser::new().load_config("devbox.yaml")?;
//!
//! // Validates config, probes the docker daemon, loads and reconciles state
//! let orchestrator = Orchestrator::builder()
//!     .config(config)
//!     .work_dir(std::path::PathBuf::from("."))
//!     .build()
//!     .await?;
//!
//! let created = orchestrator
//!     .create("c1", "nvidia/cuda:12.2.0-devel-ubuntu22.04", CreateOptions::default())
//!     .await?;
//! println!("public ports: {:?}", created.ports);
//!
//! orchestrator
//!     .stop("c1", StopOptions { keep_history: true, commit_message: None })
//!     .await?;
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - Every operation takes `&self`; share the orchestrator behind an `Arc`
//! - One lifecycle operation per container name at a time; a second one is rejected as busy
//! - Operations on different names run concurrently

pub mod config;
pub mod credentials;
pub mod error;
pub mod lock_order;
pub mod orchestrator;
pub mod port;
pub mod relay;
pub mod response;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod tunnel;

// Re-export commonly used types
pub use config::{Config, Parser, ServiceKind};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::Orchestrator;
pub use response::OperationResult;
pub use state::{LifecycleState, StateStore};
