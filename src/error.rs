// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use crate::relay::RelayError;
use crate::runtime::RuntimeError;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(devbox::config::validation),
        help("Run `devbox validate` for detailed validation errors")
    )]
    Validation(String),

    #[error("Invalid container name '{name}': {reason}")]
    #[diagnostic(
        code(devbox::container::invalid_name),
        help("Use 1-63 characters from [a-zA-Z0-9_.-], starting with a letter or digit")
    )]
    InvalidName { name: String, reason: String },

    #[error("Container '{0}' not found")]
    #[diagnostic(
        code(devbox::container::not_found),
        help("List managed containers with `devbox list`")
    )]
    NotFound(String),

    #[error("Snapshot '{tag}' not found for container '{container}'")]
    #[diagnostic(
        code(devbox::snapshot::not_found),
        help("List snapshots with `devbox snapshots {container}`")
    )]
    SnapshotNotFound { container: String, tag: String },

    #[error("Container '{name}' {reason}")]
    #[diagnostic(code(devbox::container::conflict))]
    Conflict { name: String, reason: String },

    #[error("Container '{name}' is busy: {operation} in progress")]
    #[diagnostic(
        code(devbox::container::busy),
        help("Another lifecycle operation holds this container. Retry once it completes")
    )]
    Busy { name: String, operation: String },

    #[error("No free public port in {start}-{end}")]
    #[diagnostic(
        code(devbox::port::exhausted),
        help("Stop or delete unused containers, or widen `ports.start`/`ports.end` in devbox.yaml")
    )]
    ExhaustedPool { start: u16, end: u16 },

    #[error("Container runtime failure: {0}")]
    #[diagnostic(
        code(devbox::runtime::failure),
        help("Check that Docker is running with `docker ps`")
    )]
    RuntimeFailure(#[from] RuntimeError),

    #[error("Tunnel relay failure: {0}")]
    #[diagnostic(
        code(devbox::relay::failure),
        help("Check that the relay server is reachable and `relay.auth_key` is correct")
    )]
    RelayFailure(#[from] RelayError),

    #[error("Persisted state in '{}' is unreadable: {reason}", .path.display())]
    #[diagnostic(
        code(devbox::state::corrupt),
        help("Repair or move the file aside; devbox refuses to start with ambiguous state")
    )]
    CorruptState { path: PathBuf, reason: String },

    /// An operation failed and left resources behind that need manual
    /// cleanup. When compensation undoes every completed step the original
    /// error is returned instead, so this variant always names at least one
    /// entry in `unreconciled`.
    #[error("{operation} of '{container}' failed: {cause}{}", reconcile_note(.unreconciled))]
    #[diagnostic(code(devbox::operation::partial))]
    PartialFailure {
        operation: String,
        container: String,
        cause: Box<Error>,
        unreconciled: Vec<String>,
    },

    #[error("{operation} of '{container}' timed out after {}s", .after.as_secs())]
    #[diagnostic(
        code(devbox::operation::timeout),
        help("The container state is unknown until refreshed with `devbox status {container}`")
    )]
    Timeout {
        operation: String,
        container: String,
        after: Duration,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn reconcile_note(unreconciled: &[String]) -> String {
    if unreconciled.is_empty() {
        String::new()
    } else {
        format!(" (needs manual reconciliation: {})", unreconciled.join(", "))
    }
}

/// Coarse error classification reported to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ExhaustedPool,
    RuntimeFailure,
    RelayFailure,
    CorruptState,
    PartialFailure,
    Timeout,
    InvalidInput,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) | Error::SnapshotNotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } | Error::Busy { .. } => ErrorKind::Conflict,
            Error::ExhaustedPool { .. } => ErrorKind::ExhaustedPool,
            Error::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            Error::RelayFailure(_) => ErrorKind::RelayFailure,
            Error::CorruptState { .. } => ErrorKind::CorruptState,
            Error::PartialFailure { .. } => ErrorKind::PartialFailure,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Config(_)
            | Error::Validation(_)
            | Error::InvalidName { .. }
            | Error::Parse(_) => ErrorKind::InvalidInput,
            Error::Yaml(_) | Error::Json(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The innermost error, looking through `PartialFailure` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::PartialFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::NotFound(name) => Some(format!(
                "Create it first with: devbox create {} --image <image>",
                name
            )),
            Error::SnapshotNotFound { container, .. } => Some(format!(
                "Available snapshots are listed by: devbox snapshots {}",
                container
            )),
            Error::Conflict { name, .. } => Some(format!(
                "Check the container's current state with: devbox status {}",
                name
            )),
            Error::Busy { .. } => {
                Some("Retry after the running operation finishes.".to_string())
            }
            Error::ExhaustedPool { start, end } => Some(format!(
                "All ports in {}-{} are bound. Stop idle containers or widen the range.",
                start, end
            )),
            Error::RuntimeFailure(RuntimeError::DaemonUnavailable) => {
                Some("Start the Docker daemon and retry.".to_string())
            }
            Error::RuntimeFailure(_) => Some("Check that Docker is running: docker ps".to_string()),
            Error::RelayFailure(_) => Some(
                "Verify `relay.address` and `relay.auth_key`, then check the relay server logs."
                    .to_string(),
            ),
            Error::CorruptState { path, .. } => Some(format!(
                "Back up and fix '{}', or move it aside to start from empty state (running containers will be reconciled as stale).",
                path.display()
            )),
            Error::PartialFailure { unreconciled, .. } if !unreconciled.is_empty() => Some(format!(
                "Inspect and clean up by hand: {}",
                unreconciled.join(", ")
            )),
            Error::Timeout { container, .. } => Some(format!(
                "Refresh the container state with: devbox status {}",
                container
            )),
            Error::Config(msg) if msg.contains("Could not find") => None,
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your config with: devbox validate".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}
