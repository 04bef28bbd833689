use std::fmt;
use std::time::Duration;

/// Structured error type for container runtime calls.
///
/// Variants are machine-actionable so the orchestrator can tell a missing
/// container (reconcile) from a timeout (unknown state) from a real failure.
#[derive(Debug)]
pub enum RuntimeError {
    /// Runtime command timed out.
    Timeout { command: String, timeout: Duration },

    /// Runtime command ran but returned non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Runtime binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Container doesn't exist (parsed from "No such container" stderr).
    ContainerNotFound { container: String },

    /// Image doesn't exist.
    ImageNotFound { image: String },

    /// Runtime daemon not responding.
    DaemonUnavailable,

    /// Output that could not be interpreted.
    Unexpected { command: String, detail: String },
}

impl RuntimeError {
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        RuntimeError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Create a command-failed error from an `std::process::Output`.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        RuntimeError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    pub fn cmd_failed(
        cmd: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Self {
        RuntimeError::CommandFailed {
            command: cmd.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        RuntimeError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn not_found(container: impl Into<String>) -> Self {
        RuntimeError::ContainerNotFound {
            container: container.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::ContainerNotFound { .. } | RuntimeError::ImageNotFound { .. }
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Timeout { command, timeout } => {
                write!(
                    f,
                    "Timed out running '{}' (exceeded {} seconds)",
                    command,
                    timeout.as_secs()
                )
            }
            RuntimeError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            RuntimeError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            RuntimeError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            RuntimeError::ImageNotFound { image } => write!(f, "No such image: {}", image),
            RuntimeError::DaemonUnavailable => {
                write!(f, "Container runtime daemon is not responding")
            }
            RuntimeError::Unexpected { command, detail } => {
                write!(f, "Unexpected output from '{}': {}", command, detail)
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
