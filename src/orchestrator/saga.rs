//! Compensating steps for multi-step lifecycle operations.
//!
//! Each completed step registers the action that undoes it. When a later
//! step fails the registered actions run newest first. Compensation is best
//! effort: an action that fails is reported by label so the caller knows
//! what needs manual cleanup.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use tracing::{info, warn};

type Compensation<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

pub(crate) struct Saga<'a> {
    operation: &'static str,
    container: String,
    completed: Vec<(String, Compensation<'a>)>,
}

impl<'a> Saga<'a> {
    pub fn new(operation: &'static str, container: &str) -> Self {
        Self {
            operation,
            container: container.to_string(),
            completed: Vec::new(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Register the undo action for a step that just completed.
    pub fn completed<F>(&mut self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        self.completed.push((label.into(), Box::new(undo)));
    }

    /// Undo completed steps after `cause`.
    ///
    /// With nothing to undo, or when every undo action succeeds, the
    /// original error is returned unchanged. Otherwise the result is a
    /// [`Error::PartialFailure`] naming the steps that could not be undone
    /// plus `unreconciled`, resources the failing step already left behind.
    pub async fn compensate(self, cause: Error, mut unreconciled: Vec<String>) -> Error {
        for (label, undo) in self.completed.into_iter().rev() {
            match undo().await {
                Ok(()) => info!(
                    container = %self.container,
                    operation = self.operation,
                    step = %label,
                    "Compensated"
                ),
                Err(e) => {
                    warn!(
                        container = %self.container,
                        operation = self.operation,
                        step = %label,
                        error = %e,
                        "Compensation failed"
                    );
                    unreconciled.push(label);
                }
            }
        }

        if unreconciled.is_empty() {
            return cause;
        }
        Error::PartialFailure {
            operation: self.operation.to_string(),
            container: self.container,
            cause: Box::new(cause),
            unreconciled,
        }
    }
}
