//! Per-name operation guards.
//!
//! At most one lifecycle operation runs per container name. A second
//! operation on a busy name is rejected with [`Error::Busy`] instead of
//! queueing behind the first.

use crate::error::{Error, Result};
use crate::lock_order::{LockId, OrderedMutex};
use std::collections::HashMap;
use std::sync::Arc;

type ActiveTable = Arc<OrderedMutex<HashMap<String, &'static str>>>;

#[derive(Clone)]
pub(crate) struct OperationGuards {
    active: ActiveTable,
}

impl OperationGuards {
    pub fn new() -> Self {
        Self {
            active: Arc::new(OrderedMutex::new(LockId::Guards, HashMap::new())),
        }
    }

    /// Claim `name` for `operation`.
    pub fn try_acquire(&self, name: &str, operation: &'static str) -> Result<OperationGuard> {
        let mut active = self.active.lock();
        if let Some(running) = active.get(name) {
            return Err(Error::Busy {
                name: name.to_string(),
                operation: (*running).to_string(),
            });
        }
        active.insert(name.to_string(), operation);
        tracing::trace!(container = %name, operation, "Operation guard acquired");

        Ok(OperationGuard {
            active: Arc::clone(&self.active),
            name: name.to_string(),
        })
    }

    /// Operation currently holding `name`, if any.
    pub fn current(&self, name: &str) -> Option<&'static str> {
        self.active.lock().get(name).copied()
    }
}

/// Releases the name when dropped.
pub(crate) struct OperationGuard {
    active: ActiveTable,
    name: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.name);
    }
}
