//! Lock ordering enforcement for the shared control-plane state.
//!
//! Every lock shared between lifecycle operations is an [`OrderedMutex`]
//! tagged with a [`LockId`]. In debug builds each acquisition is checked
//! against a thread-local stack of held locks and a violation panics with a
//! description of both locks. Release builds compile the tracking away.
//!
//! # Lock Ordering Hierarchy
//!
//! 1. `guards` - per-name operation guard table
//! 2. `ledger` - container records and tunnel bindings
//! 3. `history` - snapshot history
//! 4. `ports` - public port pool
//!
//! None of these locks is ever held across an `.await`; they protect short
//! in-memory mutations only. Long runtime and relay calls run unlocked,
//! serialized per container by the operation guard.

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};

/// Identifiers for tracked locks.
///
/// Locks with lower discriminant values MUST be acquired before
/// locks with higher discriminant values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockId {
    Guards = 1,
    Ledger = 2,
    History = 3,
    Ports = 4,
}

impl LockId {
    pub fn name(&self) -> &'static str {
        match self {
            LockId::Guards => "guards",
            LockId::Ledger => "ledger",
            LockId::History => "history",
            LockId::Ports => "ports",
        }
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static LOCK_STACK: RefCell<Vec<LockId>> = const { RefCell::new(Vec::new()) };
}

/// Record that `lock` is about to be acquired.
///
/// # Panics
///
/// Panics (debug builds only) if a lock with a higher rank is already held
/// by this thread, or if `lock` itself is already held.
#[cfg(debug_assertions)]
pub fn track_lock_acquisition(lock: LockId) {
    LOCK_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(held) = stack.iter().find(|held| **held >= lock) {
            panic!(
                "Lock ordering violation: attempted to acquire '{}' (rank {}) \
                 while holding '{}' (rank {}). Order is guards < ledger < history < ports",
                lock.name(),
                lock as u8,
                held.name(),
                *held as u8
            );
        }
        stack.push(lock);
    });
}

/// Record that `lock` was released.
///
/// Guards are dropped in reverse acquisition order by scope rules, so the
/// released lock is normally on top of the stack; releasing out of order is
/// tolerated as long as the lock is held.
#[cfg(debug_assertions)]
pub fn track_lock_release(lock: LockId) {
    LOCK_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.iter().rposition(|held| *held == lock) {
            Some(pos) => {
                stack.remove(pos);
            }
            None => panic!(
                "Lock release without acquisition: '{}' is not held",
                lock.name()
            ),
        }
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_acquisition(_lock: LockId) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_release(_lock: LockId) {}

/// A `parking_lot::Mutex` whose acquisitions are checked against [`LockId`] order.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    id: LockId,
    inner: parking_lot::Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(id: LockId, value: T) -> Self {
        Self {
            id,
            inner: parking_lot::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        track_lock_acquisition(self.id);
        OrderedGuard {
            id: self.id,
            guard: self.inner.lock(),
        }
    }
}

pub struct OrderedGuard<'a, T> {
    id: LockId,
    guard: parking_lot::MutexGuard<'a, T>,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        track_lock_release(self.id);
    }
}
