//! The cross-build mutation lock.
//!
//! Every build in a composite build shares one `ProjectStateLock`. Any
//! structural change to a build's work plan happens inside
//! `with_mutable_state`, so at most one build mutates its graph at a time.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::util::lock;

/// Shared, reentrant mutual exclusion for structural graph changes.
#[derive(Clone, Default)]
pub struct ProjectStateLock {
    inner: Arc<LockState>,
}

#[derive(Default)]
struct LockState {
    /// Holding thread and its reentrancy depth.
    holder: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl ProjectStateLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` while holding the lock.
    ///
    /// Blocks while another thread holds the lock. A thread that already
    /// holds it re-enters without blocking.
    pub fn with_mutable_state<T>(&self, action: impl FnOnce() -> T) -> T {
        let _held = self.acquire();
        action()
    }

    /// Check whether the calling thread currently holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        matches!(*lock(&self.inner.holder), Some((owner, _)) if owner == me)
    }

    /// Check whether any thread holds the lock.
    pub fn is_locked(&self) -> bool {
        lock(&self.inner.holder).is_some()
    }

    /// Check whether two handles refer to the same underlying lock.
    pub fn same_lock(&self, other: &ProjectStateLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn acquire(&self) -> HeldLock<'_> {
        let me = thread::current().id();
        let mut holder = lock(&self.inner.holder);
        loop {
            match holder.as_mut() {
                None => {
                    *holder = Some((me, 1));
                    break;
                }
                Some((owner, depth)) if *owner == me => {
                    *depth += 1;
                    break;
                }
                Some(_) => {
                    holder = self
                        .inner
                        .released
                        .wait(holder)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        HeldLock { state: &self.inner }
    }
}

impl std::fmt::Debug for ProjectStateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectStateLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

struct HeldLock<'a> {
    state: &'a LockState,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        let mut holder = lock(&self.state.holder);
        if let Some((_, depth)) = holder.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *holder = None;
                self.state.released.notify_one();
            }
        }
    }
}
