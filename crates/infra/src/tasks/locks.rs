//! Named process-wide locks with bounded waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::error::{OrchestrationError, OrchestrationResult};

/// Serializes the admission check with the create that follows it.
pub const SUBMISSION_LOCK: &str = "task_submission";

#[derive(Default)]
struct NamedLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// Owner of every named lock in the process.
#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<NamedLock>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn named(&self, name: &str) -> Arc<NamedLock> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Take lock `name`, waiting at most `timeout`.
    pub fn acquire(&self, name: &str, timeout: Duration) -> OrchestrationResult<LockGuard> {
        let lock = self.named(name);
        let started = Instant::now();
        let deadline = started + timeout;

        {
            let mut held = lock.held.lock();
            while *held {
                if lock.released.wait_until(&mut held, deadline).timed_out() && *held {
                    warn!(
                        lock = name,
                        waited_ms = timeout.as_millis() as u64,
                        "lock acquisition timed out"
                    );
                    return Err(OrchestrationError::LockTimeout {
                        name: name.to_string(),
                        waited: timeout,
                    });
                }
            }
            *held = true;
        }

        debug!(lock = name, waited_us = started.elapsed().as_micros() as u64, "lock acquired");
        Ok(LockGuard {
            name: name.to_string(),
            lock,
        })
    }

    /// Names of locks created so far.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.locks.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Releases its lock on drop.
pub struct LockGuard {
    name: String,
    lock: Arc<NamedLock>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        *self.lock.held.lock() = false;
        self.lock.released.notify_one();
        debug!(lock = %self.name, "lock released");
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}
