//! Coordinated shutdown.
//!
//! Tracks in-flight tasks and open connections through RAII guards. Once
//! shutdown is requested new registrations are refused, `wait_for_drain`
//! waits (bounded) for the task registry to empty and `perform_cleanup` runs
//! the registered callbacks in order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{error, info, warn};

use super::error::{OrchestrationError, OrchestrationResult};
use crate::config::ShutdownConfig;

type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Default)]
struct Registry {
    tasks: BTreeSet<String>,
    connections: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub drained: bool,
    pub remaining_tasks: Vec<String>,
    pub waited_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub succeeded: Vec<String>,
    /// `(callback name, error)` pairs.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    pub drain: DrainReport,
    pub cleanup: CleanupReport,
}

pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    requested: AtomicBool,
    registry: Mutex<Registry>,
    changed: Condvar,
    callbacks: Mutex<Vec<(String, CleanupFn)>>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            requested: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
            changed: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Fail with `ShuttingDown` once shutdown has been requested.
    pub fn guard(&self, operation: &str) -> OrchestrationResult<()> {
        if self.is_shutting_down() {
            warn!(operation, "operation rejected during shutdown");
            return Err(OrchestrationError::ShuttingDown {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Flip into shutdown mode. Returns `false` if already requested.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        let first = !self.requested.swap(true, Ordering::SeqCst);
        if first {
            let registry = self.registry.lock();
            info!(
                reason,
                active_tasks = registry.tasks.len(),
                active_connections = registry.connections.len(),
                "shutdown requested"
            );
        }
        first
    }

    /// Track a running task until the returned guard drops.
    pub fn register_task(
        self: &Arc<Self>,
        id: impl Into<String>,
    ) -> OrchestrationResult<TaskGuard> {
        let id = id.into();
        self.guard("register_task")?;
        self.registry.lock().tasks.insert(id.clone());
        Ok(TaskGuard {
            coordinator: self.clone(),
            id,
        })
    }

    /// Track an open connection until the returned guard drops.
    pub fn register_connection(
        self: &Arc<Self>,
        id: impl Into<String>,
    ) -> OrchestrationResult<ConnectionGuard> {
        let id = id.into();
        self.guard("register_connection")?;
        self.registry.lock().connections.insert(id.clone());
        Ok(ConnectionGuard {
            coordinator: self.clone(),
            id,
        })
    }

    fn unregister_task(&self, id: &str) {
        let mut registry = self.registry.lock();
        registry.tasks.remove(id);
        self.changed.notify_all();
    }

    fn unregister_connection(&self, id: &str) {
        self.registry.lock().connections.remove(id);
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.registry.lock().tasks.iter().cloned().collect()
    }

    pub fn active_connections(&self) -> Vec<String> {
        self.registry.lock().connections.iter().cloned().collect()
    }

    /// Queue a callback for [`perform_cleanup`](Self::perform_cleanup).
    pub fn register_cleanup<F>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.callbacks.lock().push((name.into(), Box::new(callback)));
    }

    /// Wait until no tasks are registered or `timeout` elapses.
    pub fn wait_for_drain(&self, timeout: Duration) -> DrainReport {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut registry = self.registry.lock();

        while !registry.tasks.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            info!(
                remaining = registry.tasks.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "waiting for active tasks to finish"
            );
            let wait = self.config.poll_interval.min(deadline - now);
            self.changed.wait_for(&mut registry, wait);
        }

        let remaining_tasks: Vec<_> = registry.tasks.iter().cloned().collect();
        let report = DrainReport {
            drained: remaining_tasks.is_empty(),
            remaining_tasks,
            waited_ms: started.elapsed().as_millis() as u64,
        };
        if report.drained {
            info!(waited_ms = report.waited_ms, "all tasks drained");
        } else {
            warn!(
                remaining = report.remaining_tasks.len(),
                waited_ms = report.waited_ms,
                "drain timed out; proceeding with shutdown"
            );
        }
        report
    }

    /// Run and consume the registered callbacks in registration order.
    ///
    /// A failing callback is logged and recorded; the rest still run.
    pub fn perform_cleanup(&self) -> CleanupReport {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        let mut report = CleanupReport::default();

        for (name, callback) in callbacks {
            match callback() {
                Ok(()) => {
                    info!(callback = %name, "cleanup callback finished");
                    report.succeeded.push(name);
                }
                Err(e) => {
                    error!(callback = %name, error = %e, "cleanup callback failed");
                    report.failed.push((name, format!("{e:#}")));
                }
            }
        }
        report
    }

    /// Request shutdown, drain with the configured timeout, then clean up.
    pub fn graceful_shutdown(&self, reason: &str) -> ShutdownReport {
        self.request_shutdown(reason);
        let drain = self.wait_for_drain(self.config.drain_timeout);
        let cleanup = self.perform_cleanup();
        info!(
            drained = drain.drained,
            cleanup_failures = cleanup.failed.len(),
            "graceful shutdown complete"
        );
        ShutdownReport {
            reason: reason.to_string(),
            drain,
            cleanup,
        }
    }
}

/// Unregisters a task on drop.
pub struct TaskGuard {
    coordinator: Arc<ShutdownCoordinator>,
    id: String,
}

impl TaskGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.coordinator.unregister_task(&self.id);
    }
}

/// Unregisters a connection on drop.
pub struct ConnectionGuard {
    coordinator: Arc<ShutdownCoordinator>,
    id: String,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.coordinator.unregister_connection(&self.id);
    }
}
