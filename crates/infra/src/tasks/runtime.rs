//! Process bootstrap: wires every component, runs startup recovery, starts
//! the monitor and worker pool, and tears everything down on shutdown.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use taskflow_core::{Clock, RecoveryAction, SystemClock, Task, TaskKey, TaskStatus};

use super::error::{OrchestrationError, OrchestrationResult};
use super::executor::{Pipeline, PipelineExecutor, PoolStats, WorkerPool};
use super::locks::ResourceLocks;
use super::monitor::TaskMonitor;
use super::orchestrator::Orchestrator;
use super::recovery::{RecoveryManager, RecoveryReport};
use super::shutdown::{ShutdownCoordinator, ShutdownReport};
use super::state_machine::TaskStateMachine;
use super::transaction::TransactionRunner;
use crate::config::OrchestratorConfig;
use crate::store::{TaskFilter, TaskStore};

/// What [`TaskRuntime::start`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartupReport {
    /// `None` when the recovery scan failed and the fallback reset ran instead.
    pub recovery: Option<RecoveryReport>,
    pub monitor_started: bool,
    pub dispatched: usize,
}

/// Every engine component for one process.
pub struct TaskRuntime {
    config: OrchestratorConfig,
    orchestrator: Orchestrator,
    recovery: RecoveryManager,
    monitor: Arc<TaskMonitor>,
    shutdown: Arc<ShutdownCoordinator>,
    executor: PipelineExecutor,
    pool: Arc<Mutex<Option<WorkerPool>>>,
}

impl TaskRuntime {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock), pipeline)
    }

    pub fn with_clock(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        pipeline: Arc<dyn Pipeline>,
    ) -> Self {
        let runner = TransactionRunner::new(store, clock, config.retry.clone());
        let state_machine = TaskStateMachine::new(runner);
        let shutdown = ShutdownCoordinator::new(config.shutdown.clone());
        let orchestrator = Orchestrator::new(
            state_machine.clone(),
            config.admission.clone(),
            Arc::new(ResourceLocks::new()),
            shutdown.clone(),
        );

        Self {
            recovery: RecoveryManager::new(state_machine.clone(), config.recovery.clone()),
            monitor: Arc::new(TaskMonitor::new(state_machine.clone(), config.monitor.clone())),
            executor: PipelineExecutor::new(state_machine, pipeline),
            pool: Arc::new(Mutex::new(None)),
            orchestrator,
            shutdown,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &TaskMonitor {
        &self.monitor
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Bring the engine up.
    ///
    /// Registers shutdown cleanup, runs crash recovery on its own thread (with
    /// the fallback reset if the scan fails), starts the monitor and the worker
    /// pool, then dispatches every PENDING task.
    pub fn start(&self) -> anyhow::Result<StartupReport> {
        info!("starting task runtime");
        self.register_cleanup();

        let recovery = match self.recovery.spawn().context("spawning recovery thread")?.join() {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "startup recovery fell back to basic reset");
                None
            }
            Err(_) => anyhow::bail!("recovery thread panicked"),
        };

        let monitor_started = self.monitor.start().context("starting task monitor")?;

        let pool = WorkerPool::spawn(
            self.executor.clone(),
            self.config.worker.threads,
            self.shutdown.clone(),
        )
        .context("starting worker pool")?;
        *self.pool.lock() = Some(pool);

        let pending = self
            .orchestrator
            .state_machine()
            .runner()
            .store()
            .list(&TaskFilter::with_statuses([TaskStatus::Pending]))
            .context("listing pending tasks")?;
        let mut dispatched = 0;
        for task in pending {
            match self.dispatch(task.key.clone()) {
                Ok(()) => dispatched += 1,
                Err(e) => error!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    error = %e,
                    "failed to dispatch pending task"
                ),
            }
        }

        info!(monitor_started, dispatched, "task runtime started");
        Ok(StartupReport {
            recovery,
            monitor_started,
            dispatched,
        })
    }

    fn register_cleanup(&self) {
        let monitor = self.monitor.clone();
        self.shutdown.register_cleanup("stop task monitor", move || {
            monitor.stop();
            Ok(())
        });

        // The drain already spent the bounded wait; workers still busy now are
        // detached instead of joined.
        let pool = self.pool.clone();
        let join_timeout = self.config.shutdown.poll_interval;
        self.shutdown.register_cleanup("stop worker pool", move || {
            let taken = pool.lock().take();
            if let Some(pool) = taken {
                pool.shutdown(join_timeout);
            }
            Ok(())
        });
    }

    fn dispatch(&self, key: TaskKey) -> OrchestrationResult<()> {
        match self.pool.lock().as_ref() {
            Some(pool) => pool.dispatch(key),
            None => Err(not_started("dispatch")),
        }
    }

    /// Admit a task and hand it to the worker pool.
    ///
    /// Refused with `NotStarted` before [`start`](Self::start), so no task is
    /// left PENDING without a worker behind it.
    pub fn submit(
        &self,
        key: &TaskKey,
        rules_config: Option<serde_json::Value>,
    ) -> OrchestrationResult<Task> {
        self.shutdown.guard("submit")?;
        if self.pool.lock().is_none() {
            return Err(not_started("submit"));
        }
        let task = self.orchestrator.submit(key, rules_config)?;
        self.dispatch(key.clone())?;
        Ok(task)
    }

    /// Run an on-demand recovery scan and dispatch every auto-resumed task.
    pub fn recover_stuck_tasks(&self) -> OrchestrationResult<RecoveryReport> {
        let report = self.recovery.recover_stuck_tasks()?;
        for detail in &report.details {
            if detail.action != Some(RecoveryAction::AutoResume) {
                continue;
            }
            let key = TaskKey::parse(&detail.project_id, &detail.task_id)?;
            if let Err(e) = self.dispatch(key) {
                warn!(
                    project_id = %detail.project_id,
                    task_id = %detail.task_id,
                    error = %e,
                    "auto-resumed task left PENDING"
                );
            }
        }
        Ok(report)
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.lock().as_ref().map(WorkerPool::stats)
    }

    /// Request shutdown, drain in-flight tasks and run cleanup.
    pub fn shutdown(&self, reason: &str) -> ShutdownReport {
        self.shutdown.graceful_shutdown(reason)
    }

    /// Block until Ctrl-C, then shut down gracefully.
    pub fn run_until_signal(&self) -> anyhow::Result<ShutdownReport> {
        wait_for_shutdown_signal()?;
        Ok(self.shutdown("signal"))
    }
}

fn not_started(operation: &str) -> OrchestrationError {
    OrchestrationError::NotStarted {
        operation: operation.into(),
    }
}

/// Block the calling thread until the process receives Ctrl-C / SIGINT.
pub fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    rt.block_on(tokio::signal::ctrl_c())
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    Ok(())
}
