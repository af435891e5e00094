//! Pipeline execution on a bounded pool of worker threads.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{Span, debug, error, info, instrument, warn};

use taskflow_core::{RunId, Task, TaskKey, TaskStatus};

use super::error::{OrchestrationError, OrchestrationResult};
use super::shutdown::{ShutdownCoordinator, TaskGuard};
use super::state_machine::{TaskStateMachine, TransitionUpdate};

/// The sync + evaluate work for one task.
///
/// Implementations own the external calls (document fetch, model calls);
/// status bookkeeping stays with the executor. Both phases see the task as it
/// was when the phase started.
pub trait Pipeline: Send + Sync {
    fn sync(&self, task: &Task) -> anyhow::Result<()>;

    /// Produce the business result stored on the task.
    fn evaluate(&self, task: &Task) -> anyhow::Result<serde_json::Value>;
}

/// How a single pipeline run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { phase: TaskStatus, error: String },
    /// Someone else moved the task (cancelled, timed out) mid-run.
    Aborted { phase: TaskStatus, status: TaskStatus },
}

/// Drives one task through PENDING -> SYNCING -> EVALUATING -> COMPLETED|ERROR.
#[derive(Clone)]
pub struct PipelineExecutor {
    state_machine: TaskStateMachine,
    pipeline: Arc<dyn Pipeline>,
}

impl PipelineExecutor {
    pub fn new(state_machine: TaskStateMachine, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            state_machine,
            pipeline,
        }
    }

    /// Run the pipeline for `key`.
    ///
    /// The task's status is re-checked at every phase boundary; no store
    /// transaction is held while the pipeline runs.
    #[instrument(
        skip(self),
        fields(project_id = %key.project_id, task_id = %key.task_id, run_id = tracing::field::Empty)
    )]
    pub fn run(&self, key: &TaskKey) -> OrchestrationResult<RunOutcome> {
        let run_id = RunId::new();
        Span::current().record("run_id", tracing::field::display(&run_id));

        let task = match self.step(key, TaskStatus::Pending, TaskStatus::Syncing, "sync started")? {
            Ok(task) => task,
            Err(outcome) => return Ok(outcome),
        };
        if let Err(e) = self.pipeline.sync(&task) {
            return self.fail(key, TaskStatus::Syncing, "sync failed", e);
        }

        let task = match self.step(
            key,
            TaskStatus::Syncing,
            TaskStatus::Evaluating,
            "evaluation started",
        )? {
            Ok(task) => task,
            Err(outcome) => return Ok(outcome),
        };
        let result = match self.pipeline.evaluate(&task) {
            Ok(result) => result,
            Err(e) => return self.fail(key, TaskStatus::Evaluating, "evaluation failed", e),
        };

        match self.state_machine.advance(
            key,
            TaskStatus::Evaluating,
            TaskStatus::Completed,
            "evaluation completed",
            &TransitionUpdate::result(result),
        ) {
            Ok(_) => {
                info!("pipeline completed");
                Ok(RunOutcome::Completed)
            }
            Err(e) => self.aborted_or(key, TaskStatus::Evaluating, e),
        }
    }

    /// Move `from -> to`; `Ok(Err(outcome))` means the run should stop quietly.
    fn step(
        &self,
        key: &TaskKey,
        from: TaskStatus,
        to: TaskStatus,
        reason: &str,
    ) -> OrchestrationResult<Result<Task, RunOutcome>> {
        match self
            .state_machine
            .advance(key, from, to, reason, &TransitionUpdate::default())
        {
            Ok(task) => Ok(Ok(task)),
            Err(e) => self.aborted_or(key, from, e).map(Err),
        }
    }

    fn aborted_or(
        &self,
        key: &TaskKey,
        phase: TaskStatus,
        err: OrchestrationError,
    ) -> OrchestrationResult<RunOutcome> {
        match err {
            OrchestrationError::InvalidState(_) | OrchestrationError::InvalidTransition { .. } => {
                let status = self.state_machine.get(key)?.status;
                warn!(
                    phase = %phase,
                    status = %status,
                    "task moved by another actor; aborting run"
                );
                Ok(RunOutcome::Aborted { phase, status })
            }
            other => Err(other),
        }
    }

    fn fail(
        &self,
        key: &TaskKey,
        phase: TaskStatus,
        reason: &str,
        err: anyhow::Error,
    ) -> OrchestrationResult<RunOutcome> {
        let message = format!("{err:#}");
        error!(phase = %phase, error = %message, "pipeline phase failed");
        match self.state_machine.advance(
            key,
            phase,
            TaskStatus::Error,
            reason,
            &TransitionUpdate::error(message.clone()),
        ) {
            Ok(_) => Ok(RunOutcome::Failed {
                phase,
                error: message,
            }),
            Err(e) => self.aborted_or(key, phase, e),
        }
    }
}

/// Worker pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub tasks_processed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_aborted: u64,
    /// Queued items dropped unrun because shutdown was requested.
    pub tasks_skipped: u64,
    pub current_running: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    skipped: AtomicU64,
    running: AtomicUsize,
}

/// How often a bounded pool shutdown re-checks for finished workers.
const JOIN_POLL: Duration = Duration::from_millis(5);

struct WorkItem {
    key: TaskKey,
    _guard: TaskGuard,
}

/// Fixed set of OS threads pulling task keys off a shared queue.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<WorkItem>>,
    workers: Vec<thread::JoinHandle<()>>,
    counters: Arc<Counters>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl WorkerPool {
    pub fn spawn(
        executor: PipelineExecutor,
        threads: usize,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<WorkItem>();
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let receiver = receiver.clone();
            let executor = executor.clone();
            let counters = counters.clone();
            let coordinator = coordinator.clone();
            let name = format!("task-worker-{n}");
            workers.push(thread::Builder::new().name(name.clone()).spawn(move || {
                worker_loop(&name, executor, receiver, counters, coordinator)
            })?);
        }
        info!(threads = workers.len(), "worker pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            counters,
            coordinator,
        })
    }

    /// Queue `key` for execution. Refused once shutdown has been requested.
    pub fn dispatch(&self, key: TaskKey) -> OrchestrationResult<()> {
        let guard = self.coordinator.register_task(key.to_string())?;
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| OrchestrationError::ShuttingDown {
                operation: "dispatch".into(),
            })?;
        debug!(project_id = %key.project_id, task_id = %key.task_id, "task dispatched");
        sender
            .send(WorkItem { key, _guard: guard })
            .map_err(|_| OrchestrationError::ShuttingDown {
                operation: "dispatch".into(),
            })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tasks_processed: self.counters.processed.load(Ordering::SeqCst),
            tasks_completed: self.counters.completed.load(Ordering::SeqCst),
            tasks_failed: self.counters.failed.load(Ordering::SeqCst),
            tasks_aborted: self.counters.aborted.load(Ordering::SeqCst),
            tasks_skipped: self.counters.skipped.load(Ordering::SeqCst),
            current_running: self.counters.running.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work and join the worker threads, waiting at most
    /// `timeout`.
    ///
    /// Workers still inside a pipeline when the deadline passes are detached;
    /// they exit after their current run. Returns how many were detached.
    pub fn shutdown(mut self, timeout: Duration) -> usize {
        self.close(timeout)
    }

    fn close(&mut self, timeout: Duration) -> usize {
        self.sender.take();
        let deadline = Instant::now() + timeout;
        loop {
            let (finished, busy): (Vec<_>, Vec<_>) =
                self.workers.drain(..).partition(|w| w.is_finished());
            for worker in finished {
                let _ = worker.join();
            }
            self.workers = busy;
            if self.workers.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }

        let detached = self.workers.len();
        if detached > 0 {
            warn!(detached, "worker threads still busy; detaching");
        }
        self.workers.clear();
        detached
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close(Duration::ZERO);
    }
}

fn worker_loop(
    name: &str,
    executor: PipelineExecutor,
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    counters: Arc<Counters>,
    coordinator: Arc<ShutdownCoordinator>,
) {
    debug!(worker = name, "worker started");
    loop {
        let item = {
            let Ok(receiver) = receiver.lock() else {
                break;
            };
            receiver.recv()
        };
        let Ok(item) = item else {
            break;
        };
        if coordinator.is_shutting_down() {
            // Left PENDING; the next startup dispatches it again.
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            debug!(
                worker = name,
                project_id = %item.key.project_id,
                task_id = %item.key.task_id,
                "shutdown requested; dropping queued task"
            );
            continue;
        }

        counters.running.fetch_add(1, Ordering::SeqCst);
        let outcome = executor.run(&item.key);
        counters.running.fetch_sub(1, Ordering::SeqCst);
        counters.processed.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(RunOutcome::Completed) => {
                counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(RunOutcome::Failed { .. }) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(RunOutcome::Aborted { .. }) => {
                counters.aborted.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    worker = name,
                    project_id = %item.key.project_id,
                    task_id = %item.key.task_id,
                    error = %e,
                    "task run failed"
                );
            }
        }
    }
    debug!(worker = name, "worker stopped");
}
