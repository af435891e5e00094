//! End-to-end behavior of the orchestration engine over the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskflow_core::{Actor, Clock, FixedClock, SystemClock, Task, TaskKey, TaskStatus};
use taskflow_infra::OrchestratorConfig;
use taskflow_infra::store::{Change, InMemoryTaskStore, StoreError, TaskFilter, TaskStore};
use taskflow_infra::tasks::{
    MonitorConfigUpdate, OrchestrationError, Pipeline, RetryPolicy, TaskMonitor, TaskRuntime,
    TaskStateMachine, TransactionRunner,
};

/// Holds a pipeline phase until opened.
#[derive(Clone, Default)]
struct Gate(Arc<AtomicBool>);

impl Gate {
    fn opened() -> Self {
        let gate = Self::default();
        gate.open();
        gate
    }

    fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn wait(&self) {
        while !self.0.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Blocks inside `phase` (SYNCING or EVALUATING) until the gate opens.
struct GatedPipeline {
    gate: Gate,
    phase: TaskStatus,
}

impl GatedPipeline {
    fn at(phase: TaskStatus, gate: Gate) -> Arc<Self> {
        Arc::new(Self { gate, phase })
    }
}

impl Pipeline for GatedPipeline {
    fn sync(&self, _task: &Task) -> anyhow::Result<()> {
        if self.phase == TaskStatus::Syncing {
            self.gate.wait();
        }
        Ok(())
    }

    fn evaluate(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
        if self.phase == TaskStatus::Evaluating {
            self.gate.wait();
        }
        Ok(serde_json::json!({ "evaluated": task.key.to_string() }))
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn config(max_concurrent: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.admission.max_concurrent = max_concurrent;
    config.monitor.enabled = false;
    config.worker.threads = 4;
    config.retry = RetryPolicy::fixed(3, Duration::from_millis(5));
    config.shutdown.drain_timeout = Duration::from_secs(5);
    config.shutdown.poll_interval = Duration::from_millis(10);
    config
}

fn key(id: &str) -> TaskKey {
    TaskKey::parse("P1", id).unwrap()
}

fn status(store: &InMemoryTaskStore, key: &TaskKey) -> TaskStatus {
    store.get(key).unwrap().unwrap().status
}

#[test]
fn submit_reject_complete_and_resubmit() {
    let _ = taskflow_observability::tracing::init_for_tests();
    let store = InMemoryTaskStore::arc();
    let gate = Gate::default();
    let runtime = TaskRuntime::new(
        config(1),
        store.clone(),
        GatedPipeline::at(TaskStatus::Evaluating, gate.clone()),
    );
    runtime.start().unwrap();

    runtime.submit(&key("T0"), None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Evaluating
    }));

    match runtime.submit(&key("T1"), None).unwrap_err() {
        OrchestrationError::ConcurrencyLimitExceeded(admission) => {
            assert!(!admission.allowed);
            assert_eq!((admission.current, admission.max), (1, 1));
            assert_eq!(admission.available, 0);
            assert_eq!(admission.running.len(), 1);
            assert_eq!(admission.running[0].project_id, "P1");
            assert_eq!(admission.running[0].task_id, "T0");
            assert_eq!(admission.running[0].status, TaskStatus::Evaluating);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.get(&key("T1")).unwrap().is_none());

    gate.open();
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Completed
    }));

    let admitted = runtime.submit(&key("T1"), None).unwrap();
    assert_eq!(admitted.status, TaskStatus::Pending);
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T1")) == TaskStatus::Completed
    }));

    let reopened = runtime.submit(&key("T0"), None).unwrap();
    assert_eq!(reopened.status, TaskStatus::Pending);
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Completed
    }));

    let history = runtime.orchestrator().get_task_history(&key("T0")).unwrap();
    let completions = history
        .history
        .iter()
        .filter(|e| e.new_status() == TaskStatus::Completed)
        .count();
    assert_eq!(completions, 2);

    let report = runtime.shutdown("test finished");
    assert!(report.drain.drained);
    assert!(report.cleanup.failed.is_empty());
    assert!(matches!(
        runtime.submit(&key("T9"), None),
        Err(OrchestrationError::ShuttingDown { .. })
    ));
}

#[test]
fn submit_before_start_is_refused() {
    let store = InMemoryTaskStore::arc();
    let runtime = TaskRuntime::new(
        config(3),
        store.clone(),
        GatedPipeline::at(TaskStatus::Syncing, Gate::opened()),
    );

    assert!(matches!(
        runtime.submit(&key("T0"), None),
        Err(OrchestrationError::NotStarted { .. })
    ));
    assert!(store.get(&key("T0")).unwrap().is_none());
}

#[test]
fn shutdown_is_bounded_and_skips_queued_tasks() {
    let store = InMemoryTaskStore::arc();
    let gate = Gate::default();
    let mut config = config(3);
    config.worker.threads = 1;
    config.shutdown.drain_timeout = Duration::from_millis(50);
    let runtime = TaskRuntime::new(
        config,
        store.clone(),
        GatedPipeline::at(TaskStatus::Syncing, gate.clone()),
    );
    runtime.start().unwrap();

    runtime.submit(&key("T0"), None).unwrap();
    runtime.submit(&key("T1"), None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Syncing
    }));

    let started = Instant::now();
    let report = runtime.shutdown("test finished");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!report.drain.drained);
    assert_eq!(report.drain.remaining_tasks.len(), 2);

    // The in-flight run finishes; the queued one is dropped unrun.
    gate.open();
    let coordinator = runtime.shutdown_coordinator();
    assert!(wait_until(Duration::from_secs(5), || {
        coordinator.active_tasks().is_empty()
    }));
    assert_eq!(status(&store, &key("T0")), TaskStatus::Completed);

    let queued = store.get(&key("T1")).unwrap().unwrap();
    assert_eq!(queued.status, TaskStatus::Pending);
    assert!(queued.audit_log.is_empty());
}

#[test]
fn startup_recovers_and_reruns_interrupted_task() {
    let store = InMemoryTaskStore::arc();
    let created = SystemClock.now() - chrono::Duration::hours(2);
    let mut orphan = Task::new(key("T0"), TaskStatus::Pending, created).unwrap();
    orphan.status = TaskStatus::Evaluating;
    store.create(orphan).unwrap();

    let runtime = TaskRuntime::new(
        config(3),
        store.clone(),
        GatedPipeline::at(TaskStatus::Syncing, Gate::opened()),
    );

    let startup = runtime.start().unwrap();
    let recovery = startup.recovery.unwrap();
    assert_eq!(recovery.stats.total_checked, 1);
    assert_eq!(recovery.stats.recovered_tasks, 1);
    assert_eq!(startup.dispatched, 1);

    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Completed
    }));
    let task = store.get(&key("T0")).unwrap().unwrap();
    assert_eq!(task.recovery_count(), 1);
    assert!(task.audit_log.iter().any(|e| e.actor == Actor::Recovery));

    runtime.shutdown("test finished");
}

#[test]
fn on_demand_recovery_dispatches_auto_resumed_tasks() {
    let store = InMemoryTaskStore::arc();
    let runtime = TaskRuntime::new(
        config(3),
        store.clone(),
        GatedPipeline::at(TaskStatus::Syncing, Gate::opened()),
    );
    runtime.start().unwrap();

    let created = SystemClock.now() - chrono::Duration::hours(2);
    let mut orphan = Task::new(key("T0"), TaskStatus::Pending, created).unwrap();
    orphan.status = TaskStatus::Syncing;
    store.create(orphan).unwrap();

    let report = runtime.recover_stuck_tasks().unwrap();
    assert_eq!(report.stats.recovered_tasks, 1);
    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Completed
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        runtime.pool_stats().unwrap().tasks_completed == 1
    }));

    runtime.shutdown("test finished");
}

fn monitor_over(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, enabled: bool) -> TaskMonitor {
    let runner = TransactionRunner::new(store, clock, RetryPolicy::no_retry());
    let mut monitor_config = OrchestratorConfig::default().monitor;
    monitor_config.check_interval = Duration::from_millis(10);
    monitor_config.enabled = enabled;
    TaskMonitor::new(TaskStateMachine::new(runner), monitor_config)
}

#[test]
fn monitor_thread_times_out_stale_tasks() {
    let store = InMemoryTaskStore::arc();
    let clock = Arc::new(FixedClock::new(Utc::now()));
    let stale_at = clock.now() - chrono::Duration::minutes(70);
    let mut task = Task::new(key("T0"), TaskStatus::Pending, stale_at).unwrap();
    task.status = TaskStatus::Evaluating;
    store.create(task).unwrap();

    let monitor = monitor_over(store.clone(), clock, true);
    assert!(monitor.start().unwrap());

    assert!(wait_until(Duration::from_secs(5), || {
        status(&store, &key("T0")) == TaskStatus::Error
    }));
    let entry = store
        .get(&key("T0"))
        .unwrap()
        .unwrap()
        .last_audit_entry()
        .cloned()
        .unwrap();
    assert_eq!(entry.actor, Actor::Monitor);
    assert_eq!(entry.retry_eligible(), Some(false));

    monitor
        .update_config(MonitorConfigUpdate {
            enabled: Some(false),
            ..MonitorConfigUpdate::default()
        })
        .unwrap();
    assert!(!monitor.is_running());
}

#[test]
fn enabling_a_disabled_monitor_starts_its_thread() {
    let monitor = monitor_over(InMemoryTaskStore::arc(), Arc::new(SystemClock), false);
    assert!(!monitor.start().unwrap());
    assert!(!monitor.is_running());

    let config = monitor
        .update_config(MonitorConfigUpdate {
            enabled: Some(true),
            ..MonitorConfigUpdate::default()
        })
        .unwrap();
    assert!(config.enabled);
    assert!(monitor.is_running());
    assert!(monitor.get_status().started_at.is_some());

    monitor.stop();
    assert!(!monitor.is_running());
}

/// Every read fails.
struct BrokenStore;

impl TaskStore for BrokenStore {
    fn get(&self, _key: &TaskKey) -> Result<Option<Task>, StoreError> {
        Err(StoreError::Unavailable("database offline".into()))
    }

    fn list(&self, _filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        Err(StoreError::Unavailable("database offline".into()))
    }

    fn commit(&self, _changes: Vec<Change>) -> Result<Vec<Task>, StoreError> {
        Err(StoreError::Unavailable("database offline".into()))
    }
}

#[test]
fn monitor_circuit_breaker_trips_after_three_failures() {
    let monitor = monitor_over(Arc::new(BrokenStore), Arc::new(SystemClock), true);
    assert!(monitor.start().unwrap());

    assert!(wait_until(Duration::from_secs(5), || !monitor.is_running()));
    let status = monitor.get_status();
    assert!(status.tripped);
    assert_eq!(status.consecutive_failures, 3);
}

#[test]
fn concurrent_submissions_never_exceed_the_limit() {
    let store = InMemoryTaskStore::arc();
    let gate = Gate::default();
    let runtime = Arc::new(TaskRuntime::new(
        config(2),
        store.clone(),
        GatedPipeline::at(TaskStatus::Syncing, gate.clone()),
    ));
    runtime.start().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let runtime = runtime.clone();
            thread::spawn(move || runtime.submit(&key(&format!("T{i}")), None).is_ok())
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(admitted, 2);
    assert_eq!(
        store
            .list(&TaskFilter::with_statuses(TaskStatus::RUNNING))
            .unwrap()
            .len(),
        2
    );

    gate.open();
    assert!(runtime.shutdown("test finished").drain.drained);
}
