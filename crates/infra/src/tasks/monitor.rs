//! Background timeout monitor.
//!
//! A dedicated thread wakes every `check_interval`, reports stale tasks
//! (health pass) and then forces ERROR/CANCELLED on tasks whose `updated_at`
//! is older than their per-state limit (timeout pass). Three consecutive
//! failed iterations trip the circuit breaker and stop the thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use taskflow_core::{
    Actor, AuditEntry, AuditKind, Clock, Task, TaskStatus, TimeoutAction, TimeoutKind,
};

use super::age;
use super::error::{OrchestrationError, OrchestrationResult};
use super::state_machine::TaskStateMachine;
use crate::config::{MonitorConfig, StateTimeouts};
use crate::store::TaskFilter;

/// Lower bounds applied to runtime config updates.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const MIN_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Partial runtime update for [`TaskMonitor::update_config`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorConfigUpdate {
    pub enabled: Option<bool>,
    pub check_interval: Option<Duration>,
    pub default_timeout: Option<Duration>,
    pub state_timeouts: Option<StateTimeouts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssueKind {
    StateTimeout,
    PendingStall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    pub project_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub kind: HealthIssueKind,
    pub update_age_minutes: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutDetail {
    pub project_id: String,
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub timeout_type: TimeoutKind,
    pub retry_eligible: bool,
    pub update_age_minutes: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimeoutReport {
    pub checked: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub details: Vec<TimeoutDetail>,
}

/// Snapshot returned by [`TaskMonitor::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub enabled: bool,
    pub running: bool,
    pub check_interval_secs: u64,
    pub default_timeout_mins: u64,
    pub state_timeouts: StateTimeouts,
    pub started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub tripped: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    started_at: Option<DateTime<Utc>>,
    last_check_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    tripped: bool,
}

struct Shared {
    state_machine: TaskStateMachine,
    config: RwLock<MonitorConfig>,
    state: Mutex<MonitorState>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

#[derive(Debug)]
struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

pub struct TaskMonitor {
    shared: Arc<Shared>,
    handle: Mutex<Option<MonitorHandle>>,
}

impl TaskMonitor {
    pub fn new(state_machine: TaskStateMachine, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state_machine,
                config: RwLock::new(config),
                state: Mutex::new(MonitorState::default()),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the monitor thread unless it is disabled or already running.
    ///
    /// Returns whether a thread was started.
    pub fn start(&self) -> std::io::Result<bool> {
        if !self.shared.config.read().enabled {
            info!("task monitor disabled; not starting");
            return Ok(false);
        }

        let mut handle = self.handle.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        // A tripped thread exits on its own; reap it before starting anew.
        if let Some(old) = handle.take() {
            old.shutdown();
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let shared = self.shared.clone();
        shared.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut state = shared.state.lock();
            state.consecutive_failures = 0;
            state.tripped = false;
            state.started_at = Some(shared.clock().now());
        }
        shared.running.store(true, Ordering::SeqCst);

        let join = thread::Builder::new()
            .name("task-monitor".into())
            .spawn(move || monitor_loop(shared, shutdown_rx));
        let join = match join {
            Ok(join) => join,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        *handle = Some(MonitorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        });
        info!(
            check_interval_secs = self.shared.config.read().check_interval.as_secs(),
            "task monitor started"
        );
        Ok(true)
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!("task monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn health_check(&self) -> OrchestrationResult<HealthReport> {
        self.shared.health_pass()
    }

    pub fn check_timeouts(&self) -> OrchestrationResult<TimeoutReport> {
        self.shared.timeout_pass()
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.config.read().clone()
    }

    /// Apply a runtime update; toggling `enabled` starts or stops the thread.
    pub fn update_config(&self, update: MonitorConfigUpdate) -> std::io::Result<MonitorConfig> {
        let (was_enabled, now_enabled, config) = {
            let mut config = self.shared.config.write();
            let was_enabled = config.enabled;

            if let Some(interval) = update.check_interval {
                config.check_interval = interval.max(MIN_CHECK_INTERVAL);
            }
            if let Some(timeout) = update.default_timeout {
                config.default_timeout = timeout.max(MIN_DEFAULT_TIMEOUT);
            }
            if let Some(timeouts) = update.state_timeouts {
                config.state_timeouts = timeouts;
            }
            if let Some(enabled) = update.enabled {
                config.enabled = enabled;
            }
            (was_enabled, config.enabled, config.clone())
        };

        info!(
            enabled = config.enabled,
            check_interval_secs = config.check_interval.as_secs(),
            default_timeout_mins = config.default_timeout.as_secs() / 60,
            "task monitor configuration updated"
        );

        match (was_enabled, now_enabled) {
            (false, true) => {
                self.start()?;
            }
            (true, false) => self.stop(),
            _ => {}
        }
        Ok(config)
    }

    pub fn get_status(&self) -> MonitorStatus {
        let config = self.shared.config.read().clone();
        let state = self.shared.state.lock();
        MonitorStatus {
            enabled: config.enabled,
            running: self.is_running(),
            check_interval_secs: config.check_interval.as_secs(),
            default_timeout_mins: config.default_timeout.as_secs() / 60,
            state_timeouts: config.state_timeouts,
            started_at: state.started_at,
            last_check_at: state.last_check_at,
            consecutive_failures: state.consecutive_failures,
            tripped: state.tripped,
        }
    }
}

impl Drop for TaskMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop(shared: Arc<Shared>, shutdown_rx: mpsc::Receiver<()>) {
    loop {
        let interval = shared.config.read().check_interval;
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if shared.stopping() {
            break;
        }

        match shared.run_iteration() {
            Ok(()) => {
                let mut state = shared.state.lock();
                state.consecutive_failures = 0;
                state.last_check_at = Some(shared.clock().now());
            }
            Err(e) => {
                let max = shared.config.read().max_consecutive_failures;
                let mut state = shared.state.lock();
                state.consecutive_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures = state.consecutive_failures,
                    "task monitor iteration failed"
                );
                if state.consecutive_failures >= max {
                    state.tripped = true;
                    error!(
                        consecutive_failures = state.consecutive_failures,
                        "task monitor circuit breaker tripped; stopping monitor"
                    );
                    break;
                }
            }
        }
    }
    shared.running.store(false, Ordering::SeqCst);
}

impl Shared {
    fn clock(&self) -> &dyn Clock {
        self.state_machine.runner().clock().as_ref()
    }

    fn stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn run_iteration(&self) -> OrchestrationResult<()> {
        let health = self.health_pass()?;
        if !health.issues.is_empty() {
            warn!(issues = health.issues.len(), "task health check found stale tasks");
        }
        if self.stopping() {
            return Ok(());
        }
        let timeouts = self.timeout_pass()?;
        if timeouts.timed_out > 0 || timeouts.failed > 0 {
            info!(
                checked = timeouts.checked,
                timed_out = timeouts.timed_out,
                failed = timeouts.failed,
                "timeout pass finished"
            );
        }
        Ok(())
    }

    fn active_tasks(&self) -> OrchestrationResult<Vec<Task>> {
        Ok(self
            .state_machine
            .runner()
            .store()
            .list(&TaskFilter::with_statuses(TaskStatus::ACTIVE))?)
    }

    fn health_pass(&self) -> OrchestrationResult<HealthReport> {
        let config = self.config.read().clone();
        let now = self.clock().now();
        let tasks = self.active_tasks()?;

        let mut report = HealthReport {
            checked: tasks.len(),
            ..HealthReport::default()
        };
        for task in &tasks {
            let update_age = age::elapsed(now, task.updated_at);
            let limit = config
                .state_timeouts
                .for_status(task.status)
                .unwrap_or(config.default_timeout);

            let kind = if update_age > limit {
                Some(HealthIssueKind::StateTimeout)
            } else if task.status == TaskStatus::Pending && update_age > config.pending_stall {
                Some(HealthIssueKind::PendingStall)
            } else {
                None
            };

            if let Some(kind) = kind {
                debug!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    status = %task.status,
                    ?kind,
                    update_age_minutes = age::minutes(update_age),
                    "unhealthy task"
                );
                report.issues.push(HealthIssue {
                    project_id: task.key.project_id.to_string(),
                    task_id: task.key.task_id.to_string(),
                    status: task.status,
                    kind,
                    update_age_minutes: age::minutes(update_age),
                });
            }
        }
        Ok(report)
    }

    fn timeout_pass(&self) -> OrchestrationResult<TimeoutReport> {
        let config = self.config.read().clone();
        let tasks = self.active_tasks()?;
        let mut report = TimeoutReport {
            checked: tasks.len(),
            ..TimeoutReport::default()
        };

        for task in &tasks {
            if self.stopping() {
                break;
            }
            let Some(entry) = timeout_entry(task, &config, self.clock().now()) else {
                continue;
            };
            let retry_eligible = entry.retry_eligible().unwrap_or(false);
            let (timeout_type, update_age_minutes) = match &entry.kind {
                AuditKind::Timeout {
                    timeout_type,
                    update_age_minutes,
                    ..
                } => (*timeout_type, *update_age_minutes),
                _ => continue,
            };
            let new_status = entry.new_status();

            let outcome = match timeout_type {
                TimeoutKind::HardTimeout => self.state_machine.force(&task.key, entry),
                TimeoutKind::StateTimeout => self.state_machine.record(&task.key, entry),
            };
            match outcome {
                Ok(_) => {
                    report.timed_out += 1;
                    report.details.push(TimeoutDetail {
                        project_id: task.key.project_id.to_string(),
                        task_id: task.key.task_id.to_string(),
                        old_status: task.status,
                        new_status,
                        timeout_type,
                        retry_eligible,
                        update_age_minutes,
                    });
                }
                Err(OrchestrationError::InvalidState(reason)) => {
                    debug!(
                        project_id = %task.key.project_id,
                        task_id = %task.key.task_id,
                        reason = %reason,
                        "task changed before timeout was applied"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        project_id = %task.key.project_id,
                        task_id = %task.key.task_id,
                        error = %e,
                        "failed to apply timeout"
                    );
                }
            }
        }
        Ok(report)
    }
}

/// Build the timeout entry for `task`, or `None` if it is within its limit.
fn timeout_entry(task: &Task, config: &MonitorConfig, now: DateTime<Utc>) -> Option<AuditEntry> {
    let limit = config.state_timeouts.for_status(task.status)?;
    let update_age = age::elapsed(now, task.updated_at);

    let (timeout_type, new_status, action, retry_eligible, reason) = match task.status {
        TaskStatus::Syncing | TaskStatus::Evaluating if update_age > config.hard_timeout() => (
            TimeoutKind::HardTimeout,
            TaskStatus::Error,
            TimeoutAction::MarkedErrorNoRetry,
            false,
            format!(
                "{} exceeded hard timeout of {} minutes",
                task.status.as_str().to_lowercase(),
                config.hard_timeout().as_secs() / 60
            ),
        ),
        TaskStatus::Pending | TaskStatus::Syncing | TaskStatus::Evaluating
            if update_age > limit =>
        {
            (
                TimeoutKind::StateTimeout,
                TaskStatus::Error,
                TimeoutAction::MarkedErrorRetryable,
                true,
                format!(
                    "{} timeout: no progress for {:.1} minutes",
                    task.status.as_str().to_lowercase(),
                    age::minutes(update_age)
                ),
            )
        }
        TaskStatus::Paused if update_age > limit => (
            TimeoutKind::StateTimeout,
            TaskStatus::Cancelled,
            TimeoutAction::Cancelled,
            false,
            "paused timeout".to_string(),
        ),
        _ => return None,
    };

    Some(AuditEntry {
        timestamp: now,
        reason,
        actor: Actor::Monitor,
        kind: AuditKind::Timeout {
            old_status: task.status,
            new_status,
            timeout_type,
            update_age_minutes: age::minutes(update_age),
            state_timeout_minutes: age::minutes(limit),
            retry_eligible,
            action,
        },
    })
}
