//! Crash recovery for tasks abandoned mid-flight.
//!
//! At startup any task still SYNCING or EVALUATING that was created more than
//! `threshold` ago cannot have a live worker behind it. Each one is either
//! resumed, failed with retry eligibility, or terminalized, based on its age
//! and how many restarts it has already been through.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use taskflow_core::{
    Actor, AuditEntry, AuditKind, Clock, RecoveryAction, RecoveryStrategy, Task, TaskStatus,
};

use super::age;
use super::error::{OrchestrationError, OrchestrationResult};
use super::state_machine::TaskStateMachine;
use crate::config::RecoveryConfig;
use crate::store::TaskFilter;

/// Counters for one recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub total_checked: usize,
    pub recoverable_tasks: usize,
    pub recovered_tasks: usize,
    pub failed_tasks: usize,
    /// Unrecoverable tasks that were terminalized, plus tasks that moved on
    /// before recovery reached them.
    pub ignored_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryDetail {
    pub project_id: String,
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: Option<TaskStatus>,
    pub action: Option<RecoveryAction>,
    pub is_recoverable: bool,
    pub duration_hours: f64,
    pub recovery_count: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub stats: RecoveryStats,
    pub details: Vec<RecoveryDetail>,
}

/// What recovery decided for one stuck task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    Recover(RecoveryStrategy),
    Unrecoverable,
}

#[derive(Clone)]
pub struct RecoveryManager {
    state_machine: TaskStateMachine,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(state_machine: TaskStateMachine, config: RecoveryConfig) -> Self {
        Self {
            state_machine,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Pick a plan from a task's age and prior restart count.
    pub fn plan(&self, duration: Duration, recovery_count: u32) -> RecoveryPlan {
        if duration > self.config.max_recoverable_age
            || recovery_count >= self.config.max_attempts
        {
            return RecoveryPlan::Unrecoverable;
        }

        let strategy = if recovery_count == 0 && duration < self.config.auto_resume_window {
            RecoveryStrategy::AutoResume
        } else if recovery_count < self.config.max_attempts {
            RecoveryStrategy::MarkRetry
        } else {
            RecoveryStrategy::MarkError
        };
        RecoveryPlan::Recover(strategy)
    }

    /// Scan for stuck SYNCING/EVALUATING tasks and repair each one.
    ///
    /// Per-task failures are counted, never propagated; only a failed scan
    /// query returns `Err`.
    pub fn recover_stuck_tasks(&self) -> OrchestrationResult<RecoveryReport> {
        let now = self.clock().now();
        let filter = TaskFilter::with_statuses(TaskStatus::IN_FLIGHT)
            .created_before(age::before(now, self.config.threshold));
        let stuck = self.state_machine.runner().store().list(&filter)?;

        let mut report = RecoveryReport {
            stats: RecoveryStats {
                total_checked: stuck.len(),
                ..RecoveryStats::default()
            },
            details: Vec::with_capacity(stuck.len()),
        };

        if stuck.is_empty() {
            info!("no stuck tasks found");
            return Ok(report);
        }
        info!(count = stuck.len(), "found stuck tasks");

        for task in stuck {
            let detail = self.recover_one(&task, now);
            let stats = &mut report.stats;
            if detail.is_recoverable {
                stats.recoverable_tasks += 1;
            }
            match (&detail.error, detail.action) {
                (Some(_), _) => stats.failed_tasks += 1,
                (None, Some(RecoveryAction::MarkedUnrecoverable)) | (None, None) => {
                    stats.ignored_tasks += 1
                }
                (None, Some(_)) => stats.recovered_tasks += 1,
            }
            report.details.push(detail);
        }

        info!(
            total_checked = report.stats.total_checked,
            recoverable = report.stats.recoverable_tasks,
            recovered = report.stats.recovered_tasks,
            failed = report.stats.failed_tasks,
            ignored = report.stats.ignored_tasks,
            "task recovery finished"
        );
        Ok(report)
    }

    fn recover_one(&self, task: &Task, now: DateTime<Utc>) -> RecoveryDetail {
        let duration = age::elapsed(now, task.created_at);
        let recovery_count = task.recovery_count();
        let plan = self.plan(duration, recovery_count);
        let is_recoverable = matches!(plan, RecoveryPlan::Recover(_));

        let mut detail = RecoveryDetail {
            project_id: task.key.project_id.to_string(),
            task_id: task.key.task_id.to_string(),
            old_status: task.status,
            new_status: None,
            action: None,
            is_recoverable,
            duration_hours: age::hours(duration),
            recovery_count,
            error: None,
        };

        let entry = recovery_entry(task.status, plan, now, detail.duration_hours, recovery_count);
        let action = match &entry.kind {
            AuditKind::Recovery { action, .. } => Some(*action),
            _ => None,
        };

        match self.state_machine.force(&task.key, entry) {
            Ok(updated) => {
                detail.new_status = Some(updated.status);
                detail.action = action;
                info!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    from = %task.status,
                    to = %updated.status,
                    ?plan,
                    duration_hours = detail.duration_hours,
                    recovery_count,
                    "stuck task handled"
                );
            }
            Err(OrchestrationError::InvalidState(reason)) => {
                // Moved on (a worker or the monitor got there first).
                info!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    reason = %reason,
                    "stuck task no longer needs recovery"
                );
            }
            Err(e) => {
                error!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    error = %e,
                    "task recovery failed"
                );
                detail.error = Some(e.to_string());
            }
        }
        detail
    }

    /// Move every SYNCING/EVALUATING task to ERROR regardless of age.
    ///
    /// Used when the regular scan cannot run at all. Returns how many rows
    /// were reset.
    pub fn fallback_reset(&self) -> OrchestrationResult<usize> {
        let now = self.clock().now();
        let in_flight = self
            .state_machine
            .runner()
            .store()
            .list(&TaskFilter::with_statuses(TaskStatus::IN_FLIGHT))?;

        let mut reset = 0;
        for task in in_flight {
            let duration = age::elapsed(now, task.created_at);
            let entry = AuditEntry {
                timestamp: now,
                reason: "reset after restart (fallback)".to_string(),
                actor: Actor::Recovery,
                kind: AuditKind::Recovery {
                    old_status: task.status,
                    new_status: TaskStatus::Error,
                    duration_hours: age::hours(duration),
                    recovery_count: task.recovery_count(),
                    is_recoverable: false,
                    strategy: None,
                    action: RecoveryAction::FallbackReset,
                    retry_eligible: Some(true),
                    restart_induced: true,
                },
            };
            match self.state_machine.force(&task.key, entry) {
                Ok(_) => reset += 1,
                Err(e) => warn!(
                    project_id = %task.key.project_id,
                    task_id = %task.key.task_id,
                    error = %e,
                    "fallback reset failed"
                ),
            }
        }

        warn!(reset, "fallback reset of in-flight tasks finished");
        Ok(reset)
    }

    /// Run [`recover_stuck_tasks`](Self::recover_stuck_tasks) on its own
    /// thread, falling back to [`fallback_reset`](Self::fallback_reset) if the
    /// scan fails.
    pub fn spawn(&self) -> std::io::Result<JoinHandle<OrchestrationResult<RecoveryReport>>> {
        let manager = self.clone();
        thread::Builder::new()
            .name("task-recovery".into())
            .spawn(move || match manager.recover_stuck_tasks() {
                Ok(report) => Ok(report),
                Err(e) => {
                    error!(error = %e, "task recovery scan failed; running fallback reset");
                    manager.fallback_reset()?;
                    Err(e)
                }
            })
    }

    fn clock(&self) -> &dyn Clock {
        self.state_machine.runner().clock().as_ref()
    }
}

fn recovery_entry(
    old_status: TaskStatus,
    plan: RecoveryPlan,
    now: DateTime<Utc>,
    duration_hours: f64,
    recovery_count: u32,
) -> AuditEntry {
    let (new_status, reason, strategy, action, retry_eligible, restart_induced) = match plan {
        RecoveryPlan::Recover(RecoveryStrategy::AutoResume) => (
            TaskStatus::Pending,
            "service restart interrupted the task; resubmitted for processing",
            Some(RecoveryStrategy::AutoResume),
            RecoveryAction::AutoResume,
            None,
            true,
        ),
        RecoveryPlan::Recover(RecoveryStrategy::MarkRetry) => (
            TaskStatus::Error,
            "service restart interrupted the task; eligible for retry",
            Some(RecoveryStrategy::MarkRetry),
            RecoveryAction::MarkForRetry,
            Some(true),
            true,
        ),
        RecoveryPlan::Recover(RecoveryStrategy::MarkError) => (
            TaskStatus::Error,
            "service restart interrupted the task",
            Some(RecoveryStrategy::MarkError),
            RecoveryAction::MarkedError,
            None,
            true,
        ),
        RecoveryPlan::Unrecoverable => (
            TaskStatus::Error,
            "duration exceeded or recovery attempts exhausted",
            None,
            RecoveryAction::MarkedUnrecoverable,
            Some(false),
            false,
        ),
    };

    AuditEntry {
        timestamp: now,
        reason: reason.to_string(),
        actor: Actor::Recovery,
        kind: AuditKind::Recovery {
            old_status,
            new_status,
            duration_hours,
            recovery_count,
            is_recoverable: matches!(plan, RecoveryPlan::Recover(_)),
            strategy,
            action,
            retry_eligible,
            restart_induced,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use taskflow_core::{FixedClock, TaskKey};

    use crate::store::{InMemoryTaskStore, TaskStore};
    use crate::tasks::retry::RetryPolicy;
    use crate::tasks::transaction::TransactionRunner;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: Arc<FixedClock>,
        recovery: RecoveryManager,
    }

    fn fixture() -> Fixture {
        let store = InMemoryTaskStore::arc();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let runner = TransactionRunner::new(store.clone(), clock.clone(), RetryPolicy::no_retry());
        let recovery =
            RecoveryManager::new(TaskStateMachine::new(runner), RecoveryConfig::default());
        Fixture {
            store,
            clock,
            recovery,
        }
    }

    fn seed(f: &Fixture, id: &str, status: TaskStatus, age_hours: i64, restarts: u32) -> TaskKey {
        let key = TaskKey::parse("P1", id).unwrap();
        let created = f.clock.now() - ChronoDuration::hours(age_hours);
        let mut task = Task::new(key.clone(), TaskStatus::Pending, created).unwrap();
        task.status = status;
        for _ in 0..restarts {
            task.audit_log.push(recovery_entry(
                status,
                RecoveryPlan::Recover(RecoveryStrategy::MarkRetry),
                created,
                1.0,
                0,
            ));
        }
        f.store.create(task).unwrap();
        key
    }

    fn load(f: &Fixture, key: &TaskKey) -> Task {
        f.store.get(key).unwrap().unwrap()
    }

    #[test]
    fn plan_follows_age_and_restart_count() {
        let f = fixture();
        let h = |n: u64| Duration::from_secs(n * 3600);

        assert_eq!(
            f.recovery.plan(h(2), 0),
            RecoveryPlan::Recover(RecoveryStrategy::AutoResume)
        );
        assert_eq!(
            f.recovery.plan(h(8), 0),
            RecoveryPlan::Recover(RecoveryStrategy::MarkRetry)
        );
        assert_eq!(
            f.recovery.plan(h(2), 2),
            RecoveryPlan::Recover(RecoveryStrategy::MarkRetry)
        );
        assert_eq!(f.recovery.plan(h(2), 3), RecoveryPlan::Unrecoverable);
        assert_eq!(f.recovery.plan(h(30), 0), RecoveryPlan::Unrecoverable);
    }

    #[test]
    fn young_first_time_task_is_resumed() {
        let f = fixture();
        let key = seed(&f, "T0", TaskStatus::Syncing, 2, 0);

        let report = f.recovery.recover_stuck_tasks().unwrap();

        let task = load(&f, &key);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.recovery_count(), 1);
        assert_eq!(report.stats.recovered_tasks, 1);
        assert_eq!(report.stats.recoverable_tasks, 1);
        assert_eq!(report.details[0].action, Some(RecoveryAction::AutoResume));
    }

    #[test]
    fn old_task_is_marked_unrecoverable() {
        let f = fixture();
        let key = seed(&f, "T0", TaskStatus::Evaluating, 30, 0);

        let report = f.recovery.recover_stuck_tasks().unwrap();

        let task = load(&f, &key);
        assert_eq!(task.status, TaskStatus::Error);
        let entry = task.last_audit_entry().unwrap();
        assert_eq!(entry.retry_eligible(), Some(false));
        assert_eq!(entry.reason, "duration exceeded or recovery attempts exhausted");
        assert!(!entry.is_restart_induced());
        assert_eq!(report.stats.ignored_tasks, 1);
        assert_eq!(report.stats.recoverable_tasks, 0);
    }

    #[test]
    fn previously_restarted_task_is_marked_for_retry() {
        let f = fixture();
        let key = seed(&f, "T0", TaskStatus::Syncing, 2, 1);

        f.recovery.recover_stuck_tasks().unwrap();

        let task = load(&f, &key);
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.last_audit_entry().unwrap().retry_eligible(), Some(true));
        assert_eq!(task.recovery_count(), 2);
    }

    #[test]
    fn recent_and_idle_tasks_are_left_alone() {
        let f = fixture();
        let fresh = seed(&f, "T0", TaskStatus::Syncing, 0, 0);
        let pending = seed(&f, "T1", TaskStatus::Pending, 5, 0);

        let report = f.recovery.recover_stuck_tasks().unwrap();

        assert_eq!(report.stats.total_checked, 0);
        assert_eq!(load(&f, &fresh).status, TaskStatus::Syncing);
        assert_eq!(load(&f, &pending).status, TaskStatus::Pending);
    }

    #[test]
    fn fallback_reset_errors_every_in_flight_task() {
        let f = fixture();
        let a = seed(&f, "T0", TaskStatus::Syncing, 0, 0);
        let b = seed(&f, "T1", TaskStatus::Evaluating, 40, 0);
        let c = seed(&f, "T2", TaskStatus::Completed, 1, 0);

        assert_eq!(f.recovery.fallback_reset().unwrap(), 2);
        assert_eq!(load(&f, &a).status, TaskStatus::Error);
        assert_eq!(load(&f, &b).status, TaskStatus::Error);
        assert_eq!(load(&f, &c).status, TaskStatus::Completed);
        assert_eq!(
            load(&f, &a).last_audit_entry().unwrap().reason,
            "reset after restart (fallback)"
        );
    }

    #[test]
    fn spawned_recovery_reports_back() {
        let f = fixture();
        seed(&f, "T0", TaskStatus::Syncing, 2, 0);

        let report = f.recovery.spawn().unwrap().join().unwrap().unwrap();
        assert_eq!(report.stats.recovered_tasks, 1);
    }
}
