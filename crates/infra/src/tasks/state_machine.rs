//! Task lifecycle state machine.
//!
//! The only writer of `Task::status`. Each change reads the row, validates it
//! against the transition table, appends one audit entry and commits both in a
//! single transaction.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use taskflow_core::{AuditEntry, Clock, Task, TaskKey, TaskStatus};

use super::error::{OrchestrationError, OrchestrationResult};
use super::transaction::{TransactionRunner, TxOptions};

/// Optional extras written together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionUpdate {
    /// Recorded on the audit entry when the target is ERROR.
    pub error_message: Option<String>,
    /// Replaces `Task::result` in the same commit.
    pub result: Option<serde_json::Value>,
    /// Replaces `Task::rules_config` in the same commit.
    pub rules_config: Option<serde_json::Value>,
}

impl TransitionUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }
}

/// Ordered audit trail plus current status of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskHistory {
    pub project_id: String,
    pub task_id: String,
    pub current_status: TaskStatus,
    pub history: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskHistory {
    fn from(task: Task) -> Self {
        Self {
            project_id: task.key.project_id.to_string(),
            task_id: task.key.task_id.to_string(),
            current_status: task.status,
            history: task.audit_log,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct TaskStateMachine {
    runner: TransactionRunner,
}

impl TaskStateMachine {
    pub fn new(runner: TransactionRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &TransactionRunner {
        &self.runner
    }

    /// Pure transition-table lookup.
    pub fn validate(&self, from: TaskStatus, to: TaskStatus) -> bool {
        from.can_transition_to(to)
    }

    pub fn valid_next_states(&self, status: TaskStatus) -> &'static [TaskStatus] {
        status.valid_next_states()
    }

    pub fn is_terminal(&self, status: TaskStatus) -> bool {
        status.is_terminal()
    }

    /// Insert a new task in `initial` (IDLE or PENDING).
    pub fn create(&self, key: &TaskKey, initial: TaskStatus) -> OrchestrationResult<Task> {
        self.create_with(key, initial, None)
    }

    pub fn create_with(
        &self,
        key: &TaskKey,
        initial: TaskStatus,
        rules_config: Option<serde_json::Value>,
    ) -> OrchestrationResult<Task> {
        if !matches!(initial, TaskStatus::Idle | TaskStatus::Pending) {
            return Err(OrchestrationError::InvalidState(format!(
                "tasks start in IDLE or PENDING, not {initial}"
            )));
        }

        let (_, rows) = self
            .runner
            .transaction_committed(TxOptions::default(), |session| {
                let mut task = Task::new(key.clone(), initial, self.runner.clock().now())?;
                task.rules_config = rules_config.clone();
                session.create(task)
            })
            .map_err(|e| self.with_existing_status(e))?;

        let task = committed(rows, key)?;
        info!(
            project_id = %key.project_id,
            task_id = %key.task_id,
            status = %initial,
            "task created"
        );
        Ok(task)
    }

    /// A create that lost a race at commit time only learns the key from the
    /// store; fill in the status of the row that won.
    fn with_existing_status(&self, err: OrchestrationError) -> OrchestrationError {
        match err {
            OrchestrationError::AlreadyExists { key, status: None } => {
                let status = self
                    .runner
                    .store()
                    .get(&key)
                    .ok()
                    .flatten()
                    .map(|task| task.status);
                OrchestrationError::AlreadyExists { key, status }
            }
            other => other,
        }
    }

    /// Move a task to `to`, recording `reason`.
    pub fn transition(
        &self,
        key: &TaskKey,
        to: TaskStatus,
        reason: &str,
    ) -> OrchestrationResult<Task> {
        self.apply(key, None, to, reason, &TransitionUpdate::default())
    }

    /// [`transition`](Self::transition) carrying an error message and/or result.
    pub fn transition_with(
        &self,
        key: &TaskKey,
        to: TaskStatus,
        reason: &str,
        update: &TransitionUpdate,
    ) -> OrchestrationResult<Task> {
        self.apply(key, None, to, reason, update)
    }

    /// Transition only while the task is still in `from`.
    ///
    /// Workers use this at phase boundaries: if someone else moved the task
    /// (cancelled, timed out) the call fails with `InvalidState` and nothing
    /// is written.
    pub fn advance(
        &self,
        key: &TaskKey,
        from: TaskStatus,
        to: TaskStatus,
        reason: &str,
        update: &TransitionUpdate,
    ) -> OrchestrationResult<Task> {
        self.apply(key, Some(from), to, reason, update)
    }

    fn apply(
        &self,
        key: &TaskKey,
        expected_from: Option<TaskStatus>,
        to: TaskStatus,
        reason: &str,
        update: &TransitionUpdate,
    ) -> OrchestrationResult<Task> {
        let result = self
            .runner
            .transaction_committed(TxOptions::default(), |session| {
                let mut task = session.require(key)?;
                let from = task.status;
                if let Some(expected) = expected_from
                    && from != expected
                {
                    return Err(OrchestrationError::InvalidState(format!(
                        "{key} is {from}, expected {expected}"
                    )));
                }

                let mut entry = AuditEntry::transition(self.runner.clock().now(), from, to, reason);
                if to == TaskStatus::Error
                    && let Some(message) = &update.error_message
                {
                    entry = entry.with_error_message(message.clone());
                }
                task.apply_transition(entry)
                    .map_err(|e| OrchestrationError::from_domain(key, e))?;
                if let Some(result) = &update.result {
                    task.result = Some(result.clone());
                }
                if let Some(rules) = &update.rules_config {
                    task.rules_config = Some(rules.clone());
                }

                session.update(task)?;
                Ok(from)
            });

        match result {
            Ok((from, rows)) => {
                info!(
                    project_id = %key.project_id,
                    task_id = %key.task_id,
                    from = %from,
                    to = %to,
                    reason,
                    "task status changed"
                );
                committed(rows, key)
            }
            Err(e) => {
                warn!(
                    project_id = %key.project_id,
                    task_id = %key.task_id,
                    to = %to,
                    error = %e,
                    "task status change rejected"
                );
                Err(e)
            }
        }
    }

    /// Commit a prepared audit entry through the transition table.
    ///
    /// For callers that need a richer entry than a plain transition (the
    /// timeout monitor). `entry.old_status()` must match the stored status.
    pub fn record(&self, key: &TaskKey, entry: AuditEntry) -> OrchestrationResult<Task> {
        self.write_entry(key, entry, true)
    }

    /// Write `entry` without consulting the transition table.
    ///
    /// Reserved for recovery and the timeout monitor. `entry.old_status()` must
    /// still match the stored status, otherwise `InvalidState` is returned and
    /// nothing is written.
    pub fn force(&self, key: &TaskKey, entry: AuditEntry) -> OrchestrationResult<Task> {
        self.write_entry(key, entry, false)
    }

    fn write_entry(
        &self,
        key: &TaskKey,
        entry: AuditEntry,
        checked: bool,
    ) -> OrchestrationResult<Task> {
        let from = entry.old_status();
        let to = entry.new_status();
        let actor = entry.actor;

        let (_, rows) = self
            .runner
            .transaction_committed(TxOptions::default(), |session| {
                let mut task = session.require(key)?;
                if task.status != from {
                    return Err(OrchestrationError::InvalidState(format!(
                        "{key} is {}, expected {from}",
                        task.status
                    )));
                }
                if checked {
                    task.apply_transition(entry.clone())
                        .map_err(|e| OrchestrationError::from_domain(key, e))?;
                } else {
                    task.apply_unchecked(entry.clone());
                }
                session.update(task)
            })?;

        if checked {
            info!(
                project_id = %key.project_id,
                task_id = %key.task_id,
                from = %from,
                to = %to,
                actor = ?actor,
                reason = %entry.reason,
                "task status changed"
            );
        } else {
            warn!(
                project_id = %key.project_id,
                task_id = %key.task_id,
                from = %from,
                to = %to,
                actor = ?actor,
                reason = %entry.reason,
                "task status forced"
            );
        }
        committed(rows, key)
    }

    pub fn get(&self, key: &TaskKey) -> OrchestrationResult<Task> {
        self.runner
            .store()
            .get(key)?
            .ok_or_else(|| OrchestrationError::NotFound(key.clone()))
    }

    pub fn get_history(&self, key: &TaskKey) -> OrchestrationResult<TaskHistory> {
        self.get(key).map(TaskHistory::from)
    }
}

fn committed(rows: Vec<Task>, key: &TaskKey) -> OrchestrationResult<Task> {
    rows.into_iter()
        .find(|t| &t.key == key)
        .ok_or_else(|| OrchestrationError::InvalidState(format!("{key} missing from commit")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use taskflow_core::{Actor, AuditKind, FixedClock, RecoveryAction, RecoveryStrategy};

    use crate::store::{Change, InMemoryTaskStore, StoreError, TaskFilter, TaskStore};
    use crate::tasks::retry::RetryPolicy;

    fn machine() -> (TaskStateMachine, Arc<InMemoryTaskStore>, Arc<FixedClock>) {
        let store = InMemoryTaskStore::arc();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let runner = TransactionRunner::new(store.clone(), clock.clone(), RetryPolicy::no_retry());
        (TaskStateMachine::new(runner), store, clock)
    }

    fn key(id: &str) -> TaskKey {
        TaskKey::parse("P1", id).unwrap()
    }

    #[test]
    fn create_rejects_duplicates_and_bad_initial_state() {
        let (sm, _, _) = machine();
        sm.create(&key("T0"), TaskStatus::Pending).unwrap();

        assert!(matches!(
            sm.create(&key("T0"), TaskStatus::Pending),
            Err(OrchestrationError::AlreadyExists {
                status: Some(TaskStatus::Pending),
                ..
            })
        ));
        assert!(matches!(
            sm.create(&key("T1"), TaskStatus::Syncing),
            Err(OrchestrationError::InvalidState(_))
        ));
    }

    #[test]
    fn illegal_transition_keeps_status_and_lists_targets() {
        let (sm, _, _) = machine();
        sm.create(&key("T0"), TaskStatus::Idle).unwrap();

        let err = sm
            .transition(&key("T0"), TaskStatus::Error, "fail early")
            .unwrap_err();
        match err {
            OrchestrationError::InvalidTransition { allowed, .. } => {
                assert_eq!(allowed, vec![TaskStatus::Pending])
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sm.get(&key("T0")).unwrap().status, TaskStatus::Idle);
        assert!(sm.get_history(&key("T0")).unwrap().history.is_empty());
    }

    #[test]
    fn transition_records_audit_and_bumps_updated_at() {
        let (sm, _, clock) = machine();
        let created = sm.create(&key("T0"), TaskStatus::Pending).unwrap();
        clock.advance(ChronoDuration::seconds(30));

        let task = sm
            .transition(&key("T0"), TaskStatus::Syncing, "sync started")
            .unwrap();

        assert_eq!(task.status, TaskStatus::Syncing);
        assert!(task.updated_at > created.updated_at);
        assert_eq!(task.version, created.version + 1);

        let entry = task.last_audit_entry().unwrap();
        assert_eq!(entry.old_status(), TaskStatus::Pending);
        assert_eq!(entry.new_status(), TaskStatus::Syncing);
        assert_eq!(entry.reason, "sync started");
    }

    #[test]
    fn error_transition_carries_message() {
        let (sm, _, _) = machine();
        sm.create(&key("T0"), TaskStatus::Pending).unwrap();

        let task = sm
            .transition_with(
                &key("T0"),
                TaskStatus::Error,
                "sync failed",
                &TransitionUpdate::error("source unreachable"),
            )
            .unwrap();

        match &task.last_audit_entry().unwrap().kind {
            AuditKind::Transition { error_message, .. } => {
                assert_eq!(error_message.as_deref(), Some("source unreachable"))
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn advance_refuses_when_status_moved_on() {
        let (sm, _, _) = machine();
        sm.create(&key("T0"), TaskStatus::Pending).unwrap();
        sm.transition(&key("T0"), TaskStatus::Cancelled, "user cancelled")
            .unwrap();

        let err = sm
            .advance(
                &key("T0"),
                TaskStatus::Pending,
                TaskStatus::Syncing,
                "sync started",
                &TransitionUpdate::default(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidState(_)));
        assert_eq!(sm.get(&key("T0")).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn force_bypasses_table_but_checks_current_status() {
        let (sm, store, clock) = machine();
        sm.create(&key("T0"), TaskStatus::Pending).unwrap();
        sm.transition(&key("T0"), TaskStatus::Syncing, "sync started")
            .unwrap();

        let entry = AuditEntry {
            timestamp: clock.now(),
            reason: "service restart interrupted the task".into(),
            actor: Actor::Recovery,
            kind: AuditKind::Recovery {
                old_status: TaskStatus::Syncing,
                new_status: TaskStatus::Pending,
                duration_hours: 2.0,
                recovery_count: 0,
                is_recoverable: true,
                strategy: Some(RecoveryStrategy::AutoResume),
                action: RecoveryAction::AutoResume,
                retry_eligible: None,
                restart_induced: true,
            },
        };
        let task = sm.force(&key("T0"), entry.clone()).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.recovery_count(), 1);

        // Stale expectation: row is PENDING now.
        assert!(matches!(
            sm.force(&key("T0"), entry),
            Err(OrchestrationError::InvalidState(_))
        ));
        assert_eq!(store.get(&key("T0")).unwrap().unwrap().audit_log.len(), 2);
    }

    #[test]
    fn history_of_missing_task_is_not_found() {
        let (sm, _, _) = machine();
        assert!(matches!(
            sm.get_history(&key("nope")),
            Err(OrchestrationError::NotFound(_))
        ));
    }

    #[test]
    fn record_still_enforces_table() {
        let (sm, _, clock) = machine();
        sm.create(&key("T0"), TaskStatus::Idle).unwrap();

        let entry = AuditEntry::transition(clock.now(), TaskStatus::Idle, TaskStatus::Error, "x")
            .with_actor(Actor::Monitor);
        assert!(matches!(
            sm.record(&key("T0"), entry),
            Err(OrchestrationError::InvalidTransition { .. })
        ));
        assert_eq!(sm.get(&key("T0")).unwrap().status, TaskStatus::Idle);
    }

    /// Lets a competing writer create the same row just before every commit.
    struct RacingStore {
        inner: InMemoryTaskStore,
        winner_status: TaskStatus,
    }

    impl TaskStore for RacingStore {
        fn get(&self, key: &TaskKey) -> Result<Option<Task>, StoreError> {
            self.inner.get(key)
        }

        fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
            self.inner.list(filter)
        }

        fn commit(&self, changes: Vec<Change>) -> Result<Vec<Task>, StoreError> {
            if let Some(Change::Create(task)) = changes.first()
                && self.inner.get(&task.key)?.is_none()
            {
                let mut winner = task.clone();
                winner.status = self.winner_status;
                self.inner.create(winner)?;
            }
            self.inner.commit(changes)
        }
    }

    #[test]
    fn lost_create_race_reports_the_winning_row_status() {
        let store = Arc::new(RacingStore {
            inner: InMemoryTaskStore::new(),
            winner_status: TaskStatus::Syncing,
        });
        let runner = TransactionRunner::new(
            store,
            Arc::new(FixedClock::new(Utc::now())),
            RetryPolicy::no_retry(),
        );
        let sm = TaskStateMachine::new(runner);

        match sm.create(&key("T0"), TaskStatus::Pending).unwrap_err() {
            OrchestrationError::AlreadyExists { key: k, status } => {
                assert_eq!(k, key("T0"));
                assert_eq!(status, Some(TaskStatus::Syncing));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
