//! The task entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEntry;
use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::TaskKey;
use crate::status::TaskStatus;

/// A long-running sync+evaluate job for one `(project, task)` pair.
///
/// The business `result` and the append-only `audit_log` are kept apart so
/// recovery bookkeeping never has to be fished out of pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub status: TaskStatus,
    /// Opaque rules/config blob handed to the pipeline.
    #[serde(default)]
    pub rules_config: Option<serde_json::Value>,
    /// Opaque business payload written by the evaluate phase.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
    /// Row version; `0` until first committed, bumped by the store on each write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh, uncommitted task in `initial` (IDLE or PENDING).
    pub fn new(key: TaskKey, initial: TaskStatus, now: DateTime<Utc>) -> DomainResult<Self> {
        if !matches!(initial, TaskStatus::Idle | TaskStatus::Pending) {
            return Err(DomainError::InvalidInitialState(initial));
        }
        Ok(Self {
            key,
            status: initial,
            rules_config: None,
            result: None,
            audit_log: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a validated status change and record it.
    pub fn apply_transition(&mut self, entry: AuditEntry) -> DomainResult<()> {
        self.status.check_transition(entry.new_status())?;
        self.apply_unchecked(entry);
        Ok(())
    }

    /// Apply a status change without consulting the transition table.
    ///
    /// Reserved for repair paths (crash recovery, hard timeouts); the entry's
    /// actor records who bypassed the table.
    pub fn apply_unchecked(&mut self, entry: AuditEntry) {
        self.status = entry.new_status();
        self.touch(entry.timestamp);
        self.audit_log.push(entry);
    }

    /// Refresh `updated_at`; never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Number of restart-induced recovery attempts recorded so far.
    pub fn recovery_count(&self) -> u32 {
        self.audit_log
            .iter()
            .filter(|e| e.is_restart_induced())
            .count() as u32
    }

    pub fn last_audit_entry(&self) -> Option<&AuditEntry> {
        self.audit_log.last()
    }
}

impl Entity for Task {
    type Id = TaskKey;

    fn id(&self) -> &TaskKey {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, AuditKind, RecoveryAction, RecoveryStrategy};
    use chrono::Duration;

    fn key() -> TaskKey {
        TaskKey::parse("P1", "T0").unwrap()
    }

    #[test]
    fn new_rejects_running_initial_state() {
        assert_eq!(
            Task::new(key(), TaskStatus::Syncing, Utc::now()).unwrap_err(),
            DomainError::InvalidInitialState(TaskStatus::Syncing)
        );
    }

    #[test]
    fn illegal_transition_leaves_task_untouched() {
        let now = Utc::now();
        let mut task = Task::new(key(), TaskStatus::Pending, now).unwrap();
        let before = task.clone();

        let entry = AuditEntry::transition(
            now + Duration::seconds(5),
            TaskStatus::Pending,
            TaskStatus::Completed,
            "skip ahead",
        );
        assert!(task.apply_transition(entry).is_err());
        assert_eq!(task, before);
    }

    #[test]
    fn legal_transition_appends_audit_and_touches() {
        let now = Utc::now();
        let mut task = Task::new(key(), TaskStatus::Pending, now).unwrap();
        let later = now + Duration::seconds(5);

        task.apply_transition(AuditEntry::transition(
            later,
            TaskStatus::Pending,
            TaskStatus::Syncing,
            "sync started",
        ))
        .unwrap();

        assert_eq!(task.status, TaskStatus::Syncing);
        assert_eq!(task.updated_at, later);
        assert_eq!(task.audit_log.len(), 1);
    }

    #[test]
    fn recovery_count_counts_restart_entries_only() {
        let now = Utc::now();
        let mut task = Task::new(key(), TaskStatus::Pending, now).unwrap();
        task.audit_log.push(AuditEntry::transition(
            now,
            TaskStatus::Pending,
            TaskStatus::Syncing,
            "sync started",
        ));
        task.audit_log.push(AuditEntry {
            timestamp: now,
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
        });

        assert_eq!(task.recovery_count(), 1);
    }
}
