//! Append-only audit trail entries.
//!
//! Every status change writes exactly one [`AuditEntry`] into the task's
//! audit log. Entries serialize as flat JSON objects carrying at least
//! `timestamp`, `reason`, `actor` and `kind`, plus kind-specific fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TaskStatus;

/// Which component caused the status change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    StateMachine,
    Recovery,
    Monitor,
}

/// Recovery strategy chosen for a recoverable task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    AutoResume,
    MarkRetry,
    MarkError,
}

/// What the recovery manager actually did to the row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    AutoResume,
    MarkForRetry,
    MarkedError,
    MarkedUnrecoverable,
    FallbackReset,
}

/// Which threshold a timed-out task crossed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// `update_age` exceeded the per-state timeout.
    StateTimeout,
    /// `update_age` exceeded twice the default timeout.
    HardTimeout,
}

/// What the monitor did to a timed-out task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    MarkedErrorRetryable,
    MarkedErrorNoRetry,
    Cancelled,
}

/// Kind-specific payload of an audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    Transition {
        old_status: TaskStatus,
        new_status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Recovery {
        old_status: TaskStatus,
        new_status: TaskStatus,
        duration_hours: f64,
        recovery_count: u32,
        is_recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<RecoveryStrategy>,
        action: RecoveryAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_eligible: Option<bool>,
        /// Counted by [`Task::recovery_count`](crate::Task::recovery_count).
        restart_induced: bool,
    },
    Timeout {
        old_status: TaskStatus,
        new_status: TaskStatus,
        timeout_type: TimeoutKind,
        update_age_minutes: f64,
        state_timeout_minutes: f64,
        retry_eligible: bool,
        action: TimeoutAction,
    },
}

/// One entry of a task's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub actor: Actor,
    #[serde(flatten)]
    pub kind: AuditKind,
}

impl AuditEntry {
    pub fn transition(
        timestamp: DateTime<Utc>,
        old_status: TaskStatus,
        new_status: TaskStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            reason: reason.into(),
            actor: Actor::StateMachine,
            kind: AuditKind::Transition {
                old_status,
                new_status,
                error_message: None,
            },
        }
    }

    /// Attach an error message (only meaningful for transitions into ERROR).
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        if let AuditKind::Transition { error_message, .. } = &mut self.kind {
            *error_message = Some(message.into());
        }
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn old_status(&self) -> TaskStatus {
        match &self.kind {
            AuditKind::Transition { old_status, .. }
            | AuditKind::Recovery { old_status, .. }
            | AuditKind::Timeout { old_status, .. } => *old_status,
        }
    }

    pub fn new_status(&self) -> TaskStatus {
        match &self.kind {
            AuditKind::Transition { new_status, .. }
            | AuditKind::Recovery { new_status, .. }
            | AuditKind::Timeout { new_status, .. } => *new_status,
        }
    }

    pub fn is_restart_induced(&self) -> bool {
        matches!(
            self.kind,
            AuditKind::Recovery {
                restart_induced: true,
                ..
            }
        )
    }

    /// `Some(flag)` for entries that state retry eligibility explicitly.
    pub fn retry_eligible(&self) -> Option<bool> {
        match &self.kind {
            AuditKind::Recovery { retry_eligible, .. } => *retry_eligible,
            AuditKind::Timeout { retry_eligible, .. } => Some(*retry_eligible),
            AuditKind::Transition { .. } => None,
        }
    }
}
