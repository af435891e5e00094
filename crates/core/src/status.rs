//! Task lifecycle states and the transition table.
//!
//! This is the single place where legality of a status change is decided.
//! Every other component asks [`TaskStatus::can_transition_to`] (directly or
//! through the state machine in the infra layer).

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle status of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created but never scheduled.
    Idle,
    /// Admitted, waiting for a worker.
    Pending,
    /// Sync phase running.
    Syncing,
    /// Evaluate phase running.
    Evaluating,
    /// Finished successfully (soft terminal).
    Completed,
    /// Failed; may be resubmitted.
    Error,
    /// Cancelled (soft terminal).
    Cancelled,
    /// Evaluation suspended.
    Paused,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Idle,
        TaskStatus::Pending,
        TaskStatus::Syncing,
        TaskStatus::Evaluating,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Cancelled,
        TaskStatus::Paused,
    ];

    /// States counted against the admission ceiling.
    pub const RUNNING: [TaskStatus; 3] = [
        TaskStatus::Pending,
        TaskStatus::Syncing,
        TaskStatus::Evaluating,
    ];

    /// States watched by the timeout monitor.
    pub const ACTIVE: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Syncing,
        TaskStatus::Evaluating,
        TaskStatus::Paused,
    ];

    /// States a crashed process can leave a task stranded in.
    pub const IN_FLIGHT: [TaskStatus; 2] = [TaskStatus::Syncing, TaskStatus::Evaluating];

    /// States from which a resubmission reopens the task.
    pub const RERUNNABLE: [TaskStatus; 4] = [
        TaskStatus::Idle,
        TaskStatus::Completed,
        TaskStatus::Error,
        TaskStatus::Cancelled,
    ];

    /// Legal targets from this status.
    pub fn valid_next_states(self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Idle => &[Pending],
            Pending => &[Syncing, Cancelled, Error],
            Syncing => &[Evaluating, Error, Cancelled],
            Evaluating => &[Completed, Error, Paused],
            Paused => &[Evaluating, Cancelled],
            Completed => &[Pending],
            Error => &[Pending],
            Cancelled => &[Pending],
        }
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        self.valid_next_states().contains(&to)
    }

    /// Validate `self -> to` against the table.
    pub fn check_transition(self, to: TaskStatus) -> Result<(), DomainError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to,
                allowed: self.valid_next_states().to_vec(),
            })
        }
    }

    /// Soft terminal: no automatic outbound transition, only an explicit
    /// resubmission back to PENDING.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn is_running(self) -> bool {
        Self::RUNNING.contains(&self)
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_rerunnable(self) -> bool {
        Self::RERUNNABLE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "IDLE",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Syncing => "SYNCING",
            TaskStatus::Evaluating => "EVALUATING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}
