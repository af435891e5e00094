//! Domain error model.

use thiserror::Error;

use crate::status::TaskStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic lifecycle failures (illegal status
/// changes, malformed identifiers, stale versions). Storage and scheduling
/// concerns belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A status change is not listed in the transition table.
    #[error("invalid transition {from} -> {to}; allowed from {from}: {}", format_targets(.allowed))]
    InvalidTransition {
        from: TaskStatus,
        to: TaskStatus,
        allowed: Vec<TaskStatus>,
    },

    /// A task may only be created in IDLE or PENDING.
    #[error("invalid initial state {0}; must be IDLE or PENDING")]
    InvalidInitialState(TaskStatus),

    /// A status string did not name a known state.
    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    /// An identifier was invalid (e.g. empty or parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflict occurred (stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

fn format_targets(targets: &[TaskStatus]) -> String {
    if targets.is_empty() {
        return "none".to_string();
    }
    targets
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
