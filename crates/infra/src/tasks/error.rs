//! Orchestration error taxonomy.

use std::time::Duration;

use thiserror::Error;

use taskflow_core::{DomainError, TaskKey, TaskStatus};

use super::admission::AdmissionStatus;
use crate::store::StoreError;

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Errors surfaced by the orchestration engine.
///
/// `NotFound`, `AlreadyExists`, `InvalidTransition` and
/// `ConcurrencyLimitExceeded` go straight back to the caller. `TransientStore`
/// and `Conflict` are retried by the transaction runner.
#[derive(Debug, Clone, Error)]
pub enum OrchestrationError {
    #[error("task not found: {0}")]
    NotFound(TaskKey),

    /// `status` is `None` when the store reported the duplicate without the row.
    #[error("task already exists: {key}{}", status_suffix(.status))]
    AlreadyExists {
        key: TaskKey,
        status: Option<TaskStatus>,
    },

    #[error("{key}: invalid transition {from} -> {to}; allowed: {}", join(.allowed))]
    InvalidTransition {
        key: TaskKey,
        from: TaskStatus,
        to: TaskStatus,
        allowed: Vec<TaskStatus>,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(
        "concurrency limit reached ({current}/{max} running)",
        current = .0.current,
        max = .0.max
    )]
    ConcurrencyLimitExceeded(Box<AdmissionStatus>),

    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    #[error("transient store error: {0}")]
    TransientStore(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("{key} is unrecoverable: {reason}")]
    Unrecoverable { key: TaskKey, reason: String },

    #[error("shutdown in progress; rejected operation '{operation}'")]
    ShuttingDown { operation: String },

    #[error("task runtime not started; rejected operation '{operation}'")]
    NotStarted { operation: String },
}

impl OrchestrationError {
    /// Whether the transaction runner may retry the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::TransientStore(_) | OrchestrationError::Conflict(_)
        )
    }

    /// Attach a key to a domain-level error.
    pub fn from_domain(key: &TaskKey, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to, allowed } => {
                OrchestrationError::InvalidTransition {
                    key: key.clone(),
                    from,
                    to,
                    allowed,
                }
            }
            DomainError::Conflict(detail) => OrchestrationError::Conflict(detail),
            other => OrchestrationError::InvalidState(other.to_string()),
        }
    }
}

fn status_suffix(status: &Option<TaskStatus>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

fn join(targets: &[TaskStatus]) -> String {
    targets
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<StoreError> for OrchestrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => OrchestrationError::NotFound(key),
            StoreError::AlreadyExists(key) => {
                OrchestrationError::AlreadyExists { key, status: None }
            }
            StoreError::Conflict { key, detail } => {
                OrchestrationError::Conflict(format!("{key}: {detail}"))
            }
            StoreError::Unavailable(msg) => OrchestrationError::TransientStore(msg),
        }
    }
}

impl From<DomainError> for OrchestrationError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(detail) => OrchestrationError::Conflict(detail),
            other => OrchestrationError::InvalidState(other.to_string()),
        }
    }
}
