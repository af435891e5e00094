use std::sync::Arc;

use thiserror::Error;

use taskflow_core::{Entity, ExpectedVersion, Task, TaskKey};

use super::filter::TaskFilter;

/// A single staged row write.
///
/// Changes are produced by a [`Session`](crate::tasks::Session) and applied by
/// [`TaskStore::commit`] all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert a new row; fails if the key exists.
    Create(Task),
    /// Overwrite an existing row whose version still equals `expected`.
    Update { task: Task, expected: ExpectedVersion },
}

impl Change {
    pub fn key(&self) -> &TaskKey {
        match self {
            Change::Create(task) | Change::Update { task, .. } => task.id(),
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            Change::Create(task) | Change::Update { task, .. } => task,
        }
    }

    pub fn expected(&self) -> ExpectedVersion {
        match self {
            Change::Create(_) => ExpectedVersion::NoRow,
            Change::Update { expected, .. } => *expected,
        }
    }
}

/// Task store operation error.
///
/// These are **infrastructure errors** (missing rows, lost updates, backend
/// failures) as opposed to lifecycle errors (illegal transitions).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskKey),

    #[error("task already exists: {0}")]
    AlreadyExists(TaskKey),

    /// Optimistic concurrency check failed; the caller should re-read and retry.
    #[error("write conflict on {key}: {detail}")]
    Conflict { key: TaskKey, detail: String },

    /// Retryable backend failure (connection drop, lock wait, deadlock victim).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable task rows keyed by `(project_id, task_id)`.
///
/// ## Commit semantics
///
/// `commit()`:
/// - checks every change's [`ExpectedVersion`] against the current row first
/// - applies all changes or none (atomicity)
/// - bumps each written row's `version` by one
/// - returns the rows as stored
///
/// `create` and `update` are single-row commits.
pub trait TaskStore: Send + Sync {
    /// Get a task by key.
    fn get(&self, key: &TaskKey) -> Result<Option<Task>, StoreError>;

    /// List tasks matching a filter, ordered by `created_at`.
    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Atomically apply a set of staged changes.
    fn commit(&self, changes: Vec<Change>) -> Result<Vec<Task>, StoreError>;

    /// Insert a new task.
    fn create(&self, task: Task) -> Result<Task, StoreError> {
        let mut stored = self.commit(vec![Change::Create(task)])?;
        stored
            .pop()
            .ok_or_else(|| StoreError::Unavailable("commit returned no rows".to_string()))
    }

    /// Overwrite a task loaded at `task.version`.
    fn update(&self, task: Task) -> Result<Task, StoreError> {
        let expected = ExpectedVersion::Exact(task.version);
        let mut stored = self.commit(vec![Change::Update { task, expected }])?;
        stored
            .pop()
            .ok_or_else(|| StoreError::Unavailable("commit returned no rows".to_string()))
    }
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn get(&self, key: &TaskKey) -> Result<Option<Task>, StoreError> {
        (**self).get(key)
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        (**self).list(filter)
    }

    fn commit(&self, changes: Vec<Change>) -> Result<Vec<Task>, StoreError> {
        (**self).commit(changes)
    }
}
