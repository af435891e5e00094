//! Explicit unit-of-work handle.
//!
//! A [`Session`] stages writes in memory and reads its own writes. Nothing
//! reaches the store until [`Session::commit`]; dropping the session (or
//! calling [`Session::rollback`]) discards the staged set.

use std::collections::HashMap;

use taskflow_core::{ExpectedVersion, Task, TaskKey};

use super::error::{OrchestrationError, OrchestrationResult};
use crate::store::{Change, TaskFilter, TaskStore};

/// Marker returned by [`Session::savepoint`].
#[derive(Debug, Clone)]
pub struct Savepoint {
    staged: Vec<Change>,
}

/// One open unit of work against a [`TaskStore`].
pub struct Session<'s> {
    store: &'s dyn TaskStore,
    staged: Vec<Change>,
}

impl<'s> Session<'s> {
    /// Begin a unit of work.
    pub fn begin(store: &'s dyn TaskStore) -> Self {
        Self {
            store,
            staged: Vec::new(),
        }
    }

    fn staged_index(&self, key: &TaskKey) -> Option<usize> {
        self.staged.iter().position(|c| c.key() == key)
    }

    /// Read a task, preferring this session's staged version.
    pub fn get(&self, key: &TaskKey) -> OrchestrationResult<Option<Task>> {
        if let Some(i) = self.staged_index(key) {
            return Ok(Some(self.staged[i].task().clone()));
        }
        Ok(self.store.get(key)?)
    }

    /// Read a task or fail with `NotFound`.
    pub fn require(&self, key: &TaskKey) -> OrchestrationResult<Task> {
        self.get(key)?
            .ok_or_else(|| OrchestrationError::NotFound(key.clone()))
    }

    /// List tasks, overlaying staged writes on the committed rows.
    pub fn list(&self, filter: &TaskFilter) -> OrchestrationResult<Vec<Task>> {
        let mut by_key: HashMap<TaskKey, Task> = self
            .store
            .list(filter)?
            .into_iter()
            .map(|t| (t.key.clone(), t))
            .collect();

        for change in &self.staged {
            let task = change.task();
            if filter.matches(task) {
                by_key.insert(task.key.clone(), task.clone());
            } else {
                by_key.remove(&task.key);
            }
        }

        let mut tasks: Vec<_> = by_key.into_values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(tasks)
    }

    /// Stage a new row.
    pub fn create(&mut self, task: Task) -> OrchestrationResult<()> {
        if let Some(existing) = self.get(&task.key)? {
            return Err(OrchestrationError::AlreadyExists {
                key: existing.key,
                status: Some(existing.status),
            });
        }
        self.staged.push(Change::Create(task));
        Ok(())
    }

    /// Stage an overwrite of a row previously read through this session.
    pub fn update(&mut self, task: Task) -> OrchestrationResult<()> {
        match self.staged_index(&task.key) {
            Some(i) => {
                // Keep the original expectation; the store has not seen this row yet.
                let replacement = match &self.staged[i] {
                    Change::Create(_) => Change::Create(task),
                    Change::Update { expected, .. } => Change::Update {
                        expected: *expected,
                        task,
                    },
                };
                self.staged[i] = replacement;
            }
            None => {
                let expected = ExpectedVersion::Exact(task.version);
                self.staged.push(Change::Update { task, expected });
            }
        }
        Ok(())
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            staged: self.staged.clone(),
        }
    }

    /// Discard everything staged after `savepoint`.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        self.staged = savepoint.staged;
    }

    pub fn pending_changes(&self) -> usize {
        self.staged.len()
    }

    /// Apply all staged writes atomically.
    pub fn commit(self) -> OrchestrationResult<Vec<Task>> {
        if self.staged.is_empty() {
            return Ok(vec![]);
        }
        Ok(self.store.commit(self.staged)?)
    }

    /// Discard all staged writes.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use chrono::Utc;
    use taskflow_core::TaskStatus;

    fn task(id: &str) -> Task {
        Task::new(TaskKey::parse("P1", id).unwrap(), TaskStatus::Pending, Utc::now()).unwrap()
    }

    #[test]
    fn reads_own_writes_before_commit() {
        let store = InMemoryTaskStore::new();
        let mut session = Session::begin(&store);
        session.create(task("T0")).unwrap();

        assert!(session.get(&task("T0").key).unwrap().is_some());
        assert!(store.is_empty());

        session.commit().unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let store = InMemoryTaskStore::new();
        let mut session = Session::begin(&store);
        session.create(task("T0")).unwrap();
        session.rollback();

        assert!(store.is_empty());
    }

    #[test]
    fn savepoint_drops_later_writes_only() {
        let store = InMemoryTaskStore::new();
        let mut session = Session::begin(&store);
        session.create(task("T0")).unwrap();
        let sp = session.savepoint();
        session.create(task("T1")).unwrap();
        session.rollback_to(sp);

        let committed = session.commit().unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].key.task_id.as_str(), "T0");
    }

    #[test]
    fn duplicate_create_in_session_fails() {
        let store = InMemoryTaskStore::new();
        store.create(task("T0")).unwrap();

        let mut session = Session::begin(&store);
        assert!(matches!(
            session.create(task("T0")),
            Err(OrchestrationError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn list_overlays_staged_status() {
        let store = InMemoryTaskStore::new();
        let stored = store.create(task("T0")).unwrap();

        let mut session = Session::begin(&store);
        let mut moved = stored;
        moved.status = TaskStatus::Syncing;
        session.update(moved).unwrap();

        let pending = session
            .list(&TaskFilter::with_statuses([TaskStatus::Pending]))
            .unwrap();
        assert!(pending.is_empty());
    }
}
