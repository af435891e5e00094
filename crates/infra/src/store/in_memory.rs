use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use taskflow_core::{Task, TaskKey};

use super::filter::TaskFilter;
use super::r#trait::{Change, StoreError, TaskStore};

/// In-memory task store.
///
/// Intended for tests/dev and single-process deployments. Not optimized for
/// large row counts; `list` is a full scan.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    rows: RwLock<HashMap<TaskKey, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

impl TaskStore for InMemoryTaskStore {
    fn get(&self, key: &TaskKey) -> Result<Option<Task>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(key).cloned())
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = rows.values().filter(|t| filter.matches(t)).cloned().collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(result)
    }

    fn commit(&self, changes: Vec<Change>) -> Result<Vec<Task>, StoreError> {
        if changes.is_empty() {
            return Ok(vec![]);
        }

        let mut rows = self.rows.write().map_err(|_| poisoned())?;

        // Validate everything before touching any row (all or nothing).
        let mut seen = HashSet::with_capacity(changes.len());
        for change in &changes {
            let key = change.key();
            if !seen.insert(key.clone()) {
                return Err(StoreError::Unavailable(format!(
                    "commit contains {key} more than once"
                )));
            }

            let current = rows.get(key).map(|t| t.version);
            match change {
                Change::Create(_) if current.is_some() => {
                    return Err(StoreError::AlreadyExists(key.clone()));
                }
                Change::Update { .. } if current.is_none() => {
                    return Err(StoreError::NotFound(key.clone()));
                }
                _ => {}
            }
            if let Err(e) = change.expected().check(current) {
                return Err(StoreError::Conflict {
                    key: key.clone(),
                    detail: e.to_string(),
                });
            }
        }

        let mut committed = Vec::with_capacity(changes.len());
        for change in changes {
            let mut task = match change {
                Change::Create(task) => task,
                Change::Update { task, .. } => task,
            };
            task.version = rows.get(&task.key).map(|t| t.version).unwrap_or(0) + 1;
            rows.insert(task.key.clone(), task.clone());
            committed.push(task);
        }

        Ok(committed)
    }
}
