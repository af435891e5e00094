//! Row predicates for `TaskStore::list`.

use chrono::{DateTime, Utc};

use taskflow_core::{ProjectId, Task, TaskStatus};

/// Conjunction of optional constraints; the default matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub statuses: Option<Vec<TaskStatus>>,
    pub project_id: Option<ProjectId>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.statuses
            .as_ref()
            .is_none_or(|s| s.contains(&task.status))
            && self
                .project_id
                .as_ref()
                .is_none_or(|p| &task.key.project_id == p)
            && self.created_before.is_none_or(|t| task.created_at < t)
            && self.updated_before.is_none_or(|t| task.updated_at < t)
    }
}
