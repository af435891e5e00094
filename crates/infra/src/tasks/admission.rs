//! Admission control: bounds how many tasks run at once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use taskflow_core::TaskStatus;

use super::error::OrchestrationResult;
use crate::config::AdmissionConfig;
use crate::store::{TaskFilter, TaskStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTask {
    pub project_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// Snapshot returned by [`AdmissionController::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStatus {
    pub allowed: bool,
    pub current: usize,
    pub max: usize,
    pub available: usize,
    pub running: Vec<RunningTask>,
}

/// Counts tasks in PENDING, SYNCING or EVALUATING against `max_concurrent`.
///
/// The check alone is racy; callers serialize check-then-create under the
/// submission lock.
pub struct AdmissionController {
    store: Arc<dyn TaskStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn TaskStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn check(&self) -> OrchestrationResult<AdmissionStatus> {
        let running: Vec<_> = self
            .store
            .list(&TaskFilter::with_statuses(TaskStatus::RUNNING))?
            .into_iter()
            .map(|t| RunningTask {
                project_id: t.key.project_id.to_string(),
                task_id: t.key.task_id.to_string(),
                status: t.status,
                created_at: t.created_at,
            })
            .collect();

        let max = self.config.max_concurrent;
        let current = running.len();
        let status = AdmissionStatus {
            allowed: current < max,
            current,
            max,
            available: max.saturating_sub(current),
            running,
        };
        debug!(current, max, allowed = status.allowed, "admission check");
        Ok(status)
    }
}
