//! Submission path and operator queries.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use taskflow_core::{Actor, ProjectId, Task, TaskKey, TaskStatus};

use super::admission::{AdmissionController, AdmissionStatus};
use super::error::{OrchestrationError, OrchestrationResult};
use super::locks::{ResourceLocks, SUBMISSION_LOCK};
use super::shutdown::ShutdownCoordinator;
use super::state_machine::{TaskHistory, TaskStateMachine, TransitionUpdate};
use crate::config::AdmissionConfig;
use crate::store::TaskFilter;

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub by_status: BTreeMap<String, usize>,
}

pub struct Orchestrator {
    state_machine: TaskStateMachine,
    admission: AdmissionController,
    locks: Arc<ResourceLocks>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl Orchestrator {
    pub fn new(
        state_machine: TaskStateMachine,
        admission: AdmissionConfig,
        locks: Arc<ResourceLocks>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let admission =
            AdmissionController::new(state_machine.runner().store().clone(), admission);
        Self {
            state_machine,
            admission,
            locks,
            shutdown,
        }
    }

    pub fn state_machine(&self) -> &TaskStateMachine {
        &self.state_machine
    }

    /// Admit `key` as PENDING.
    ///
    /// New keys are created; IDLE, COMPLETED, ERROR and CANCELLED tasks are
    /// reopened. Tasks already in flight are rejected with `AlreadyExists`,
    /// tasks recovery gave up on with `Unrecoverable`, a full pool with
    /// `ConcurrencyLimitExceeded`. The admission check and
    /// the write happen under the submission lock.
    pub fn submit(
        &self,
        key: &TaskKey,
        rules_config: Option<serde_json::Value>,
    ) -> OrchestrationResult<Task> {
        self.shutdown.guard("submit")?;
        let _lock = self
            .locks
            .acquire(SUBMISSION_LOCK, self.admission.config().submit_lock_timeout)?;

        let existing = self.state_machine.runner().store().get(key)?;
        if let Some(task) = &existing
            && !task.status.is_rerunnable()
        {
            info!(
                project_id = %key.project_id,
                task_id = %key.task_id,
                status = %task.status,
                "submission rejected: task already in flight"
            );
            return Err(OrchestrationError::AlreadyExists {
                key: key.clone(),
                status: Some(task.status),
            });
        }
        if let Some(reason) = existing.as_ref().and_then(exhausted_by_recovery) {
            warn!(
                project_id = %key.project_id,
                task_id = %key.task_id,
                reason = %reason,
                "submission rejected: recovery budget exhausted"
            );
            return Err(OrchestrationError::Unrecoverable {
                key: key.clone(),
                reason,
            });
        }

        let admission = self.admission.check()?;
        if !admission.allowed {
            warn!(
                project_id = %key.project_id,
                task_id = %key.task_id,
                current = admission.current,
                max = admission.max,
                "submission rejected: concurrency limit reached"
            );
            return Err(OrchestrationError::ConcurrencyLimitExceeded(Box::new(
                admission,
            )));
        }

        match existing {
            None => self
                .state_machine
                .create_with(key, TaskStatus::Pending, rules_config),
            Some(task) => {
                let update = TransitionUpdate {
                    rules_config,
                    ..TransitionUpdate::default()
                };
                let reason = format!("resubmitted from {}", task.status);
                self.state_machine
                    .advance(key, task.status, TaskStatus::Pending, &reason, &update)
            }
        }
    }

    pub fn get_concurrency_status(&self) -> OrchestrationResult<AdmissionStatus> {
        self.admission.check()
    }

    pub fn get_task_history(&self, key: &TaskKey) -> OrchestrationResult<TaskHistory> {
        self.state_machine.get_history(key)
    }

    pub fn task_statistics(&self) -> OrchestrationResult<TaskStatistics> {
        let tasks = self.state_machine.runner().store().list(&TaskFilter::all())?;

        let mut stats = TaskStatistics {
            total: tasks.len(),
            by_status: TaskStatus::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
            ..TaskStatistics::default()
        };
        for task in &tasks {
            if task.status.is_running() {
                stats.running += 1;
            }
            match task.status {
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Error => stats.error += 1,
                _ => {}
            }
            *stats
                .by_status
                .entry(task.status.as_str().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    pub fn list_project_tasks(&self, project_id: &ProjectId) -> OrchestrationResult<Vec<Task>> {
        Ok(self
            .state_machine
            .runner()
            .store()
            .list(&TaskFilter::all().project(project_id.clone()))?)
    }
}

/// The reason recovery terminalized `task`, if that is why it sits in ERROR.
fn exhausted_by_recovery(task: &Task) -> Option<String> {
    let entry = task.last_audit_entry()?;
    (task.status == TaskStatus::Error
        && entry.actor == Actor::Recovery
        && entry.retry_eligible() == Some(false))
    .then(|| entry.reason.clone())
}
