//! Transaction runner: retry/backoff and rollback-on-failure around store
//! mutations.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, warn};

use taskflow_core::{Clock, Task};

use super::error::{OrchestrationError, OrchestrationResult};
use super::retry::RetryPolicy;
use super::session::Session;
use crate::store::{TaskFilter, TaskStore};

/// How the runner sleeps between retries.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Per-call transaction options.
#[derive(Clone, Copy)]
pub struct TxOptions {
    pub auto_retry: bool,
    /// Which errors are worth another attempt.
    pub retry_on: fn(&OrchestrationError) -> bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            auto_retry: true,
            retry_on: OrchestrationError::is_retryable,
        }
    }
}

impl TxOptions {
    pub fn no_retry() -> Self {
        Self {
            auto_retry: false,
            ..Self::default()
        }
    }
}

impl fmt::Debug for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxOptions")
            .field("auto_retry", &self.auto_retry)
            .finish_non_exhaustive()
    }
}

/// Fields an [`TransactionRunner::atomic_update`] may overwrite.
///
/// Status is deliberately absent: status changes go through the state machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub rules_config: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.rules_config.is_none() && self.result.is_none()
    }

    fn apply(&self, task: &mut Task) {
        if let Some(rules) = &self.rules_config {
            task.rules_config = Some(rules.clone());
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
    }
}

/// Outcome of [`TransactionRunner::atomic_update`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AtomicUpdateResult {
    pub success: bool,
    pub affected_rows: usize,
    pub error: Option<String>,
}

/// One unit inside [`TransactionRunner::batch_operations`].
pub struct BatchOperation<'a> {
    pub name: String,
    pub run: Box<dyn FnMut(&mut Session<'_>) -> OrchestrationResult<()> + 'a>,
}

impl<'a> BatchOperation<'a> {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnMut(&mut Session<'_>) -> OrchestrationResult<()> + 'a,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedOperation {
    pub operation: String,
    pub error: String,
}

/// Outcome of [`TransactionRunner::batch_operations`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub total_operations: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub failed_operations: Vec<FailedOperation>,
    /// Set when the enclosing transaction itself could not commit.
    pub batch_error: Option<String>,
}

/// Runs units of work against a [`TaskStore`] with commit/rollback and
/// exponential-backoff retries.
#[derive(Clone)]
pub struct TransactionRunner {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl TransactionRunner {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            sleeper: Arc::new(thread::sleep),
        }
    }

    /// Replace the backoff sleep (tests record delays instead of sleeping).
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `unit` in a fresh session, commit on `Ok`, roll back on `Err`.
    ///
    /// Matching errors are retried up to `max_retries` times with
    /// `base_delay * 2^(retry-1)` between attempts; the whole unit re-runs
    /// against freshly read rows.
    pub fn transaction<T, F>(&self, options: TxOptions, unit: F) -> OrchestrationResult<T>
    where
        F: FnMut(&mut Session<'_>) -> OrchestrationResult<T>,
    {
        self.transaction_committed(options, unit)
            .map(|(value, _)| value)
    }

    /// Like [`transaction`](Self::transaction) but also returns the rows as stored.
    pub fn transaction_committed<T, F>(
        &self,
        options: TxOptions,
        mut unit: F,
    ) -> OrchestrationResult<(T, Vec<Task>)>
    where
        F: FnMut(&mut Session<'_>) -> OrchestrationResult<T>,
    {
        self.retrying(options, "transaction", || {
            let mut session = Session::begin(self.store.as_ref());
            match unit(&mut session) {
                Ok(value) => {
                    let rows = session.commit()?;
                    Ok((value, rows))
                }
                Err(e) => {
                    session.rollback();
                    Err(e)
                }
            }
        })
    }

    /// Apply the retry policy around arbitrary work.
    pub fn execute_with_retry<T, F>(&self, f: F) -> OrchestrationResult<T>
    where
        F: FnMut() -> OrchestrationResult<T>,
    {
        self.retrying(TxOptions::default(), "operation", f)
    }

    fn retrying<T, F>(&self, options: TxOptions, what: &str, mut f: F) -> OrchestrationResult<T>
    where
        F: FnMut() -> OrchestrationResult<T>,
    {
        let mut retries = 0u32;
        loop {
            match f() {
                Ok(value) => {
                    if retries > 0 {
                        debug!(what, retries, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if options.auto_retry
                    && (options.retry_on)(&e)
                    && self.policy.should_retry(retries) =>
                {
                    retries += 1;
                    let delay = self.policy.delay_for_retry(retries);
                    warn!(
                        what,
                        retry = retries,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "failed; retrying"
                    );
                    (self.sleeper)(delay);
                }
                Err(e) => {
                    if retries > 0 || (options.retry_on)(&e) {
                        error!(what, retries, error = %e, "giving up");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Patch every row matching `filter` in one transaction.
    pub fn atomic_update(&self, filter: &TaskFilter, patch: &TaskPatch) -> AtomicUpdateResult {
        let now = self.clock.now();
        let outcome = self.transaction(TxOptions::default(), |session| {
            let rows = session.list(filter)?;
            let affected = rows.len();
            for mut task in rows {
                patch.apply(&mut task);
                task.touch(now);
                session.update(task)?;
            }
            Ok(affected)
        });

        match outcome {
            Ok(affected_rows) => AtomicUpdateResult {
                success: true,
                affected_rows,
                error: None,
            },
            Err(e) => {
                error!(error = %e, "atomic update failed");
                AtomicUpdateResult {
                    success: false,
                    affected_rows: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Run operations in chunks of `batch_size` inside one transaction.
    ///
    /// Each operation runs under a savepoint: a failing operation's writes are
    /// discarded and recorded, the rest of the batch continues.
    pub fn batch_operations(
        &self,
        mut operations: Vec<BatchOperation<'_>>,
        batch_size: usize,
    ) -> BatchResult {
        let total = operations.len();
        let batch_size = batch_size.max(1);

        let outcome = self.transaction(TxOptions::default(), |session| {
            let mut result = BatchResult {
                total_operations: total,
                ..BatchResult::default()
            };

            for (chunk_no, chunk) in operations.chunks_mut(batch_size).enumerate() {
                for op in chunk.iter_mut() {
                    let savepoint = session.savepoint();
                    match (op.run)(session) {
                        Ok(()) => result.success_count += 1,
                        Err(e) => {
                            session.rollback_to(savepoint);
                            warn!(operation = %op.name, error = %e, "batch operation failed");
                            result.failed_count += 1;
                            result.failed_operations.push(FailedOperation {
                                operation: op.name.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
                debug!(
                    chunk = chunk_no,
                    staged = session.pending_changes(),
                    "batch chunk processed"
                );
            }

            Ok(result)
        });

        outcome.unwrap_or_else(|e| {
            error!(error = %e, "batch transaction failed");
            BatchResult {
                total_operations: total,
                success_count: 0,
                failed_count: total,
                failed_operations: Vec::new(),
                batch_error: Some(e.to_string()),
            }
        })
    }
}
