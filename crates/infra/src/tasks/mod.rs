//! Task orchestration engine.
//!
//! Components, leaves first:
//! - [`transaction::TransactionRunner`]: commit/rollback around a [`session::Session`]
//!   with retry and exponential backoff.
//! - [`state_machine::TaskStateMachine`]: the single writer of task status.
//! - [`admission::AdmissionController`]: bounds concurrently running tasks.
//! - [`recovery::RecoveryManager`]: repairs tasks orphaned by a crash.
//! - [`monitor::TaskMonitor`]: background timeout enforcement.
//! - [`shutdown::ShutdownCoordinator`]: drain and cleanup on exit.
//! - [`executor::WorkerPool`]: runs a [`executor::Pipeline`] per task on OS threads.
//! - [`orchestrator::Orchestrator`] and [`runtime::TaskRuntime`]: the entry points.

mod age;

pub mod admission;
pub mod error;
pub mod executor;
pub mod locks;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod shutdown;
pub mod state_machine;
pub mod transaction;

pub use admission::{AdmissionController, AdmissionStatus, RunningTask};
pub use error::{OrchestrationError, OrchestrationResult};
pub use executor::{Pipeline, PipelineExecutor, PoolStats, RunOutcome, WorkerPool};
pub use locks::{LockGuard, ResourceLocks, SUBMISSION_LOCK};
pub use monitor::{
    HealthIssue, HealthIssueKind, HealthReport, MonitorConfigUpdate, MonitorStatus, TaskMonitor,
    TimeoutDetail, TimeoutReport,
};
pub use orchestrator::{Orchestrator, TaskStatistics};
pub use recovery::{RecoveryDetail, RecoveryManager, RecoveryPlan, RecoveryReport, RecoveryStats};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::{StartupReport, TaskRuntime, wait_for_shutdown_signal};
pub use session::{Savepoint, Session};
pub use shutdown::{
    CleanupReport, ConnectionGuard, DrainReport, ShutdownCoordinator, ShutdownReport, TaskGuard,
};
pub use state_machine::{TaskHistory, TaskStateMachine, TransitionUpdate};
pub use transaction::{
    AtomicUpdateResult, BatchOperation, BatchResult, FailedOperation, TaskPatch,
    TransactionRunner, TxOptions,
};
