//! `taskflow-core`: task orchestration domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the task lifecycle table, the task entity and its audit trail.

pub mod audit;
pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod status;
pub mod task;
pub mod version;

pub use audit::{
    Actor, AuditEntry, AuditKind, RecoveryAction, RecoveryStrategy, TimeoutAction, TimeoutKind,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{ProjectId, RunId, TaskId, TaskKey};
pub use status::TaskStatus;
pub use task::Task;
pub use version::ExpectedVersion;
