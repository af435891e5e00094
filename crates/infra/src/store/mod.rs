//! Task persistence boundary.
//!
//! Defines the storage abstraction the orchestration engine consumes without
//! making any backend assumptions. An in-memory implementation is provided for
//! tests/dev and single-process deployments.

pub mod filter;
pub mod in_memory;
pub mod r#trait;

pub use filter::TaskFilter;
pub use in_memory::InMemoryTaskStore;
pub use r#trait::{Change, StoreError, TaskStore};
