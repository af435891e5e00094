//! Infrastructure layer: task storage, configuration and the orchestration
//! engine that runs on top of them.

pub mod config;
pub mod store;
pub mod tasks;

pub use config::{ConfigError, OrchestratorConfig};
