//! Tracing and logging setup shared by taskflow binaries and tests.

/// Initialize process-wide logging from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&logging::LogConfig::from_env());
}

/// Log output configuration.
pub mod logging;

/// Tracing subscriber installation.
pub mod tracing;

pub use logging::{LogConfig, LogFormat};
