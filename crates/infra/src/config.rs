//! Configuration loading and representation.
//!
//! Every component takes its section of [`OrchestratorConfig`] by value at
//! construction. `from_env` overlays `TASKFLOW_*` variables on the defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskflow_core::TaskStatus;

use crate::tasks::retry::{RetryPolicy, duration_millis};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Parse { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    #[serde(with = "duration_millis")]
    pub submit_lock_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            submit_lock_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Only tasks created longer ago than this are considered stuck.
    #[serde(with = "duration_millis")]
    pub threshold: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub max_recoverable_age: Duration,
    #[serde(with = "duration_millis")]
    pub auto_resume_window: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(60 * 60),
            max_attempts: 3,
            max_recoverable_age: Duration::from_secs(24 * 60 * 60),
            auto_resume_window: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Per-state staleness limits, measured against `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTimeouts {
    #[serde(with = "duration_millis")]
    pub pending: Duration,
    #[serde(with = "duration_millis")]
    pub syncing: Duration,
    #[serde(with = "duration_millis")]
    pub evaluating: Duration,
    #[serde(with = "duration_millis")]
    pub paused: Duration,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(5 * 60),
            syncing: Duration::from_secs(15 * 60),
            evaluating: Duration::from_secs(30 * 60),
            paused: Duration::from_secs(120 * 60),
        }
    }
}

impl StateTimeouts {
    /// Limit for `status`; `None` for states the monitor does not watch.
    pub fn for_status(&self, status: TaskStatus) -> Option<Duration> {
        match status {
            TaskStatus::Pending => Some(self.pending),
            TaskStatus::Syncing => Some(self.syncing),
            TaskStatus::Evaluating => Some(self.evaluating),
            TaskStatus::Paused => Some(self.paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    pub state_timeouts: StateTimeouts,
    pub max_consecutive_failures: u32,
    /// PENDING rows older than this are reported by the health pass.
    #[serde(with = "duration_millis")]
    pub pending_stall: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30 * 60),
            state_timeouts: StateTimeouts::default(),
            max_consecutive_failures: 3,
            pending_stall: Duration::from_secs(10 * 60),
        }
    }
}

impl MonitorConfig {
    /// Beyond this age an in-flight task is failed without retry.
    pub fn hard_timeout(&self) -> Duration {
        self.default_timeout.saturating_mul(2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { threads: 4 }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub admission: AdmissionConfig,
    pub recovery: RecoveryConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
    pub shutdown: ShutdownConfig,
    pub worker: WorkerConfig,
}

impl OrchestratorConfig {
    /// Defaults overlaid with `TASKFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TASKFLOW_MAX_CONCURRENT_TASKS") {
            config.admission.max_concurrent = parse("TASKFLOW_MAX_CONCURRENT_TASKS", &v)?;
        }
        if let Some(v) = get("TASKFLOW_SUBMIT_LOCK_TIMEOUT_SECS") {
            config.admission.submit_lock_timeout =
                secs(parse("TASKFLOW_SUBMIT_LOCK_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_MONITOR_INTERVAL_SECS") {
            config.monitor.check_interval = secs(parse("TASKFLOW_MONITOR_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_MONITOR_ENABLED") {
            config.monitor.enabled = parse_flag("TASKFLOW_MONITOR_ENABLED", &v)?;
        }
        if let Some(v) = get("TASKFLOW_DEFAULT_TIMEOUT_MINS") {
            config.monitor.default_timeout = mins(parse("TASKFLOW_DEFAULT_TIMEOUT_MINS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_RECOVERY_THRESHOLD_MINS") {
            config.recovery.threshold = mins(parse("TASKFLOW_RECOVERY_THRESHOLD_MINS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_MAX_RECOVERY_ATTEMPTS") {
            config.recovery.max_attempts = parse("TASKFLOW_MAX_RECOVERY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("TASKFLOW_TX_MAX_RETRIES") {
            config.retry.max_retries = parse("TASKFLOW_TX_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("TASKFLOW_TX_BASE_DELAY_MS") {
            config.retry.base_delay =
                Duration::from_millis(parse("TASKFLOW_TX_BASE_DELAY_MS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown.drain_timeout = secs(parse("TASKFLOW_SHUTDOWN_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("TASKFLOW_WORKER_THREADS") {
            config.worker.threads = parse("TASKFLOW_WORKER_THREADS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if self.admission.max_concurrent < 1 {
            errors.push("max_concurrent must be at least 1");
        }
        if self.worker.threads < 1 {
            errors.push("worker threads must be at least 1");
        }
        if self.monitor.check_interval.is_zero() {
            errors.push("monitor check_interval must be positive");
        }
        if self.monitor.default_timeout.is_zero() {
            errors.push("monitor default_timeout must be positive");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Parse {
            var,
            value: value.to_string(),
        }),
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn mins(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_constants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.admission.max_concurrent, 3);
        assert_eq!(config.monitor.check_interval, Duration::from_secs(60));
        assert_eq!(config.monitor.hard_timeout(), Duration::from_secs(60 * 60));
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(
            config.monitor.state_timeouts.for_status(TaskStatus::Paused),
            Some(Duration::from_secs(7200))
        );
        assert_eq!(config.monitor.state_timeouts.for_status(TaskStatus::Idle), None);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("TASKFLOW_MAX_CONCURRENT_TASKS", "5"),
            ("TASKFLOW_MONITOR_ENABLED", "off"),
            ("TASKFLOW_DEFAULT_TIMEOUT_MINS", "45"),
            ("TASKFLOW_TX_BASE_DELAY_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.admission.max_concurrent, 5);
        assert!(!config.monitor.enabled);
        assert_eq!(config.monitor.default_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("TASKFLOW_WORKER_THREADS", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                var: "TASKFLOW_WORKER_THREADS",
                value: "many".into()
            }
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err =
            OrchestratorConfig::from_lookup(lookup(&[("TASKFLOW_MAX_CONCURRENT_TASKS", "0")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<OrchestratorConfig>(&json).unwrap(), config);
    }
}
