//! Queue and worker configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML
//! file, then `JOBFORGE_*` environment variables, then CLI flags. Every
//! layer ends with [`QueueConfig::validate`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::backoff::Backoff;
use super::policy::SchedulingPolicy;
use super::task::DEFAULT_MAX_RETRIES;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the task queue, its workers and the health monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    // Storage
    /// SQLite connection URL.
    pub database_url: String,
    /// Maximum connections in the store pool.
    pub max_connections: u32,

    // Workers
    /// Number of worker runtimes started by `jobforge worker`.
    pub worker_count: usize,
    /// Policy used when a worker asks for its next task.
    pub policy: SchedulingPolicy,
    /// Candidates tried per claim before giving up (the lookahead K).
    pub claim_lookahead: usize,
    /// Delay schedule between empty polls.
    pub poll_backoff: Backoff,

    // Heartbeats
    /// How often a worker refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Age after which a heartbeat is considered stale.
    pub heartbeat_ttl: Duration,
    /// How often the health monitor sweeps.
    pub sweep_interval: Duration,

    // Execution
    /// Wall-clock budget of one execution.
    pub task_timeout: Duration,
    /// Time a cancelled executor gets to return before it is abandoned.
    pub cancel_grace: Duration,

    // Retries
    /// Delay schedule between retries of a task.
    pub retry_backoff: Backoff,
    /// Retry ceiling for tasks submitted without one.
    pub default_max_retries: u32,

    /// Time the worker pool waits for runtimes to stop.
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://jobforge.db".to_string(),
            max_connections: 8,

            worker_count: 4,
            policy: SchedulingPolicy::Fifo,
            claim_lookahead: 8,
            poll_backoff: Backoff::poll_default(),

            heartbeat_interval: Duration::from_secs(5),
            heartbeat_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),

            task_timeout: Duration::from_secs(1800), // 30 minutes
            cancel_grace: Duration::from_secs(10),

            retry_backoff: Backoff::retry_default(),
            default_max_retries: DEFAULT_MAX_RETRIES,

            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// On-disk shape of the configuration file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    max_connections: Option<u32>,
    worker_count: Option<usize>,
    policy: Option<SchedulingPolicy>,
    claim_lookahead: Option<usize>,
    poll_initial_ms: Option<u64>,
    poll_max_ms: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    task_timeout_secs: Option<u64>,
    cancel_grace_secs: Option<u64>,
    retry_initial_secs: Option<u64>,
    retry_max_secs: Option<u64>,
    retry_multiplier: Option<f64>,
    retry_jitter: Option<f64>,
    default_max_retries: Option<u32>,
    shutdown_timeout_secs: Option<u64>,
}

impl QueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from defaults overlaid with environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_DATABASE_URL`: SQLite URL (default: sqlite://jobforge.db)
    /// - `JOBFORGE_MAX_CONNECTIONS`: Store pool size (default: 8)
    /// - `JOBFORGE_WORKERS`: Worker runtimes per process (default: 4)
    /// - `JOBFORGE_POLICY`: fifo, lifo, priority or weighted_random (default: fifo)
    /// - `JOBFORGE_CLAIM_LOOKAHEAD`: Candidates per claim (default: 8)
    /// - `JOBFORGE_HEARTBEAT_INTERVAL_SECS`: Heartbeat period (default: 5)
    /// - `JOBFORGE_HEARTBEAT_TTL_SECS`: Staleness threshold (default: 30)
    /// - `JOBFORGE_SWEEP_INTERVAL_SECS`: Health sweep period (default: 10)
    /// - `JOBFORGE_TASK_TIMEOUT_SECS`: Execution budget (default: 1800)
    /// - `JOBFORGE_CANCEL_GRACE_SECS`: Cancellation grace window (default: 10)
    /// - `JOBFORGE_MAX_RETRIES`: Default retry ceiling (default: 3)
    /// - `JOBFORGE_SHUTDOWN_TIMEOUT_SECS`: Pool shutdown timeout (default: 60)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file over the defaults, then applies the environment.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML over the defaults without consulting the environment.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = if content.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        let mut config = Self::default();
        config.apply_file(file);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.max_connections {
            self.max_connections = v;
        }
        if let Some(v) = file.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = file.policy {
            self.policy = v;
        }
        if let Some(v) = file.claim_lookahead {
            self.claim_lookahead = v;
        }
        if let Some(v) = file.poll_initial_ms {
            self.poll_backoff.initial = Duration::from_millis(v);
        }
        if let Some(v) = file.poll_max_ms {
            self.poll_backoff.max = Duration::from_millis(v);
        }
        if let Some(v) = file.heartbeat_interval_secs {
            self.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.heartbeat_ttl_secs {
            self.heartbeat_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.task_timeout_secs {
            self.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.cancel_grace_secs {
            self.cancel_grace = Duration::from_secs(v);
        }
        if let Some(v) = file.retry_initial_secs {
            self.retry_backoff.initial = Duration::from_secs(v);
        }
        if let Some(v) = file.retry_max_secs {
            self.retry_backoff.max = Duration::from_secs(v);
        }
        if let Some(v) = file.retry_multiplier {
            self.retry_backoff.multiplier = v;
        }
        if let Some(v) = file.retry_jitter {
            self.retry_backoff.jitter = v;
        }
        if let Some(v) = file.default_max_retries {
            self.default_max_retries = v;
        }
        if let Some(v) = file.shutdown_timeout_secs {
            self.shutdown_timeout = Duration::from_secs(v);
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("JOBFORGE_DATABASE_URL") {
            self.database_url = val;
        }

        if let Ok(val) = std::env::var("JOBFORGE_MAX_CONNECTIONS") {
            self.max_connections = parse_env_value(&val, "JOBFORGE_MAX_CONNECTIONS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_WORKERS") {
            self.worker_count = parse_env_value(&val, "JOBFORGE_WORKERS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_POLICY") {
            self.policy = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "JOBFORGE_POLICY".to_string(),
                message,
            })?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_CLAIM_LOOKAHEAD") {
            self.claim_lookahead = parse_env_value(&val, "JOBFORGE_CLAIM_LOOKAHEAD")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval = parse_env_secs(&val, "JOBFORGE_HEARTBEAT_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_HEARTBEAT_TTL_SECS") {
            self.heartbeat_ttl = parse_env_secs(&val, "JOBFORGE_HEARTBEAT_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_SWEEP_INTERVAL_SECS") {
            self.sweep_interval = parse_env_secs(&val, "JOBFORGE_SWEEP_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_TASK_TIMEOUT_SECS") {
            self.task_timeout = parse_env_secs(&val, "JOBFORGE_TASK_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_CANCEL_GRACE_SECS") {
            self.cancel_grace = parse_env_secs(&val, "JOBFORGE_CANCEL_GRACE_SECS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_MAX_RETRIES") {
            self.default_max_retries = parse_env_value(&val, "JOBFORGE_MAX_RETRIES")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_SHUTDOWN_TIMEOUT_SECS") {
            self.shutdown_timeout = parse_env_secs(&val, "JOBFORGE_SHUTDOWN_TIMEOUT_SECS")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.claim_lookahead == 0 {
            return Err(ConfigError::ValidationFailed(
                "claim_lookahead must be greater than 0".to_string(),
            ));
        }

        validate_backoff("poll_backoff", &self.poll_backoff)?;
        validate_backoff("retry_backoff", &self.retry_backoff)?;

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_ttl < self.heartbeat_interval * 2 {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_ttl must be at least twice heartbeat_interval".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.task_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "task_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Builder method to set the scheduling policy.
    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder method to set the claim lookahead.
    pub fn with_claim_lookahead(mut self, lookahead: usize) -> Self {
        self.claim_lookahead = lookahead;
        self
    }

    /// Builder method to set the empty-poll backoff.
    pub fn with_poll_backoff(mut self, backoff: Backoff) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Builder method to set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Builder method to set the heartbeat TTL.
    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    /// Builder method to set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Builder method to set the task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Builder method to set the cancellation grace window.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Builder method to set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder method to set the default retry ceiling.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Builder method to set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn validate_backoff(name: &str, backoff: &Backoff) -> Result<(), ConfigError> {
    if backoff.initial.is_zero() {
        return Err(ConfigError::ValidationFailed(format!(
            "{}.initial must be greater than 0",
            name
        )));
    }
    if backoff.max < backoff.initial {
        return Err(ConfigError::ValidationFailed(format!(
            "{}.max must be at least {}.initial",
            name, name
        )));
    }
    if backoff.multiplier.is_nan() || backoff.multiplier < 1.0 {
        return Err(ConfigError::ValidationFailed(format!(
            "{}.multiplier must be at least 1.0",
            name
        )));
    }
    if !(0.0..=1.0).contains(&backoff.jitter) {
        return Err(ConfigError::ValidationFailed(format!(
            "{}.jitter must be between 0.0 and 1.0",
            name
        )));
    }
    Ok(())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}
