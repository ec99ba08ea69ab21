//! Runtime configuration for the ingest server and the worker pool.
//!
//! Both configurations are read from environment variables (after loading a
//! `.env` file when one exists), validated once at startup and treated as
//! read-only afterwards. CLI flags override individual values.

use std::time::Duration;

use thiserror::Error;

use crate::worker::{Backoff, RetryPolicy, WorkerOptions};

/// Default Redis connection URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
/// Default prefix of every stream key.
pub const DEFAULT_STREAM_PREFIX: &str = "dacrew:jira";
/// Default consumer group shared by all workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "dacrew_work_consumers";

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
}

/// Loads a `.env` file from the working directory, if present.
pub fn load_dotenv() {
    if let Ok(path) = dotenv::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded environment from file");
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Configuration of the webhook ingestion server.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Shared secret used to verify webhook signatures.
    pub webhook_secret: String,
    /// Path the webhook is posted to.
    pub webhook_endpoint: String,
    /// Address to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Stream store URL (`redis://...` or `memory://`).
    pub redis_url: String,
    /// Prefix of every stream key.
    pub stream_prefix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            webhook_endpoint: "/webhook/jira".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
        }
    }
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `JIRA_WEBHOOK_SECRET`: Webhook shared secret (required)
    /// - `JIRA_INGEST_WEBHOOK_ENDPOINT`: Webhook path (default: /webhook/jira)
    /// - `JIRA_INGEST_HOST`: Bind address (default: 0.0.0.0)
    /// - `JIRA_INGEST_PORT`: Bind port (default: 8080)
    /// - `REDIS_URL`: Stream store URL (default: redis://localhost:6379)
    /// - `DACREW_STREAM_PREFIX`: Stream key prefix (default: dacrew:jira)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the secret is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.webhook_secret = lookup("JIRA_WEBHOOK_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("JIRA_WEBHOOK_SECRET".to_string()))?;

        if let Some(val) = lookup("JIRA_INGEST_WEBHOOK_ENDPOINT") {
            config.webhook_endpoint = val;
        }

        if let Some(val) = lookup("JIRA_INGEST_HOST") {
            config.host = val;
        }

        if let Some(val) = lookup("JIRA_INGEST_PORT") {
            config.port = parse_env_value(&val, "JIRA_INGEST_PORT")?;
        }

        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("DACREW_STREAM_PREFIX") {
            config.stream_prefix = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "webhook_secret must not be empty".to_string(),
            ));
        }

        if !self.webhook_endpoint.starts_with('/') {
            return Err(ConfigError::ValidationFailed(format!(
                "webhook_endpoint must start with '/', got '{}'",
                self.webhook_endpoint
            )));
        }

        if self.stream_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "stream_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Queue settings
    /// Stream store URL (`redis://...` or `memory://`).
    pub redis_url: String,
    /// Prefix of every stream key.
    pub stream_prefix: String,
    /// Consumer group shared by all workers.
    pub consumer_group: String,
    /// Maximum messages claimed per poll.
    pub batch_size: usize,
    /// Wait between polls that claimed nothing.
    pub poll_interval: Duration,

    // Processing settings
    /// Use the logging mock evaluator instead of the HTTP evaluator.
    pub mock_processing: bool,
    /// Simulated processing time of the mock evaluator.
    pub mock_delay: Duration,
    /// URL of the external evaluator service.
    pub evaluator_url: Option<String>,
    /// Upper bound on a single evaluation.
    pub evaluation_timeout: Duration,
    /// Failed deliveries that are retried before dead-lettering.
    pub max_retries: u32,

    // Recovery settings
    /// Idle time after which a claim is considered orphaned.
    pub orphan_timeout: Duration,
    /// How often the reclaimer scans for orphans.
    pub reclaim_interval: Duration,

    // Pool settings
    /// Worker tasks in this process.
    pub num_workers: usize,
    /// Time allowed for workers to drain on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            batch_size: 10,
            poll_interval: Duration::from_millis(5000),
            mock_processing: true,
            mock_delay: Duration::from_millis(2500),
            evaluator_url: None,
            evaluation_timeout: Duration::from_secs(300),
            max_retries: 3,
            orphan_timeout: Duration::from_millis(600_000),
            reclaim_interval: Duration::from_millis(30_000),
            num_workers: 1,
            shutdown_timeout: Duration::from_secs(360),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `REDIS_URL`: Stream store URL (default: redis://localhost:6379)
    /// - `DACREW_STREAM_PREFIX`: Stream key prefix (default: dacrew:jira)
    /// - `WORKER_CONSUMER_GROUP`: Consumer group (default: dacrew_work_consumers)
    /// - `WORKER_BATCH_SIZE`: Messages per poll (default: 10)
    /// - `WORKER_POLL_INTERVAL_MS`: Idle poll wait (default: 5000)
    /// - `WORKER_MOCK_PROCESSING`: Use the mock evaluator (default: true)
    /// - `WORKER_MOCK_DELAY_MS`: Mock processing time (default: 2500)
    /// - `WORKER_EVALUATOR_URL`: External evaluator endpoint (no default)
    /// - `WORKER_TIMEOUT`: Evaluation timeout in seconds (default: 300)
    /// - `WORKER_MAX_RETRIES`: Retried failures before dead-lettering (default: 3)
    /// - `WORKER_ORPHAN_TIMEOUT_MS`: Claim idle limit (default: 600000)
    /// - `WORKER_RECLAIM_INTERVAL_MS`: Reclaimer period (default: 30000)
    /// - `WORKER_NUM_WORKERS`: Workers per process (default: 1)
    /// - `WORKER_SHUTDOWN_TIMEOUT_SECS`: Drain limit on shutdown (default: 360)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value cannot be parsed or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(env_lookup)
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Queue settings
        if let Some(val) = lookup("REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("DACREW_STREAM_PREFIX") {
            config.stream_prefix = val;
        }

        if let Some(val) = lookup("WORKER_CONSUMER_GROUP") {
            config.consumer_group = val;
        }

        if let Some(val) = lookup("WORKER_BATCH_SIZE") {
            config.batch_size = parse_env_value(&val, "WORKER_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("WORKER_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        // Processing settings
        if let Some(val) = lookup("WORKER_MOCK_PROCESSING") {
            config.mock_processing = parse_env_bool(&val, "WORKER_MOCK_PROCESSING")?;
        }

        if let Some(val) = lookup("WORKER_MOCK_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_MOCK_DELAY_MS")?;
            config.mock_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("WORKER_EVALUATOR_URL") {
            if !val.is_empty() {
                config.evaluator_url = Some(val);
            }
        }

        if let Some(val) = lookup("WORKER_TIMEOUT") {
            let secs: u64 = parse_env_value(&val, "WORKER_TIMEOUT")?;
            config.evaluation_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("WORKER_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "WORKER_MAX_RETRIES")?;
        }

        // Recovery settings
        if let Some(val) = lookup("WORKER_ORPHAN_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_ORPHAN_TIMEOUT_MS")?;
            config.orphan_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("WORKER_RECLAIM_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_RECLAIM_INTERVAL_MS")?;
            config.reclaim_interval = Duration::from_millis(ms);
        }

        // Pool settings
        if let Some(val) = lookup("WORKER_NUM_WORKERS") {
            config.num_workers = parse_env_value(&val, "WORKER_NUM_WORKERS")?;
        }

        if let Some(val) = lookup("WORKER_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKER_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.reclaim_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reclaim_interval must be greater than 0".to_string(),
            ));
        }

        if self.consumer_group.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "consumer_group must not be empty".to_string(),
            ));
        }

        // Evaluations must finish before their claim can lapse.
        if self.evaluation_timeout >= self.orphan_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "evaluation_timeout ({:?}) must be shorter than orphan_timeout ({:?})",
                self.evaluation_timeout, self.orphan_timeout
            )));
        }

        if !self.mock_processing && self.evaluator_url.is_none() {
            return Err(ConfigError::ValidationFailed(
                "WORKER_EVALUATOR_URL is required when mock processing is disabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Per-worker settings derived from this configuration.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            group: self.consumer_group.clone(),
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            evaluation_timeout: self.evaluation_timeout,
            retry_policy: RetryPolicy::new(self.max_retries),
            backoff: Backoff::default(),
        }
    }

    /// Sets the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enables or disables mock processing.
    pub fn with_mock_processing(mut self, enabled: bool) -> Self {
        self.mock_processing = enabled;
        self
    }

    /// Sets the stream store URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
