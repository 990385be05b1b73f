//! Engine configuration.
//!
//! Every knob the ingestion, worker and execution layers read lives here,
//! loaded from environment variables with sensible defaults and validated
//! before any connection is opened.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::RetryPolicy;

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

/// Configuration for the batch-row engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Connections
    /// PostgreSQL connection URL for the job ledger.
    pub database_url: String,
    /// Redis connection URL for the task queue and shared cache.
    pub redis_url: String,
    /// Prefix for every Redis key the engine touches.
    pub queue_prefix: String,

    // Storage
    /// Root of the per-job row store (`job_{id}/{logs,rows,results}`).
    pub results_path: PathBuf,
    /// Root where uploaded inputs are persisted before streaming.
    pub uploads_path: PathBuf,

    // Worker pool
    /// Number of tasks leased concurrently by one worker process.
    pub worker_concurrency: usize,
    /// Maximum number of row executions in flight in one worker process.
    pub worker_max_children: usize,
    /// How long one lease attempt blocks when the queue is empty.
    pub poll_interval: Duration,
    /// Delay between a counter increment and the completion check.
    pub settle_delay: Duration,
    /// Time without a heartbeat after which a lease is handed to another
    /// worker. Must exceed every execution timeout.
    pub stall_timeout: Duration,
    /// Timeout for graceful pool shutdown.
    pub shutdown_timeout: Duration,

    // Ingestion
    /// Number of row tasks submitted to the queue per bulk call.
    pub chunk_size: usize,
    /// Inputs smaller than this many bytes are dispatched with high priority.
    pub priority_size_threshold: u64,
    /// Retry policy attached to every row task.
    pub retry: RetryPolicy,

    // Execution
    /// Number of threads in the in-process module pool.
    pub pool_threads: usize,
    /// URL of the remote script-execution service; `None` runs those scripts locally.
    pub rpc_url: Option<String>,
    /// Timeout for a single remote execution.
    pub rpc_timeout: Duration,
    /// Hard kill timeout for subprocess executions.
    pub subprocess_timeout: Duration,
    /// Interpreter for Python scripts.
    pub python_bin: String,
    /// Interpreter for Node scripts.
    pub node_bin: String,

    // Abort
    /// Expiry of the fast-path abort flag.
    pub abort_flag_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/rowforge".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_prefix: "rowforge".to_string(),

            results_path: PathBuf::from("./data/results"),
            uploads_path: PathBuf::from("./data/uploads"),

            worker_concurrency: 5,
            worker_max_children: 1000,
            poll_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(200),
            stall_timeout: Duration::from_secs(1860),
            shutdown_timeout: Duration::from_secs(60),

            chunk_size: 1000,
            priority_size_threshold: 1024 * 1024,
            retry: RetryPolicy::default(),

            pool_threads: 4,
            rpc_url: None,
            rpc_timeout: Duration::from_secs(300),
            subprocess_timeout: Duration::from_secs(1800),
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),

            abort_flag_ttl: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `QUEUE_PREFIX`: Redis key prefix (default: rowforge)
    /// - `RESULTS_PATH`: Row store root (default: ./data/results)
    /// - `UPLOADS_PATH`: Persisted upload root (default: ./data/uploads)
    /// - `WORKER_CONCURRENCY`: Concurrent leases (default: 5)
    /// - `WORKER_MAX_CHILDREN`: Concurrent executions (default: 1000)
    /// - `POLL_INTERVAL_MS`: Lease wait when idle (default: 1000)
    /// - `SETTLE_DELAY_MS`: Delay before the completion check (default: 200)
    /// - `STALL_TIMEOUT_SECS`: Lease expiry without a heartbeat (default: 1860)
    /// - `CHUNK_SIZE`: Enqueue batch size (default: 1000)
    /// - `PRIORITY_SIZE_THRESHOLD_BYTES`: High-priority cutoff (default: 1048576)
    /// - `TASK_MAX_ATTEMPTS`: Queue delivery attempts per row (default: 3)
    /// - `TASK_BACKOFF_MS`: Exponential backoff base (default: 3000)
    /// - `POOL_THREADS`: In-process pool size (default: 4)
    /// - `PY_WORKER_URL`: Remote execution service (default: unset)
    /// - `RPC_TIMEOUT_SECS`: Remote execution timeout (default: 300)
    /// - `SUBPROCESS_TIMEOUT_SECS`: Subprocess kill timeout (default: 1800)
    /// - `PYTHON_BIN` / `NODE_BIN`: Interpreters (default: python3 / node)
    /// - `ABORT_FLAG_TTL_SECS`: Abort flag expiry (default: 3600)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // DATABASE_URL is required
        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("QUEUE_PREFIX") {
            config.queue_prefix = val;
        }

        if let Ok(val) = std::env::var("RESULTS_PATH") {
            config.results_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("UPLOADS_PATH") {
            config.uploads_path = PathBuf::from(val);
        }

        // Worker settings
        if let Ok(val) = std::env::var("WORKER_CONCURRENCY") {
            config.worker_concurrency = parse_env_value(&val, "WORKER_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("WORKER_MAX_CHILDREN") {
            config.worker_max_children = parse_env_value(&val, "WORKER_MAX_CHILDREN")?;
        }

        if let Ok(val) = std::env::var("POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("SETTLE_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "SETTLE_DELAY_MS")?;
            config.settle_delay = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("STALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STALL_TIMEOUT_SECS")?;
            config.stall_timeout = Duration::from_secs(secs);
        }

        // Ingestion settings
        if let Ok(val) = std::env::var("CHUNK_SIZE") {
            config.chunk_size = parse_env_value(&val, "CHUNK_SIZE")?;
        }

        if let Ok(val) = std::env::var("PRIORITY_SIZE_THRESHOLD_BYTES") {
            config.priority_size_threshold =
                parse_env_value(&val, "PRIORITY_SIZE_THRESHOLD_BYTES")?;
        }

        if let Ok(val) = std::env::var("TASK_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "TASK_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("TASK_BACKOFF_MS") {
            config.retry.backoff_base_ms = parse_env_value(&val, "TASK_BACKOFF_MS")?;
        }

        // Execution settings
        if let Ok(val) = std::env::var("POOL_THREADS") {
            config.pool_threads = parse_env_value(&val, "POOL_THREADS")?;
        }

        if let Ok(val) = std::env::var("PY_WORKER_URL") {
            if !val.trim().is_empty() {
                config.rpc_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("RPC_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RPC_TIMEOUT_SECS")?;
            config.rpc_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("SUBPROCESS_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SUBPROCESS_TIMEOUT_SECS")?;
            config.subprocess_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PYTHON_BIN") {
            config.python_bin = val;
        }

        if let Ok(val) = std::env::var("NODE_BIN") {
            config.node_bin = val;
        }

        if let Ok(val) = std::env::var("ABORT_FLAG_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "ABORT_FLAG_TTL_SECS")?;
            config.abort_flag_ttl = Duration::from_secs(secs);
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
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.queue_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_prefix cannot be empty".to_string(),
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.worker_max_children == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_max_children must be greater than 0".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "chunk_size must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.pool_threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "pool_threads must be greater than 0".to_string(),
            ));
        }

        if self.subprocess_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "subprocess_timeout must be greater than 0".to_string(),
            ));
        }

        let longest_run = self.rpc_timeout.max(self.subprocess_timeout);
        if self.stall_timeout <= longest_run {
            return Err(ConfigError::ValidationFailed(format!(
                "stall_timeout ({}s) must exceed the longest execution timeout ({}s)",
                self.stall_timeout.as_secs(),
                longest_run.as_secs()
            )));
        }

        if self.abort_flag_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "abort_flag_ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the row store root.
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    /// Builder method to set the upload root.
    pub fn with_uploads_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.uploads_path = path.into();
        self
    }

    /// Builder method to set lease concurrency.
    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Builder method to set the execution cap.
    pub fn with_worker_max_children(mut self, max: usize) -> Self {
        self.worker_max_children = max;
        self
    }

    /// Builder method to set the enqueue chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Builder method to set the in-process pool size.
    pub fn with_pool_threads(mut self, threads: usize) -> Self {
        self.pool_threads = threads;
        self
    }

    /// Builder method to set the remote execution URL.
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    /// Builder method to set the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.worker_max_children, 1000);
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.pool_threads, 4);
        assert_eq!(config.settle_delay, Duration::from_millis(200));
        assert_eq!(config.rpc_timeout, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_base_ms, 3000);
        assert!(config.rpc_url.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_database_url("postgres://test/db")
            .with_redis_url("redis://cache:6380")
            .with_worker_concurrency(8)
            .with_worker_max_children(16)
            .with_chunk_size(50)
            .with_pool_threads(2)
            .with_rpc_url("http://python-service:9000/run");

        assert_eq!(config.database_url, "postgres://test/db");
        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.worker_max_children, 16);
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.pool_threads, 2);
        assert_eq!(
            config.rpc_url.as_deref(),
            Some("http://python-service:9000/run")
        );
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_concurrency() {
        let result = EngineConfig::default().with_worker_concurrency(0).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("worker_concurrency"));
    }

    #[test]
    fn test_validation_zero_children() {
        let result = EngineConfig::default().with_worker_max_children(0).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("worker_max_children"));
    }

    #[test]
    fn test_validation_stall_timeout_must_outlast_executions() {
        let mut config = EngineConfig::default();
        config.stall_timeout = config.subprocess_timeout;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("stall_timeout"));

        config.subprocess_timeout = Duration::from_secs(60);
        config.stall_timeout = Duration::from_secs(300);
        assert!(config.validate().unwrap_err().to_string().contains("300s"));

        config.stall_timeout = Duration::from_secs(301);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_chunk_size() {
        let result = EngineConfig::default().with_chunk_size(0).validate();
        assert!(result.unwrap_err().to_string().contains("chunk_size"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = EngineConfig::default()
            .with_retry(RetryPolicy::new(0, 1000))
            .validate();
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validation_empty_database_url() {
        let result = EngineConfig::default().with_database_url("").validate();
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_parse_env_value_rejects_garbage() {
        let result: Result<usize, _> = parse_env_value("many", "WORKER_CONCURRENCY");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("WORKER_CONCURRENCY"));
        assert!(err.to_string().contains("many"));
    }
}
