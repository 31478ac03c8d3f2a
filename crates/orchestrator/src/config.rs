//! Process configuration loaded from environment variables.

use std::time::Duration;

use saga::{ExecutorConfig, RetryPolicy, RetryPolicyError};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL connection string (unset: in-memory store)
/// - `METRICS_ADDR`: Prometheus listener address (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON logs, anything else for pretty
/// - `EXECUTOR_ID`: lease owner id (default: random per process)
/// - `LEASE_TTL_SECS`: run lease lifetime (default: `30`)
/// - `SAGA_MAX_ATTEMPTS`: attempts per step (default: `3`)
/// - `SAGA_BACKOFF_BASE_MS`: first retry delay (default: `100`)
/// - `SAGA_BACKOFF_MAX_MS`: retry delay cap (default: `10000`)
/// - `RECOVERY_INTERVAL_SECS`: pause between recovery sweeps (default: `5`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub metrics_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub executor_id: Option<String>,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub recovery_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            metrics_addr: lookup("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
            executor_id: lookup("EXECUTOR_ID").filter(|id| !id.trim().is_empty()),
            lease_ttl: number("LEASE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_ttl),
            max_attempts: lookup("SAGA_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_attempts),
            backoff_base: number("SAGA_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: number("SAGA_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            recovery_interval: number("RECOVERY_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.recovery_interval),
        }
    }

    /// Builds the default step retry policy: exponential, doubling.
    pub fn retry_policy(&self) -> Result<RetryPolicy, RetryPolicyError> {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base, 2, self.backoff_max)
    }

    /// Builds the executor settings.
    pub fn executor_config(&self) -> ExecutorConfig {
        let defaults = ExecutorConfig::default();
        ExecutorConfig {
            owner_id: self.executor_id.clone().unwrap_or(defaults.owner_id),
            lease_ttl: self.lease_ttl,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            metrics_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            executor_id: None,
            lease_ttl: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            recovery_interval: Duration::from_secs(5),
        }
    }
}
