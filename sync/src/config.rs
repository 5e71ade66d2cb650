//! Configuration management for the sync layer.

use std::env;
use std::time::Duration;

const DEFAULT_TXID_TIMEOUT_MS: u64 = 5000;
const DEFAULT_REFETCH_TIMEOUT_MS: u64 = 3000;
const DEFAULT_LOG_FILTER: &str = "livequery_engine=info,livequery_sync=info";

/// Sync configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Max wait for each sync token to be observed
    pub txid_timeout: Duration,
    /// Max wait for a refetch-based confirmation
    pub refetch_timeout: Duration,
    /// Tracing filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            txid_timeout: Duration::from_millis(DEFAULT_TXID_TIMEOUT_MS),
            refetch_timeout: Duration::from_millis(DEFAULT_REFETCH_TIMEOUT_MS),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let txid_timeout = millis(
            &lookup,
            "LIVEQUERY_TXID_TIMEOUT_MS",
            DEFAULT_TXID_TIMEOUT_MS,
        )?;
        let refetch_timeout = millis(
            &lookup,
            "LIVEQUERY_REFETCH_TIMEOUT_MS",
            DEFAULT_REFETCH_TIMEOUT_MS,
        )?;
        let log_filter =
            lookup("LIVEQUERY_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            txid_timeout,
            refetch_timeout,
            log_filter,
        })
    }

    pub fn with_txid_timeout(mut self, timeout: Duration) -> Self {
        self.txid_timeout = timeout;
        self
    }

    pub fn with_refetch_timeout(mut self, timeout: Duration) -> Self {
        self.refetch_timeout = timeout;
        self
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        None => Ok(Duration::from_millis(default)),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or(ConfigError::InvalidTimeout { var, value }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {var} value: {value:?} (expected a positive number of milliseconds)")]
    InvalidTimeout { var: &'static str, value: String },
}
