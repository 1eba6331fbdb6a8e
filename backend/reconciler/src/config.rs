//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::errors::{ReconcilerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Esplora-style REST endpoints queried for UTXO status (at least one)
    pub utxo_source_urls: Vec<String>,
    /// Optional project status server
    pub status_feed_url: Option<String>,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Upper bound (in seconds) on one UTXO source query
    pub query_timeout_secs: u64,
    /// Chain-tip debounce window in milliseconds
    pub debounce_millis: u64,
    /// How often (in seconds) to poll the chain tip
    pub tip_poll_interval_secs: u64,
    /// How often (in seconds) to pull the status feed
    pub feed_poll_interval_secs: u64,
    pub retry_initial_backoff_secs: u64,
    pub retry_max_backoff_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let utxo_source_urls: Vec<String> = env_var("UTXO_SOURCE_URLS")
            .map_err(|_| {
                ReconcilerError::Config(
                    "UTXO_SOURCE_URLS environment variable is required".to_string(),
                )
            })?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if utxo_source_urls.is_empty() {
            return Err(ReconcilerError::Config(
                "UTXO_SOURCE_URLS must name at least one source".to_string(),
            ));
        }

        let config = Config {
            utxo_source_urls,
            status_feed_url: env_var("STATUS_FEED_URL").ok().filter(|s| !s.is_empty()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./reconciler.db".to_string()),
            api_port: parse_or("API_PORT", 3002)?,
            query_timeout_secs: parse_or("QUERY_TIMEOUT_SECS", 10)?,
            debounce_millis: parse_or("DEBOUNCE_MILLIS", 750)?,
            tip_poll_interval_secs: parse_or("TIP_POLL_INTERVAL_SECS", 15)?,
            feed_poll_interval_secs: parse_or("FEED_POLL_INTERVAL_SECS", 60)?,
            retry_initial_backoff_secs: parse_or("RETRY_INITIAL_BACKOFF_SECS", 2)?,
            retry_max_backoff_secs: parse_or("RETRY_MAX_BACKOFF_SECS", 60)?,
        };

        if config.query_timeout_secs == 0
            || config.tip_poll_interval_secs == 0
            || config.feed_poll_interval_secs == 0
        {
            return Err(ReconcilerError::Config(
                "Timeouts and poll intervals must be non-zero".to_string(),
            ));
        }
        if config.retry_initial_backoff_secs > config.retry_max_backoff_secs {
            return Err(ReconcilerError::Config(
                "RETRY_INITIAL_BACKOFF_SECS exceeds RETRY_MAX_BACKOFF_SECS".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            debounce: Duration::from_millis(self.debounce_millis),
            retry_initial_backoff: Duration::from_secs(self.retry_initial_backoff_secs),
            retry_max_backoff: Duration::from_secs(self.retry_max_backoff_secs),
        }
    }

    pub fn tip_poll_interval(&self) -> Duration {
        Duration::from_secs(self.tip_poll_interval_secs)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_secs(self.feed_poll_interval_secs)
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ReconcilerError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ReconcilerError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
