//! Indexer configuration: compiled-in defaults, then environment overrides.
//!
//! Built once at startup and handed to the engine and scheduler; nothing reads
//! the environment after that.
//!
//! Env: `DECENTGIT_NODE_URL`, `DECENTGIT_DB_PATH`, `DECENTGIT_POLL_INTERVAL_SECS`.

use crate::chain::{FetchConfig, DEFAULT_NODE_URL};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const ENV_NODE_URL: &str = "DECENTGIT_NODE_URL";
pub const ENV_DB_PATH: &str = "DECENTGIT_DB_PATH";
pub const ENV_POLL_INTERVAL_SECS: &str = "DECENTGIT_POLL_INTERVAL_SECS";

const DEFAULT_DB_PATH: &str = "./data/decentgit_index.db";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid node url {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("node url must be http or https, got {0:?}")]
    UnsupportedScheme(String),
    #[error("{var} is not a whole number of seconds: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("poll interval must be at least one second")]
    ZeroInterval,
    #[error("fetch timeout must be non-zero")]
    ZeroTimeout,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Ledger node base address; `/chain` is appended.
    pub node_url: String,
    /// SQLite file holding refs and the checkpoint.
    pub db_path: PathBuf,
    /// Wait between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        Self {
            node_url: DEFAULT_NODE_URL.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fetch_timeout: Duration::from_millis(fetch.timeout_ms),
            max_retries: fetch.max_retries,
            retry_backoff: Duration::from_millis(fetch.retry_backoff_ms),
        }
    }
}

impl IndexerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `DECENTGIT_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_NODE_URL).filter(|s| !s.trim().is_empty()) {
            config.node_url = url.trim().to_string();
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|s| !s.trim().is_empty()) {
            config.db_path = PathBuf::from(path.trim());
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_SECS) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: ENV_POLL_INTERVAL_SECS,
                    value: raw.clone(),
                })?;
            config.poll_interval = Duration::from_secs(secs);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.node_url)
            .map_err(|e| ConfigError::InvalidUrl(self.node_url.clone(), e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            base_url: self.node_url.clone(),
            timeout_ms: self.fetch_timeout.as_millis() as u64,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff.as_millis() as u64,
        }
    }
}
