//! Ledger node client with timeouts and retries.

use crate::chain::model::{Block, ChainResponse};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_NODE_URL: &str = "http://127.0.0.1:5000";
const FETCH_TIMEOUT_MS: u64 = 30_000;
const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_NODE_URL.to_string(),
            timeout_ms: FETCH_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("node error: status {0} body {1}")]
    Status(u16, String),
    #[error("decode chain: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Anything that can hand the replay engine the ledger's block sequence.
///
/// Implementations return the full known chain; the engine does its own
/// index filtering against the checkpoint.
pub trait BlockSource {
    fn fetch_chain(&self) -> impl Future<Output = Result<Vec<Block>, FetchError>> + Send;
}

/// HTTP client for the ledger node's `GET /chain` endpoint.
pub struct NodeClient {
    config: FetchConfig,
    client: reqwest::Client,
    request_count: AtomicU64,
}

impl NodeClient {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            config,
            client,
            request_count: AtomicU64::new(0),
        })
    }

    pub fn chain_url(&self) -> String {
        format!("{}/chain", self.config.base_url.trim_end_matches('/'))
    }

    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            match self.client.get(url).send().await {
                Ok(r) => {
                    let status = r.status();
                    match r.text().await {
                        Ok(body) if status.is_success() => {
                            self.request_count.fetch_add(1, Ordering::Relaxed);
                            return Ok(body);
                        }
                        Ok(body) => last_err = Some(FetchError::Status(status.as_u16(), body)),
                        // body cut short by a timeout or reset
                        Err(e) => last_err = Some(FetchError::Request(e)),
                    }
                }
                Err(e) => last_err = Some(FetchError::Request(e)),
            }
            if attempt < self.config.max_retries {
                let ms = self.config.retry_backoff_ms * (1 << attempt);
                warn!(attempt, ms, url, "retry after fetch error");
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Status(0, "no attempt made".to_string())))
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

impl BlockSource for NodeClient {
    async fn fetch_chain(&self) -> Result<Vec<Block>, FetchError> {
        let url = self.chain_url();
        debug!(%url, "fetching chain");
        let body = self.get_text(&url).await?;
        let parsed: ChainResponse = serde_json::from_str(&body)?;
        info!(length = parsed.chain.len(), "chain received");
        Ok(parsed.chain)
    }
}
