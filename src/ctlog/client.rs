// CT log API client
//
// HTTP communication with CT log servers: signed tree heads and entry
// ranges, with bounded retries on transient failures. The underlying
// client verifies TLS normally, pools connections and honours the
// standard proxy environment variables.

use crate::error::CtError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Declared User-Agent
const USER_AGENT: &str = concat!("certwatch/", env!("CARGO_PKG_VERSION"));

/// Initial retry backoff, doubled per attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry backoff cap
const MAX_BACKOFF: Duration = Duration::from_millis(5000);

/// Idle connections kept per host
const POOL_MAX_IDLE: usize = 10;

/// Idle connection lifetime
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Signed Tree Head response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    pub sha256_root_hash: String,
    pub tree_head_signature: String,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    entries: Vec<LogEntryResponse>,
}

/// One entry from the get-entries API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryResponse {
    pub leaf_input: String,
    pub extra_data: String,
}

/// Client for one CT log server
#[derive(Clone)]
pub struct CtLogClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl CtLogClient {
    /// Build a client for the log at `base_url`
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        })
    }

    /// The log URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the current signed tree head
    pub async fn get_signed_tree_head(&self) -> Result<SignedTreeHead> {
        let url = format!("{}/ct/v1/get-sth", self.base_url);
        let response = self.retry_request(&url).await?;
        let sth: SignedTreeHead = response.json().await.map_err(|e| CtError::Parse {
            message: format!("failed to parse STH response: {}", e),
        })?;
        Ok(sth)
    }

    /// Fetch entries `start..=end` (the log may return fewer)
    pub async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<LogEntryResponse>> {
        let url = format!(
            "{}/ct/v1/get-entries?start={}&end={}",
            self.base_url, start, end
        );
        debug!(start, end, log = %self.base_url, "fetching entries");

        let response = self.retry_request(&url).await?;
        let entries: EntriesResponse = response.json().await.map_err(|e| CtError::Parse {
            message: format!("failed to parse entries response: {}", e),
        })?;
        Ok(entries.entries)
    }

    /// GET with bounded retries: transport errors, 429 and 5xx retry with
    /// doubling backoff; other client errors fail immediately.
    async fn retry_request(&self, url: &str) -> Result<reqwest::Response> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            match self.http.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(
                            %status,
                            attempt = attempt + 1,
                            retries = self.max_retries,
                            "retryable response, backing off {:?}",
                            backoff
                        );
                        last_error = format!("status {}", status);
                    } else {
                        return Err(CtError::Http {
                            status: status.as_u16(),
                            details: format!("request to {} failed", url),
                        });
                    }
                }
                Err(err) => {
                    if attempt + 1 >= self.max_retries {
                        return Err(err.into());
                    }
                    warn!(
                        attempt = attempt + 1,
                        retries = self.max_retries,
                        "network error: {}, backing off {:?}",
                        err,
                        backoff
                    );
                    last_error = err.to_string();
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        Err(CtError::Other(format!(
            "request failed after {} attempts: {}",
            self.max_retries, last_error
        )))
    }
}
