// Engine configuration
//
// Option structs for the engine, the per-log watchers, the domain matcher
// and the checkpoint store. Validation fills unset fields with defaults;
// an empty log list is a fatal configuration error.

use crate::error::CtError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default batch size for get-entries requests
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default number of parallel fetch workers per log
pub const DEFAULT_PARALLEL_FETCH: usize = 1;

/// Default bounded buffer between fetch workers and the watcher
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget for CT API requests
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default key prefix for checkpoint records
pub const DEFAULT_KEY_PREFIX: &str = "ct_watcher:";

/// Top-level engine options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    /// CT logs to follow; at least one is required
    #[serde(default)]
    pub logs: Vec<LogConfig>,
    /// Registrable domains to watch from startup
    #[serde(default)]
    pub initial_domains: Vec<String>,
    /// Domain matcher tuning
    #[serde(default)]
    pub matcher: MatcherConfig,
    /// Processing/tuning knobs
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Checkpoint store settings
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

impl EngineOptions {
    /// Validate the options, filling unset fields with defaults.
    ///
    /// Returns the normalised options or a configuration error. An empty
    /// log list is fatal; every log entry must carry a well-formed URL.
    pub fn validated(mut self) -> Result<Self> {
        if self.logs.is_empty() {
            return Err(CtError::Config {
                message: "at least one CT log must be configured".to_string(),
            });
        }

        for log in &mut self.logs {
            if log.url.trim().is_empty() {
                return Err(CtError::Config {
                    message: "CT log URL must not be empty".to_string(),
                });
            }
            url::Url::parse(&log.url)?;
            log.fill_defaults();
        }

        self.matcher.fill_defaults();
        self.performance.fill_defaults();
        self.checkpoints.fill_defaults();

        Ok(self)
    }
}

/// Per-log watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base URL of the CT log (e.g. `https://ct.googleapis.com/logs/argon2025h1/`)
    pub url: String,
    /// Entries requested per get-entries call
    #[serde(default)]
    pub batch_size: usize,
    /// Concurrent fetch workers inside this watcher
    #[serde(default)]
    pub parallel_fetch: usize,
    /// Bounded buffer between fetch workers and entry processing
    #[serde(default)]
    pub buffer_size: usize,
    /// Per-request timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Retry budget for transient API failures
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl LogConfig {
    /// Create a log configuration with default tuning
    pub fn new(url: impl Into<String>) -> Self {
        let mut config = Self {
            url: url.into(),
            batch_size: 0,
            parallel_fetch: 0,
            buffer_size: 0,
            timeout: None,
            max_retries: None,
        };
        config.fill_defaults();
        config
    }

    fn fill_defaults(&mut self) {
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.parallel_fetch == 0 {
            self.parallel_fetch = DEFAULT_PARALLEL_FETCH;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.timeout.is_none() {
            self.timeout = Some(DEFAULT_TIMEOUT);
        }
        if self.max_retries.is_none() {
            self.max_retries = Some(DEFAULT_MAX_RETRIES);
        }
    }

    /// Effective request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Effective retry budget
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

/// Domain matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Enable the approximate-membership pre-filter
    pub enable_bloom: bool,
    /// Bloom filter size in bits
    pub bloom_size: u64,
    /// Number of bloom hash probes
    pub bloom_hashes: u32,
    /// Enable the recently-seen cache
    pub enable_lru: bool,
    /// Recently-seen cache capacity
    pub lru_size: usize,
    /// Match domains case-sensitively
    pub case_sensitive: bool,
    /// Maximum accepted domain length
    pub max_domain_len: usize,
}

impl MatcherConfig {
    fn fill_defaults(&mut self) {
        if self.bloom_size == 0 {
            self.bloom_size = 1_000_000;
        }
        if self.bloom_hashes == 0 {
            self.bloom_hashes = 5;
        }
        if self.lru_size == 0 {
            self.lru_size = 10_000;
        }
        if self.max_domain_len == 0 {
            self.max_domain_len = 253;
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            enable_bloom: true,
            bloom_size: 1_000_000,
            bloom_hashes: 5,
            enable_lru: true,
            lru_size: 10_000,
            case_sensitive: false,
            max_domain_len: 253,
        }
    }
}

/// Processing/tuning knobs
///
/// Worker caps and batch sizes are advisory: entry processing happens on
/// the fetch pipeline that delivered the entry, bounded by the per-log
/// buffer, so these knobs only shape auxiliary work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Upper bound on auxiliary worker tasks
    pub max_workers: usize,
    /// Buffer size for internal channels
    pub channel_buffer: usize,
    /// Budget for processing a single certificate
    pub processing_timeout: Duration,
    /// Batch size for grouped processing
    pub batch_process: usize,
}

impl PerformanceConfig {
    fn fill_defaults(&mut self) {
        if self.max_workers == 0 {
            self.max_workers = 10;
        }
        if self.channel_buffer == 0 {
            self.channel_buffer = 100;
        }
        if self.processing_timeout.is_zero() {
            self.processing_timeout = Duration::from_secs(5);
        }
        if self.batch_process == 0 {
            self.batch_process = 50;
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            channel_buffer: 100,
            processing_timeout: Duration::from_secs(5),
            batch_process: 50,
        }
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Prefix applied to every store key
    pub key_prefix: String,
    /// SQLite database path; `None` selects the in-memory store
    /// (no durability across restarts)
    pub database_path: Option<PathBuf>,
}

impl CheckpointConfig {
    fn fill_defaults(&mut self) {
        if self.key_prefix.is_empty() {
            self.key_prefix = DEFAULT_KEY_PREFIX.to_string();
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            database_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_logs_rejected() {
        let opts = EngineOptions::default();
        let result = opts.validated();
        assert!(matches!(result, Err(CtError::Config { .. })));
    }

    #[test]
    fn test_defaults_filled() {
        let opts = EngineOptions {
            logs: vec![LogConfig {
                url: "https://ct.example.test/log/".to_string(),
                batch_size: 0,
                parallel_fetch: 0,
                buffer_size: 0,
                timeout: None,
                max_retries: None,
            }],
            ..Default::default()
        };

        let opts = opts.validated().unwrap();
        let log = &opts.logs[0];
        assert_eq!(log.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(log.parallel_fetch, DEFAULT_PARALLEL_FETCH);
        assert_eq!(log.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(log.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(log.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(opts.matcher.bloom_size, 1_000_000);
        assert_eq!(opts.checkpoints.key_prefix, DEFAULT_KEY_PREFIX);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let opts = EngineOptions {
            logs: vec![LogConfig::new("not a url")],
            ..Default::default()
        };
        assert!(opts.validated().is_err());
    }

    #[test]
    fn test_log_config_new() {
        let log = LogConfig::new("https://ct.example.test/log/");
        assert_eq!(log.batch_size, 100);
        assert_eq!(log.parallel_fetch, 1);
        assert_eq!(log.buffer_size, 1000);
    }
}
