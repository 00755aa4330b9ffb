// Checkpointing
//
// Durable per-log progress markers. Watchers update their checkpoint in
// memory on every processed entry; the saver batches writes to the store
// on a timer. Losing the in-memory delta on crash sets a log back to the
// previous successful flush at worst (at-least-once re-processing).

pub mod memory;
pub mod saver;
pub mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use saver::CheckpointSaver;
pub use sqlite::SqliteCheckpointStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-log progress marker.
///
/// `last_processed_index == 0` on a freshly initialised log means "start
/// from the current tree head".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// CT log URL, the store key
    pub log_url: String,
    /// Highest entry index processed so far; monotonically non-decreasing
    pub last_processed_index: u64,
    /// Tree size observed at the last STH fetch
    pub tree_size_hint: u64,
    /// When the checkpoint was last updated
    pub timestamp: DateTime<Utc>,
    /// Record format version
    pub version: u32,
}

impl Checkpoint {
    /// Fresh checkpoint for a log that has never been followed
    pub fn new(log_url: impl Into<String>) -> Self {
        Self {
            log_url: log_url.into(),
            last_processed_index: 0,
            tree_size_hint: 0,
            timestamp: Utc::now(),
            version: 1,
        }
    }

    /// Advance the checkpoint. The index never moves backwards.
    pub fn update(&mut self, index: u64, tree_size_hint: u64) {
        self.last_processed_index = self.last_processed_index.max(index);
        if tree_size_hint > 0 {
            self.tree_size_hint = tree_size_hint;
        }
        self.timestamp = Utc::now();
    }

    /// Basic shape check before persisting
    pub fn is_valid(&self) -> bool {
        !self.log_url.is_empty()
    }
}

/// Durable key/value store for checkpoints, keyed by log URL.
///
/// Implementations must guarantee durability across process restarts,
/// read-your-last-write per key, and independence of concurrent writes to
/// distinct keys. Batch saves are atomic per key, not across keys.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist one checkpoint; idempotent, atomic per key
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the checkpoint for a log; a missing key yields the zero-value
    /// checkpoint (`last_processed_index == 0`)
    async fn load(&self, log_url: &str) -> Result<Checkpoint>;

    /// Persist a batch; atomic per key
    async fn save_batch(&self, checkpoints: &[Checkpoint]) -> Result<()>;

    /// All stored checkpoints
    async fn list(&self) -> Result<Vec<Checkpoint>>;

    /// Remove the checkpoint for a log
    async fn delete(&self, log_url: &str) -> Result<()>;

    /// Remove checkpoints not updated within `max_age`; returns how many
    /// were removed
    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize>;

    /// Release store resources; further calls may fail
    async fn close(&self) {}
}

/// Store key for a log URL
pub(crate) fn store_key(key_prefix: &str, log_url: &str) -> String {
    format!("{}checkpoint:{}", key_prefix, log_url)
}
