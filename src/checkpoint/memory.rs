// In-memory checkpoint store
//
// Non-durable store for tests and embedders that opt out of persistence.
// Satisfies the same per-key semantics as the SQLite store; everything is
// lost on process exit.

use super::{store_key, Checkpoint, CheckpointStore};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Ephemeral checkpoint store backed by a map
pub struct MemoryCheckpointStore {
    key_prefix: String,
    records: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored checkpoints
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True when nothing is stored
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if !checkpoint.is_valid() {
            return Err(crate::CtError::Store {
                message: "refusing to save checkpoint without a log URL".to_string(),
            });
        }
        let key = store_key(&self.key_prefix, &checkpoint.log_url);
        self.records.write().await.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, log_url: &str) -> Result<Checkpoint> {
        let key = store_key(&self.key_prefix, log_url);
        let records = self.records.read().await;
        Ok(records
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Checkpoint::new(log_url)))
    }

    async fn save_batch(&self, checkpoints: &[Checkpoint]) -> Result<()> {
        let mut records = self.records.write().await;
        for checkpoint in checkpoints {
            if !checkpoint.is_valid() {
                continue;
            }
            let key = store_key(&self.key_prefix, &checkpoint.log_url);
            records.insert(key, checkpoint.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn delete(&self, log_url: &str) -> Result<()> {
        let key = store_key(&self.key_prefix, log_url);
        self.records.write().await.remove(&key);
        Ok(())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, cp| cp.timestamp >= cutoff);
        Ok(before - records.len())
    }
}
