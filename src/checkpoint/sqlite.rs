// SQLite-backed checkpoint store
//
// Reference durable implementation: JSON-encoded checkpoints in a single
// table keyed `<key_prefix>checkpoint:<logURL>`. SQLite is single-writer,
// so the pool is capped at one connection; batch saves run in one
// transaction and are atomic per key.

use super::{store_key, Checkpoint, CheckpointStore};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS checkpoints (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

const UPSERT: &str = "INSERT INTO checkpoints (key, payload, updated_at) VALUES (?, ?, ?)
    ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at";

/// Durable checkpoint store on a local SQLite database
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    key_prefix: String,
}

impl SqliteCheckpointStore {
    /// Open (creating if missing) the database at `path`
    pub async fn open(path: &Path, key_prefix: impl Into<String>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        debug!(path = %path.display(), "opened checkpoint store");
        Ok(Self {
            pool,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, log_url: &str) -> String {
        store_key(&self.key_prefix, log_url)
    }

    fn like_pattern(&self) -> String {
        format!("{}checkpoint:%", self.key_prefix)
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        if !checkpoint.is_valid() {
            return Err(crate::CtError::Store {
                message: "refusing to save checkpoint without a log URL".to_string(),
            });
        }
        let payload = serde_json::to_string(checkpoint)?;
        sqlx::query(UPSERT)
            .bind(self.key(&checkpoint.log_url))
            .bind(payload)
            .bind(checkpoint.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load(&self, log_url: &str) -> Result<Checkpoint> {
        let row = sqlx::query("SELECT payload FROM checkpoints WHERE key = ?")
            .bind(self.key(log_url))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let payload: String = row.get(0);
                Ok(serde_json::from_str(&payload)?)
            }
            None => Ok(Checkpoint::new(log_url)),
        }
    }

    async fn save_batch(&self, checkpoints: &[Checkpoint]) -> Result<()> {
        if checkpoints.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for checkpoint in checkpoints {
            if !checkpoint.is_valid() {
                continue;
            }
            let payload = serde_json::to_string(checkpoint)?;
            sqlx::query(UPSERT)
                .bind(self.key(&checkpoint.log_url))
                .bind(payload)
                .bind(checkpoint.timestamp.to_rfc3339())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query("SELECT payload FROM checkpoints WHERE key LIKE ?")
            .bind(self.like_pattern())
            .fetch_all(&self.pool)
            .await?;

        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get(0);
            match serde_json::from_str(&payload) {
                Ok(cp) => checkpoints.push(cp),
                // Skip unreadable rows rather than failing the listing.
                Err(err) => debug!("skipping unparseable checkpoint row: {}", err),
            }
        }
        Ok(checkpoints)
    }

    async fn delete(&self, log_url: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE key = ?")
            .bind(self.key(log_url))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query("DELETE FROM checkpoints WHERE key LIKE ? AND updated_at < ?")
            .bind(self.like_pattern())
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
