// Checkpoint coalescer
//
// In-memory staging for checkpoint updates with periodic batched
// writeback. `update` never blocks on I/O; flushes snapshot the map under
// the read lock and talk to the store after releasing it. A failed flush
// keeps the map intact so the next tick retries.

use super::{Checkpoint, CheckpointStore};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default flush interval
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(600);

/// Coalesces checkpoint updates and flushes them in batches
pub struct CheckpointSaver {
    store: Arc<dyn CheckpointStore>,
    interval: Duration,
    pending: RwLock<HashMap<String, Checkpoint>>,
    running: AtomicBool,
    token: Mutex<Option<CancellationToken>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointSaver {
    /// Create a saver flushing to `store` every `interval`
    pub fn new(store: Arc<dyn CheckpointStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            pending: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            token: Mutex::new(None),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Stage a checkpoint update. Never blocks on I/O.
    ///
    /// The staged index is kept monotonic even if updates arrive out of
    /// order from concurrent fetch workers.
    pub fn update(&self, checkpoint: Checkpoint) {
        if !checkpoint.is_valid() {
            return;
        }
        let mut pending = self.pending.write().expect("saver lock poisoned");
        match pending.get_mut(&checkpoint.log_url) {
            Some(existing) => {
                existing.update(checkpoint.last_processed_index, checkpoint.tree_size_hint);
            }
            None => {
                let mut checkpoint = checkpoint;
                checkpoint.timestamp = Utc::now();
                pending.insert(checkpoint.log_url.clone(), checkpoint);
            }
        }
    }

    /// Drop the staged checkpoint for a log
    pub fn remove(&self, log_url: &str) {
        let mut pending = self.pending.write().expect("saver lock poisoned");
        pending.remove(log_url);
    }

    /// Staged checkpoints awaiting the next flush
    pub fn pending_count(&self) -> usize {
        self.pending.read().expect("saver lock poisoned").len()
    }

    /// Flush the staged map to the store now
    pub async fn flush(&self) -> Result<()> {
        let snapshot: Vec<Checkpoint> = {
            let pending = self.pending.read().expect("saver lock poisoned");
            pending.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return Ok(());
        }
        self.store.save_batch(&snapshot).await?;
        debug!(count = snapshot.len(), "flushed checkpoints");
        Ok(())
    }

    /// Start the periodic flush task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.token.lock().expect("saver token lock poisoned") = Some(token.clone());

        let saver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(saver.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = saver.flush().await {
                            warn!("periodic checkpoint flush failed: {}", err);
                        }
                    }
                }
            }
            // Final flush before exiting.
            if let Err(err) = saver.flush().await {
                warn!("final checkpoint flush failed: {}", err);
            }
        });

        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the flush task; performs one final flush before returning
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self
            .token
            .lock()
            .expect("saver token lock poisoned")
            .take()
        {
            token.cancel();
        }
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// True while the flush task is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
