// Per-log watcher
//
// One long-lived follower per CT log: loads its checkpoint, fetches new
// entries in parallel batches, hands each entry to the stream processor
// and keeps the checkpoint moving. Transient failures back off linearly
// and never kill the watcher; cancellation is cooperative at every
// suspension point.

use crate::checkpoint::{Checkpoint, CheckpointSaver, CheckpointStore};
use crate::config::LogConfig;
use crate::ctlog::{decode_leaf, CtLogClient, LeafKind, LogEntryResponse};
use crate::error::CtError;
use crate::events::{ErrorEvent, Event, EventBus, Severity, WatcherStatusEvent};
use crate::processor::StreamProcessor;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sleep between successful scan cycles
const SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline for one scan cycle
const SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Linear back-off step after a failed cycle
const BACKOFF_STEP: Duration = Duration::from_secs(5);

/// Back-off cap
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Watcher lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Connected,
    Scanning,
    Error,
    Stopped,
}

impl std::fmt::Display for WatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WatcherState::Disconnected => "disconnected",
            WatcherState::Connecting => "connecting",
            WatcherState::Connected => "connected",
            WatcherState::Scanning => "scanning",
            WatcherState::Error => "error",
            WatcherState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Point-in-time snapshot of one watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub log_url: String,
    pub state: WatcherState,
    pub last_processed_index: u64,
    pub tree_size_hint: u64,
    pub processed_count: u64,
    pub error_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub last_error_time: Option<DateTime<Utc>>,
}

struct WatcherShared {
    state: Mutex<WatcherState>,
    /// First index not yet processed; advances by CAS maximum
    next_index: AtomicU64,
    tree_size_hint: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    last_activity: Mutex<DateTime<Utc>>,
    last_error: Mutex<Option<DateTime<Utc>>>,
}

struct FetchedEntry {
    index: u64,
    response: LogEntryResponse,
}

/// Follower for a single CT log
pub struct CtWatcher {
    config: LogConfig,
    client: CtLogClient,
    processor: Arc<StreamProcessor>,
    store: Arc<dyn CheckpointStore>,
    saver: Arc<CheckpointSaver>,
    bus: Arc<EventBus>,
    shared: WatcherShared,
    token: CancellationToken,
    running: AtomicBool,
}

impl CtWatcher {
    /// Build a watcher for one log. The HTTP client honours the standard
    /// proxy environment variables and verifies TLS normally.
    pub fn new(
        config: LogConfig,
        processor: Arc<StreamProcessor>,
        store: Arc<dyn CheckpointStore>,
        saver: Arc<CheckpointSaver>,
        bus: Arc<EventBus>,
        token: CancellationToken,
    ) -> Result<Self> {
        let client = CtLogClient::new(&config.url, config.timeout(), config.max_retries())?;

        Ok(Self {
            config,
            client,
            processor,
            store,
            saver,
            bus,
            shared: WatcherShared {
                state: Mutex::new(WatcherState::Disconnected),
                next_index: AtomicU64::new(0),
                tree_size_hint: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                started_at: Mutex::new(None),
                last_activity: Mutex::new(Utc::now()),
                last_error: Mutex::new(None),
            },
            token,
            running: AtomicBool::new(false),
        })
    }

    /// The log URL this watcher follows
    pub fn log_url(&self) -> &str {
        &self.config.url
    }

    /// Load the checkpoint, pick the start position and launch the watch
    /// loop. Returns the loop's task handle.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CtError::AlreadyRunning);
        }

        *self
            .shared
            .started_at
            .lock()
            .expect("watcher lock poisoned") = Some(Utc::now());

        self.set_state(WatcherState::Connecting, "starting");

        if let Err(err) = self.load_checkpoint().await {
            self.running.store(false, Ordering::SeqCst);
            self.set_state(WatcherState::Error, "checkpoint load failed");
            return Err(err);
        }

        self.set_state(WatcherState::Connected, "checkpoint loaded");

        let watcher = Arc::clone(self);
        Ok(tokio::spawn(watcher.watch_loop()))
    }

    /// Request cooperative shutdown
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Point-in-time status snapshot
    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            log_url: self.config.url.clone(),
            state: *self.shared.state.lock().expect("watcher lock poisoned"),
            last_processed_index: self.last_processed_index(),
            tree_size_hint: self.shared.tree_size_hint.load(Ordering::Acquire),
            processed_count: self.shared.processed.load(Ordering::Relaxed),
            error_count: self.shared.errors.load(Ordering::Relaxed),
            started_at: *self
                .shared
                .started_at
                .lock()
                .expect("watcher lock poisoned"),
            last_activity: *self
                .shared
                .last_activity
                .lock()
                .expect("watcher lock poisoned"),
            last_error_time: *self.shared.last_error.lock().expect("watcher lock poisoned"),
        }
    }

    /// Highest index processed so far
    pub fn last_processed_index(&self) -> u64 {
        self.shared
            .next_index
            .load(Ordering::Acquire)
            .saturating_sub(1)
    }

    async fn watch_loop(self: Arc<Self>) {
        loop {
            if self.token.is_cancelled() {
                break;
            }

            match self.run_cycle().await {
                Ok(()) => {
                    self.set_state(WatcherState::Connected, "scan cycle complete");
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                    }
                }
                Err(err) => {
                    self.record_error();
                    self.set_state(WatcherState::Error, "scan cycle failed");
                    let mut context = HashMap::new();
                    context.insert("log_url".to_string(), self.config.url.clone());
                    self.bus.publish(Event::ErrorOccurred(ErrorEvent {
                        error_type: "fetch_error".to_string(),
                        message: err.to_string(),
                        context,
                        severity: Severity::Medium,
                        recoverable: true,
                    }));

                    let delay = self.retry_delay();
                    warn!(log = %self.config.url, "scan failed: {}; retrying in {:?}", err, delay);
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.set_state(WatcherState::Connecting, "retrying after back-off");
                }
            }
        }

        // Request one final checkpoint write before going quiet.
        self.push_checkpoint();
        self.running.store(false, Ordering::SeqCst);
        self.set_state(WatcherState::Stopped, "watcher cancelled");
        info!(log = %self.config.url, "watcher stopped");
    }

    async fn run_cycle(&self) -> Result<()> {
        self.set_state(WatcherState::Scanning, "scan cycle started");
        match tokio::time::timeout(SCAN_TIMEOUT, self.scan_once()).await {
            Ok(result) => result,
            Err(_) => Err(CtError::Timeout {
                duration: SCAN_TIMEOUT,
            }),
        }
    }

    /// One pass: fetch the STH, then pull and process every entry between
    /// the cursor and the tree head. Fetching is spread over
    /// `parallel_fetch` workers claiming contiguous batch ranges; a bounded
    /// channel throttles them if processing is slow.
    async fn scan_once(&self) -> Result<()> {
        let sth = self.client.get_signed_tree_head().await?;
        self.shared
            .tree_size_hint
            .store(sth.tree_size, Ordering::Release);

        let begin = self.shared.next_index.load(Ordering::Acquire);
        if begin >= sth.tree_size {
            debug!(log = %self.config.url, begin, tree_size = sth.tree_size, "caught up");
            return Ok(());
        }

        let end = sth.tree_size;
        let (tx, mut rx) = mpsc::channel::<FetchedEntry>(self.config.buffer_size);
        let cursor = Arc::new(AtomicU64::new(begin));
        let batch = self.config.batch_size.max(1) as u64;

        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for _ in 0..self.config.parallel_fetch.max(1) {
            let client = self.client.clone();
            let cursor = Arc::clone(&cursor);
            let token = self.token.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                loop {
                    if token.is_cancelled() {
                        return Ok(());
                    }
                    let start = cursor.fetch_add(batch, Ordering::SeqCst);
                    if start >= end {
                        return Ok(());
                    }
                    let last = (start + batch - 1).min(end - 1);

                    // Logs may return fewer entries than asked; keep
                    // fetching until the claimed range is complete so no
                    // index is silently skipped.
                    let mut pos = start;
                    while pos <= last {
                        let entries = client.get_entries(pos, last).await?;
                        if entries.is_empty() {
                            return Err(CtError::Parse {
                                message: format!("log returned no entries for {}-{}", pos, last),
                            });
                        }
                        let count = entries.len() as u64;
                        for (offset, response) in entries.into_iter().enumerate() {
                            let entry = FetchedEntry {
                                index: pos + offset as u64,
                                response,
                            };
                            tokio::select! {
                                _ = token.cancelled() => return Ok(()),
                                sent = tx.send(entry) => {
                                    if sent.is_err() {
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        pos += count;
                    }
                }
            });
        }
        drop(tx);

        loop {
            let fetched = tokio::select! {
                _ = self.token.cancelled() => break,
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };
            self.handle_entry(fetched);
        }
        drop(rx);

        let mut failure: Option<CtError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failure = Some(err),
                Err(err) => failure = Some(CtError::Other(format!("fetch worker died: {}", err))),
            }
        }

        if self.token.is_cancelled() {
            return Ok(());
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Process one delivered entry. Pre-certificates are counted as
    /// processed but their content is not matched (names are often
    /// sanitised); parse and decode failures still advance the index so a
    /// poisonous entry cannot stall the log.
    fn handle_entry(&self, fetched: FetchedEntry) {
        match decode_leaf(&fetched.response.leaf_input, fetched.index) {
            Ok(leaf) => {
                self.advance_index(leaf.index);
                match leaf.kind {
                    LeafKind::X509 => {
                        let result = self.processor.process_entry(
                            &leaf.cert_der,
                            leaf.index,
                            leaf.timestamp,
                            &self.config.url,
                        );
                        if result.is_err() {
                            self.record_error();
                        }
                    }
                    LeafKind::Precert => {
                        debug!(log = %self.config.url, index = leaf.index, "skipping pre-certificate");
                    }
                }
            }
            Err(err) => {
                self.advance_index(fetched.index);
                self.record_error();
                let mut context = HashMap::new();
                context.insert("log_url".to_string(), self.config.url.clone());
                context.insert("index".to_string(), fetched.index.to_string());
                self.bus.publish(Event::ErrorOccurred(ErrorEvent {
                    error_type: "leaf_decode_error".to_string(),
                    message: err.to_string(),
                    context,
                    severity: Severity::Low,
                    recoverable: true,
                }));
            }
        }

        self.shared.processed.fetch_add(1, Ordering::Relaxed);
        self.touch();
        self.push_checkpoint();
    }

    /// Advance the cursor to `index + 1` unless it is already further
    /// along; fetch workers may deliver entries out of order
    fn advance_index(&self, index: u64) {
        let target = index + 1;
        let mut current = self.shared.next_index.load(Ordering::Acquire);
        while target > current {
            match self.shared.next_index.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn push_checkpoint(&self) {
        let next = self.shared.next_index.load(Ordering::Acquire);
        if next == 0 {
            return;
        }
        let mut checkpoint = Checkpoint::new(&self.config.url);
        checkpoint.update(
            next - 1,
            self.shared.tree_size_hint.load(Ordering::Acquire),
        );
        self.saver.update(checkpoint);
    }

    async fn load_checkpoint(&self) -> Result<()> {
        let checkpoint = self.store.load(&self.config.url).await?;

        if checkpoint.last_processed_index == 0 {
            // First run: begin at the current tree head so we do not
            // backfill the whole log.
            match self.client.get_signed_tree_head().await {
                Ok(sth) => {
                    info!(
                        log = %self.config.url,
                        tree_size = sth.tree_size,
                        "first run, starting at current tree head"
                    );
                    self.shared
                        .next_index
                        .store(sth.tree_size, Ordering::Release);
                    self.shared
                        .tree_size_hint
                        .store(sth.tree_size, Ordering::Release);
                }
                Err(err) => {
                    warn!(
                        log = %self.config.url,
                        "STH fetch failed ({}); starting from index 0",
                        err
                    );
                    self.shared.next_index.store(0, Ordering::Release);
                }
            }
        } else {
            info!(
                log = %self.config.url,
                last_index = checkpoint.last_processed_index,
                "resuming from checkpoint"
            );
            self.shared
                .next_index
                .store(checkpoint.last_processed_index + 1, Ordering::Release);
            self.shared
                .tree_size_hint
                .store(checkpoint.tree_size_hint, Ordering::Release);
        }

        Ok(())
    }

    fn retry_delay(&self) -> Duration {
        let errors = self.shared.errors.load(Ordering::Relaxed).min(60);
        let delay = BACKOFF_STEP * errors.max(1) as u32;
        delay.min(BACKOFF_MAX)
    }

    fn record_error(&self) {
        self.shared.errors.fetch_add(1, Ordering::Relaxed);
        *self.shared.last_error.lock().expect("watcher lock poisoned") = Some(Utc::now());
    }

    fn touch(&self) {
        *self
            .shared
            .last_activity
            .lock()
            .expect("watcher lock poisoned") = Utc::now();
    }

    fn set_state(&self, new_state: WatcherState, reason: &str) {
        let old_state = {
            let mut state = self.shared.state.lock().expect("watcher lock poisoned");
            if *state == new_state {
                return;
            }
            std::mem::replace(&mut *state, new_state)
        };
        self.touch();
        debug!(log = %self.config.url, %old_state, %new_state, reason, "watcher state change");
        self.bus
            .publish(Event::WatcherStatusChanged(WatcherStatusEvent {
                log_url: self.config.url.clone(),
                old_state,
                new_state,
                reason: reason.to_string(),
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointSaver, MemoryCheckpointStore};
    use crate::config::MatcherConfig;
    use crate::ctlog::leaf::encode_leaf;
    use crate::matcher::DomainMatcher;

    fn test_watcher(store: Arc<MemoryCheckpointStore>) -> Arc<CtWatcher> {
        let matcher = Arc::new(DomainMatcher::new(MatcherConfig::default()));
        matcher.add_domain("example.com").unwrap();
        let bus = Arc::new(EventBus::new());
        let processor = Arc::new(StreamProcessor::new(matcher, Arc::clone(&bus)));
        let saver = Arc::new(CheckpointSaver::new(
            Arc::clone(&store) as Arc<dyn CheckpointStore>,
            Duration::from_secs(600),
        ));

        let mut config = LogConfig::new("http://127.0.0.1:9/ct/");
        config.timeout = Some(Duration::from_millis(500));
        config.max_retries = Some(1);

        Arc::new(
            CtWatcher::new(
                config,
                processor,
                store as Arc<dyn CheckpointStore>,
                saver,
                bus,
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_advance_index_is_monotonic_max() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);

        watcher.advance_index(10);
        assert_eq!(watcher.last_processed_index(), 10);

        // Out-of-order delivery of a lower index must not move backwards.
        watcher.advance_index(5);
        assert_eq!(watcher.last_processed_index(), 10);

        watcher.advance_index(11);
        assert_eq!(watcher.last_processed_index(), 11);
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let mut cp = Checkpoint::new("http://127.0.0.1:9/ct/");
        cp.update(1000, 5000);
        store.save(&cp).await.unwrap();

        let watcher = test_watcher(store);
        watcher.load_checkpoint().await.unwrap();

        // The next fetch targets index 1001.
        assert_eq!(watcher.shared.next_index.load(Ordering::Acquire), 1001);
        assert_eq!(watcher.last_processed_index(), 1000);
    }

    #[tokio::test]
    async fn test_first_run_sth_failure_starts_at_zero() {
        // The configured URL is unreachable, so the STH probe fails; the
        // watcher must still come up, starting at index 0.
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);
        watcher.load_checkpoint().await.unwrap();
        assert_eq!(watcher.shared.next_index.load(Ordering::Acquire), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_entry_advances_on_decode_failure() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(Arc::clone(&store));

        watcher.handle_entry(FetchedEntry {
            index: 7,
            response: LogEntryResponse {
                leaf_input: "!!!not-base64!!!".to_string(),
                extra_data: String::new(),
            },
        });

        assert_eq!(watcher.last_processed_index(), 7);
        assert_eq!(watcher.shared.errors.load(Ordering::Relaxed), 1);
        assert_eq!(watcher.shared.processed.load(Ordering::Relaxed), 1);
        assert_eq!(watcher.saver.pending_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_entry_skips_precert_but_advances() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);

        let leaf = encode_leaf(LeafKind::Precert, 1_700_000_000_000, &[0x30, 0x01, 0x02]);
        watcher.handle_entry(FetchedEntry {
            index: 3,
            response: LogEntryResponse {
                leaf_input: leaf,
                extra_data: String::new(),
            },
        });

        assert_eq!(watcher.last_processed_index(), 3);
        assert_eq!(watcher.shared.processed.load(Ordering::Relaxed), 1);
        assert_eq!(watcher.shared.errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_handle_entry_processes_x509() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);

        let names = vec!["api.example.com".to_string()];
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        let leaf = encode_leaf(LeafKind::X509, 1_700_000_000_000, cert.cert.der());

        watcher.handle_entry(FetchedEntry {
            index: 12,
            response: LogEntryResponse {
                leaf_input: leaf,
                extra_data: String::new(),
            },
        });

        assert_eq!(watcher.last_processed_index(), 12);
        assert_eq!(watcher.processor.stats().total_processed, 1);
        assert_eq!(watcher.processor.stats().total_matched, 1);
    }

    #[tokio::test]
    async fn test_retry_delay_linear_and_capped() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);

        assert_eq!(watcher.retry_delay(), Duration::from_secs(5));

        watcher.shared.errors.store(3, Ordering::Relaxed);
        assert_eq!(watcher.retry_delay(), Duration::from_secs(15));

        watcher.shared.errors.store(1000, Ordering::Relaxed);
        assert_eq!(watcher.retry_delay(), BACKOFF_MAX);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_snapshot() {
        let store = Arc::new(MemoryCheckpointStore::new("test:"));
        let watcher = test_watcher(store);

        let status = watcher.status();
        assert_eq!(status.state, WatcherState::Disconnected);
        assert_eq!(status.processed_count, 0);
        assert_eq!(status.log_url, "http://127.0.0.1:9/ct/");
    }
}
