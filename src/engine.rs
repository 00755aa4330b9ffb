// Engine façade
//
// The only surface the core exposes outward: lifecycle, dynamic domain
// add/remove, callback registration and status reporting. The engine owns
// the matcher, stream processor, checkpoint machinery and one watcher per
// configured log; watchers receive their collaborators as parameters and
// callbacks receive the counter object, never the engine itself.

use crate::checkpoint::{
    saver::DEFAULT_FLUSH_INTERVAL, CheckpointSaver, CheckpointStore, MemoryCheckpointStore,
    SqliteCheckpointStore,
};
use crate::config::EngineOptions;
use crate::error::CtError;
use crate::events::{
    ErrorEvent, Event, EventBus, EventKind, LifecycleEvent, Severity, SubdomainEvent,
};
use crate::matcher::{DomainMatcher, MatcherStats};
use crate::processor::StreamProcessor;
use crate::watcher::{CtWatcher, WatcherStatus};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Grace period granted to watcher tasks on shutdown
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Aggregate engine statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub processed_certificates: u64,
    pub discovered_subdomains: u64,
    pub total_errors: u64,
    pub uptime: Duration,
}

/// Aggregate engine status with per-watcher detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime: Duration,
    pub processed_certificates: u64,
    pub discovered_subdomains: u64,
    pub total_errors: u64,
    pub active_watchers: usize,
    pub watchers: HashMap<String, WatcherStatus>,
}

#[derive(Default)]
struct EngineCounters {
    processed: AtomicU64,
    discovered: AtomicU64,
    errors: AtomicU64,
}

/// The CT monitoring engine
pub struct Engine {
    opts: EngineOptions,
    matcher: Arc<DomainMatcher>,
    processor: Arc<StreamProcessor>,
    store: Arc<dyn CheckpointStore>,
    saver: Arc<CheckpointSaver>,
    bus: Arc<EventBus>,
    counters: Arc<EngineCounters>,
    watchers: Mutex<HashMap<String, Arc<CtWatcher>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    root: Mutex<CancellationToken>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl Engine {
    /// Validate the options, construct every component and pre-seed the
    /// matcher with the initial domains.
    ///
    /// Fatal failures here are configuration errors, invalid initial
    /// domains and checkpoint store construction.
    pub async fn new(opts: EngineOptions) -> Result<Self> {
        let opts = opts.validated()?;

        let store: Arc<dyn CheckpointStore> = match &opts.checkpoints.database_path {
            Some(path) => Arc::new(
                SqliteCheckpointStore::open(path, opts.checkpoints.key_prefix.clone()).await?,
            ),
            None => Arc::new(MemoryCheckpointStore::new(
                opts.checkpoints.key_prefix.clone(),
            )),
        };

        let saver = Arc::new(CheckpointSaver::new(
            Arc::clone(&store),
            DEFAULT_FLUSH_INTERVAL,
        ));

        let matcher = Arc::new(DomainMatcher::new(opts.matcher.clone()));
        for domain in &opts.initial_domains {
            matcher.add_domain(domain)?;
        }

        let bus = Arc::new(EventBus::new());
        let processor = Arc::new(StreamProcessor::new(Arc::clone(&matcher), Arc::clone(&bus)));

        let counters = Arc::new(EngineCounters::default());
        {
            let c = Arc::clone(&counters);
            bus.subscribe(EventKind::CertificateProcessed, move |_| {
                c.processed.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let c = Arc::clone(&counters);
            bus.subscribe(EventKind::SubdomainDiscovered, move |_| {
                c.discovered.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let c = Arc::clone(&counters);
            bus.subscribe(EventKind::ErrorOccurred, move |_| {
                c.errors.fetch_add(1, Ordering::Relaxed);
            });
        }

        Ok(Self {
            opts,
            matcher,
            processor,
            store,
            saver,
            bus,
            counters,
            watchers: Mutex::new(HashMap::new()),
            handles: tokio::sync::Mutex::new(Vec::new()),
            root: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        })
    }

    /// Start the checkpoint saver and one watcher per configured log.
    ///
    /// A watcher that fails to start is reported and skipped; failing to
    /// start every watcher is fatal.
    pub async fn start(&self) -> Result<()> {
        eprintln!("DEBUG start() enter");
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CtError::AlreadyRunning);
        }

        *self.started_at.lock().expect("engine lock poisoned") = Some(Utc::now());
        let root = CancellationToken::new();
        *self.root.lock().expect("engine lock poisoned") = root.clone();

        self.saver.start();

        let mut watchers = HashMap::new();
        let mut handles = Vec::new();

        for log in &self.opts.logs {
            if watchers.contains_key(&log.url) {
                warn!(log = %log.url, "duplicate log URL, skipping");
                continue;
            }

            let watcher = match CtWatcher::new(
                log.clone(),
                Arc::clone(&self.processor),
                Arc::clone(&self.store),
                Arc::clone(&self.saver),
                Arc::clone(&self.bus),
                root.child_token(),
            ) {
                Ok(watcher) => Arc::new(watcher),
                Err(err) => {
                    self.report_watcher_failure(&log.url, &err);
                    continue;
                }
            };

            eprintln!("DEBUG before watcher.start()");
            match watcher.start().await {
                Ok(handle) => {
                    eprintln!("DEBUG watcher.start() ok");
                    handles.push(handle);
                    watchers.insert(log.url.clone(), watcher);
                }
                Err(err) => self.report_watcher_failure(&log.url, &err),
            }
        }
        eprintln!("DEBUG after watcher loop");

        if watchers.is_empty() {
            self.saver.stop().await;
            self.running.store(false, Ordering::SeqCst);
            return Err(CtError::Other(
                "failed to start any watcher".to_string(),
            ));
        }

        info!(watchers = watchers.len(), "engine started");
        *self.watchers.lock().expect("engine lock poisoned") = watchers;
        eprintln!("DEBUG before handles.lock()");
        *self.handles.lock().await = handles;
        eprintln!("DEBUG after handles.lock()");

        self.bus.publish(Event::EngineStarted(LifecycleEvent {
            uptime: None,
            stats: None,
        }));
        eprintln!("DEBUG start() returning Ok");
        Ok(())
    }

    /// Stop every watcher, flush checkpoints and close the store.
    ///
    /// Idempotent and bounded: watcher tasks get a short grace period to
    /// wind down, then the engine returns regardless.
    pub async fn stop(&self) -> Result<()> {
        eprintln!("DEBUG stop() enter");
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("stopping engine");
        self.root.lock().expect("engine lock poisoned").cancel();
        eprintln!("DEBUG stop() cancelled root, awaiting handles");

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        if tokio::time::timeout(STOP_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("watchers did not stop within the grace period");
        }
        eprintln!("DEBUG stop() handles joined/timed out, stopping saver");

        self.saver.stop().await;
        eprintln!("DEBUG stop() saver stopped, closing store");
        self.store.close().await;
        eprintln!("DEBUG stop() store closed");

        let stats = self.stats();
        self.bus.publish(Event::EngineStopped(LifecycleEvent {
            uptime: Some(stats.uptime),
            stats: Some(stats),
        }));

        self.watchers.lock().expect("engine lock poisoned").clear();
        info!("engine stopped");
        Ok(())
    }

    /// Add watched registrable domains
    pub fn add_domains(&self, domains: &[String]) -> Result<()> {
        for domain in domains {
            self.matcher.add_domain(domain)?;
        }
        Ok(())
    }

    /// Remove watched domains; the Bloom filter is rebuilt and the
    /// recently-seen cache cleared
    pub fn remove_domains(&self, domains: &[String]) -> Result<()> {
        for domain in domains {
            self.matcher.remove_domain(domain)?;
        }
        Ok(())
    }

    /// Currently watched domains
    pub fn watched_domains(&self) -> Vec<String> {
        self.matcher.all_domains()
    }

    /// Register a callback for discovered subdomains. Each invocation
    /// runs on its own task with panic isolation.
    pub fn on_subdomain_found<F>(&self, callback: F)
    where
        F: Fn(SubdomainEvent) + Send + Sync + 'static,
    {
        self.bus
            .subscribe(EventKind::SubdomainDiscovered, move |event| {
                if let Event::SubdomainDiscovered(discovery) = event {
                    callback(discovery);
                }
            });
    }

    /// Register a callback for error events
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(ErrorEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(EventKind::ErrorOccurred, move |event| {
            if let Event::ErrorOccurred(err) = event {
                callback(err);
            }
        });
    }

    /// True while the engine is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Aggregate statistics snapshot
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            processed_certificates: self.counters.processed.load(Ordering::Relaxed),
            discovered_subdomains: self.counters.discovered.load(Ordering::Relaxed),
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }

    /// Domain matcher statistics snapshot
    pub fn matcher_stats(&self) -> MatcherStats {
        self.matcher.stats()
    }

    /// Aggregate status with per-watcher detail
    pub fn status(&self) -> EngineStatus {
        let watchers = self.watchers.lock().expect("engine lock poisoned");
        let watcher_statuses: HashMap<String, WatcherStatus> = watchers
            .iter()
            .map(|(url, watcher)| (url.clone(), watcher.status()))
            .collect();

        EngineStatus {
            is_running: self.is_running(),
            started_at: *self.started_at.lock().expect("engine lock poisoned"),
            uptime: self.uptime(),
            processed_certificates: self.counters.processed.load(Ordering::Relaxed),
            discovered_subdomains: self.counters.discovered.load(Ordering::Relaxed),
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            active_watchers: watcher_statuses.len(),
            watchers: watcher_statuses,
        }
    }

    /// The event bus, for consumers that want raw event access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .expect("engine lock poisoned")
            .map(|started| (Utc::now() - started).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    fn report_watcher_failure(&self, log_url: &str, err: &CtError) {
        error!(log = %log_url, "failed to start watcher: {}", err);
        let mut context = HashMap::new();
        context.insert("log_url".to_string(), log_url.to_string());
        self.bus.publish(Event::ErrorOccurred(ErrorEvent {
            error_type: "watcher_init".to_string(),
            message: err.to_string(),
            context,
            severity: Severity::High,
            recoverable: true,
        }));
    }
}
