// Event types and the typed publish/subscribe bus
//
// Discovery, processing, error and lifecycle events flow through one
// EventBus. Handlers never run on the publishing task, and a panicking
// handler cannot break the others.

use crate::parser::CertRecord;
use crate::watcher::WatcherState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::error;

/// Event classes carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubdomainDiscovered,
    CertificateProcessed,
    ErrorOccurred,
    WatcherStatusChanged,
    EngineStarted,
    EngineStopped,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::SubdomainDiscovered => "subdomain_discovered",
            EventKind::CertificateProcessed => "certificate_processed",
            EventKind::ErrorOccurred => "error_occurred",
            EventKind::WatcherStatusChanged => "watcher_status_changed",
            EventKind::EngineStarted => "engine_started",
            EventKind::EngineStopped => "engine_stopped",
        };
        write!(f, "{}", name)
    }
}

/// Error severity for `ErrorOccurred` events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A watched-domain hit on a freshly logged certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubdomainEvent {
    /// The DNS name that matched
    pub subdomain: String,
    /// The watched registrable domain it falls under
    pub root_domain: String,
    /// The certificate the name was found in
    pub certificate: CertRecord,
    /// When the match was made
    pub discovered_at: DateTime<Utc>,
    /// Opaque event identifier
    pub event_id: String,
    /// First sighting in this process lifetime
    pub is_new: bool,
}

/// Emitted for every successfully parsed certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateProcessedEvent {
    pub certificate: CertRecord,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A recoverable or fatal error somewhere in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub severity: Severity,
    pub recoverable: bool,
}

impl ErrorEvent {
    /// Internal error reported by the bus itself (handler panic etc.)
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            error_type: "internal_error".to_string(),
            message: message.into(),
            context: HashMap::new(),
            severity: Severity::Medium,
            recoverable: true,
        }
    }
}

/// A watcher state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatusEvent {
    pub log_url: String,
    pub old_state: WatcherState,
    pub new_state: WatcherState,
    pub reason: String,
}

/// Engine lifecycle payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<crate::engine::EngineStats>,
}

/// All events carried by the bus
#[derive(Debug, Clone)]
pub enum Event {
    SubdomainDiscovered(SubdomainEvent),
    CertificateProcessed(CertificateProcessedEvent),
    ErrorOccurred(ErrorEvent),
    WatcherStatusChanged(WatcherStatusEvent),
    EngineStarted(LifecycleEvent),
    EngineStopped(LifecycleEvent),
}

impl Event {
    /// The kind handlers subscribe under
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SubdomainDiscovered(_) => EventKind::SubdomainDiscovered,
            Event::CertificateProcessed(_) => EventKind::CertificateProcessed,
            Event::ErrorOccurred(_) => EventKind::ErrorOccurred,
            Event::WatcherStatusChanged(_) => EventKind::WatcherStatusChanged,
            Event::EngineStarted(_) => EventKind::EngineStarted,
            Event::EngineStopped(_) => EventKind::EngineStopped,
        }
    }
}

/// Generate an opaque event identifier
pub fn generate_event_id() -> String {
    format!("evt_{}", uuid::Uuid::new_v4().simple())
}

/// Registered event handler
pub type Handler = Arc<dyn Fn(Event) + Send + Sync + 'static>;

/// Typed publish/subscribe bus
///
/// Subscriptions are write-once at startup; there is no unsubscribe. For
/// each publish, one task is spawned that invokes the kind's handlers in
/// registration order. A panic in one handler is caught, logged and
/// reported as an internal error event; the remaining handlers still run.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    handler_panics: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            handler_panics: AtomicU64::new(0),
        }
    }

    /// Register a handler for one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().expect("event bus lock poisoned");
        handlers.entry(kind).or_default().push(Arc::new(handler));
    }

    /// Number of handlers registered for a kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let handlers = self.handlers.read().expect("event bus lock poisoned");
        handlers.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Total handler panics caught since startup
    pub fn handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    /// Publish an event to all handlers of its kind.
    ///
    /// Returns immediately; handlers run on a freshly spawned task so slow
    /// or misbehaving consumers never stall the producer. Must be called
    /// from within a tokio runtime.
    pub fn publish(self: &Arc<Self>, event: Event) {
        let handlers = {
            let map = self.handlers.read().expect("event bus lock poisoned");
            match map.get(&event.kind()) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return,
            }
        };

        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let kind = event.kind();
            for handler in handlers {
                let ev = event.clone();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(ev))) {
                    bus.handler_panics.fetch_add(1, Ordering::Relaxed);
                    let message = panic_message(&panic);
                    error!(kind = %kind, "event handler panicked: {}", message);
                    if kind != EventKind::ErrorOccurred {
                        bus.publish(Event::ErrorOccurred(ErrorEvent::internal(format!(
                            "handler for {} panicked: {}",
                            kind, message
                        ))));
                    }
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn error_event(message: &str) -> Event {
        Event::ErrorOccurred(ErrorEvent {
            error_type: "test".to_string(),
            message: message.to_string(),
            context: HashMap::new(),
            severity: Severity::Low,
            recoverable: true,
        })
    }

    #[test]
    fn test_subscribe_and_count() {
        let bus = EventBus::new();
        assert_eq!(bus.handler_count(EventKind::ErrorOccurred), 0);

        bus.subscribe(EventKind::ErrorOccurred, |_| {});
        bus.subscribe(EventKind::ErrorOccurred, |_| {});
        assert_eq!(bus.handler_count(EventKind::ErrorOccurred), 2);
        assert_eq!(bus.handler_count(EventKind::SubdomainDiscovered), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publish_reaches_handlers_in_order() {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        bus.subscribe(EventKind::ErrorOccurred, move |_| {
            tx1.send(1).unwrap();
        });
        let tx2 = tx;
        bus.subscribe(EventKind::ErrorOccurred, move |_| {
            tx2.send(2).unwrap();
        });

        bus.publish(error_event("ping"));

        let first = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_handler_does_not_break_others() {
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::channel();

        bus.subscribe(EventKind::CertificateProcessed, |_| {
            panic!("boom");
        });
        bus.subscribe(EventKind::CertificateProcessed, move |_| {
            tx.send(()).unwrap();
        });

        let record = crate::parser::CertRecord {
            log_url: "https://ct.example.test/".to_string(),
            index: 1,
            timestamp: Utc::now(),
            common_name: None,
            dns_names: vec![],
        };
        bus.publish(Event::CertificateProcessed(CertificateProcessedEvent {
            certificate: record,
            success: true,
            error: None,
        }));

        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(bus.handler_panics(), 1);
    }

    #[test]
    fn test_event_id_shape() {
        let id = generate_event_id();
        assert!(id.starts_with("evt_"));
        assert!(id.len() > 10);
    }
}
