// Per-entry stream processing
//
// Glue between the watchers and the matcher: parse the raw certificate,
// publish a processed event, run the domain matcher and publish one
// discovery event per match. Event publication is asynchronous; this
// never blocks on consumers.

use crate::events::{
    generate_event_id, CertificateProcessedEvent, ErrorEvent, Event, EventBus, Severity,
    SubdomainEvent,
};
use crate::matcher::DomainMatcher;
use crate::parser::EntryParser;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Stream processor statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    /// Certificates successfully parsed
    pub total_processed: u64,
    /// Certificates with at least one watched-domain match
    pub total_matched: u64,
    /// Parse failures
    pub total_errors: u64,
}

/// Parser + matcher + event publisher, applied to every log entry
pub struct StreamProcessor {
    parser: EntryParser,
    matcher: Arc<DomainMatcher>,
    bus: Arc<EventBus>,
    processed: AtomicU64,
    matched: AtomicU64,
    errors: AtomicU64,
}

impl StreamProcessor {
    /// Create a processor wired to the given matcher and bus
    pub fn new(matcher: Arc<DomainMatcher>, bus: Arc<EventBus>) -> Self {
        Self {
            parser: EntryParser::new(),
            matcher,
            bus,
            processed: AtomicU64::new(0),
            matched: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Process one raw certificate.
    ///
    /// On parse failure the error counter is bumped, an error event is
    /// published and the error is returned - the caller still advances
    /// its checkpoint so a poisonous entry cannot stall the log forever.
    pub fn process_entry(
        &self,
        raw: &[u8],
        index: u64,
        timestamp: DateTime<Utc>,
        log_url: &str,
    ) -> Result<()> {
        let record = match self.parser.parse(raw, index, timestamp, log_url) {
            Ok(record) => record,
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                let mut context = HashMap::new();
                context.insert("log_url".to_string(), log_url.to_string());
                context.insert("index".to_string(), index.to_string());
                self.bus.publish(Event::ErrorOccurred(ErrorEvent {
                    error_type: "parse_error".to_string(),
                    message: err.to_string(),
                    context,
                    severity: Severity::Low,
                    recoverable: true,
                }));
                return Err(err);
            }
        };

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bus
            .publish(Event::CertificateProcessed(CertificateProcessedEvent {
                certificate: record.clone(),
                success: true,
                error: None,
            }));

        if record.dns_names.is_empty() {
            return Ok(());
        }

        let matches = self.matcher.match_subdomains(&record.dns_names);
        if matches.is_empty() {
            return Ok(());
        }

        self.matched.fetch_add(1, Ordering::Relaxed);
        debug!(
            log_url,
            index,
            matches = matches.len(),
            "watched domain hit"
        );

        for m in matches {
            self.bus
                .publish(Event::SubdomainDiscovered(SubdomainEvent {
                    subdomain: m.subdomain,
                    root_domain: m.root_domain,
                    certificate: record.clone(),
                    discovered_at: m.matched_at,
                    event_id: generate_event_id(),
                    is_new: true,
                }));
        }

        Ok(())
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            total_processed: self.processed.load(Ordering::Relaxed),
            total_matched: self.matched.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatcherConfig;
    use crate::events::EventKind;
    use std::sync::mpsc;
    use std::time::Duration;

    fn harness(watched: &[&str]) -> (StreamProcessor, mpsc::Receiver<Event>) {
        let matcher = Arc::new(DomainMatcher::new(MatcherConfig::default()));
        for domain in watched {
            matcher.add_domain(domain).unwrap();
        }
        let bus = Arc::new(EventBus::new());
        let (tx, rx) = mpsc::channel();
        for kind in [
            EventKind::SubdomainDiscovered,
            EventKind::CertificateProcessed,
            EventKind::ErrorOccurred,
        ] {
            let tx = tx.clone();
            bus.subscribe(kind, move |event| {
                let _ = tx.send(event);
            });
        }
        (StreamProcessor::new(matcher, bus), rx)
    }

    fn self_signed(names: &[&str]) -> Vec<u8> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let key = rcgen::generate_simple_self_signed(names).unwrap();
        key.cert.der().to_vec()
    }

    fn drain(rx: &mpsc::Receiver<Event>, wait: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(wait) {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_match_publishes_discovery() {
        let (processor, rx) = harness(&["example.com"]);
        let der = self_signed(&["api.example.com", "mail.other.test"]);

        processor
            .process_entry(&der, 10, Utc::now(), "https://log.test/")
            .unwrap();

        let events = drain(&rx, Duration::from_millis(500));
        let discoveries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::SubdomainDiscovered(d) => Some(d),
                _ => None,
            })
            .collect();

        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].subdomain, "api.example.com");
        assert_eq!(discoveries[0].root_domain, "example.com");
        assert_eq!(discoveries[0].certificate.index, 10);

        let processed = events
            .iter()
            .filter(|e| matches!(e, Event::CertificateProcessed(_)))
            .count();
        assert_eq!(processed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replay_is_suppressed() {
        let (processor, rx) = harness(&["example.com"]);
        let der = self_signed(&["api.example.com"]);

        processor
            .process_entry(&der, 1, Utc::now(), "https://log.test/")
            .unwrap();
        processor
            .process_entry(&der, 2, Utc::now(), "https://log.test/")
            .unwrap();

        let events = drain(&rx, Duration::from_millis(500));
        let discoveries = events
            .iter()
            .filter(|e| matches!(e, Event::SubdomainDiscovered(_)))
            .count();
        assert_eq!(discoveries, 1);

        assert_eq!(processor.stats().total_processed, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_match_publishes_processed_only() {
        let (processor, rx) = harness(&["example.com"]);
        let der = self_signed(&["foo.other.com"]);

        processor
            .process_entry(&der, 3, Utc::now(), "https://log.test/")
            .unwrap();

        let events = drain(&rx, Duration::from_millis(500));
        assert!(events
            .iter()
            .all(|e| !matches!(e, Event::SubdomainDiscovered(_))));
        let processed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::CertificateProcessed(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(processed.len(), 1);
        assert!(processed[0].success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_parse_failure_publishes_error() {
        let (processor, rx) = harness(&["example.com"]);
        let corrupt = vec![0xffu8; 200];

        let result = processor.process_entry(&corrupt, 5, Utc::now(), "https://log.test/");
        assert!(result.is_err());

        let events = drain(&rx, Duration::from_millis(500));
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::ErrorOccurred(err) => Some(err),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "parse_error");
        assert!(errors[0].recoverable);
        assert_eq!(errors[0].context.get("index").map(String::as_str), Some("5"));

        assert_eq!(processor.stats().total_errors, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_case_insensitive_pipeline() {
        let (processor, rx) = harness(&["Example.COM"]);
        let der = self_signed(&["API.Example.com"]);

        processor
            .process_entry(&der, 9, Utc::now(), "https://log.test/")
            .unwrap();

        let events = drain(&rx, Duration::from_millis(500));
        let discovery = events.iter().find_map(|e| match e {
            Event::SubdomainDiscovered(d) => Some(d),
            _ => None,
        });
        let discovery = discovery.expect("expected a discovery event");
        assert_eq!(discovery.root_domain, "example.com");
    }
}
