// High-performance domain matcher
//
// Composes three filter stages over every candidate DNS name: a Bloom
// filter for constant-time rejection of non-watched roots, a
// recently-seen LRU that suppresses duplicate work on hot subdomains, and
// a trie holding the exact watched set. The canonical domain set and its
// derived indices live under one read/write lock; the match hot path only
// takes the shared side.

pub mod bloom;
pub mod cache;
pub mod trie;

pub use bloom::{BloomStats, DomainBloom};
pub use cache::{CacheStats, RecentCache};
pub use trie::{DomainTrie, TrieStats};

use crate::config::MatcherConfig;
use crate::error::CtError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// A watched registrable domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedDomain {
    /// Normalised name (lowercased, no trailing dot, wildcard label stripped)
    pub name: String,
    /// True when the domain was registered with a leading `*.`
    pub is_wildcard: bool,
    /// When the domain was added
    pub added_at: DateTime<Utc>,
}

/// One successful match of a candidate name against the watched set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMatch {
    /// The candidate name that matched
    pub subdomain: String,
    /// The watched registrable domain it falls under
    pub root_domain: String,
    /// When the match was made
    pub matched_at: DateTime<Utc>,
    /// Match classification; always `root_domain` for registrable-root hits
    pub match_type: String,
    /// Match confidence, 0..=1
    pub confidence: f64,
    /// Lifetime hits on this watched domain
    pub hit_count: u64,
}

/// Aggregated matcher statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatcherStats {
    pub total_domains: u64,
    pub wildcard_domains: u64,
    pub total_matches: u64,
    pub bloom_hits: u64,
    pub bloom_misses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub trie_hits: u64,
    pub trie_misses: u64,
    pub cache_hit_rate: f64,
    pub bloom: Option<BloomStats>,
    pub trie: TrieStats,
    pub cache: Option<CacheStats>,
}

#[derive(Default)]
struct Counters {
    total_matches: AtomicU64,
    bloom_hits: AtomicU64,
    bloom_misses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    trie_hits: AtomicU64,
    trie_misses: AtomicU64,
}

struct MatcherInner {
    domains: HashMap<String, WatchedDomain>,
    trie: DomainTrie,
    bloom: Option<DomainBloom>,
}

/// The three-stage domain matcher
pub struct DomainMatcher {
    config: MatcherConfig,
    inner: RwLock<MatcherInner>,
    cache: Option<RecentCache>,
    counters: Counters,
}

impl DomainMatcher {
    /// Create a matcher with the given configuration
    pub fn new(config: MatcherConfig) -> Self {
        let bloom = config
            .enable_bloom
            .then(|| DomainBloom::new(config.bloom_size, config.bloom_hashes));
        let cache = config.enable_lru.then(|| RecentCache::new(config.lru_size));

        Self {
            config,
            inner: RwLock::new(MatcherInner {
                domains: HashMap::new(),
                trie: DomainTrie::new(),
                bloom,
            }),
            cache,
            counters: Counters::default(),
        }
    }

    /// Add a watched registrable domain. Idempotent; invalid syntax is an
    /// error with no side effect.
    pub fn add_domain(&self, domain: &str) -> Result<()> {
        let normalized = self.normalize(domain);
        let (key, is_wildcard) = split_wildcard(&normalized);
        self.validate(domain, key)?;

        let mut inner = self.inner.write().expect("matcher lock poisoned");
        if inner.domains.contains_key(key) {
            return Ok(());
        }

        inner.domains.insert(
            key.to_string(),
            WatchedDomain {
                name: key.to_string(),
                is_wildcard,
                added_at: Utc::now(),
            },
        );
        inner.trie.insert(key);
        if let Some(bloom) = inner.bloom.as_mut() {
            bloom.insert(key);
        }
        Ok(())
    }

    /// Remove a watched domain.
    ///
    /// The trie and the Bloom filter are rebuilt from the canonical set
    /// (the filter cannot forget single items) and the recently-seen cache
    /// is cleared so previously suppressed subdomains can match again.
    pub fn remove_domain(&self, domain: &str) -> Result<()> {
        let normalized = self.normalize(domain);
        let (key, _) = split_wildcard(&normalized);
        if key.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write().expect("matcher lock poisoned");
        if inner.domains.remove(key).is_none() {
            return Ok(());
        }
        Self::rebuild_indices(&mut inner);
        drop(inner);

        if let Some(cache) = &self.cache {
            cache.clear();
        }
        Ok(())
    }

    /// True when the (normalised) domain is in the watched set
    pub fn has_domain(&self, domain: &str) -> bool {
        let normalized = self.normalize(domain);
        let (key, _) = split_wildcard(&normalized);
        let inner = self.inner.read().expect("matcher lock poisoned");
        inner.domains.contains_key(key)
    }

    /// All watched domains
    pub fn all_domains(&self) -> Vec<String> {
        let inner = self.inner.read().expect("matcher lock poisoned");
        inner.domains.keys().cloned().collect()
    }

    /// Number of watched domains
    pub fn len(&self) -> usize {
        let inner = self.inner.read().expect("matcher lock poisoned");
        inner.domains.len()
    }

    /// True when nothing is watched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Match a batch of candidate DNS names against the watched set.
    ///
    /// Per name: normalise, extract the registrable root, then run the
    /// Bloom → recently-seen → trie pipeline. A name matches when its
    /// registrable root equals a watched root; a bare watched root matches
    /// itself; `*.example.com` matches as `example.com`.
    pub fn match_subdomains(&self, names: &[String]) -> Vec<DomainMatch> {
        let mut matches = Vec::new();
        let inner = self.inner.read().expect("matcher lock poisoned");

        for name in names {
            let normalized = self.normalize(name);
            if normalized.is_empty() || normalized.len() > self.config.max_domain_len {
                continue;
            }

            let root = match registrable_root(&normalized) {
                Some(root) => root,
                None => continue,
            };

            if let Some(bloom) = &inner.bloom {
                if !bloom.contains(&root) {
                    self.counters.bloom_misses.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                self.counters.bloom_hits.fetch_add(1, Ordering::Relaxed);
            }

            if let Some(cache) = &self.cache {
                if cache.touch(&normalized) {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
            }

            match inner.trie.search(&root) {
                Some(terminal) => {
                    let hit_count = terminal.record_hit();
                    self.counters.trie_hits.fetch_add(1, Ordering::Relaxed);
                    self.counters.total_matches.fetch_add(1, Ordering::Relaxed);

                    matches.push(DomainMatch {
                        subdomain: normalized.clone(),
                        root_domain: root,
                        matched_at: Utc::now(),
                        match_type: "root_domain".to_string(),
                        confidence: 1.0,
                        hit_count,
                    });

                    if let Some(cache) = &self.cache {
                        cache.insert(&normalized);
                    }
                }
                None => {
                    self.counters.trie_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        matches
    }

    /// True when `subdomain` sits strictly below `root` in the DNS tree
    pub fn is_subdomain_of(&self, subdomain: &str, root: &str) -> bool {
        let sub = self.normalize(subdomain);
        let root = self.normalize(root);
        if sub.is_empty() || root.is_empty() || sub == root {
            return false;
        }
        sub.strip_suffix(&root)
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> MatcherStats {
        let inner = self.inner.read().expect("matcher lock poisoned");
        let cache_hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;

        MatcherStats {
            total_domains: inner.domains.len() as u64,
            wildcard_domains: inner.domains.values().filter(|d| d.is_wildcard).count() as u64,
            total_matches: self.counters.total_matches.load(Ordering::Relaxed),
            bloom_hits: self.counters.bloom_hits.load(Ordering::Relaxed),
            bloom_misses: self.counters.bloom_misses.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            trie_hits: self.counters.trie_hits.load(Ordering::Relaxed),
            trie_misses: self.counters.trie_misses.load(Ordering::Relaxed),
            cache_hit_rate: if cache_total > 0 {
                cache_hits as f64 / cache_total as f64
            } else {
                0.0
            },
            bloom: inner.bloom.as_ref().map(DomainBloom::stats),
            trie: inner.trie.stats(),
            cache: self.cache.as_ref().map(RecentCache::stats),
        }
    }

    /// Drop every watched domain and reset all counters
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("matcher lock poisoned");
        inner.domains.clear();
        inner.trie.clear();
        if let Some(bloom) = inner.bloom.as_mut() {
            bloom.clear();
        }
        drop(inner);

        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.counters.total_matches.store(0, Ordering::Relaxed);
        self.counters.bloom_hits.store(0, Ordering::Relaxed);
        self.counters.bloom_misses.store(0, Ordering::Relaxed);
        self.counters.cache_hits.store(0, Ordering::Relaxed);
        self.counters.cache_misses.store(0, Ordering::Relaxed);
        self.counters.trie_hits.store(0, Ordering::Relaxed);
        self.counters.trie_misses.store(0, Ordering::Relaxed);
    }

    fn normalize(&self, domain: &str) -> String {
        normalize_domain(domain, self.config.case_sensitive)
    }

    fn validate(&self, original: &str, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CtError::InvalidDomain {
                domain: original.to_string(),
                reason: "empty after normalisation".to_string(),
            });
        }
        if key.len() > self.config.max_domain_len {
            return Err(CtError::InvalidDomain {
                domain: original.to_string(),
                reason: format!("longer than {} characters", self.config.max_domain_len),
            });
        }
        for ch in key.chars() {
            let ok = ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '*';
            if !ok {
                return Err(CtError::InvalidDomain {
                    domain: original.to_string(),
                    reason: format!("invalid character '{}'", ch),
                });
            }
        }
        Ok(())
    }

    fn rebuild_indices(inner: &mut MatcherInner) {
        inner.trie.clear();
        if let Some(bloom) = inner.bloom.as_mut() {
            bloom.clear();
        }
        let keys: Vec<String> = inner.domains.keys().cloned().collect();
        for key in keys {
            inner.trie.insert(&key);
            if let Some(bloom) = inner.bloom.as_mut() {
                bloom.insert(&key);
            }
        }
    }
}

/// Normalise a domain: trim whitespace, fold case unless `case_sensitive`,
/// strip one trailing dot
pub fn normalize_domain(domain: &str, case_sensitive: bool) -> String {
    let trimmed = domain.trim();
    let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
    if case_sensitive {
        trimmed.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

fn split_wildcard(normalized: &str) -> (&str, bool) {
    match normalized.strip_prefix("*.") {
        Some(rest) => (rest, true),
        None => (normalized, false),
    }
}

/// Registrable root of a DNS name via the public suffix list.
///
/// Uses the ICANN section only; an unknown or private suffix falls back to
/// the last two labels. A leading wildcard label is ignored. Expects an
/// already lowercased name.
pub fn registrable_root(name: &str) -> Option<String> {
    let name = name.strip_prefix("*.").unwrap_or(name);
    if name.is_empty() {
        return None;
    }

    match psl::suffix(name.as_bytes()) {
        Some(suffix) if suffix.is_known() && suffix.typ() == Some(psl::Type::Icann) => {
            match psl::domain_str(name) {
                Some(domain) => Some(domain.to_string()),
                None => last_two_labels(name),
            }
        }
        _ => last_two_labels(name),
    }
}

fn last_two_labels(name: &str) -> Option<String> {
    let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();
    match labels.len() {
        0 => None,
        1 => Some(labels[0].to_string()),
        n => Some(format!("{}.{}", labels[n - 2], labels[n - 1])),
    }
}
