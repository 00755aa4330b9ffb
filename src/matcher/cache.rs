// Recently-seen subdomain cache
//
// Fixed-capacity LRU keyed by the full subdomain, used only to suppress
// repeated match work within one process lifetime. Losing entries is safe:
// the worst case is one re-emitted discovery event, which consumers must
// tolerate anyway.

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded LRU over recently matched subdomains.
///
/// Carries its own lock because lookups promote the entry (the cache
/// mutates on read).
pub struct RecentCache {
    inner: Mutex<LruCache<String, DateTime<Utc>>>,
    capacity: usize,
}

impl RecentCache {
    /// Create a cache holding at most `capacity` subdomains
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
            )),
            capacity,
        }
    }

    /// True when the subdomain was seen recently; promotes it to
    /// most-recently-used
    pub fn touch(&self, subdomain: &str) -> bool {
        let mut cache = self.inner.lock().expect("recent cache lock poisoned");
        cache.get(subdomain).is_some()
    }

    /// Record a subdomain, evicting the least-recently-used entry when full
    pub fn insert(&self, subdomain: &str) {
        let mut cache = self.inner.lock().expect("recent cache lock poisoned");
        cache.put(subdomain.to_string(), Utc::now());
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut cache = self.inner.lock().expect("recent cache lock poisoned");
        cache.clear();
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        let cache = self.inner.lock().expect("recent cache lock poisoned");
        cache.len()
    }

    /// True when no entries are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity,
            len: self.len(),
        }
    }
}

/// Recently-seen cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_touch() {
        let cache = RecentCache::new(10);
        assert!(!cache.touch("api.example.com"));

        cache.insert("api.example.com");
        assert!(cache.touch("api.example.com"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = RecentCache::new(3);
        for i in 0..10 {
            cache.insert(&format!("host{}.example.com", i));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = RecentCache::new(2);
        cache.insert("a.example.com");
        cache.insert("b.example.com");

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.touch("a.example.com"));
        cache.insert("c.example.com");

        assert!(cache.touch("a.example.com"));
        assert!(!cache.touch("b.example.com"));
        assert!(cache.touch("c.example.com"));
    }

    #[test]
    fn test_fresh_insert_survives_capacity_minus_one_inserts() {
        let n = 5;
        let cache = RecentCache::new(n);
        cache.insert("fresh.example.com");
        for i in 0..n - 1 {
            cache.insert(&format!("filler{}.example.com", i));
        }
        assert!(cache.touch("fresh.example.com"));
    }

    #[test]
    fn test_clear() {
        let cache = RecentCache::new(4);
        cache.insert("a.example.com");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.touch("a.example.com"));
    }
}
