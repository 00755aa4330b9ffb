// Exact-membership trie over watched registrable domains
//
// Paths spell out a watched domain character by character; terminal nodes
// hold the stored domain and an atomic hit counter so lookups can tick it
// under the matcher's shared read lock. Removal rebuilds the whole trie
// from the canonical set (removals are rare compared to queries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payload of a terminal trie node
pub struct TrieTerminal {
    /// The watched domain this node completes
    pub domain: String,
    /// When the domain was added
    pub added_at: DateTime<Utc>,
    /// Lookup hits on this domain
    pub hits: AtomicU64,
}

impl TrieTerminal {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            added_at: Utc::now(),
            hits: AtomicU64::new(0),
        }
    }

    /// Record a hit and return the new count
    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    terminal: Option<TrieTerminal>,
}

/// Character-keyed trie of watched domains
#[derive(Default)]
pub struct DomainTrie {
    root: TrieNode,
}

impl DomainTrie {
    /// Create an empty trie
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a domain; marks the final node terminal
    pub fn insert(&mut self, domain: &str) {
        let mut node = &mut self.root;
        for ch in domain.chars() {
            node = node.children.entry(ch).or_default();
        }
        if node.terminal.is_none() {
            node.terminal = Some(TrieTerminal::new(domain));
        }
    }

    /// Walk the trie; returns the terminal payload when `domain` is a
    /// watched domain
    pub fn search(&self, domain: &str) -> Option<&TrieTerminal> {
        let mut node = &self.root;
        for ch in domain.chars() {
            node = node.children.get(&ch)?;
        }
        node.terminal.as_ref()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.root = TrieNode::default();
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> TrieStats {
        let mut stats = TrieStats::default();
        traverse(&self.root, 0, &mut stats);
        stats
    }
}

fn traverse(node: &TrieNode, depth: usize, stats: &mut TrieStats) {
    stats.node_count += 1;
    if depth > stats.max_depth {
        stats.max_depth = depth;
    }
    if let Some(terminal) = &node.terminal {
        stats.domain_count += 1;
        stats.total_hits += terminal.hits.load(Ordering::Relaxed);
    }
    for child in node.children.values() {
        traverse(child, depth + 1, stats);
    }
}

/// Trie statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrieStats {
    pub node_count: u64,
    pub max_depth: usize,
    pub domain_count: u64,
    pub total_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_search() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com");
        trie.insert("example.co.uk");

        assert!(trie.search("example.com").is_some());
        assert!(trie.search("example.co.uk").is_some());
        assert!(trie.search("example.co").is_none());
        assert!(trie.search("example.org").is_none());
    }

    #[test]
    fn test_prefix_is_not_a_match() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com");
        // "example.com" is a path prefix of "example.community" but only
        // terminal nodes count.
        assert!(trie.search("example.community").is_none());
        assert!(trie.search("exam").is_none());
    }

    #[test]
    fn test_hit_counting() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com");

        let terminal = trie.search("example.com").unwrap();
        assert_eq!(terminal.record_hit(), 1);
        assert_eq!(terminal.record_hit(), 2);
        assert_eq!(trie.stats().total_hits, 2);
    }

    #[test]
    fn test_stats() {
        let mut trie = DomainTrie::new();
        trie.insert("a.io");
        trie.insert("b.io");

        let stats = trie.stats();
        assert_eq!(stats.domain_count, 2);
        assert_eq!(stats.max_depth, 4);
        assert!(stats.node_count > 4);
    }

    #[test]
    fn test_clear() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com");
        trie.clear();
        assert!(trie.search("example.com").is_none());
        assert_eq!(trie.stats().domain_count, 0);
    }

    #[test]
    fn test_duplicate_insert_keeps_first_terminal() {
        let mut trie = DomainTrie::new();
        trie.insert("example.com");
        trie.search("example.com").unwrap().record_hit();
        trie.insert("example.com");
        // Re-inserting must not reset the hit counter.
        assert_eq!(trie.stats().total_hits, 1);
    }
}
