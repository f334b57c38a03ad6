//! In-memory resource cache with origin tagging.
//!
//! Entries have no TTL. A value stays until it is replaced by a newer commit
//! or explicitly cleared, so callers can rely on repeated loads being served
//! from memory for the lifetime of the loader.

use std::collections::HashMap;

use solarflow_core::{CacheOrigin, Timestamp};

/// One cached resource value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub origin: CacheOrigin,
    pub committed_at: Timestamp,
}

/// Hit and miss counters plus the current entry count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
}

impl CacheStats {
    /// Fraction of counted lookups that hit, `0.0` when nothing was counted.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Keyed value cache.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counted lookup. Use [`ResourceCache::peek`] for inspection that should
    /// not move the hit rate.
    pub fn lookup(&mut self, key: &str) -> Option<&CacheEntry> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Lookup without touching the counters.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn commit(&mut self, key: impl Into<String>, value: serde_json::Value, origin: CacheOrigin) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                origin,
                committed_at: chrono::Utc::now(),
            },
        );
    }

    /// Drop one entry. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry. Counters survive.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Cached keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entry_count: self.entries.len(),
        }
    }
}
