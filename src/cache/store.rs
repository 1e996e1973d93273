//! TTL key-value cache with lazy expiration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// One cached value with its insertion instant and time-to-live.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Counters describing cache behavior since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Live entries currently stored.
    pub entries: usize,

    /// Reads that returned a value.
    pub hits: u64,

    /// Reads that found nothing.
    pub misses: u64,

    /// Reads that found an entry past its TTL and dropped it.
    pub expired: u64,
}

/// Process-local key-value store with per-entry TTL.
///
/// Expiration is lazy: an entry past its TTL is dropped on the read that
/// observes it. There is no eviction policy beyond TTL.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Look up `key`, returning `None` when absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `value` under `key` for `ttl_minutes`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl_minutes: u64) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl: Duration::from_secs(ttl_minutes * 60),
            },
        );
    }

    /// Remove every key containing `fragment`. Returns how many were
    /// removed. The match is unanchored.
    pub fn invalidate(&self, fragment: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.contains(fragment));
        before - self.entries.len()
    }

    /// Drop entries already past their TTL without waiting for a read.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including any not yet lazily expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
