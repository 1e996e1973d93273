//! Access-pattern-driven cache layer.
//!
//! Wraps the TTL store with per-key telemetry and computes a TTL for each
//! write from recent access frequency and hit rate. Hot keys live longer,
//! cold keys expire sooner, and critical keys can be preloaded in bulk.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde::Serialize;

use crate::cache::store::{CacheStats, TtlCache};
use crate::error::DispatchResult;

const ACCESS_LOG_MAX: usize = 200;
const ACCESS_LOG_KEEP: usize = 100;

/// Minimum adaptive TTL in minutes.
const TTL_FLOOR_MINUTES: u64 = 1;

/// Maximum adaptive TTL in minutes.
const TTL_CEIL_MINUTES: u64 = 120;

#[derive(Debug, Default, Clone, Copy)]
struct KeyCounters {
    hits: u64,
    total: u64,
}

/// A loader for one critical key, used by [`AdaptiveCache::preload`].
pub struct PreloadEntry<V> {
    /// Cache key to warm.
    pub key: String,

    /// Base TTL in minutes before adaptive adjustment.
    pub base_minutes: u64,

    /// Loader invoked on a cache miss.
    pub loader: Arc<dyn Fn() -> BoxFuture<'static, DispatchResult<V>> + Send + Sync>,
}

/// Snapshot of the adaptive layer plus the underlying store.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveCacheStats {
    /// Underlying store counters.
    pub store: CacheStats,

    /// Keys with recorded access telemetry.
    pub tracked_keys: usize,
}

/// TTL cache with per-key access telemetry and adaptive TTL computation.
///
/// Composes a [`TtlCache`]; it does not change the store's read semantics,
/// only the TTL chosen on writes that go through [`Self::get_or_load`].
pub struct AdaptiveCache<V> {
    store: TtlCache<V>,
    access_log: DashMap<String, Vec<DateTime<Utc>>>,
    counters: DashMap<String, KeyCounters>,
}

impl<V: Clone> AdaptiveCache<V> {
    /// Create an empty adaptive cache.
    pub fn new() -> Self {
        Self {
            store: TtlCache::new(),
            access_log: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Look up `key`; on a miss, run `loader` and store its value with the
    /// adaptively computed TTL. Two back-to-back calls for the same key run
    /// the loader once.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &str,
        base_minutes: u64,
        loader: F,
    ) -> DispatchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<V>>,
    {
        self.record_access(key);

        if let Some(value) = self.store.get(key) {
            self.bump(key, true);
            return Ok(value);
        }
        self.bump(key, false);

        let value = loader().await?;
        let ttl = self.optimal_ttl(key, base_minutes);
        self.store.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// TTL in minutes for `key`: the base scaled by recent access frequency
    /// and hit rate, clamped to 1..=120. Keys with fewer than 5 recorded
    /// accesses keep the base.
    pub fn optimal_ttl(&self, key: &str, base_minutes: u64) -> u64 {
        let (total_accesses, recent) = match self.access_log.get(key) {
            Some(log) => {
                let hour_ago = Utc::now() - Duration::hours(1);
                let recent = log.iter().filter(|at| **at >= hour_ago).count();
                (log.len(), recent)
            }
            None => (0, 0),
        };

        if total_accesses < 5 {
            return base_minutes;
        }

        let mut multiplier: f64 = if recent > 50 {
            3.0
        } else if recent > 20 {
            2.0
        } else if recent < 5 {
            0.5
        } else {
            1.0
        };

        if let Some(counters) = self.counters.get(key) {
            if counters.total > 10 {
                let hit_rate = counters.hits as f64 / counters.total as f64;
                if hit_rate > 0.9 {
                    multiplier *= 1.2;
                } else if hit_rate < 0.3 {
                    multiplier *= 0.8;
                }
            }
        }

        ((base_minutes as f64 * multiplier).floor() as u64)
            .clamp(TTL_FLOOR_MINUTES, TTL_CEIL_MINUTES)
    }

    /// Warm every entry concurrently. Individual loader failures are logged
    /// and do not affect the other entries. Returns (loaded, failed).
    pub async fn preload(&self, entries: Vec<PreloadEntry<V>>) -> (usize, usize) {
        let results = join_all(entries.into_iter().map(|entry| async move {
            let loader = Arc::clone(&entry.loader);
            let outcome = self
                .get_or_load(&entry.key, entry.base_minutes, move || loader())
                .await;
            if let Err(err) = &outcome {
                tracing::warn!(key = %entry.key, error = %err, "cache preload entry failed");
            }
            outcome.is_ok()
        }))
        .await;

        let loaded = results.iter().filter(|ok| **ok).count();
        (loaded, results.len() - loaded)
    }

    /// Remove every key containing `fragment` from the underlying store.
    pub fn invalidate(&self, fragment: &str) -> usize {
        self.store.invalidate(fragment)
    }

    /// Drop entries already past their TTL.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Clear stored values and all access telemetry.
    pub fn clear(&self) {
        self.store.clear();
        self.access_log.clear();
        self.counters.clear();
    }

    /// Snapshot of store counters plus tracked telemetry keys.
    pub fn stats(&self) -> AdaptiveCacheStats {
        AdaptiveCacheStats {
            store: self.store.stats(),
            tracked_keys: self.access_log.len(),
        }
    }

    fn record_access(&self, key: &str) {
        let mut log = self.access_log.entry(key.to_string()).or_default();
        log.push(Utc::now());
        if log.len() > ACCESS_LOG_MAX {
            let excess = log.len() - ACCESS_LOG_KEEP;
            log.drain(0..excess);
        }
    }

    fn bump(&self, key: &str, hit: bool) {
        let mut counters = self.counters.entry(key.to_string()).or_default();
        counters.total += 1;
        if hit {
            counters.hits += 1;
        }
    }
}

impl<V: Clone> Default for AdaptiveCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
