//! In-process recency cache with LRU eviction
//!
//! First tier of the lookup path: a bounded map from classification code to
//! the resolved concept, shared by every caller in the process. One mutex
//! guards the whole structure and no I/O ever happens under it, so hold
//! times stay O(1).
//!
//! Recency is tracked with a stamped queue: every touch pushes a fresh
//! (stamp, key) pair and bumps the entry's stamp, and eviction skips queue
//! pairs whose stamp is no longer current. The queue is compacted once it
//! outgrows a small multiple of the capacity, keeping all operations O(1)
//! amortized.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::Concept;

/// Hit/miss/eviction counters for the recency tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Current number of entries
    pub entries: usize,
    /// Entries evicted to stay within capacity
    pub evictions: u64,
}

impl CacheStats {
    /// Total lookups observed
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate in [0.0, 1.0]; 0.0 when nothing was looked up yet
    pub fn hit_rate(&self) -> f64 {
        if self.requests() == 0 {
            return 0.0;
        }
        self.hits as f64 / self.requests() as f64
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "entries: {}, hits: {}, misses: {}, evictions: {}, hit rate: {:.1}%",
            self.entries,
            self.hits,
            self.misses,
            self.evictions,
            self.hit_rate() * 100.0
        )
    }
}

/// Bounded code → concept cache with least-recently-used eviction
pub struct RecencyCache {
    capacity: usize,
    track_stats: bool,
    store: Mutex<RecencyStore>,
}

/// Internal storage behind the single guard
struct RecencyStore {
    entries: HashMap<String, StampedEntry>,
    queue: VecDeque<(u64, String)>,
    next_stamp: u64,
    stats: CacheStats,
}

struct StampedEntry {
    value: Arc<Concept>,
    stamp: u64,
}

impl RecencyCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize, track_stats: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            track_stats,
            store: Mutex::new(RecencyStore {
                entries: HashMap::new(),
                queue: VecDeque::new(),
                next_stamp: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Looks up a concept by code, refreshing its recency on a hit.
    pub async fn get(&self, code: &str) -> Option<Arc<Concept>> {
        let mut store = self.store.lock().await;
        let stamp = store.next_stamp;

        let value = match store.entries.get_mut(code) {
            Some(entry) => {
                entry.stamp = stamp;
                Some(entry.value.clone())
            }
            None => None,
        };

        match value {
            Some(value) => {
                store.next_stamp += 1;
                store.queue.push_back((stamp, code.to_string()));
                store.compact_if_needed(self.capacity);
                if self.track_stats {
                    store.stats.hits += 1;
                }
                Some(value)
            }
            None => {
                if self.track_stats {
                    store.stats.misses += 1;
                }
                None
            }
        }
    }

    /// Inserts or replaces the concept for a code, evicting the least
    /// recently used entry when over capacity.
    pub async fn put(&self, code: impl Into<String>, value: Arc<Concept>) {
        let code = code.into();
        let mut store = self.store.lock().await;
        let stamp = store.next_stamp;
        store.next_stamp += 1;

        let replaced = store
            .entries
            .insert(code.clone(), StampedEntry { value, stamp })
            .is_some();
        store.queue.push_back((stamp, code));

        if !replaced {
            store.evict_over_capacity(self.capacity, self.track_stats);
        }
        store.compact_if_needed(self.capacity);
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.store.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every entry; counters survive.
    pub async fn clear(&self) {
        let mut store = self.store.lock().await;
        store.entries.clear();
        store.queue.clear();
        debug!("Recency cache cleared");
    }

    /// Snapshot of the cache counters.
    pub async fn stats(&self) -> CacheStats {
        let store = self.store.lock().await;
        let mut stats = store.stats.clone();
        stats.entries = store.entries.len();
        stats
    }
}

impl RecencyStore {
    fn evict_over_capacity(&mut self, capacity: usize, track_stats: bool) {
        while self.entries.len() > capacity {
            let Some((stamp, code)) = self.queue.pop_front() else {
                break;
            };
            // stale pair: the entry was touched again after this was queued
            let current = self
                .entries
                .get(&code)
                .map(|entry| entry.stamp == stamp)
                .unwrap_or(false);
            if current {
                self.entries.remove(&code);
                if track_stats {
                    self.stats.evictions += 1;
                }
                debug!(code = %code, "Evicted least recently used entry");
            }
        }
    }

    fn compact_if_needed(&mut self, capacity: usize) {
        if self.queue.len() <= capacity.saturating_mul(4).max(64) {
            return;
        }
        let entries = &self.entries;
        self.queue
            .retain(|(stamp, code)| entries.get(code).map(|e| e.stamp == *stamp).unwrap_or(false));
    }
}
