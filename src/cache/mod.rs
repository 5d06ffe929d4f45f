//! LRU result cache.
//!
//! Bounded associative store mapping request fingerprints to computed
//! results: LRU eviction via a monotonic touch counter, TTL expiry (lazy on
//! access plus periodic sweep), byte accounting over the serialised value
//! size, and hit-rate statistics.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;

/// Size estimate when a value refuses to serialise.
const SIZE_FALLBACK_BYTES: u64 = 1024;

struct CacheEntry {
    value: Value,
    bytes: u64,
    inserted_at: Instant,
    last_access: Instant,
    access_count: u64,
    /// Monotonic touch counter; the minimum identifies the LRU entry.
    touch: u64,
    /// Insertion sequence, breaks touch ties deterministically.
    seq: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    touch_counter: u64,
    seq_counter: u64,
}

#[derive(Default)]
struct CacheCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    rejected: AtomicU64,
    access_ns_total: AtomicU64,
    access_samples: AtomicU64,
}

/// Point-in-time view of the cache statistics.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expired: u64,
    pub rejected: u64,
    pub item_count: usize,
    pub total_bytes: u64,
    pub avg_access_time_us: f64,
    /// Age of the oldest entry by insertion time, milliseconds.
    pub oldest_entry_age_ms: Option<u64>,
    pub newest_entry_age_ms: Option<u64>,
}

/// Bounded key->result store with TTL, LRU eviction, and byte accounting.
///
/// All mutation goes through a single interior lock covering the map and
/// every counter it depends on; `get` and `put` never panic.
pub struct ResultCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    counters: CacheCounters,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                touch_counter: 0,
                seq_counter: 0,
            }),
            counters: CacheCounters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a result. Expired entries are deleted and count as misses;
    /// hits update recency and the access counters.
    pub fn get(&self, key: &str) -> Option<Value> {
        let started = std::time::Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            None => {
                drop(state);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.record_access(started);
                return None;
            }
            Some(entry) => now.duration_since(entry.inserted_at) >= self.config.ttl,
        };

        if expired {
            if let Some(entry) = state.entries.remove(key) {
                state.total_bytes -= entry.bytes;
            }
            drop(state);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.record_access(started);
            return None;
        }

        state.touch_counter += 1;
        let touch = state.touch_counter;
        let entry = state.entries.get_mut(key).expect("checked above");
        entry.touch = touch;
        entry.last_access = now;
        entry.access_count += 1;
        let value = entry.value.clone();
        drop(state);

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.record_access(started);
        Some(value)
    }

    /// Insert a result, evicting LRU entries until both the entry-count and
    /// byte caps have headroom. Returns false (and caches nothing) when the
    /// single value already exceeds the byte cap.
    pub fn put(&self, key: &str, value: Value) -> bool {
        let bytes = serialized_size(&value);
        if bytes > self.config.max_bytes {
            warn!(key, bytes, cap = self.config.max_bytes, "value exceeds cache memory cap");
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(old) = state.entries.remove(key) {
            state.total_bytes -= old.bytes;
        }

        while !state.entries.is_empty()
            && (state.entries.len() >= self.config.max_entries
                || state.total_bytes + bytes > self.config.max_bytes)
        {
            if let Some(lru_key) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.touch, e.seq))
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = state.entries.remove(&lru_key) {
                    state.total_bytes -= evicted.bytes;
                    let idle_ms = now.duration_since(evicted.last_access).as_millis() as u64;
                    debug!(key = %lru_key, idle_ms, "evicted LRU cache entry");
                }
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }

        state.touch_counter += 1;
        state.seq_counter += 1;
        let entry = CacheEntry {
            value,
            bytes,
            inserted_at: now,
            last_access: now,
            access_count: 0,
            touch: state.touch_counter,
            seq: state.seq_counter,
        };
        state.total_bytes += bytes;
        state.entries.insert(key.to_string(), entry);
        true
    }

    /// Presence check. Removes an expired entry but does not touch the
    /// hit/miss counters or recency.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            None => return false,
            Some(entry) => now.duration_since(entry.inserted_at) >= self.config.ttl,
        };
        if expired {
            if let Some(entry) = state.entries.remove(key) {
                state.total_bytes -= entry.bytes;
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(key) {
            state.total_bytes -= entry.bytes;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    /// Sweep all entries and drop the expired ones. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut state = self.state.lock();
        let before = state.entries.len();
        let mut freed = 0u64;
        state.entries.retain(|_, entry| {
            if now.duration_since(entry.inserted_at) >= ttl {
                freed += entry.bytes;
                false
            } else {
                true
            }
        });
        state.total_bytes -= freed;
        let removed = before - state.entries.len();
        if removed > 0 {
            self.counters
                .expired
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "cache cleanup swept expired entries");
        }
        removed
    }

    /// Best-effort precompute of missing keys. Per-key provider failures are
    /// swallowed and only logged; returns how many values were inserted.
    pub fn warmup<F>(&self, keys: &[String], provider: F) -> usize
    where
        F: Fn(&str) -> anyhow::Result<Value>,
    {
        let mut inserted = 0;
        for key in keys {
            if self.has(key) {
                continue;
            }
            match provider(key) {
                Ok(value) => {
                    if self.put(key, value) {
                        inserted += 1;
                    }
                }
                Err(e) => debug!(key = %key, error = %e, "cache warmup provider failed"),
            }
        }
        inserted
    }

    /// Keys ordered by access count, descending.
    pub fn hot_keys(&self, limit: usize) -> Vec<(String, u64)> {
        let state = self.state.lock();
        let mut keys: Vec<(String, u64)> = state
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.access_count))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        keys.truncate(limit);
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let samples = self.counters.access_samples.load(Ordering::Relaxed);
        let access_ns = self.counters.access_ns_total.load(Ordering::Relaxed);

        let now = Instant::now();
        let state = self.state.lock();
        let oldest = state
            .entries
            .values()
            .map(|e| now.duration_since(e.inserted_at).as_millis() as u64)
            .max();
        let newest = state
            .entries
            .values()
            .map(|e| now.duration_since(e.inserted_at).as_millis() as u64)
            .min();

        CacheStats {
            requests,
            hits,
            misses: self.counters.misses.load(Ordering::Relaxed),
            hit_rate: if requests > 0 {
                hits as f64 / requests as f64
            } else {
                0.0
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            item_count: state.entries.len(),
            total_bytes: state.total_bytes,
            avg_access_time_us: if samples > 0 {
                access_ns as f64 / samples as f64 / 1000.0
            } else {
                0.0
            },
            oldest_entry_age_ms: oldest,
            newest_entry_age_ms: newest,
        }
    }

    fn record_access(&self, started: std::time::Instant) {
        self.counters
            .access_ns_total
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.counters.access_samples.fetch_add(1, Ordering::Relaxed);
    }
}

fn serialized_size(value: &Value) -> u64 {
    serde_json::to_string(value)
        .map(|s| s.len() as u64)
        .unwrap_or(SIZE_FALLBACK_BYTES)
}
