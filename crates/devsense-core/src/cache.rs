//! Bounded key/value cache with LRU eviction and per-entry TTL
//!
//! Expiry is lazy: `get` treats an entry older than the TTL as absent and
//! drops it on the spot. `cleanup` sweeps every expired entry for callers
//! that want bounded memory between accesses.
//!
//! Timestamps come from `tokio::time::Instant`, which follows the paused
//! test clock when one is active.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Cache sizing and expiry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Entry time-to-live in milliseconds
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

fn default_capacity() -> usize {
    100
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

/// Counters reported by [`TtlCache::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
    /// hits / (hits + misses), 0.0 before any access
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    touched: Instant,
    tick: u64,
}

struct CacheInner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Recency order: lowest tick is least recently used
    recency: BTreeMap<u64, K>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry.value)
    }

    fn evict_lru(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, key)) => {
                self.entries.remove(&key);
                self.evictions += 1;
                true
            }
            None => false,
        }
    }
}

/// Fixed-capacity cache with least-recently-used eviction and lazy TTL expiry
///
/// All operations lock internally, so a cache can be shared behind an `Arc`.
pub struct TtlCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries, each valid for `ttl`
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::new()),
            capacity,
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, Duration::from_millis(config.ttl_ms))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry and mark it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let state = inner
            .entries
            .get(key)
            .map(|entry| now.duration_since(entry.touched) > self.ttl);
        let Some(expired) = state else {
            inner.misses += 1;
            return None;
        };

        if expired {
            inner.remove(key);
            inner.evictions += 1;
            inner.misses += 1;
            trace!("Cache entry expired on read");
            return None;
        }

        inner.hits += 1;
        let tick = inner.tick();
        let entry = inner.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        entry.touched = now;
        let value = entry.value.clone();
        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, key.clone());
        Some(value)
    }

    /// Insert or replace an entry, evicting the least recently used one if full
    pub fn set(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.remove(&key).is_none() && inner.entries.len() >= self.capacity {
            inner.evict_lru();
        }

        let tick = inner.tick();
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                touched: now,
                tick,
            },
        );
    }

    /// Remove an entry without touching the hit/miss counters
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// Whether a live entry exists, without refreshing recency or counting an access
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| now.duration_since(entry.touched) <= self.ttl)
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.touched) > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        inner.evictions += expired.len() as u64;

        if !expired.is_empty() {
            debug!(evicted = expired.len(), remaining = inner.entries.len(), "Cache cleanup");
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let accesses = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            capacity: self.capacity,
            hit_rate: if accesses == 0 {
                0.0
            } else {
                inner.hits as f64 / accesses as f64
            },
        }
    }

    /// Drop every entry and reset all counters
    pub fn clear(&self) {
        *self.inner.lock() = CacheInner::new();
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TtlCache")
            .field("size", &inner.entries.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}
