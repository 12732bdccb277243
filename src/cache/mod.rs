//! Response cache
//!
//! Bounded LRU map with a per-entry TTL. Expiry is checked lazily on read;
//! `purge_expired` sweeps the rest. Keys are blake3 digests of everything
//! that changes the result, not just the query text.

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Digest of the normalized query plus every parameter that affects the result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(normalized_query: &str, file_filter: Option<&str>, budget: usize) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalized_query.to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(file_filter.unwrap_or("").to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(budget.to_string().as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Fold one more result-affecting option into the key
    pub fn with_option(self, name: &str, value: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.0.as_bytes());
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    tick: u64,
}

struct Inner<V> {
    entries: AHashMap<CacheKey, Entry<V>>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    next_tick: u64,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn touch(&mut self, key: &CacheKey) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

pub struct ResponseCache<V> {
    inner: Mutex<Inner<V>>,
    max_entries: usize,
    default_ttl: Duration,
    clock: SharedClock,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: AHashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats::default(),
            }),
            max_entries: config.max_entries,
            default_ttl: Duration::seconds(config.ttl_secs as i64),
            clock,
        }
    }

    /// Fresh value for `key`, refreshing its recency
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let Some(expired) = inner.entries.get(key).map(|e| e.expires_at <= now) else {
            inner.stats.misses += 1;
            return None;
        };
        if expired {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.touch(key);
        inner.stats.hits += 1;
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: V) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: CacheKey, value: V, ttl: Duration) {
        if self.max_entries == 0 {
            return;
        }
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        inner.remove(&key);
        while inner.entries.len() >= self.max_entries {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.stats.evictions += 1;
        }

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                tick,
            },
        );
        inner.stats.inserts += 1;
    }

    /// Returns whether an entry was removed
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.recency.clear();
        tracing::info!("Response cache cleared");
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        inner.stats.expirations += expired.len() as u64;
        if !expired.is_empty() {
            tracing::debug!("Purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut stats = inner.stats.clone();
        stats.size = inner.entries.len();
        stats.capacity = self.max_entries;
        let lookups = stats.hits + stats.misses;
        stats.hit_rate = if lookups == 0 {
            0.0
        } else {
            stats.hits as f64 / lookups as f64
        };
        stats
    }
}
