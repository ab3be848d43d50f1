//! Bounded, TTL-aware LRU cache for entitlements and usage snapshots.
//!
//! Two independent keyspaces share one [`Cache`]: entitlements keyed by user id,
//! usage keyed by `user:resource:period_key`. Expiry is checked lazily on access.
//! Values are cloned on the way in and out, so callers never alias cached state.
//!
//! [`NoopCache`] always misses and discards writes, letting the manager run the
//! same code path with caching disabled.

use crate::clock::{Clock, SystemClock};
use crate::types::{Entitlement, Usage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Hit/miss/eviction counters plus current sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entitlement_entries: usize,
    pub usage_entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache capability consumed by the manager and the cache fallback.
pub trait Cache: Send + Sync + std::fmt::Debug {
    fn get_entitlement(&self, user_id: &str) -> Option<Entitlement>;
    fn set_entitlement(&self, entitlement: &Entitlement, ttl: Duration);
    fn invalidate_entitlement(&self, user_id: &str);

    fn get_usage(&self, key: &str) -> Option<Usage>;
    fn set_usage(&self, key: &str, usage: &Usage, ttl: Duration);
    fn invalidate_usage(&self, key: &str);

    fn stats(&self) -> CacheStats;
    fn clear(&self);
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    // Breaks ties when two entries share a last-access instant.
    seq: u64,
}

#[derive(Debug)]
struct Keyspace<V> {
    entries: HashMap<String, Entry<V>>,
    capacity: usize,
    next_seq: u64,
}

impl<V: Clone> Keyspace<V> {
    fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), capacity, next_seq: 0 }
    }

    /// Returns `None` on absent or expired; expired entries are dropped.
    fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let expired = match self.entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at <= now => true,
            Some(entry) => {
                entry.last_access = now;
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Inserts and reports how many entries were evicted to make room.
    fn set(&mut self, key: &str, value: V, ttl: Duration, now: DateTime<Utc>) -> u64 {
        let mut evicted = 0;
        if !self.entries.contains_key(key) && self.capacity > 0 {
            while self.entries.len() >= self.capacity {
                if !self.evict_lru() {
                    break;
                }
                evicted += 1;
            }
        }

        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at, last_access: now, seq });
        evicted
    }

    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| a.last_access.cmp(&b.last_access).then(a.seq.cmp(&b.seq)))
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process LRU cache.
#[derive(Debug)]
pub struct LruCache {
    entitlements: Mutex<Keyspace<Entitlement>>,
    usage: Mutex<Keyspace<Usage>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl LruCache {
    /// Capacities are entry counts per keyspace. A capacity of zero leaves that
    /// keyspace unbounded; [`Config::validate`](crate::Config::validate)
    /// rejects it for the manager's own cache.
    pub fn new(max_entitlements: usize, max_usage: usize) -> Self {
        Self {
            entitlements: Mutex::new(Keyspace::new(max_entitlements)),
            usage: Mutex::new(Keyspace::new(max_usage)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn record<V>(&self, found: Option<V>) -> Option<V> {
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }
}

impl Cache for LruCache {
    fn get_entitlement(&self, user_id: &str) -> Option<Entitlement> {
        let now = self.clock.now();
        let found = lock(&self.entitlements).get(user_id, now);
        self.record(found)
    }

    fn set_entitlement(&self, entitlement: &Entitlement, ttl: Duration) {
        let now = self.clock.now();
        let evicted =
            lock(&self.entitlements).set(&entitlement.user_id, entitlement.clone(), ttl, now);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    fn invalidate_entitlement(&self, user_id: &str) {
        lock(&self.entitlements).entries.remove(user_id);
    }

    fn get_usage(&self, key: &str) -> Option<Usage> {
        let now = self.clock.now();
        let found = lock(&self.usage).get(key, now);
        self.record(found)
    }

    fn set_usage(&self, key: &str, usage: &Usage, ttl: Duration) {
        let now = self.clock.now();
        let evicted = lock(&self.usage).set(key, usage.clone(), ttl, now);
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
    }

    fn invalidate_usage(&self, key: &str) {
        lock(&self.usage).entries.remove(key);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entitlement_entries: lock(&self.entitlements).entries.len(),
            usage_entries: lock(&self.usage).entries.len(),
        }
    }

    fn clear(&self) {
        lock(&self.entitlements).entries.clear();
        lock(&self.usage).entries.clear();
    }
}

/// Cache used when caching is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl Cache for NoopCache {
    fn get_entitlement(&self, _user_id: &str) -> Option<Entitlement> {
        None
    }
    fn set_entitlement(&self, _entitlement: &Entitlement, _ttl: Duration) {}
    fn invalidate_entitlement(&self, _user_id: &str) {}
    fn get_usage(&self, _key: &str) -> Option<Usage> {
        None
    }
    fn set_usage(&self, _key: &str, _usage: &Usage, _ttl: Duration) {}
    fn invalidate_usage(&self, _key: &str) {}
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
    fn clear(&self) {}
}
