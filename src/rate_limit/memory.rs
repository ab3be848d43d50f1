use super::{state_key, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::QuotaError;
use crate::types::RateLimitDecision;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Checks between sweeps of idle per-key state.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug)]
struct Bucket {
    tokens: i64,
    last_refill: DateTime<Utc>,
    // From this instant the bucket is full again and carries no state.
    full_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Window {
    requests: VecDeque<DateTime<Utc>>,
    // Every recorded request has left the window by this instant.
    idle_at: DateTime<Utc>,
}

impl Window {
    fn new(now: DateTime<Utc>) -> Self {
        Self { requests: VecDeque::new(), idle_at: now }
    }
}

type Shards<T> = Mutex<HashMap<String, Arc<Mutex<T>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process limiter. State is per key and guarded by a per-key lock; the map
/// lock is held only long enough to find or create the entry.
///
/// Keys whose state has gone idle (a refilled bucket, an empty window) are
/// swept every [`SWEEP_EVERY`] checks, so the maps track active keys only.
#[derive(Debug)]
pub struct MemoryRateLimiter {
    buckets: Shards<Bucket>,
    windows: Shards<Window>,
    checks: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            checks: AtomicU64::new(0),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check and record one request at an explicit instant.
    pub fn check_at(
        &self,
        user_id: &str,
        resource: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.prune_at(now);
        }

        let key = state_key(user_id, resource);
        match &config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let bucket = self.bucket(&key, config, now);
                let mut bucket = lock(&bucket);
                take_token(&mut bucket, config, now)
            }
            RateLimitAlgorithm::SlidingWindow => {
                let window = shard(&self.windows, &key, || Window::new(now));
                let mut window = lock(&window);
                admit_window(&mut window, config, now)
            }
            RateLimitAlgorithm::Unknown(name) => {
                tracing::warn!(
                    algorithm = %name,
                    user_id = %user_id,
                    resource = %resource,
                    "unknown rate limit algorithm, allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: config.capacity(),
                    limit: config.capacity(),
                    reset_at: now,
                }
            }
        }
    }

    /// Record a request admitted elsewhere, without a limit check.
    pub fn record_at(
        &self,
        user_id: &str,
        resource: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) {
        let key = state_key(user_id, resource);
        match &config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let bucket = self.bucket(&key, config, now);
                let mut bucket = lock(&bucket);
                refill(&mut bucket, config, now);
                bucket.tokens = (bucket.tokens - 1).max(0);
                bucket.full_at = full_at(&bucket, config, now);
            }
            RateLimitAlgorithm::SlidingWindow => {
                let window = shard(&self.windows, &key, || Window::new(now));
                let mut window = lock(&window);
                window.requests.push_back(now);
                window.idle_at = idle_at(config, now);
            }
            RateLimitAlgorithm::Unknown(_) => {}
        }
    }

    /// Forget all state for one user and resource.
    pub fn reset(&self, user_id: &str, resource: &str) {
        let key = state_key(user_id, resource);
        lock(&self.buckets).remove(&key);
        lock(&self.windows).remove(&key);
    }

    /// Drop per-key state that has gone idle by `now`. Entries a caller is
    /// still holding are kept.
    pub fn prune_at(&self, now: DateTime<Utc>) {
        // Under the map lock nobody can clone an entry, so a count of one
        // means it is unused and its lock is free.
        lock(&self.buckets).retain(|_, b| Arc::strong_count(b) > 1 || lock(b).full_at > now);
        lock(&self.windows).retain(|_, w| Arc::strong_count(w) > 1 || lock(w).idle_at > now);
    }

    /// Number of keys with live state, across both algorithms.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.buckets).len() + lock(&self.windows).len()
    }

    fn bucket(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<Bucket>> {
        shard(&self.buckets, key, || Bucket {
            tokens: config.capacity(),
            last_refill: now,
            full_at: now,
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(
        &self,
        user_id: &str,
        resource: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, QuotaError> {
        Ok(self.check_at(user_id, resource, config, self.clock.now()))
    }
}

fn shard<T>(shards: &Shards<T>, key: &str, init: impl FnOnce() -> T) -> Arc<Mutex<T>> {
    lock(shards).entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(init()))).clone()
}

fn window_nanos(config: &RateLimitConfig) -> i128 {
    config.window.as_nanos().min(i64::MAX as u128) as i128
}

/// Time for `tokens` tokens to accrue at the configured rate.
fn time_for(tokens: i64, config: &RateLimitConfig) -> Duration {
    if config.rate <= 0 {
        return Duration::MAX;
    }
    let nanos = window_nanos(config) * tokens as i128 / config.rate as i128;
    Duration::nanoseconds(nanos.min(i64::MAX as i128) as i64)
}

/// When `bucket` will be back at capacity, rounding up.
fn full_at(bucket: &Bucket, config: &RateLimitConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let missing = (config.capacity() - bucket.tokens).max(0) as i128;
    if missing == 0 {
        return now;
    }
    if config.rate <= 0 {
        return DateTime::<Utc>::MAX_UTC;
    }
    let rate = config.rate as i128;
    let nanos = (window_nanos(config) * missing + rate - 1) / rate;
    now.checked_add_signed(Duration::nanoseconds(nanos.min(i64::MAX as i128) as i64))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn idle_at(config: &RateLimitConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    Duration::from_std(config.window)
        .ok()
        .and_then(|span| now.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn refill(bucket: &mut Bucket, config: &RateLimitConfig, now: DateTime<Utc>) {
    let capacity = config.capacity();
    if bucket.tokens > capacity {
        bucket.tokens = capacity;
    }
    let window = window_nanos(config);
    if config.rate <= 0 || window <= 0 {
        return;
    }
    let elapsed = (now - bucket.last_refill).num_nanoseconds().unwrap_or(i64::MAX).max(0) as i128;
    let added = config.rate as i128 * elapsed / window;
    if added > 0 {
        bucket.tokens = (bucket.tokens as i128 + added).min(capacity as i128) as i64;
        bucket.last_refill = now;
    }
}

fn take_token(bucket: &mut Bucket, config: &RateLimitConfig, now: DateTime<Utc>) -> RateLimitDecision {
    let capacity = config.capacity();
    if config.rate <= 0 {
        return RateLimitDecision {
            allowed: false,
            remaining: 0,
            limit: capacity,
            reset_at: now.checked_add_signed(time_for(1, config)).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
    }

    refill(bucket, config, now);
    if bucket.tokens > 0 {
        bucket.tokens -= 1;
        bucket.full_at = full_at(bucket, config, now);
        let missing = capacity - bucket.tokens;
        RateLimitDecision {
            allowed: true,
            remaining: bucket.tokens,
            limit: capacity,
            reset_at: now + time_for(missing, config),
        }
    } else {
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            limit: capacity,
            reset_at: bucket.last_refill + time_for(1, config),
        }
    }
}

fn admit_window(window: &mut Window, config: &RateLimitConfig, now: DateTime<Utc>) -> RateLimitDecision {
    let span = Duration::from_std(config.window).unwrap_or(Duration::MAX);
    let cutoff = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
    while window.requests.front().is_some_and(|&at| at <= cutoff) {
        window.requests.pop_front();
    }

    let limit = config.rate.max(0);
    let count = window.requests.len() as i64;
    if count < limit {
        window.requests.push_back(now);
        window.idle_at = idle_at(config, now);
        let oldest = window.requests.front().copied().unwrap_or(now);
        RateLimitDecision {
            allowed: true,
            remaining: limit - count - 1,
            limit,
            reset_at: oldest.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    } else {
        let oldest = window.requests.front().copied().unwrap_or(now);
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            limit,
            reset_at: oldest.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}
