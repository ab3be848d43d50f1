//! Three-state circuit breaker guarding the storage backend.
//!
//! Only `closed` and `open` are stored. `half_open` is a read-time projection:
//! a breaker whose last failure is at least `reset_timeout` old reports
//! `half_open` without any timer firing. The next call decides: success closes
//! the circuit and clears the failure count, failure reopens it.
//!
//! Business outcomes (quota exceeded, not found, ...) mean the backend answered
//! and count as successes; see [`QuotaError::counts_as_backend_failure`].

use crate::clock::{Clock, SystemClock};
use crate::config::CircuitBreakerConfig;
use crate::error::QuotaError;
use crate::storage::Storage;
use crate::types::{
    ConsumeRequest, ConsumptionRecord, Entitlement, LimitAdjustment, Period, RateLimitDecision,
    RateLimitRequest, RefundRecord, RefundRequest, TierChangeRequest, Usage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Observed state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Reset timeout elapsed; the next call probes the backend.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called with `(from, to)` whenever the stored state actually changes.
pub type StateObserver = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    // Never HalfOpen; see `project`.
    raw: CircuitState,
    failures: usize,
    last_failure: Option<DateTime<Utc>>,
}

/// Circuit breaker shared by every storage call of one backend.
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.failures())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: RwLock::new(BreakerState {
                raw: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
            config,
            clock: Arc::new(SystemClock),
            observer: None,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current observed state.
    pub fn state(&self) -> CircuitState {
        let snapshot = *self.read();
        self.project(&snapshot, self.clock.now())
    }

    /// Consecutive failures recorded so far.
    pub fn failures(&self) -> usize {
        self.read().failures
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let previous = {
            let mut guard = self.write();
            let previous = self.project(&guard, self.clock.now());
            *guard = BreakerState { raw: CircuitState::Closed, failures: 0, last_failure: None };
            previous
        };
        if previous != CircuitState::Closed {
            tracing::info!(from = %previous, "Circuit breaker reset → closed");
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// # Errors
    /// Returns [`QuotaError::CircuitOpen`] without invoking `operation` when the
    /// observed state is open; otherwise returns the operation's own result.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, QuotaError>
    where
        Fut: Future<Output = Result<T, QuotaError>>,
        Op: FnOnce() -> Fut,
    {
        if !self.config.enabled {
            return operation().await;
        }

        self.admit()?;
        let result = operation().await;
        match &result {
            Err(err) if err.counts_as_backend_failure() => self.on_failure(),
            _ => self.on_success(),
        }
        result
    }

    fn admit(&self) -> Result<(), QuotaError> {
        let now = self.clock.now();
        let snapshot = *self.read();
        if self.project(&snapshot, now) != CircuitState::Open {
            return Ok(());
        }
        let open_for = snapshot
            .last_failure
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Err(QuotaError::CircuitOpen { failures: snapshot.failures, open_for })
    }

    fn on_success(&self) {
        let transition = {
            let mut guard = self.write();
            match self.project(&guard, self.clock.now()) {
                CircuitState::HalfOpen => {
                    *guard =
                        BreakerState { raw: CircuitState::Closed, failures: 0, last_failure: None };
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
                CircuitState::Closed => {
                    guard.failures = 0;
                    None
                }
                // A call admitted before the circuit opened; it proves nothing.
                CircuitState::Open => None,
            }
        };

        if let Some((from, to)) = transition {
            tracing::info!("Circuit breaker → closed");
            self.notify(from, to);
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let (transition, failures) = {
            let mut guard = self.write();
            let observed = self.project(&guard, now);
            guard.failures = guard.failures.saturating_add(1);
            guard.last_failure = Some(now);
            let transition = match observed {
                CircuitState::HalfOpen => Some((CircuitState::HalfOpen, CircuitState::Open)),
                CircuitState::Closed if guard.failures >= self.config.failure_threshold => {
                    guard.raw = CircuitState::Open;
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                _ => None,
            };
            (transition, guard.failures)
        };

        match transition {
            Some((CircuitState::HalfOpen, to)) => {
                tracing::warn!(failures, "Circuit breaker: test failed → open");
                self.notify(CircuitState::HalfOpen, to);
            }
            Some((from, to)) => {
                tracing::error!(
                    failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker → open"
                );
                self.notify(from, to);
            }
            None => {}
        }
    }

    fn project(&self, state: &BreakerState, now: DateTime<Utc>) -> CircuitState {
        if state.raw != CircuitState::Open {
            return state.raw;
        }
        let elapsed = state
            .last_failure
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.config.reset_timeout {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(observer) = &self.observer {
            observer(from, to);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BreakerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BreakerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`Storage`] decorator that routes every call through one [`CircuitBreaker`].
pub struct CircuitBreakerStorage<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> CircuitBreakerStorage<S> {
    pub fn new(inner: S, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: Storage> Storage for CircuitBreakerStorage<S> {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError> {
        self.breaker.execute(|| self.inner.get_entitlement(user_id)).await
    }

    async fn set_entitlement(&self, entitlement: &Entitlement) -> Result<(), QuotaError> {
        self.breaker.execute(|| self.inner.set_entitlement(entitlement)).await
    }

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Option<Usage>, QuotaError> {
        self.breaker.execute(|| self.inner.get_usage(user_id, resource, period)).await
    }

    async fn consume_quota(&self, req: &ConsumeRequest) -> Result<i64, QuotaError> {
        self.breaker.execute(|| self.inner.consume_quota(req)).await
    }

    async fn apply_tier_change(&self, req: &TierChangeRequest) -> Result<(), QuotaError> {
        self.breaker.execute(|| self.inner.apply_tier_change(req)).await
    }

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: &Usage,
        period: &Period,
    ) -> Result<(), QuotaError> {
        self.breaker.execute(|| self.inner.set_usage(user_id, resource, usage, period)).await
    }

    async fn refund_quota(&self, req: &RefundRequest) -> Result<i64, QuotaError> {
        self.breaker.execute(|| self.inner.refund_quota(req)).await
    }

    async fn get_refund_record(&self, key: &str) -> Result<Option<RefundRecord>, QuotaError> {
        self.breaker.execute(|| self.inner.get_refund_record(key)).await
    }

    async fn get_consumption_record(
        &self,
        key: &str,
    ) -> Result<Option<ConsumptionRecord>, QuotaError> {
        self.breaker.execute(|| self.inner.get_consumption_record(key)).await
    }

    async fn check_rate_limit(
        &self,
        req: &RateLimitRequest,
    ) -> Result<RateLimitDecision, QuotaError> {
        self.breaker.execute(|| self.inner.check_rate_limit(req)).await
    }

    async fn record_rate_limit_request(&self, req: &RateLimitRequest) -> Result<(), QuotaError> {
        self.breaker.execute(|| self.inner.record_rate_limit_request(req)).await
    }

    async fn add_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.breaker.execute(|| self.inner.add_limit(adj)).await
    }

    async fn subtract_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.breaker.execute(|| self.inner.subtract_limit(adj)).await
    }
}
