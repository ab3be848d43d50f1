//! Telemetry events and sinks.
//!
//! The manager describes what it did as [`QuotaEvent`]s and hands them to a sink.
//! A sink is any `tower::Service<QuotaEvent, Response = ()>`, so sinks compose
//! with ordinary tower combinators. Emission is best-effort: a sink that is not
//! ready or fails simply drops the event.
//!
//! ```rust
//! use quotaguard::telemetry::{ConsumptionEvent, QuotaEvent};
//! use quotaguard::types::PeriodType;
//!
//! let event = QuotaEvent::Consumption(ConsumptionEvent::Consumed {
//!     resource: "api_calls".into(),
//!     period: PeriodType::Monthly,
//!     amount: 1,
//!     new_used: 41,
//! });
//! assert_eq!(event.kind(), "consumption");
//! assert_eq!(event.outcome(), "consumed");
//! ```

use crate::circuit_breaker::CircuitState;
use crate::types::PeriodType;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// Boxed error used by type-erased sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type-erased sink held by the manager.
pub type BoxedSink = tower::util::BoxCloneService<QuotaEvent, (), BoxError>;

/// A telemetry sink that consumes quota events.
pub trait TelemetrySink:
    tower::Service<QuotaEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + Sync + 'static;
}

/// Erase a concrete sink so it can be stored behind one type.
pub fn boxed<S>(sink: S) -> BoxedSink
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;
    BoxedSink::new(sink.map_err(|e| Box::new(e) as BoxError))
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: QuotaEvent)
where
    S: tower::Service<QuotaEvent, Response = ()> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Everything the manager reports.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    Consumption(ConsumptionEvent),
    RateLimit(RateLimitEvent),
    Cache(CacheEvent),
    Fallback(FallbackEvent),
    CircuitBreaker(CircuitBreakerEvent),
    /// A warning threshold was crossed.
    Warning { resource: String, threshold: f64, used: i64, limit: i64 },
}

impl QuotaEvent {
    /// Coarse category, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            QuotaEvent::Consumption(_) => "consumption",
            QuotaEvent::RateLimit(_) => "rate_limit",
            QuotaEvent::Cache(_) => "cache",
            QuotaEvent::Fallback(_) => "fallback",
            QuotaEvent::CircuitBreaker(_) => "circuit_breaker",
            QuotaEvent::Warning { .. } => "warning",
        }
    }

    /// Outcome within the category, used as a metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            QuotaEvent::Consumption(e) => match e {
                ConsumptionEvent::Consumed { .. } => "consumed",
                ConsumptionEvent::DryRun { .. } => "dry_run",
                ConsumptionEvent::Denied { .. } => "denied",
                ConsumptionEvent::Refunded { .. } => "refunded",
            },
            QuotaEvent::RateLimit(e) => match e {
                RateLimitEvent::Allowed { .. } => "allowed",
                RateLimitEvent::Denied { .. } => "denied",
                RateLimitEvent::FailedOpen { .. } => "failed_open",
            },
            QuotaEvent::Cache(e) => match e {
                CacheEvent::Hit { .. } => "hit",
                CacheEvent::Miss { .. } => "miss",
            },
            QuotaEvent::Fallback(e) => match e {
                FallbackEvent::Served { .. } => "served",
                FallbackEvent::OptimisticAllowed { .. } => "optimistic_allowed",
                FallbackEvent::Exhausted { .. } => "exhausted",
            },
            QuotaEvent::CircuitBreaker(e) => match e {
                CircuitBreakerEvent::Opened { .. } => "opened",
                CircuitBreakerEvent::Closed => "closed",
            },
            QuotaEvent::Warning { .. } => "threshold_crossed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumptionEvent {
    Consumed { resource: String, period: PeriodType, amount: i64, new_used: i64 },
    /// A dry run computed `would_be` without writing.
    DryRun { resource: String, period: PeriodType, amount: i64, would_be: i64 },
    Denied { resource: String, period: PeriodType, requested: i64 },
    Refunded { resource: String, period: PeriodType, amount: i64, new_used: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    Allowed { resource: String, remaining: i64 },
    Denied { resource: String, reset_at: DateTime<Utc> },
    /// The limiter itself failed and the request was let through.
    FailedOpen { resource: String },
}

/// Which cache keyspace an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyspace {
    Entitlement,
    Usage,
}

impl fmt::Display for CacheKeyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKeyspace::Entitlement => f.write_str("entitlement"),
            CacheKeyspace::Usage => f.write_str("usage"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit { keyspace: CacheKeyspace },
    Miss { keyspace: CacheKeyspace },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackEvent {
    /// A read was answered by the fallback chain.
    Served { operation: &'static str },
    /// A consume was admitted against the optimistic budget.
    OptimisticAllowed { resource: String, amount: i64 },
    /// No strategy could help; the original error is surfaced.
    Exhausted { operation: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    Opened { from: CircuitState },
    Closed,
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Consumption(event) => write!(f, "Consumption::{}", event),
            QuotaEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            QuotaEvent::Cache(event) => write!(f, "Cache::{}", event),
            QuotaEvent::Fallback(event) => write!(f, "Fallback::{}", event),
            QuotaEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            QuotaEvent::Warning { resource, threshold, used, limit } => {
                write!(f, "Warning({} at {:.0}%: {}/{})", resource, threshold * 100.0, used, limit)
            }
        }
    }
}

impl fmt::Display for ConsumptionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumptionEvent::Consumed { resource, period, amount, new_used } => {
                write!(f, "Consumed({} {} +{} -> {})", resource, period, amount, new_used)
            }
            ConsumptionEvent::DryRun { resource, period, amount, would_be } => {
                write!(f, "DryRun({} {} +{} -> {})", resource, period, amount, would_be)
            }
            ConsumptionEvent::Denied { resource, period, requested } => {
                write!(f, "Denied({} {} requested={})", resource, period, requested)
            }
            ConsumptionEvent::Refunded { resource, period, amount, new_used } => {
                write!(f, "Refunded({} {} -{} -> {})", resource, period, amount, new_used)
            }
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { resource, remaining } => {
                write!(f, "Allowed({} remaining={})", resource, remaining)
            }
            RateLimitEvent::Denied { resource, reset_at } => {
                write!(f, "Denied({} reset_at={})", resource, reset_at)
            }
            RateLimitEvent::FailedOpen { resource } => write!(f, "FailedOpen({})", resource),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { keyspace } => write!(f, "Hit({})", keyspace),
            CacheEvent::Miss { keyspace } => write!(f, "Miss({})", keyspace),
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Served { operation } => write!(f, "Served({})", operation),
            FallbackEvent::OptimisticAllowed { resource, amount } => {
                write!(f, "OptimisticAllowed({} +{})", resource, amount)
            }
            FallbackEvent::Exhausted { operation } => write!(f, "Exhausted({})", operation),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { from } => write!(f, "Opened(from={})", from),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

// ============================================================================
// Built-in Telemetry Sinks
// ============================================================================

type Ready = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<QuotaEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: QuotaEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<QuotaEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        tracing::info!(kind = event.kind(), outcome = event.outcome(), event = %event, "quota_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that keeps the most recent events in memory.
///
/// Once `capacity` is reached the oldest event is dropped and counted.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<QuotaEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<QuotaEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Number of recorded events matching `kind`/`outcome`.
    pub fn count(&self, kind: &str, outcome: &str) -> usize {
        self.lock().iter().filter(|e| e.kind() == kind && e.outcome() == outcome).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QuotaEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<QuotaEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit() -> QuotaEvent {
        QuotaEvent::Cache(CacheEvent::Hit { keyspace: CacheKeyspace::Usage })
    }

    #[tokio::test]
    async fn memory_sink_records_and_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        emit_best_effort(sink.clone(), hit()).await;
        emit_best_effort(sink.clone(), QuotaEvent::CircuitBreaker(CircuitBreakerEvent::Closed))
            .await;
        emit_best_effort(
            sink.clone(),
            QuotaEvent::RateLimit(RateLimitEvent::FailedOpen { resource: "api".into() }),
        )
        .await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "circuit_breaker");
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.count("rate_limit", "failed_open"), 1);
    }

    #[tokio::test]
    async fn boxed_sink_forwards_events() {
        let memory = MemorySink::new();
        let boxed = boxed(memory.clone());
        emit_best_effort(boxed, hit()).await;
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        emit_best_effort(NullSink, hit()).await;
        emit_best_effort(LogSink, hit()).await;
    }

    #[test]
    fn display_is_readable() {
        let event = QuotaEvent::Warning {
            resource: "api_calls".into(),
            threshold: 0.8,
            used: 85,
            limit: 100,
        };
        assert_eq!(event.to_string(), "Warning(api_calls at 80%: 85/100)");
        assert_eq!(hit().to_string(), "Cache::Hit(usage)");
    }
}
