//! The quota manager: one entry point that ties the other modules together.
//!
//! Every operation follows the same shape. The caller's [`RequestContext`] is
//! checked first, the user's tier and billing period are resolved (cache, then
//! a coalesced backend fetch, then the fallback chain), and the mutation is
//! delegated to the [`Storage`] backend, which is responsible for making
//! check-then-write atomic. The manager never holds a lock across a backend
//! call.
//!
//! ```rust
//! use quotaguard::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::with_default_tier("free", TierConfig::new().with_monthly("api_calls", 100));
//! let manager = Manager::builder(Arc::new(MemoryStorage::new())).config(config).build()?;
//!
//! let ctx = RequestContext::background();
//! let used = manager
//!     .consume(&ctx, "user-1", "api_calls", 3, PeriodType::Monthly, ConsumeOptions::new())
//!     .await?;
//! assert_eq!(used, 3);
//! # Ok(())
//! # }
//! ```

use crate::cache::{Cache, CacheStats, LruCache, NoopCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStorage, CircuitState, StateObserver};
use crate::clock::{Clock, SystemClock};
use crate::coalesce::RequestGroup;
use crate::config::{Config, FallbackConfig, FallbackKind, TierConfig};
use crate::context::RequestContext;
use crate::cycle::{period_for, prorated_limit, remaining_fraction};
use crate::dynamic::DynamicConfig;
use crate::error::{ConfigError, QuotaError};
use crate::fallback::{
    CacheFallback, CompositeFallback, FallbackStrategy, OptimisticFallback,
    SecondaryStorageFallback,
};
use crate::rate_limit::{MemoryRateLimiter, RateLimiter};
use crate::storage::{AuditLogger, Storage, TimeSource};
use crate::telemetry::{
    self, BoxedSink, CacheEvent, CacheKeyspace, CircuitBreakerEvent, ConsumptionEvent,
    FallbackEvent, NullSink, QuotaEvent, RateLimitEvent, TelemetrySink,
};
use crate::types::{
    checked_total, usage_key, AuditEntry, ConsumeRequest, Entitlement, LimitAdjustment, Period,
    PeriodType, RefundRequest, TierChangeRequest, Usage, UNLIMITED,
};
use crate::warning::{crossed_thresholds, QuotaWarning, WarningHandler};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-call options for [`Manager::consume`].
#[derive(Clone, Default)]
pub struct ConsumeOptions {
    /// Retries carrying the same key return the first call's result.
    pub idempotency_key: Option<String>,
    /// Compute the result without writing anything.
    pub dry_run: bool,
    /// Invoked in addition to the manager-wide handlers.
    pub warning_handlers: Vec<Arc<dyn WarningHandler>>,
}

impl ConsumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_warning_handler(mut self, handler: Arc<dyn WarningHandler>) -> Self {
        self.warning_handlers.push(handler);
        self
    }
}

impl fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("idempotency_key", &self.idempotency_key)
            .field("dry_run", &self.dry_run)
            .field("warning_handlers", &self.warning_handlers.len())
            .finish()
    }
}

/// Per-call options for [`Manager::refund`].
#[derive(Debug, Clone, Default)]
pub struct RefundOptions {
    pub idempotency_key: Option<String>,
    pub reason: Option<String>,
}

impl RefundOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Per-call options for forever-credit top-ups and refunds.
#[derive(Debug, Clone, Default)]
pub struct LimitOptions {
    pub idempotency_key: Option<String>,
}

impl LimitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Who performed an administrative override and why. Recorded in the audit log.
#[derive(Debug, Clone, Default)]
pub struct AdminOptions {
    pub actor: Option<String>,
    pub reason: Option<String>,
    /// Only used by [`Manager::grant_one_time_credit`].
    pub idempotency_key: Option<String>,
}

impl AdminOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Outcome of [`Manager::apply_tier_change`].
#[derive(Debug, Clone, PartialEq)]
pub struct TierChange {
    pub user_id: String,
    pub resource: String,
    pub old_tier: String,
    pub new_tier: String,
    pub period: Period,
    pub current_used: i64,
    pub old_limit: i64,
    pub new_limit: i64,
    /// Limit in force for the rest of `period`.
    pub adjusted_limit: i64,
    pub remaining_fraction: f64,
}

#[derive(Debug, Clone)]
struct Subscription {
    tier: String,
    anchor: DateTime<Utc>,
}

/// Everything one consume attempt needs, shared across an auto cascade.
struct Attempt<'a> {
    user_id: &'a str,
    resource: &'a str,
    amount: i64,
    subscription: &'a Subscription,
    tier: &'a TierConfig,
    config: &'a Config,
    options: &'a ConsumeOptions,
    now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum CreditOp {
    TopUp,
    Refund,
}

/// Limit configured for `period_type`; forever periods use the initial credit.
/// Resources missing from the tier get zero.
fn configured_limit(tier: &TierConfig, period_type: PeriodType, resource: &str) -> i64 {
    match period_type {
        PeriodType::Forever => tier.initial_forever_credits.get(resource).copied().unwrap_or(0),
        other => tier.limit(other, resource).unwrap_or(0),
    }
}

fn tier_config<'c>(config: &'c Config, name: &str) -> Result<&'c TierConfig, QuotaError> {
    config.tier(name).ok_or_else(|| QuotaError::UnknownTier(name.to_string()))
}

fn concrete(period_type: PeriodType, operation: &str) -> Result<PeriodType, QuotaError> {
    if period_type == PeriodType::Auto {
        return Err(QuotaError::InvalidPeriodType(format!("{operation} requires a concrete period")));
    }
    Ok(period_type)
}

/// Quota engine shared by every caller of a process.
pub struct Manager {
    storage: Arc<dyn Storage>,
    breaker: Option<Arc<CircuitBreaker>>,
    config: DynamicConfig<Config>,
    cache: Arc<dyn Cache>,
    fallback: Option<Arc<dyn FallbackStrategy>>,
    optimistic: Option<Arc<OptimisticFallback>>,
    rate_limiter: Arc<dyn RateLimiter>,
    warning_handlers: Vec<Arc<dyn WarningHandler>>,
    audit: Option<Arc<dyn AuditLogger>>,
    time_source: Option<Arc<dyn TimeSource>>,
    clock: Arc<dyn Clock>,
    sink: Mutex<BoxedSink>,
    entitlement_fetches: RequestGroup<Option<Entitlement>>,
    usage_fetches: RequestGroup<Option<Usage>>,
    transitions: Arc<Mutex<Vec<(CircuitState, CircuitState)>>>,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("cache", &self.cache)
            .field("breaker", &self.breaker)
            .field("warning_handlers", &self.warning_handlers.len())
            .finish_non_exhaustive()
    }
}

impl Manager {
    pub fn builder(storage: Arc<dyn Storage>) -> ManagerBuilder {
        ManagerBuilder::new(storage)
    }

    /// Snapshot of the configuration in force.
    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    /// Validate and swap in a new configuration.
    ///
    /// Tier settings and the idempotency TTL apply to the next operation. Cache,
    /// breaker and fallback composition are fixed when the manager is built.
    pub fn update_config(&self, mut config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.set(config);
        tracing::info!("quota configuration updated");
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Observed breaker state; always closed when the breaker is disabled.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.as_ref().map_or(CircuitState::Closed, |b| b.state())
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// The optimistic strategy built from [`FallbackConfig`], for resetting its
    /// budget once the backend has recovered.
    pub fn optimistic_fallback(&self) -> Option<&Arc<OptimisticFallback>> {
        self.optimistic.as_ref()
    }

    // ------------------------------------------------------------------
    // Entitlements
    // ------------------------------------------------------------------

    /// # Errors
    /// [`QuotaError::EntitlementNotFound`] when the user has none.
    pub async fn get_entitlement(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<Entitlement, QuotaError> {
        let result = self.get_entitlement_inner(ctx, user_id).await;
        self.finish(result).await
    }

    async fn get_entitlement_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<Entitlement, QuotaError> {
        ctx.check()?;
        self.load_entitlement(user_id)
            .await?
            .ok_or_else(|| QuotaError::EntitlementNotFound { user_id: user_id.to_string() })
    }

    pub async fn set_entitlement(
        &self,
        ctx: &RequestContext,
        entitlement: &Entitlement,
    ) -> Result<(), QuotaError> {
        let result = self.set_entitlement_inner(ctx, entitlement).await;
        self.finish(result).await
    }

    async fn set_entitlement_inner(
        &self,
        ctx: &RequestContext,
        entitlement: &Entitlement,
    ) -> Result<(), QuotaError> {
        ctx.check()?;
        self.storage.set_entitlement(entitlement).await?;
        self.cache.invalidate_entitlement(&entitlement.user_id);
        tracing::debug!(user_id = %entitlement.user_id, tier = %entitlement.tier, "entitlement stored");
        Ok(())
    }

    /// The period of `period_type` containing now for this user.
    pub async fn current_period(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        period_type: PeriodType,
    ) -> Result<Period, QuotaError> {
        let result = self.current_period_inner(ctx, user_id, period_type).await;
        self.finish(result).await
    }

    async fn current_period_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        period_type: PeriodType,
    ) -> Result<Period, QuotaError> {
        ctx.check()?;
        let period_type = concrete(period_type, "current_period")?;
        let now = self.now().await;
        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        period_for(period_type, subscription.anchor, now)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current usage for one resource and period.
    ///
    /// A user with no record yet gets a zero-usage record carrying the tier's
    /// limit (or initial credit for forever periods).
    pub async fn get_quota(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        period_type: PeriodType,
    ) -> Result<Usage, QuotaError> {
        let result = self.get_quota_inner(ctx, user_id, resource, period_type).await;
        self.finish(result).await
    }

    async fn get_quota_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        period_type: PeriodType,
    ) -> Result<Usage, QuotaError> {
        ctx.check()?;
        let period_type = concrete(period_type, "get_quota")?;
        let now = self.now().await;
        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        let tier = tier_config(&config, &subscription.tier)?;
        let period = period_for(period_type, subscription.anchor, now)?;
        self.load_usage(user_id, resource, &period, &subscription, tier, &config, now).await
    }

    // ------------------------------------------------------------------
    // Consumption
    // ------------------------------------------------------------------

    /// Consume `amount` of `resource` and return the new usage total.
    ///
    /// `amount == 0` returns `Ok(0)` without touching the backend. With
    /// [`PeriodType::Auto`] the tier's consumption order is tried in turn; an
    /// exhausted period moves on to the next, any other error stops the cascade.
    ///
    /// # Errors
    /// - [`QuotaError::RateLimited`] before any quota is touched.
    /// - [`QuotaError::QuotaExceeded`] when no period has room.
    /// - Infrastructure errors when the backend failed and the fallback chain
    ///   did not admit the request.
    pub async fn consume(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_type: PeriodType,
        options: ConsumeOptions,
    ) -> Result<i64, QuotaError> {
        let result = self.consume_inner(ctx, user_id, resource, amount, period_type, &options).await;
        self.finish(result).await
    }

    async fn consume_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_type: PeriodType,
        options: &ConsumeOptions,
    ) -> Result<i64, QuotaError> {
        ctx.check()?;
        if amount < 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }
        if amount == 0 {
            return Ok(0);
        }

        let now = self.now().await;
        if let Some(key) = &options.idempotency_key {
            if let Some(new_used) = self.replay_consumption(key, now).await {
                return Ok(new_used);
            }
        }

        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        let tier = tier_config(&config, &subscription.tier)?;

        // Dry runs must not spend rate-limit tokens.
        if !options.dry_run {
            self.check_rate_limit(user_id, resource, tier).await?;
        }

        let attempt = Attempt {
            user_id,
            resource,
            amount,
            subscription: &subscription,
            tier,
            config: &config,
            options,
            now,
        };

        if period_type != PeriodType::Auto {
            return self.consume_period(&attempt, period_type).await;
        }

        let mut last = None;
        for period_type in tier.consumption_order() {
            if period_type == PeriodType::Auto {
                continue;
            }
            match self.consume_period(&attempt, period_type).await {
                Ok(new_used) => return Ok(new_used),
                Err(err) if err.is_quota_exceeded() => {
                    tracing::debug!(
                        user_id = %user_id,
                        resource = %resource,
                        period = %period_type,
                        "period exhausted, trying next"
                    );
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| {
            QuotaError::InvalidPeriodType("consumption order has no concrete period".to_string())
        }))
    }

    async fn replay_consumption(&self, key: &str, now: DateTime<Utc>) -> Option<i64> {
        match self.storage.get_consumption_record(key).await {
            Ok(Some(record)) if !record.is_expired(now) => {
                tracing::debug!(idempotency_key = %key, new_used = record.new_used, "replaying recorded consumption");
                Some(record.new_used)
            }
            Ok(_) => None,
            // The backend checks the key again inside the consume transaction.
            Err(err) => {
                tracing::debug!(idempotency_key = %key, error = %err, "idempotency lookup failed");
                None
            }
        }
    }

    async fn check_rate_limit(
        &self,
        user_id: &str,
        resource: &str,
        tier: &TierConfig,
    ) -> Result<(), QuotaError> {
        let Some(limit) = tier.rate_limits.get(resource) else {
            return Ok(());
        };

        match self.rate_limiter.allow(user_id, resource, limit).await {
            Ok(decision) if decision.allowed => {
                self.emit(QuotaEvent::RateLimit(RateLimitEvent::Allowed {
                    resource: resource.to_string(),
                    remaining: decision.remaining,
                }))
                .await;
                Ok(())
            }
            Ok(decision) => {
                tracing::debug!(
                    user_id = %user_id,
                    resource = %resource,
                    reset_at = %decision.reset_at,
                    "rate limited"
                );
                self.emit(QuotaEvent::RateLimit(RateLimitEvent::Denied {
                    resource: resource.to_string(),
                    reset_at: decision.reset_at,
                }))
                .await;
                Err(QuotaError::RateLimited {
                    resource: resource.to_string(),
                    remaining: decision.remaining,
                    limit: decision.limit,
                    reset_at: decision.reset_at,
                })
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    user_id = %user_id,
                    resource = %resource,
                    "rate limiter failed, allowing request"
                );
                self.emit(QuotaEvent::RateLimit(RateLimitEvent::FailedOpen {
                    resource: resource.to_string(),
                }))
                .await;
                Ok(())
            }
        }
    }

    async fn consume_period(
        &self,
        attempt: &Attempt<'_>,
        period_type: PeriodType,
    ) -> Result<i64, QuotaError> {
        let period = period_for(period_type, attempt.subscription.anchor, attempt.now)?;
        if attempt.options.dry_run {
            return self.dry_run(attempt, &period).await;
        }

        let limit = configured_limit(attempt.tier, period_type, attempt.resource);
        let req = ConsumeRequest {
            user_id: attempt.user_id.to_string(),
            resource: attempt.resource.to_string(),
            amount: attempt.amount,
            period: period.clone(),
            limit,
            tier: attempt.subscription.tier.clone(),
            idempotency_key: attempt.options.idempotency_key.clone(),
            idempotency_ttl: attempt.config.idempotency_ttl(),
            now: attempt.now,
        };

        match self.storage.consume_quota(&req).await {
            Ok(new_used) => {
                self.cache.invalidate_usage(&usage_key(attempt.user_id, attempt.resource, &period));
                tracing::debug!(
                    user_id = %attempt.user_id,
                    resource = %attempt.resource,
                    period = %period.key(),
                    amount = attempt.amount,
                    new_used,
                    "quota consumed"
                );
                self.emit(QuotaEvent::Consumption(ConsumptionEvent::Consumed {
                    resource: attempt.resource.to_string(),
                    period: period_type,
                    amount: attempt.amount,
                    new_used,
                }))
                .await;
                self.fire_warnings(attempt, &period, limit, new_used).await;
                Ok(new_used)
            }
            Err(err) if err.is_quota_exceeded() => {
                self.emit(QuotaEvent::Consumption(ConsumptionEvent::Denied {
                    resource: attempt.resource.to_string(),
                    period: period_type,
                    requested: attempt.amount,
                }))
                .await;
                Err(err)
            }
            Err(err) => self.consume_optimistically(attempt, &period, err).await,
        }
    }

    async fn dry_run(&self, attempt: &Attempt<'_>, period: &Period) -> Result<i64, QuotaError> {
        let usage = self
            .load_usage(
                attempt.user_id,
                attempt.resource,
                period,
                attempt.subscription,
                attempt.tier,
                attempt.config,
                attempt.now,
            )
            .await?;

        let Some(would_be) = checked_total(usage.used, attempt.amount, usage.limit) else {
            self.emit(QuotaEvent::Consumption(ConsumptionEvent::Denied {
                resource: attempt.resource.to_string(),
                period: period.period_type,
                requested: attempt.amount,
            }))
            .await;
            return Err(QuotaError::QuotaExceeded {
                resource: attempt.resource.to_string(),
                used: usage.used,
                limit: usage.limit,
                requested: attempt.amount,
            });
        };

        tracing::debug!(
            user_id = %attempt.user_id,
            resource = %attempt.resource,
            would_be,
            "dry run consumption"
        );
        self.emit(QuotaEvent::Consumption(ConsumptionEvent::DryRun {
            resource: attempt.resource.to_string(),
            period: period.period_type,
            amount: attempt.amount,
            would_be,
        }))
        .await;
        Ok(would_be)
    }

    /// Admit a consume the backend could not record, if the fallback chain
    /// knows the current usage and allows it. The returned total is an
    /// estimate, so nothing is cached.
    async fn consume_optimistically(
        &self,
        attempt: &Attempt<'_>,
        period: &Period,
        err: QuotaError,
    ) -> Result<i64, QuotaError> {
        let Some(fallback) = self.fallback_for(&err) else {
            return Err(err);
        };

        let basis = match fallback.fallback_usage(attempt.user_id, attempt.resource, period).await {
            Ok(usage) => usage,
            Err(fallback_err) => {
                tracing::debug!(
                    error = %fallback_err,
                    resource = %attempt.resource,
                    "no usage basis for optimistic consumption"
                );
                self.emit(QuotaEvent::Fallback(FallbackEvent::Exhausted { operation: "consume" })).await;
                return Err(err);
            }
        };

        if !fallback.allow_optimistic_consumption(&basis, attempt.amount) {
            tracing::debug!(error = %err, resource = %attempt.resource, "fallback declined consumption");
            self.emit(QuotaEvent::Fallback(FallbackEvent::Exhausted { operation: "consume" })).await;
            return Err(err);
        }

        // The optimistic strategy's projection also counts earlier admits that
        // a snapshot basis cannot see.
        let projected = self
            .optimistic
            .as_ref()
            .and_then(|o| o.projected_used(attempt.user_id, attempt.resource, period));
        let new_used = basis.used.saturating_add(attempt.amount).max(projected.unwrap_or(0));
        if let Some(optimistic) = &self.optimistic {
            optimistic.prune_ended(attempt.now);
        }
        self.cache.invalidate_usage(&usage_key(attempt.user_id, attempt.resource, period));
        tracing::warn!(
            error = %err,
            user_id = %attempt.user_id,
            resource = %attempt.resource,
            amount = attempt.amount,
            new_used,
            "backend unavailable, consumption allowed optimistically"
        );
        self.emit(QuotaEvent::Fallback(FallbackEvent::OptimisticAllowed {
            resource: attempt.resource.to_string(),
            amount: attempt.amount,
        }))
        .await;
        Ok(new_used)
    }

    async fn fire_warnings(
        &self,
        attempt: &Attempt<'_>,
        period: &Period,
        requested_limit: i64,
        new_used: i64,
    ) {
        let thresholds = &attempt.tier.warning_thresholds;
        if thresholds.is_empty() {
            return;
        }

        // The stored record carries forever credits and tier-change overrides.
        let limit = match self.storage.get_usage(attempt.user_id, attempt.resource, period).await {
            Ok(Some(usage)) => usage.limit,
            _ => requested_limit,
        };
        let before = new_used.saturating_sub(attempt.amount);

        for threshold in crossed_thresholds(thresholds, before, new_used, limit) {
            let warning = QuotaWarning {
                user_id: attempt.user_id.to_string(),
                resource: attempt.resource.to_string(),
                period_type: period.period_type,
                threshold,
                used: new_used,
                limit,
                at: attempt.now,
            };
            tracing::info!(
                user_id = %warning.user_id,
                resource = %warning.resource,
                threshold,
                used = new_used,
                limit,
                "quota warning threshold crossed"
            );
            for handler in self.warning_handlers.iter().chain(attempt.options.warning_handlers.iter()) {
                handler.on_warning(&warning);
            }
            self.emit(QuotaEvent::Warning {
                resource: warning.resource.clone(),
                threshold,
                used: new_used,
                limit,
            })
            .await;
        }
    }

    /// Give back consumed quota. Usage never drops below zero.
    pub async fn refund(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_type: PeriodType,
        options: RefundOptions,
    ) -> Result<i64, QuotaError> {
        let result = self.refund_inner(ctx, user_id, resource, amount, period_type, options).await;
        self.finish(result).await
    }

    async fn refund_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        period_type: PeriodType,
        options: RefundOptions,
    ) -> Result<i64, QuotaError> {
        ctx.check()?;
        if amount < 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }
        if amount == 0 {
            return Ok(0);
        }
        let period_type = concrete(period_type, "refund")?;

        let now = self.now().await;
        if let Some(key) = &options.idempotency_key {
            match self.storage.get_refund_record(key).await {
                Ok(Some(record)) => return Ok(record.new_used),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(idempotency_key = %key, error = %err, "idempotency lookup failed");
                }
            }
        }

        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        let period = period_for(period_type, subscription.anchor, now)?;
        let req = RefundRequest {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            amount,
            period: period.clone(),
            idempotency_key: options.idempotency_key,
            reason: options.reason,
            now,
        };

        let new_used = self.storage.refund_quota(&req).await?;
        self.cache.invalidate_usage(&usage_key(user_id, resource, &period));
        tracing::debug!(user_id = %user_id, resource = %resource, amount, new_used, "quota refunded");
        self.emit(QuotaEvent::Consumption(ConsumptionEvent::Refunded {
            resource: resource.to_string(),
            period: period_type,
            amount,
            new_used,
        }))
        .await;
        Ok(new_used)
    }

    // ------------------------------------------------------------------
    // Forever credits
    // ------------------------------------------------------------------

    /// Raise the forever-credit limit by `amount` and return the new limit.
    pub async fn top_up_limit(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        options: LimitOptions,
    ) -> Result<i64, QuotaError> {
        let result = self
            .adjust_credits(ctx, user_id, resource, amount, options.idempotency_key, CreditOp::TopUp)
            .await;
        self.finish(result).await
    }

    /// Lower the forever-credit limit by `amount`, clamped at zero.
    pub async fn refund_credits(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        options: LimitOptions,
    ) -> Result<i64, QuotaError> {
        let result = self
            .adjust_credits(ctx, user_id, resource, amount, options.idempotency_key, CreditOp::Refund)
            .await;
        self.finish(result).await
    }

    async fn adjust_credits(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        idempotency_key: Option<String>,
        op: CreditOp,
    ) -> Result<i64, QuotaError> {
        ctx.check()?;
        if amount <= 0 {
            return Err(QuotaError::InvalidAmount(amount));
        }

        let now = self.now().await;
        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        let tier = tier_config(&config, &subscription.tier)?;
        let adjustment = LimitAdjustment {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            amount,
            period: Period::forever(),
            base_limit: configured_limit(tier, PeriodType::Forever, resource),
            tier: subscription.tier.clone(),
            idempotency_key,
            now,
        };

        let new_limit = match op {
            CreditOp::TopUp => self.storage.add_limit(&adjustment).await?,
            CreditOp::Refund => self.storage.subtract_limit(&adjustment).await?,
        };
        self.cache.invalidate_usage(&usage_key(user_id, resource, &adjustment.period));
        tracing::info!(
            user_id = %user_id,
            resource = %resource,
            amount,
            new_limit,
            op = ?op,
            "forever credit limit adjusted"
        );
        Ok(new_limit)
    }

    // ------------------------------------------------------------------
    // Tier changes
    // ------------------------------------------------------------------

    /// Prorate the monthly limit of `resource` after a mid-cycle tier change.
    ///
    /// The adjusted limit blends the old and new allowances by the share of
    /// the cycle already elapsed and never drops below current usage. It
    /// applies until the cycle ends.
    pub async fn apply_tier_change(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        old_tier: &str,
        new_tier: &str,
        resource: &str,
    ) -> Result<TierChange, QuotaError> {
        let result = self.apply_tier_change_inner(ctx, user_id, old_tier, new_tier, resource).await;
        self.finish(result).await
    }

    async fn apply_tier_change_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        old_tier: &str,
        new_tier: &str,
        resource: &str,
    ) -> Result<TierChange, QuotaError> {
        ctx.check()?;
        let now = self.now().await;
        let config = self.config.get();
        let old_config = tier_config(&config, old_tier)?;
        let new_config = tier_config(&config, new_tier)?;

        let subscription = self.subscription(&config, user_id, now).await?;
        let period = period_for(PeriodType::Monthly, subscription.anchor, now)?;
        let current_used = self
            .storage
            .get_usage(user_id, resource, &period)
            .await?
            .map_or(0, |usage| usage.used);

        let old_limit = configured_limit(old_config, PeriodType::Monthly, resource);
        let new_limit = configured_limit(new_config, PeriodType::Monthly, resource);
        let fraction = remaining_fraction(period.start, period.end, now);
        let adjusted_limit = prorated_limit(current_used, old_limit, new_limit, fraction);

        let req = TierChangeRequest {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            old_tier: old_tier.to_string(),
            new_tier: new_tier.to_string(),
            period: period.clone(),
            current_used,
            old_limit,
            new_limit,
            adjusted_limit,
            changed_at: now,
        };
        self.storage.apply_tier_change(&req).await?;
        self.cache.invalidate_usage(&usage_key(user_id, resource, &period));

        tracing::info!(
            user_id = %user_id,
            resource = %resource,
            old_tier = %old_tier,
            new_tier = %new_tier,
            adjusted_limit,
            "tier change applied"
        );

        let mut entry = audit_entry(user_id, resource, "tier_change", adjusted_limit, None, None, now);
        entry.metadata.insert("old_tier".to_string(), old_tier.to_string());
        entry.metadata.insert("new_tier".to_string(), new_tier.to_string());
        entry.metadata.insert("period".to_string(), period.key());
        self.record_audit(entry).await;

        Ok(TierChange {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            old_tier: old_tier.to_string(),
            new_tier: new_tier.to_string(),
            period,
            current_used,
            old_limit,
            new_limit,
            adjusted_limit,
            remaining_fraction: fraction,
        })
    }

    // ------------------------------------------------------------------
    // Administrative overrides
    // ------------------------------------------------------------------

    /// Overwrite usage. Values above the limit are accepted.
    pub async fn set_usage(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        period_type: PeriodType,
        used: i64,
        options: AdminOptions,
    ) -> Result<(), QuotaError> {
        let result = self
            .override_usage(ctx, user_id, resource, period_type, used, &options, "set_usage")
            .await;
        self.finish(result).await
    }

    pub async fn reset_usage(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        period_type: PeriodType,
        options: AdminOptions,
    ) -> Result<(), QuotaError> {
        let result = self
            .override_usage(ctx, user_id, resource, period_type, 0, &options, "reset_usage")
            .await;
        self.finish(result).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn override_usage(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        period_type: PeriodType,
        used: i64,
        options: &AdminOptions,
        action: &str,
    ) -> Result<(), QuotaError> {
        ctx.check()?;
        if used < 0 {
            return Err(QuotaError::InvalidAmount(used));
        }
        let period_type = concrete(period_type, action)?;

        let now = self.now().await;
        let config = self.config.get();
        let subscription = self.subscription(&config, user_id, now).await?;
        let tier = tier_config(&config, &subscription.tier)?;
        let period = period_for(period_type, subscription.anchor, now)?;

        let limit = match self.storage.get_usage(user_id, resource, &period).await? {
            Some(existing) => existing.limit,
            None => configured_limit(tier, period_type, resource),
        };
        let usage = Usage {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            used,
            limit,
            period: period.clone(),
            tier: subscription.tier.clone(),
            updated_at: now,
        };
        self.storage.set_usage(user_id, resource, &usage, &period).await?;
        self.cache.invalidate_usage(&usage_key(user_id, resource, &period));
        tracing::info!(user_id = %user_id, resource = %resource, used, action, "usage overridden");

        let mut entry = audit_entry(
            user_id,
            resource,
            action,
            used,
            options.actor.as_deref(),
            options.reason.as_deref(),
            now,
        );
        entry.metadata.insert("period".to_string(), period.key());
        self.record_audit(entry).await;
        Ok(())
    }

    /// Add forever credit as an administrative grant and return the new limit.
    pub async fn grant_one_time_credit(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        options: AdminOptions,
    ) -> Result<i64, QuotaError> {
        let result = self.grant_one_time_credit_inner(ctx, user_id, resource, amount, options).await;
        self.finish(result).await
    }

    async fn grant_one_time_credit_inner(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        resource: &str,
        amount: i64,
        options: AdminOptions,
    ) -> Result<i64, QuotaError> {
        let new_limit = self
            .adjust_credits(ctx, user_id, resource, amount, options.idempotency_key.clone(), CreditOp::TopUp)
            .await?;
        let mut entry = audit_entry(
            user_id,
            resource,
            "grant_one_time_credit",
            amount,
            options.actor.as_deref(),
            options.reason.as_deref(),
            self.now().await,
        );
        entry.metadata.insert("new_limit".to_string(), new_limit.to_string());
        self.record_audit(entry).await;
        Ok(new_limit)
    }

    /// Audit entries for one user; empty when no audit logger is configured.
    pub async fn audit_logs(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<Vec<AuditEntry>, QuotaError> {
        ctx.check()?;
        match &self.audit {
            Some(logger) => logger.get_audit_logs(user_id).await,
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Backend time when a [`TimeSource`] is configured, local time otherwise.
    async fn now(&self) -> DateTime<Utc> {
        let Some(source) = &self.time_source else {
            return self.clock.now();
        };
        match source.now().await {
            Ok(now) => now,
            Err(err) => {
                tracing::warn!(error = %err, "time source failed, using local clock");
                self.clock.now()
            }
        }
    }

    async fn subscription(
        &self,
        config: &Config,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Subscription, QuotaError> {
        let default_anchor = DateTime::<Utc>::UNIX_EPOCH;
        let subscription = match self.load_entitlement(user_id).await? {
            Some(entitlement) if entitlement.is_expired(now) => {
                tracing::debug!(
                    user_id = %user_id,
                    expired_at = ?entitlement.expires_at,
                    "entitlement expired, using default tier"
                );
                None
            }
            Some(entitlement) => Some(Subscription {
                tier: entitlement.tier,
                anchor: entitlement.subscription_start_date,
            }),
            None => None,
        };

        Ok(match subscription {
            Some(subscription) if config.tier(&subscription.tier).is_some() => subscription,
            Some(subscription) => {
                tracing::warn!(
                    user_id = %user_id,
                    tier = %subscription.tier,
                    "entitlement references an unconfigured tier, using default tier"
                );
                Subscription { tier: config.default_tier.clone(), anchor: subscription.anchor }
            }
            None => Subscription { tier: config.default_tier.clone(), anchor: default_anchor },
        })
    }

    async fn load_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError> {
        if let Some(entitlement) = self.cache.get_entitlement(user_id) {
            tracing::debug!(user_id = %user_id, "entitlement cache hit");
            self.emit(QuotaEvent::Cache(CacheEvent::Hit { keyspace: CacheKeyspace::Entitlement }))
                .await;
            return Ok(Some(entitlement));
        }
        self.emit(QuotaEvent::Cache(CacheEvent::Miss { keyspace: CacheKeyspace::Entitlement }))
            .await;

        let ttl = self.config.get().cache.entitlement_ttl;
        let fetched = self
            .entitlement_fetches
            .run(user_id, || async move {
                let found = self.storage.get_entitlement(user_id).await;
                if let Ok(Some(entitlement)) = &found {
                    self.cache.set_entitlement(entitlement, ttl);
                }
                found
            })
            .await;

        match fetched {
            Ok(found) => Ok(found),
            Err(err) => {
                let Some(fallback) = self.fallback_for(&err) else {
                    return Err(err);
                };
                match fallback.fallback_entitlement(user_id).await {
                    Ok(entitlement) => {
                        tracing::warn!(error = %err, user_id = %user_id, "serving entitlement from fallback");
                        self.emit(QuotaEvent::Fallback(FallbackEvent::Served {
                            operation: "get_entitlement",
                        }))
                        .await;
                        Ok(Some(entitlement))
                    }
                    Err(fallback_err) => {
                        tracing::debug!(error = %fallback_err, "no fallback entitlement");
                        self.emit(QuotaEvent::Fallback(FallbackEvent::Exhausted {
                            operation: "get_entitlement",
                        }))
                        .await;
                        Err(err)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
        subscription: &Subscription,
        tier: &TierConfig,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Result<Usage, QuotaError> {
        let key = usage_key(user_id, resource, period);
        let found = match self.cache.get_usage(&key) {
            Some(usage) => {
                tracing::debug!(key = %key, "usage cache hit");
                self.emit(QuotaEvent::Cache(CacheEvent::Hit { keyspace: CacheKeyspace::Usage })).await;
                Some(usage)
            }
            None => {
                self.emit(QuotaEvent::Cache(CacheEvent::Miss { keyspace: CacheKeyspace::Usage })).await;
                let ttl = config.cache.usage_ttl;
                let cache_key = key.as_str();
                let fetched = self
                    .usage_fetches
                    .run(&key, || async move {
                        let found = self.storage.get_usage(user_id, resource, period).await;
                        if let Ok(Some(usage)) = &found {
                            self.cache.set_usage(cache_key, usage, ttl);
                        }
                        found
                    })
                    .await;
                match fetched {
                    Ok(found) => found,
                    Err(err) => Some(self.fallback_usage(user_id, resource, period, err).await?),
                }
            }
        };

        Ok(match found {
            Some(mut usage) => {
                let non_positive = usage.limit <= 0 && usage.limit != UNLIMITED;
                if non_positive && period.period_type != PeriodType::Forever {
                    usage.limit = configured_limit(tier, period.period_type, resource);
                }
                usage
            }
            None => Usage {
                user_id: user_id.to_string(),
                resource: resource.to_string(),
                used: 0,
                limit: configured_limit(tier, period.period_type, resource),
                period: period.clone(),
                tier: subscription.tier.clone(),
                updated_at: now,
            },
        })
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
        err: QuotaError,
    ) -> Result<Usage, QuotaError> {
        let Some(fallback) = self.fallback_for(&err) else {
            return Err(err);
        };
        match fallback.fallback_usage(user_id, resource, period).await {
            Ok(usage) => {
                tracing::warn!(error = %err, user_id = %user_id, resource = %resource, "serving usage from fallback");
                self.emit(QuotaEvent::Fallback(FallbackEvent::Served { operation: "get_usage" })).await;
                Ok(usage)
            }
            Err(fallback_err) => {
                tracing::debug!(error = %fallback_err, "no fallback usage");
                self.emit(QuotaEvent::Fallback(FallbackEvent::Exhausted { operation: "get_usage" }))
                    .await;
                Err(err)
            }
        }
    }

    fn fallback_for(&self, err: &QuotaError) -> Option<&Arc<dyn FallbackStrategy>> {
        self.fallback.as_ref().filter(|fallback| fallback.should_fallback(err))
    }

    async fn record_audit(&self, entry: AuditEntry) {
        let Some(logger) = &self.audit else {
            return;
        };
        if let Err(err) = logger.log_audit_entry(&entry).await {
            tracing::warn!(error = %err, action = %entry.action, user_id = %entry.user_id, "failed to write audit entry");
        }
    }

    async fn emit(&self, event: QuotaEvent) {
        let sink = lock(&self.sink).clone();
        telemetry::emit_best_effort(sink, event).await;
    }

    /// Report breaker transitions queued by the observer, then hand back `result`.
    async fn finish<T>(&self, result: Result<T, QuotaError>) -> Result<T, QuotaError> {
        let transitions = std::mem::take(&mut *lock(&self.transitions));
        for (from, to) in transitions {
            let event = match to {
                CircuitState::Open => CircuitBreakerEvent::Opened { from },
                CircuitState::Closed => CircuitBreakerEvent::Closed,
                CircuitState::HalfOpen => continue,
            };
            self.emit(QuotaEvent::CircuitBreaker(event)).await;
        }
        result
    }
}

fn audit_entry(
    user_id: &str,
    resource: &str,
    action: &str,
    amount: i64,
    actor: Option<&str>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        resource: resource.to_string(),
        action: action.to_string(),
        amount,
        actor: actor.map(str::to_string),
        reason: reason.map(str::to_string),
        timestamp: now,
        metadata: HashMap::new(),
    }
}

/// Builder for [`Manager`].
///
/// Only the storage backend is required. Everything else defaults from
/// [`Config`]: an LRU cache when caching is enabled, a circuit breaker around
/// the backend when enabled, the fallback chain listed in
/// [`FallbackConfig::strategies`] when fallback is enabled, and an in-process
/// rate limiter.
pub struct ManagerBuilder {
    storage: Arc<dyn Storage>,
    config: Config,
    cache: Option<Arc<dyn Cache>>,
    fallback: Option<Arc<dyn FallbackStrategy>>,
    secondary_storage: Option<Arc<dyn Storage>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    warning_handlers: Vec<Arc<dyn WarningHandler>>,
    audit: Option<Arc<dyn AuditLogger>>,
    time_source: Option<Arc<dyn TimeSource>>,
    sink: Option<BoxedSink>,
    clock: Option<Arc<dyn Clock>>,
    breaker_observer: Option<StateObserver>,
}

impl ManagerBuilder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            config: Config::default(),
            cache: None,
            fallback: None,
            secondary_storage: None,
            rate_limiter: None,
            warning_handlers: Vec::new(),
            audit: None,
            time_source: None,
            sink: None,
            clock: None,
            breaker_observer: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the cache built from [`Config::cache`].
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the fallback chain built from [`Config::fallback`].
    pub fn fallback(mut self, fallback: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Backend read by [`FallbackKind::Secondary`].
    pub fn secondary_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.secondary_storage = Some(storage);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Add a handler invoked on every threshold crossing.
    pub fn warning_handler(mut self, handler: Arc<dyn WarningHandler>) -> Self {
        self.warning_handlers.push(handler);
        self
    }

    pub fn audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    /// Take "now" from the backend instead of the local clock.
    pub fn time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = Some(telemetry::boxed(sink));
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Called on every stored breaker transition, after telemetry is queued.
    pub fn breaker_observer(mut self, observer: StateObserver) -> Self {
        self.breaker_observer = Some(observer);
        self
    }

    /// # Errors
    /// Any [`ConfigError`] from [`Config::validate`], or
    /// [`ConfigError::MissingSecondaryStorage`] when the fallback chain names a
    /// secondary backend that was not supplied.
    pub fn build(self) -> Result<Manager, ConfigError> {
        let mut config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let cache: Arc<dyn Cache> = match self.cache {
            Some(cache) => cache,
            None if config.cache.enabled => Arc::new(
                LruCache::new(config.cache.max_entitlements, config.cache.max_usage)
                    .with_clock(clock.clone()),
            ),
            None => Arc::new(NoopCache),
        };

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let (storage, breaker) = if config.circuit_breaker.enabled {
            let queue = transitions.clone();
            let user_observer = self.breaker_observer;
            let observer: StateObserver = Arc::new(move |from: CircuitState, to: CircuitState| {
                lock(&queue).push((from, to));
                if let Some(observer) = &user_observer {
                    observer(from, to);
                }
            });
            let breaker = Arc::new(
                CircuitBreaker::new(config.circuit_breaker.clone())
                    .with_clock(clock.clone())
                    .with_observer(observer),
            );
            let guarded: Arc<dyn Storage> =
                Arc::new(CircuitBreakerStorage::new(self.storage, breaker.clone()));
            (guarded, Some(breaker))
        } else {
            (self.storage, None)
        };

        let (fallback, optimistic) = match self.fallback {
            Some(fallback) => (Some(fallback), None),
            None if config.fallback.enabled => {
                let (chain, optimistic) =
                    fallback_chain(&config.fallback, &cache, self.secondary_storage, &clock)?;
                let chain: Arc<dyn FallbackStrategy> = Arc::new(chain);
                (Some(chain), optimistic)
            }
            None => (None, None),
        };

        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(MemoryRateLimiter::new().with_clock(clock.clone())));
        let sink = self.sink.unwrap_or_else(|| telemetry::boxed(NullSink));

        Ok(Manager {
            storage,
            breaker,
            config: DynamicConfig::new(config),
            cache,
            fallback,
            optimistic,
            rate_limiter,
            warning_handlers: self.warning_handlers,
            audit: self.audit,
            time_source: self.time_source,
            clock,
            sink: Mutex::new(sink),
            entitlement_fetches: RequestGroup::new(),
            usage_fetches: RequestGroup::new(),
            transitions,
        })
    }
}

fn fallback_chain(
    config: &FallbackConfig,
    cache: &Arc<dyn Cache>,
    secondary: Option<Arc<dyn Storage>>,
    clock: &Arc<dyn Clock>,
) -> Result<(CompositeFallback, Option<Arc<OptimisticFallback>>), ConfigError> {
    let mut chain = CompositeFallback::default();
    let mut optimistic = None;
    for kind in &config.strategies {
        match kind {
            FallbackKind::Cache => chain.push(Arc::new(
                CacheFallback::new(cache.clone(), config.max_staleness).with_clock(clock.clone()),
            )),
            FallbackKind::Secondary => {
                let storage = secondary.clone().ok_or(ConfigError::MissingSecondaryStorage)?;
                chain.push(Arc::new(SecondaryStorageFallback::new(storage)));
            }
            FallbackKind::Optimistic => {
                let strategy = Arc::new(OptimisticFallback::new(config.optimistic_percentage));
                optimistic = Some(strategy.clone());
                chain.push(strategy);
            }
        }
    }
    Ok((chain, optimistic))
}
