//! Error types for quota enforcement.
//!
//! Errors fall into four classes that callers must treat differently:
//! - **Business-rule** errors (quota exceeded, invalid amount, invalid period type,
//!   entitlement not found) are legitimate denials. They never trigger fallback.
//! - **Rate-limit** denials carry remaining/limit/reset metadata.
//! - **Infrastructure** errors (circuit open, storage unavailable, caller
//!   cancellation or deadline) are the only errors eligible for fallback.
//! - **Idempotency conflicts** signal a key that was already used for a different
//!   kind of operation.
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Unified error type for quota operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuotaError {
    /// Consuming `requested` would push `used` past `limit`.
    #[error("quota exceeded for {resource}: used {used} + requested {requested} > limit {limit}")]
    QuotaExceeded { resource: String, used: i64, limit: i64, requested: i64 },
    /// Amounts must be non-negative (or strictly positive for credit operations).
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),
    /// The period type is not valid for the requested operation.
    #[error("invalid period type: {0}")]
    InvalidPeriodType(String),
    /// No entitlement is stored for the user.
    #[error("entitlement not found for user {user_id}")]
    EntitlementNotFound { user_id: String },
    /// The named tier is not configured.
    #[error("unknown tier: {0}")]
    UnknownTier(String),
    /// The caller exceeded the configured request rate.
    #[error("rate limited on {resource}: {remaining}/{limit} remaining, resets at {reset_at}")]
    RateLimited { resource: String, remaining: i64, limit: i64, reset_at: DateTime<Utc> },
    /// The idempotency key was already used for a different kind of operation.
    #[error("idempotency key {key} already used for {existing}")]
    IdempotencyKeyExists { key: String, existing: String },
    /// The circuit breaker guarding the backend is open.
    #[error("circuit breaker open ({failures} failures, open for {open_for:?})")]
    CircuitOpen { failures: usize, open_for: Duration },
    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The caller's deadline passed before the request started.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// A cached fallback value exists but is older than the allowed staleness.
    #[error("cached value is stale (age {age:?}, max {max:?})")]
    StaleCache { age: Duration, max: Duration },
    /// No fallback strategy could supply a value.
    #[error("no fallback data available")]
    FallbackUnavailable,
    /// Any other backend failure.
    #[error("storage error: {0}")]
    Backend(String),
}

impl QuotaError {
    /// Infrastructure failures are the only errors fallback strategies may mask.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::StorageUnavailable(_)
                | Self::Cancelled
                | Self::DeadlineExceeded
        )
    }

    /// Legitimate denials and validation failures.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::InvalidAmount(_)
                | Self::InvalidPeriodType(_)
                | Self::EntitlementNotFound { .. }
                | Self::UnknownTier(_)
                | Self::RateLimited { .. }
                | Self::IdempotencyKeyExists { .. }
        )
    }

    /// Whether a backend call that returned this error counts as a breaker failure.
    ///
    /// Business outcomes mean the backend answered, so they count as successes.
    pub fn counts_as_backend_failure(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Backend(_) | Self::DeadlineExceeded)
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntitlementNotFound { .. })
    }

    /// Reset time carried by a rate-limit denial.
    pub fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }
}

/// Errors produced when validating [`Config`](crate::config::Config).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("default tier must be set")]
    MissingDefaultTier,
    #[error("default tier {0:?} is not present in the tier map")]
    DefaultTierNotConfigured(String),
    #[error("tier {tier}: negative quota {value} for {resource}")]
    NegativeQuota { tier: String, resource: String, value: i64 },
    #[error("tier {tier}: warning threshold {value} outside [0, 1]")]
    InvalidWarningThreshold { tier: String, value: f64 },
    #[error("tier {tier}: unknown rate limit algorithm {algorithm:?} for {resource}")]
    UnknownRateLimitAlgorithm { tier: String, resource: String, algorithm: String },
    #[error("tier {tier}: rate limit window for {resource} must be positive")]
    NonPositiveRateLimitWindow { tier: String, resource: String },
    #[error("tier {tier}: negative burst {value} for {resource}")]
    NegativeBurst { tier: String, resource: String, value: i64 },
    #[error("tier {tier}: negative rate {value} for {resource}")]
    NegativeRate { tier: String, resource: String, value: i64 },
    #[error("idempotency ttl must not be negative")]
    NegativeIdempotencyTtl,
    #[error("optimistic fallback percentage {0} outside [0, 100]")]
    InvalidOptimisticPercentage(f64),
    #[error("cache capacity {0} must be > 0; disable the cache instead")]
    ZeroCacheCapacity(&'static str),
    #[error("circuit breaker failure threshold must be > 0")]
    InvalidFailureThreshold,
    #[error("circuit breaker reset timeout must be > 0")]
    InvalidResetTimeout,
    #[error("secondary storage fallback configured but no secondary storage supplied")]
    MissingSecondaryStorage,
}
