//! Core data model: periods, entitlements, usage, and the request/record types
//! exchanged with a [`Storage`](crate::storage::Storage) backend.

use crate::error::QuotaError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Limit value meaning "no ceiling".
pub const UNLIMITED: i64 = -1;

/// `used + amount` if it fits within `limit`. `None` when the sum exceeds the
/// limit or overflows `i64`, unlimited or not.
pub fn checked_total(used: i64, amount: i64, limit: i64) -> Option<i64> {
    let total = used.checked_add(amount)?;
    (limit == UNLIMITED || total <= limit).then_some(total)
}

/// Kind of accumulation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum PeriodType {
    /// Calendar day in UTC.
    Daily,
    /// Anniversary-based month anchored on the subscription start date.
    Monthly,
    /// Unbounded credit pool with a dynamic, purchased limit.
    Forever,
    /// Cascade through the tier's configured consumption order.
    Auto,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Monthly => "monthly",
            PeriodType::Forever => "forever",
            PeriodType::Auto => "auto",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(PeriodType::Daily),
            "monthly" => Ok(PeriodType::Monthly),
            "forever" => Ok(PeriodType::Forever),
            "auto" => Ok(PeriodType::Auto),
            other => Err(QuotaError::InvalidPeriodType(other.to_string())),
        }
    }
}

/// Half-open accumulation window `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_type: PeriodType,
}

impl Period {
    /// The single, fixed period used for forever credits.
    pub fn forever() -> Self {
        Self {
            start: forever_start(),
            end: forever_end(),
            period_type: PeriodType::Forever,
        }
    }

    /// Stable addressing key. Deterministic for a given start and type.
    pub fn key(&self) -> String {
        match self.period_type {
            PeriodType::Forever => "forever".to_string(),
            other => format!("{}:{}", other, self.start.format("%Y-%m-%d")),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn forever_start() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn forever_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).single().unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A user's subscription to a tier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Entitlement {
    pub user_id: String,
    pub tier: String,
    pub subscription_start_date: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Consumption of one resource within one period.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Usage {
    pub user_id: String,
    pub resource: String,
    pub used: i64,
    /// Audit copy of the limit; authoritative only for forever periods.
    pub limit: i64,
    pub period: Period,
    pub tier: String,
    pub updated_at: DateTime<Utc>,
}

impl Usage {
    /// Remaining headroom; `None` when unlimited.
    pub fn remaining(&self) -> Option<i64> {
        if self.limit == UNLIMITED {
            None
        } else {
            Some((self.limit - self.used).max(0))
        }
    }
}

/// Atomic consume request handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    /// Ceiling to enforce, or [`UNLIMITED`].
    pub limit: i64,
    pub tier: String,
    pub idempotency_key: Option<String>,
    /// Lifetime of the idempotency record; zero keeps it forever.
    pub idempotency_ttl: std::time::Duration,
    pub now: DateTime<Utc>,
}

/// Receipt written in the same unit as a successful consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionRecord {
    pub idempotency_key: String,
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period_key: String,
    pub new_used: i64,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConsumptionRecord {
    /// Receipts past their TTL no longer deduplicate.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Give back previously consumed quota.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundRequest {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    pub idempotency_key: Option<String>,
    pub reason: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundRecord {
    pub idempotency_key: String,
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period_key: String,
    pub new_used: i64,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Prorated limit adjustment after a mid-cycle tier change.
#[derive(Debug, Clone, PartialEq)]
pub struct TierChangeRequest {
    pub user_id: String,
    pub resource: String,
    pub old_tier: String,
    pub new_tier: String,
    pub period: Period,
    pub current_used: i64,
    pub old_limit: i64,
    pub new_limit: i64,
    pub adjusted_limit: i64,
    pub changed_at: DateTime<Utc>,
}

/// Increment or decrement of a forever period's dynamic limit.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitAdjustment {
    pub user_id: String,
    pub resource: String,
    pub amount: i64,
    pub period: Period,
    /// Limit assumed when no record exists yet (the tier's initial credit).
    pub base_limit: i64,
    pub tier: String,
    pub idempotency_key: Option<String>,
    pub now: DateTime<Utc>,
}

/// Rate-limit check routed through the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRequest {
    pub user_id: String,
    pub resource: String,
    pub config: crate::config::RateLimitConfig,
    pub now: DateTime<Utc>,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// One administrative action.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AuditEntry {
    pub id: String,
    pub user_id: String,
    pub resource: String,
    pub action: String,
    pub amount: i64,
    pub actor: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Build the cache/idempotency address for a usage record.
pub fn usage_key(user_id: &str, resource: &str, period: &Period) -> String {
    format!("{}:{}:{}", user_id, resource, period.key())
}
