//! Persistence contract consumed by the manager.
//!
//! A backend must make `consume_quota`, `apply_tier_change`, `refund_quota`,
//! `add_limit` and `subtract_limit` atomic: read, bounds check, mutation and
//! idempotency-record write happen as one unit. The manager never holds a lock
//! across a check-then-write.
//!
//! [`TimeSource`] and [`AuditLogger`] are optional capabilities injected into the
//! manager separately; a backend that implements them is passed twice.

use crate::error::QuotaError;
use crate::types::{
    AuditEntry, ConsumeRequest, ConsumptionRecord, Entitlement, LimitAdjustment, Period,
    RateLimitDecision, RateLimitRequest, RefundRecord, RefundRequest, TierChangeRequest, Usage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub mod memory;

pub use memory::MemoryStorage;

/// Backend for entitlements, usage counters, idempotency receipts, and
/// distributed rate-limit state.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError>;
    async fn set_entitlement(&self, entitlement: &Entitlement) -> Result<(), QuotaError>;

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Option<Usage>, QuotaError>;

    /// Atomically check the limit and increment usage. Returns the new total, or
    /// [`QuotaError::QuotaExceeded`] when the request does not fit.
    ///
    /// A request carrying an idempotency key that already has a receipt returns
    /// the receipt's `new_used` without mutating anything.
    async fn consume_quota(&self, req: &ConsumeRequest) -> Result<i64, QuotaError>;

    /// Atomically write a prorated limit. The stored limit never drops below the
    /// stored usage at write time.
    async fn apply_tier_change(&self, req: &TierChangeRequest) -> Result<(), QuotaError>;

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: &Usage,
        period: &Period,
    ) -> Result<(), QuotaError>;

    /// Decrement usage, clamping at zero. Returns the new total.
    async fn refund_quota(&self, req: &RefundRequest) -> Result<i64, QuotaError>;
    async fn get_refund_record(&self, key: &str) -> Result<Option<RefundRecord>, QuotaError>;
    async fn get_consumption_record(
        &self,
        key: &str,
    ) -> Result<Option<ConsumptionRecord>, QuotaError>;

    /// Check and record in one step.
    async fn check_rate_limit(
        &self,
        req: &RateLimitRequest,
    ) -> Result<RateLimitDecision, QuotaError>;
    /// Record a request that was admitted elsewhere.
    async fn record_rate_limit_request(&self, req: &RateLimitRequest) -> Result<(), QuotaError>;

    /// Raise a forever period's limit. Returns the new limit.
    async fn add_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError>;
    /// Lower a forever period's limit, clamping at zero. Returns the new limit.
    async fn subtract_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError>;
}

/// Backend clock, used to avoid skew between application servers.
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn now(&self) -> Result<DateTime<Utc>, QuotaError>;
}

/// Sink for administrative audit entries.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log_audit_entry(&self, entry: &AuditEntry) -> Result<(), QuotaError>;
    /// Entries for `user_id`, oldest first.
    async fn get_audit_logs(&self, user_id: &str) -> Result<Vec<AuditEntry>, QuotaError>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError> {
        (**self).get_entitlement(user_id).await
    }

    async fn set_entitlement(&self, entitlement: &Entitlement) -> Result<(), QuotaError> {
        (**self).set_entitlement(entitlement).await
    }

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Option<Usage>, QuotaError> {
        (**self).get_usage(user_id, resource, period).await
    }

    async fn consume_quota(&self, req: &ConsumeRequest) -> Result<i64, QuotaError> {
        (**self).consume_quota(req).await
    }

    async fn apply_tier_change(&self, req: &TierChangeRequest) -> Result<(), QuotaError> {
        (**self).apply_tier_change(req).await
    }

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: &Usage,
        period: &Period,
    ) -> Result<(), QuotaError> {
        (**self).set_usage(user_id, resource, usage, period).await
    }

    async fn refund_quota(&self, req: &RefundRequest) -> Result<i64, QuotaError> {
        (**self).refund_quota(req).await
    }

    async fn get_refund_record(&self, key: &str) -> Result<Option<RefundRecord>, QuotaError> {
        (**self).get_refund_record(key).await
    }

    async fn get_consumption_record(
        &self,
        key: &str,
    ) -> Result<Option<ConsumptionRecord>, QuotaError> {
        (**self).get_consumption_record(key).await
    }

    async fn check_rate_limit(
        &self,
        req: &RateLimitRequest,
    ) -> Result<RateLimitDecision, QuotaError> {
        (**self).check_rate_limit(req).await
    }

    async fn record_rate_limit_request(&self, req: &RateLimitRequest) -> Result<(), QuotaError> {
        (**self).record_rate_limit_request(req).await
    }

    async fn add_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        (**self).add_limit(adj).await
    }

    async fn subtract_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        (**self).subtract_limit(adj).await
    }
}
