//! Degraded answers when the storage backend is unreachable.
//!
//! A strategy is consulted only for infrastructure errors (circuit open, storage
//! unavailable, caller cancellation or deadline). Business denials such as quota
//! exceeded are never masked.
//!
//! - [`CacheFallback`] serves cached records no older than a staleness bound.
//! - [`SecondaryStorageFallback`] reads from a second backend.
//! - [`OptimisticFallback`] admits a bounded share of the limit while the
//!   backend is down.
//! - [`CompositeFallback`] tries strategies in order.

use crate::error::QuotaError;
use crate::types::{Entitlement, Period, Usage};
use async_trait::async_trait;

pub mod cache;
pub mod composite;
pub mod optimistic;
pub mod secondary;

pub use cache::CacheFallback;
pub use composite::CompositeFallback;
pub use optimistic::OptimisticFallback;
pub use secondary::SecondaryStorageFallback;

/// One fallback strategy.
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether `err` may be answered by this strategy.
    fn should_fallback(&self, err: &QuotaError) -> bool {
        err.is_infrastructure()
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Usage, QuotaError>;

    async fn fallback_entitlement(&self, user_id: &str) -> Result<Entitlement, QuotaError>;

    /// Whether `amount` may be consumed against `usage` without the backend.
    fn allow_optimistic_consumption(&self, usage: &Usage, amount: i64) -> bool;
}
