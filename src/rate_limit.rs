//! Request-rate admission checks.
//!
//! Two algorithms are selected per resource through [`RateLimitConfig`]:
//! - **Token bucket**: integer tokens refilled at `rate` per `window`, capped at
//!   the burst capacity.
//! - **Sliding window**: at most `rate` requests in any trailing `window`.
//!
//! Two implementations share the [`RateLimiter`] contract:
//! - [`MemoryRateLimiter`] keeps state in-process (not shared between instances).
//! - [`StorageRateLimiter`] delegates check-and-record to the [`Storage`]
//!   backend and fails open when the backend errors.
//!
//! An unknown algorithm name allows the request; a zero rate always denies.
//!
//! [`RateLimitConfig`]: crate::config::RateLimitConfig
//! [`Storage`]: crate::storage::Storage

use crate::config::RateLimitConfig;
use crate::error::QuotaError;
use crate::types::RateLimitDecision;
use async_trait::async_trait;

pub mod memory;
pub mod storage;

pub use memory::MemoryRateLimiter;
pub use storage::StorageRateLimiter;

/// Core interface for rate limiting logic.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check one request against `config` and record it when allowed.
    async fn allow(
        &self,
        user_id: &str,
        resource: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, QuotaError>;
}

fn state_key(user_id: &str, resource: &str) -> String {
    format!("{}:{}", user_id, resource)
}
