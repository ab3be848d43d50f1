use super::RateLimiter;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::QuotaError;
use crate::storage::Storage;
use crate::types::{RateLimitDecision, RateLimitRequest};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Limiter whose state lives in the storage backend, so every instance sharing
/// the backend sees the same counts.
///
/// A backend error never blocks traffic: the request is allowed and a fully
/// available decision is returned.
pub struct StorageRateLimiter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StorageRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRateLimiter").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl StorageRateLimiter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage, clock: Arc::new(SystemClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record a request that was admitted without a check. Failures are logged.
    pub async fn record(&self, user_id: &str, resource: &str, config: &RateLimitConfig) {
        let req = self.request(user_id, resource, config);
        if let Err(err) = self.storage.record_rate_limit_request(&req).await {
            tracing::warn!(
                error = %err,
                user_id = %user_id,
                resource = %resource,
                "failed to record rate limit request"
            );
        }
    }

    fn request(&self, user_id: &str, resource: &str, config: &RateLimitConfig) -> RateLimitRequest {
        RateLimitRequest {
            user_id: user_id.to_string(),
            resource: resource.to_string(),
            config: config.clone(),
            now: self.clock.now(),
        }
    }
}

#[async_trait]
impl RateLimiter for StorageRateLimiter {
    async fn allow(
        &self,
        user_id: &str,
        resource: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, QuotaError> {
        let req = self.request(user_id, resource, config);
        match self.storage.check_rate_limit(&req).await {
            Ok(decision) => Ok(decision),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    user_id = %user_id,
                    resource = %resource,
                    "rate limit backend failed, allowing request"
                );
                let window = Duration::from_std(config.window).unwrap_or(Duration::MAX);
                Ok(RateLimitDecision {
                    allowed: true,
                    remaining: config.capacity(),
                    limit: config.capacity(),
                    reset_at: req.now.checked_add_signed(window).unwrap_or(req.now),
                })
            }
        }
    }
}
