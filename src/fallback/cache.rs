use super::FallbackStrategy;
use crate::cache::Cache;
use crate::clock::{Clock, SystemClock};
use crate::error::QuotaError;
use crate::types::{usage_key, Entitlement, Period, Usage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Serves cached records whose `updated_at` is within `max_staleness`.
///
/// Age is measured from the record's own timestamp, not from when it entered
/// the cache. A record that is present but too old yields
/// [`QuotaError::StaleCache`] rather than [`QuotaError::FallbackUnavailable`].
pub struct CacheFallback {
    cache: Arc<dyn Cache>,
    max_staleness: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CacheFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFallback")
            .field("cache", &self.cache)
            .field("max_staleness", &self.max_staleness)
            .finish_non_exhaustive()
    }
}

impl CacheFallback {
    pub fn new(cache: Arc<dyn Cache>, max_staleness: Duration) -> Self {
        Self { cache, max_staleness, clock: Arc::new(SystemClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn check_age(&self, updated_at: DateTime<Utc>) -> Result<(), QuotaError> {
        let age = (self.clock.now() - updated_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.max_staleness {
            tracing::warn!(?age, max = ?self.max_staleness, "cached fallback value is stale");
            return Err(QuotaError::StaleCache { age, max: self.max_staleness });
        }
        Ok(())
    }
}

#[async_trait]
impl FallbackStrategy for CacheFallback {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Usage, QuotaError> {
        let usage = self
            .cache
            .get_usage(&usage_key(user_id, resource, period))
            .ok_or(QuotaError::FallbackUnavailable)?;
        self.check_age(usage.updated_at)?;
        Ok(usage)
    }

    async fn fallback_entitlement(&self, user_id: &str) -> Result<Entitlement, QuotaError> {
        let entitlement =
            self.cache.get_entitlement(user_id).ok_or(QuotaError::FallbackUnavailable)?;
        self.check_age(entitlement.updated_at)?;
        Ok(entitlement)
    }

    fn allow_optimistic_consumption(&self, _usage: &Usage, _amount: i64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (ManualClock, Arc<LruCache>, CacheFallback) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cache = Arc::new(LruCache::new(10, 10).with_clock(Arc::new(clock.clone())));
        let fallback = CacheFallback::new(cache.clone(), Duration::from_secs(60))
            .with_clock(Arc::new(clock.clone()));
        (clock, cache, fallback)
    }

    fn usage(updated_at: DateTime<Utc>) -> Usage {
        Usage {
            user_id: "u1".into(),
            resource: "api".into(),
            used: 7,
            limit: 100,
            period: Period::forever(),
            tier: "free".into(),
            updated_at,
        }
    }

    #[tokio::test]
    async fn serves_fresh_values() {
        let (clock, cache, fallback) = setup();
        let period = Period::forever();
        cache.set_usage(&usage_key("u1", "api", &period), &usage(clock.now()), Duration::from_secs(600));
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(fallback.fallback_usage("u1", "api", &period).await.unwrap().used, 7);
    }

    #[tokio::test]
    async fn staleness_is_measured_from_updated_at() {
        let (clock, cache, fallback) = setup();
        let period = Period::forever();
        // Inserted now, but the record itself is two minutes old.
        let old = clock.now() - chrono::Duration::seconds(120);
        cache.set_usage(&usage_key("u1", "api", &period), &usage(old), Duration::from_secs(600));
        let err = fallback.fallback_usage("u1", "api", &period).await.unwrap_err();
        assert!(matches!(err, QuotaError::StaleCache { .. }));
    }

    #[tokio::test]
    async fn missing_values_are_unavailable() {
        let (_clock, _cache, fallback) = setup();
        let period = Period::forever();
        assert_eq!(
            fallback.fallback_usage("u1", "api", &period).await,
            Err(QuotaError::FallbackUnavailable)
        );
        assert_eq!(fallback.fallback_entitlement("u1").await, Err(QuotaError::FallbackUnavailable));
        assert!(!fallback.allow_optimistic_consumption(&usage(Utc::now()), 1));
    }
}
