use super::FallbackStrategy;
use crate::error::QuotaError;
use crate::types::{checked_total, usage_key, Entitlement, Period, Usage, UNLIMITED};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Usage last seen for a key plus what was admitted on top of it.
#[derive(Debug)]
struct Admitted {
    basis: Usage,
    allowed: i64,
}

impl Admitted {
    fn projected(&self) -> i64 {
        self.basis.used.saturating_add(self.allowed)
    }
}

/// Admits up to `percentage`% of the limit per `(user, resource, period)` while
/// the backend is unavailable.
///
/// The first admit for a key needs a usage basis from an earlier strategy in
/// the chain (typically [`CacheFallback`](super::CacheFallback)). After that
/// this strategy answers [`fallback_usage`](FallbackStrategy::fallback_usage)
/// itself with the basis plus everything it has admitted, so reported totals
/// never move backwards during an outage.
///
/// The running totals are process-local and are never reconciled with the
/// backend automatically; call [`reset`](Self::reset) or
/// [`reset_key`](Self::reset_key) once the backend has recovered. Entries are
/// otherwise kept until their period ends (see [`prune_ended`](Self::prune_ended)).
#[derive(Debug)]
pub struct OptimisticFallback {
    percentage: f64,
    admitted: Mutex<HashMap<String, Arc<Mutex<Admitted>>>>,
}

impl Default for OptimisticFallback {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl OptimisticFallback {
    /// `percentage` is clamped to `[0, 100]`.
    pub fn new(percentage: f64) -> Self {
        let percentage = if percentage.is_nan() { 0.0 } else { percentage.clamp(0.0, 100.0) };
        Self { percentage, admitted: Mutex::new(HashMap::new()) }
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Budget available for `limit`.
    pub fn budget(&self, limit: i64) -> i64 {
        (limit as f64 * self.percentage / 100.0).floor() as i64
    }

    /// Optimistically admitted total for one key.
    pub fn allowed_for(&self, user_id: &str, resource: &str, period: &Period) -> i64 {
        self.entry(user_id, resource, period).map_or(0, |entry| lock(&entry).allowed)
    }

    /// Known usage plus optimistic admits for one key, if anything was admitted.
    pub fn projected_used(&self, user_id: &str, resource: &str, period: &Period) -> Option<i64> {
        self.entry(user_id, resource, period).map(|entry| lock(&entry).projected())
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        lock(&self.admitted).len()
    }

    /// Forget every running total.
    pub fn reset(&self) {
        lock(&self.admitted).clear();
    }

    pub fn reset_key(&self, user_id: &str, resource: &str, period: &Period) {
        lock(&self.admitted).remove(&usage_key(user_id, resource, period));
    }

    /// Drop keys whose period ended at or before `now`.
    pub fn prune_ended(&self, now: DateTime<Utc>) {
        lock(&self.admitted).retain(|_, entry| lock(entry).basis.period.end > now);
    }

    fn entry(&self, user_id: &str, resource: &str, period: &Period) -> Option<Arc<Mutex<Admitted>>> {
        lock(&self.admitted).get(&usage_key(user_id, resource, period)).cloned()
    }
}

#[async_trait]
impl FallbackStrategy for OptimisticFallback {
    fn name(&self) -> &'static str {
        "optimistic"
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Usage, QuotaError> {
        let entry = self.entry(user_id, resource, period).ok_or(QuotaError::FallbackUnavailable)?;
        let entry = lock(&entry);
        Ok(Usage { used: entry.projected(), ..entry.basis.clone() })
    }

    async fn fallback_entitlement(&self, _user_id: &str) -> Result<Entitlement, QuotaError> {
        Err(QuotaError::FallbackUnavailable)
    }

    fn allow_optimistic_consumption(&self, usage: &Usage, amount: i64) -> bool {
        let key = usage_key(&usage.user_id, &usage.resource, &usage.period);
        let entry = lock(&self.admitted)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Admitted { basis: usage.clone(), allowed: 0 })))
            .clone();
        let mut entry = lock(&entry);

        // A stale snapshot does not include earlier admits; a projection does.
        let used = usage.used.max(entry.projected());
        if checked_total(used, amount, usage.limit).is_none() {
            return false;
        }
        let Some(allowed) = entry.allowed.checked_add(amount) else {
            return false;
        };
        if usage.limit != UNLIMITED && allowed > self.budget(usage.limit) {
            tracing::warn!(
                user_id = %usage.user_id,
                resource = %usage.resource,
                allowed = entry.allowed,
                budget = self.budget(usage.limit),
                "optimistic budget exhausted"
            );
            return false;
        }
        entry.allowed = allowed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn usage(used: i64, limit: i64) -> Usage {
        Usage {
            user_id: "u1".into(),
            resource: "api".into(),
            used,
            limit,
            period: Period::forever(),
            tier: "free".into(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn admits_up_to_percentage_of_limit() {
        let fallback = OptimisticFallback::new(10.0);
        let basis = usage(0, 100);
        for _ in 0..10 {
            assert!(fallback.allow_optimistic_consumption(&basis, 1));
        }
        assert!(!fallback.allow_optimistic_consumption(&basis, 1));
        assert_eq!(fallback.allowed_for("u1", "api", &Period::forever()), 10);
    }

    #[test]
    fn respects_known_usage() {
        let fallback = OptimisticFallback::new(100.0);
        assert!(!fallback.allow_optimistic_consumption(&usage(95, 100), 10));
        assert!(fallback.allow_optimistic_consumption(&usage(95, 100), 5));
    }

    #[test]
    fn unlimited_always_allows() {
        let fallback = OptimisticFallback::new(0.0);
        assert!(fallback.allow_optimistic_consumption(&usage(1_000, UNLIMITED), 1_000));
    }

    #[test]
    fn percentage_is_capped() {
        assert_eq!(OptimisticFallback::new(250.0).percentage(), 100.0);
        assert_eq!(OptimisticFallback::new(-5.0).budget(100), 0);
        assert_eq!(OptimisticFallback::default().budget(55), 5);
    }

    #[test]
    fn reset_restores_budget() {
        let fallback = OptimisticFallback::new(10.0);
        let basis = usage(0, 10);
        assert!(fallback.allow_optimistic_consumption(&basis, 1));
        assert!(!fallback.allow_optimistic_consumption(&basis, 1));

        fallback.reset_key("u1", "api", &Period::forever());
        assert!(fallback.allow_optimistic_consumption(&basis, 1));
        fallback.reset();
        assert_eq!(fallback.allowed_for("u1", "api", &Period::forever()), 0);
    }

    #[tokio::test]
    async fn later_admits_build_on_the_projection() {
        let fallback = OptimisticFallback::new(100.0);
        let period = Period::forever();
        assert_eq!(
            fallback.fallback_usage("u1", "api", &period).await,
            Err(QuotaError::FallbackUnavailable)
        );

        // The first basis came from a snapshot; later ones come from this strategy.
        assert!(fallback.allow_optimistic_consumption(&usage(20, 100), 5));
        let projected = fallback.fallback_usage("u1", "api", &period).await.unwrap();
        assert_eq!((projected.used, projected.limit), (25, 100));
        assert!(fallback.allow_optimistic_consumption(&projected, 5));
        assert_eq!(fallback.projected_used("u1", "api", &period), Some(30));

        // A repeated stale snapshot does not hide earlier admits.
        assert!(!fallback.allow_optimistic_consumption(&usage(20, 100), 71));
        assert!(fallback.allow_optimistic_consumption(&usage(20, 100), 70));
        assert_eq!(fallback.projected_used("u1", "api", &period), Some(100));
    }

    #[test]
    fn huge_amounts_are_declined() {
        let fallback = OptimisticFallback::new(100.0);
        assert!(!fallback.allow_optimistic_consumption(&usage(50, 100), i64::MAX));
        assert!(!fallback.allow_optimistic_consumption(&usage(1, UNLIMITED), i64::MAX));
        assert_eq!(fallback.allowed_for("u1", "api", &Period::forever()), 0);
    }

    #[test]
    fn ended_periods_are_pruned() {
        let fallback = OptimisticFallback::new(100.0);
        let mut daily = usage(0, 100);
        daily.period = Period {
            start: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
            period_type: crate::types::PeriodType::Daily,
        };
        assert!(fallback.allow_optimistic_consumption(&daily, 1));
        assert!(fallback.allow_optimistic_consumption(&usage(0, 100), 1));
        assert_eq!(fallback.tracked_keys(), 2);

        fallback.prune_ended(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(fallback.tracked_keys(), 1);
        assert_eq!(fallback.allowed_for("u1", "api", &Period::forever()), 1);
    }
}
