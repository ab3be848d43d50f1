use super::FallbackStrategy;
use crate::error::QuotaError;
use crate::types::{Entitlement, Period, Usage};
use async_trait::async_trait;
use std::sync::Arc;

/// Tries strategies in order. Reads return the first success; optimistic
/// consumption is allowed by the first strategy that allows it.
///
/// A failing strategy is skipped, so one broken strategy cannot take the chain
/// down. When every strategy fails the last error is returned.
#[derive(Clone, Default)]
pub struct CompositeFallback {
    strategies: Vec<Arc<dyn FallbackStrategy>>,
}

impl std::fmt::Debug for CompositeFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.strategies.iter().map(|s| s.name())).finish()
    }
}

impl CompositeFallback {
    pub fn new(strategies: Vec<Arc<dyn FallbackStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn push(&mut self, strategy: Arc<dyn FallbackStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

#[async_trait]
impl FallbackStrategy for CompositeFallback {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn should_fallback(&self, err: &QuotaError) -> bool {
        self.strategies.iter().any(|s| s.should_fallback(err))
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Usage, QuotaError> {
        let mut last = QuotaError::FallbackUnavailable;
        for strategy in &self.strategies {
            match strategy.fallback_usage(user_id, resource, period).await {
                Ok(usage) => {
                    tracing::debug!(strategy = strategy.name(), "fallback usage served");
                    return Ok(usage);
                }
                Err(err) => {
                    tracing::debug!(strategy = strategy.name(), error = %err, "fallback strategy declined");
                    last = err;
                }
            }
        }
        Err(last)
    }

    async fn fallback_entitlement(&self, user_id: &str) -> Result<Entitlement, QuotaError> {
        let mut last = QuotaError::FallbackUnavailable;
        for strategy in &self.strategies {
            match strategy.fallback_entitlement(user_id).await {
                Ok(entitlement) => {
                    tracing::debug!(strategy = strategy.name(), "fallback entitlement served");
                    return Ok(entitlement);
                }
                Err(err) => {
                    tracing::debug!(strategy = strategy.name(), error = %err, "fallback strategy declined");
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn allow_optimistic_consumption(&self, usage: &Usage, amount: i64) -> bool {
        self.strategies.iter().any(|s| s.allow_optimistic_consumption(usage, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::OptimisticFallback;
    use chrono::Utc;

    /// A strategy that always fails with a backend error.
    struct Broken;

    #[async_trait]
    impl FallbackStrategy for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn fallback_usage(&self, _: &str, _: &str, _: &Period) -> Result<Usage, QuotaError> {
            Err(QuotaError::Backend("boom".into()))
        }

        async fn fallback_entitlement(&self, _: &str) -> Result<Entitlement, QuotaError> {
            Err(QuotaError::Backend("boom".into()))
        }

        fn allow_optimistic_consumption(&self, _: &Usage, _: i64) -> bool {
            false
        }
    }

    /// A strategy that always answers.
    struct Fixed;

    #[async_trait]
    impl FallbackStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fallback_usage(&self, user_id: &str, resource: &str, period: &Period) -> Result<Usage, QuotaError> {
            Ok(Usage {
                user_id: user_id.into(),
                resource: resource.into(),
                used: 3,
                limit: 10,
                period: period.clone(),
                tier: "free".into(),
                updated_at: Utc::now(),
            })
        }

        async fn fallback_entitlement(&self, _: &str) -> Result<Entitlement, QuotaError> {
            Err(QuotaError::FallbackUnavailable)
        }

        fn allow_optimistic_consumption(&self, _: &Usage, _: i64) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn skips_failing_strategies() {
        let chain = CompositeFallback::new(vec![Arc::new(Broken), Arc::new(Fixed)]);
        let usage = chain.fallback_usage("u1", "api", &Period::forever()).await.unwrap();
        assert_eq!(usage.used, 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let chain = CompositeFallback::new(vec![Arc::new(Fixed), Arc::new(Broken)]);
        assert_eq!(chain.fallback_entitlement("u1").await, Err(QuotaError::Backend("boom".into())));
        assert_eq!(
            CompositeFallback::default().fallback_entitlement("u1").await,
            Err(QuotaError::FallbackUnavailable)
        );
    }

    #[tokio::test]
    async fn first_allowing_strategy_wins() {
        let chain = CompositeFallback::new(vec![
            Arc::new(Broken),
            Arc::new(OptimisticFallback::new(50.0)),
        ]);
        let basis = Fixed.fallback_usage("u1", "api", &Period::forever()).await.unwrap();
        assert!(chain.allow_optimistic_consumption(&basis, 5));
        assert!(!chain.allow_optimistic_consumption(&basis, 1));
    }

    #[test]
    fn only_infrastructure_errors_fall_back() {
        let chain = CompositeFallback::new(vec![Arc::new(Fixed)]);
        assert!(chain.should_fallback(&QuotaError::StorageUnavailable("down".into())));
        assert!(!chain.should_fallback(&QuotaError::EntitlementNotFound { user_id: "u".into() }));
    }
}
