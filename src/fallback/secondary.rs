use super::FallbackStrategy;
use crate::error::QuotaError;
use crate::storage::Storage;
use crate::types::{Entitlement, Period, Usage};
use async_trait::async_trait;
use std::sync::Arc;

/// Reads from a second backend, e.g. a replica in another region.
pub struct SecondaryStorageFallback {
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for SecondaryStorageFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryStorageFallback").finish_non_exhaustive()
    }
}

impl SecondaryStorageFallback {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl FallbackStrategy for SecondaryStorageFallback {
    fn name(&self) -> &'static str {
        "secondary"
    }

    async fn fallback_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Usage, QuotaError> {
        self.storage
            .get_usage(user_id, resource, period)
            .await?
            .ok_or(QuotaError::FallbackUnavailable)
    }

    async fn fallback_entitlement(&self, user_id: &str) -> Result<Entitlement, QuotaError> {
        self.storage.get_entitlement(user_id).await?.ok_or(QuotaError::FallbackUnavailable)
    }

    fn allow_optimistic_consumption(&self, _usage: &Usage, _amount: i64) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    #[tokio::test]
    async fn reads_through_to_secondary() {
        let replica = Arc::new(MemoryStorage::new());
        replica
            .set_entitlement(&Entitlement {
                user_id: "u1".into(),
                tier: "pro".into(),
                subscription_start_date: Utc::now(),
                expires_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let fallback = SecondaryStorageFallback::new(replica);
        assert_eq!(fallback.fallback_entitlement("u1").await.unwrap().tier, "pro");
        assert_eq!(fallback.fallback_entitlement("u2").await, Err(QuotaError::FallbackUnavailable));
        assert_eq!(
            fallback.fallback_usage("u1", "api", &Period::forever()).await,
            Err(QuotaError::FallbackUnavailable)
        );
    }
}
