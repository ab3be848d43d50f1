mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::test_helpers::{clock, entitlement, start, FlakyStorage};
use quotaguard::prelude::*;
use quotaguard::storage::TimeSource;
use quotaguard::{ManualClock, MemorySink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn config() -> Config {
    Config::with_default_tier("free", TierConfig::new().with_monthly("api", 10))
        .with_tier("pro", TierConfig::new().with_monthly("api", 1_000))
}

fn setup(clock: &ManualClock) -> Manager {
    Manager::builder(Arc::new(MemoryStorage::new()))
        .config(config())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn missing_entitlement_is_reported() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    assert_eq!(
        mgr.get_entitlement(&ctx, "nobody").await,
        Err(QuotaError::EntitlementNotFound { user_id: "nobody".into() })
    );
}

#[tokio::test]
async fn entitled_users_get_their_tier() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    mgr.set_entitlement(&ctx, &entitlement("u1", "pro", start())).await.unwrap();

    let usage = mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await.unwrap();
    assert_eq!(usage.limit, 1_000);
    assert_eq!(usage.tier, "pro");
}

#[tokio::test]
async fn expired_entitlements_fall_back_to_the_default_tier() {
    let clock = clock();
    let mgr = setup(&clock);
    let ctx = RequestContext::background();
    let mut pro = entitlement("u1", "pro", start());
    pro.expires_at = Some(start() + chrono::Duration::days(1));
    mgr.set_entitlement(&ctx, &pro).await.unwrap();

    assert_eq!(mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await.unwrap().limit, 1_000);
    clock.advance(chrono::Duration::days(2));
    assert_eq!(mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await.unwrap().limit, 10);
}

#[tokio::test]
async fn unconfigured_tiers_use_the_default_tier() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    mgr.set_entitlement(&ctx, &entitlement("u1", "legacy-gold", start())).await.unwrap();

    let usage = mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await.unwrap();
    assert_eq!((usage.limit, usage.tier.as_str()), (10, "free"));
}

#[tokio::test]
async fn set_entitlement_invalidates_the_cached_copy() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    mgr.set_entitlement(&ctx, &entitlement("u1", "free", start())).await.unwrap();
    assert_eq!(mgr.get_entitlement(&ctx, "u1").await.unwrap().tier, "free");

    mgr.set_entitlement(&ctx, &entitlement("u1", "pro", start())).await.unwrap();
    assert_eq!(mgr.get_entitlement(&ctx, "u1").await.unwrap().tier, "pro");
}

#[tokio::test]
async fn entitlement_reads_are_cached() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    mgr.set_entitlement(&ctx, &entitlement("u1", "free", start())).await.unwrap();

    for _ in 0..5 {
        mgr.get_entitlement(&ctx, "u1").await.unwrap();
    }
    let stats = mgr.cache_stats();
    assert_eq!((stats.misses, stats.hits), (1, 4));
}

#[tokio::test]
async fn cache_evicts_least_recently_used_entitlements() {
    let mut config = config();
    config.cache.max_entitlements = 2;
    let clock = clock();
    let mgr = Manager::builder(Arc::new(MemoryStorage::new()))
        .config(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let ctx = RequestContext::background();

    for user in ["u1", "u2", "u3"] {
        mgr.set_entitlement(&ctx, &entitlement(user, "free", start())).await.unwrap();
        mgr.get_entitlement(&ctx, user).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
    }
    let stats = mgr.cache_stats();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.entitlement_entries, 2);

    // u1 was the least recently used, so it is fetched again.
    let misses = mgr.cache_stats().misses;
    mgr.get_entitlement(&ctx, "u1").await.unwrap();
    assert_eq!(mgr.cache_stats().misses, misses + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_backend_read() {
    let clock = clock();
    let storage = Arc::new(FlakyStorage::new().with_delay(Duration::from_millis(100)));
    let build = || {
        Manager::builder(storage.clone())
            .config(config())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    };
    let ctx = RequestContext::background();
    let seed = build();
    seed.set_entitlement(&ctx, &entitlement("u1", "free", start())).await.unwrap();
    seed.consume(&ctx, "u1", "api", 7, PeriodType::Monthly, ConsumeOptions::new()).await.unwrap();
    let (entitlement_reads, usage_reads) = (storage.entitlement_reads(), storage.usage_reads());

    // A fresh manager starts with a cold cache.
    let mgr = Arc::new(build());
    let barrier = Arc::new(Barrier::new(16));
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let mgr = mgr.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let ctx = RequestContext::background();
                mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().used, 7);
    }
    assert_eq!(storage.entitlement_reads() - entitlement_reads, 1);
    assert_eq!(storage.usage_reads() - usage_reads, 1);
}

#[derive(Debug)]
struct FixedTime(DateTime<Utc>);

#[async_trait]
impl TimeSource for FixedTime {
    async fn now(&self) -> Result<DateTime<Utc>, QuotaError> {
        Ok(self.0)
    }
}

struct BrokenTime;

#[async_trait]
impl TimeSource for BrokenTime {
    async fn now(&self) -> Result<DateTime<Utc>, QuotaError> {
        Err(QuotaError::StorageUnavailable("clock offline".into()))
    }
}

#[tokio::test]
async fn backend_time_decides_the_period() {
    let backend_now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 7, 4, 8, 0, 0).unwrap();
    let mgr = Manager::builder(Arc::new(MemoryStorage::new()))
        .config(config())
        .clock(Arc::new(clock()))
        .time_source(Arc::new(FixedTime(backend_now)))
        .build()
        .unwrap();
    let ctx = RequestContext::background();

    let period = mgr.current_period(&ctx, "u1", PeriodType::Daily).await.unwrap();
    assert_eq!(period.start, chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 7, 4, 0, 0, 0).unwrap());
}

#[tokio::test]
async fn failing_time_source_uses_the_local_clock() {
    let mgr = Manager::builder(Arc::new(MemoryStorage::new()))
        .config(config())
        .clock(Arc::new(clock()))
        .time_source(Arc::new(BrokenTime))
        .build()
        .unwrap();
    let ctx = RequestContext::background();

    let period = mgr.current_period(&ctx, "u1", PeriodType::Daily).await.unwrap();
    assert_eq!(period.start, chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 10, 0, 0, 0).unwrap());
}

#[tokio::test]
async fn operations_emit_telemetry() {
    let sink = MemorySink::new();
    let mgr = Manager::builder(Arc::new(MemoryStorage::new()))
        .config(config())
        .clock(Arc::new(clock()))
        .telemetry(sink.clone())
        .build()
        .unwrap();
    let ctx = RequestContext::background();

    mgr.consume(&ctx, "u1", "api", 4, PeriodType::Monthly, ConsumeOptions::new()).await.unwrap();
    let _ = mgr.consume(&ctx, "u1", "api", 40, PeriodType::Monthly, ConsumeOptions::new()).await;
    mgr.refund(&ctx, "u1", "api", 1, PeriodType::Monthly, RefundOptions::new()).await.unwrap();

    assert_eq!(sink.count("consumption", "consumed"), 1);
    assert_eq!(sink.count("consumption", "denied"), 1);
    assert_eq!(sink.count("consumption", "refunded"), 1);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        QuotaEvent::Consumption(quotaguard::telemetry::ConsumptionEvent::Consumed { new_used: 4, .. })
    )));
}

#[tokio::test]
async fn config_updates_apply_to_the_next_call() {
    let mgr = setup(&clock());
    let ctx = RequestContext::background();
    assert!(mgr
        .consume(&ctx, "u1", "api", 50, PeriodType::Monthly, ConsumeOptions::new())
        .await
        .unwrap_err()
        .is_quota_exceeded());

    mgr.update_config(Config::with_default_tier("free", TierConfig::new().with_monthly("api", 100)))
        .unwrap();
    assert_eq!(mgr.config().tier("free").and_then(|t| t.limit(PeriodType::Monthly, "api")), Some(100));
    mgr.consume(&ctx, "u1", "api", 50, PeriodType::Monthly, ConsumeOptions::new()).await.unwrap();
}
