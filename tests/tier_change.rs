mod common;

use chrono::{TimeZone, Utc};
use common::test_helpers::entitlement;
use quotaguard::prelude::*;
use quotaguard::ManualClock;
use std::sync::Arc;

fn config() -> Config {
    Config::with_default_tier("free", TierConfig::new().with_monthly("api", 100))
        .with_tier("pro", TierConfig::new().with_monthly("api", 1_000))
        .with_tier("enterprise", TierConfig::new().with_monthly("api", UNLIMITED))
}

// Cycle runs March 1 to April 1 (31 days); the clock sits 15 days in.
fn setup() -> (Arc<MemoryStorage>, Manager) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 16, 0, 0, 0).unwrap());
    let storage = Arc::new(MemoryStorage::new());
    let mgr = Manager::builder(storage.clone())
        .config(config())
        .clock(Arc::new(clock))
        .audit_logger(storage.clone())
        .build()
        .unwrap();
    (storage, mgr)
}

async fn subscribe(mgr: &Manager, user_id: &str, tier: &str) {
    let ctx = RequestContext::background();
    let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    mgr.set_entitlement(&ctx, &entitlement(user_id, tier, anchor)).await.unwrap();
}

#[tokio::test]
async fn upgrade_blends_old_and_new_allowance() {
    let (_storage, mgr) = setup();
    let ctx = RequestContext::background();
    subscribe(&mgr, "u1", "free").await;
    mgr.consume(&ctx, "u1", "api", 80, PeriodType::Monthly, ConsumeOptions::new()).await.unwrap();

    let change = mgr.apply_tier_change(&ctx, "u1", "free", "pro", "api").await.unwrap();
    // round(100 * 15/31) + round(1000 * 16/31) = 48 + 516
    assert_eq!(change.adjusted_limit, 564);
    assert_eq!((change.old_limit, change.new_limit, change.current_used), (100, 1_000, 80));
    assert!((change.remaining_fraction - 16.0 / 31.0).abs() < 1e-9);

    assert_eq!(
        mgr.consume(&ctx, "u1", "api", 484, PeriodType::Monthly, ConsumeOptions::new())
            .await
            .unwrap(),
        564
    );
    let err = mgr
        .consume(&ctx, "u1", "api", 1, PeriodType::Monthly, ConsumeOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_quota_exceeded());
}

#[tokio::test]
async fn downgrade_never_drops_below_current_usage() {
    let (_storage, mgr) = setup();
    let ctx = RequestContext::background();
    subscribe(&mgr, "u1", "pro").await;
    mgr.consume(&ctx, "u1", "api", 900, PeriodType::Monthly, ConsumeOptions::new()).await.unwrap();

    let change = mgr.apply_tier_change(&ctx, "u1", "pro", "free", "api").await.unwrap();
    assert_eq!(change.adjusted_limit, 900);

    let usage = mgr.get_quota(&ctx, "u1", "api", PeriodType::Monthly).await.unwrap();
    assert_eq!((usage.used, usage.limit), (900, 900));
    assert!(mgr
        .consume(&ctx, "u1", "api", 1, PeriodType::Monthly, ConsumeOptions::new())
        .await
        .unwrap_err()
        .is_quota_exceeded());
}

#[tokio::test]
async fn upgrade_to_unlimited_stays_unlimited() {
    let (_storage, mgr) = setup();
    let ctx = RequestContext::background();
    subscribe(&mgr, "u1", "pro").await;

    let change = mgr.apply_tier_change(&ctx, "u1", "pro", "enterprise", "api").await.unwrap();
    assert_eq!(change.adjusted_limit, UNLIMITED);
    mgr.consume(&ctx, "u1", "api", 50_000, PeriodType::Monthly, ConsumeOptions::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_tiers_are_rejected() {
    let (_storage, mgr) = setup();
    let ctx = RequestContext::background();
    assert_eq!(
        mgr.apply_tier_change(&ctx, "u1", "free", "platinum", "api").await,
        Err(QuotaError::UnknownTier("platinum".into()))
    );
}

#[tokio::test]
async fn tier_changes_are_audited() {
    let (_storage, mgr) = setup();
    let ctx = RequestContext::background();
    subscribe(&mgr, "u1", "free").await;
    mgr.apply_tier_change(&ctx, "u1", "free", "pro", "api").await.unwrap();

    let logs = mgr.audit_logs(&ctx, "u1").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, "tier_change");
    assert_eq!(logs[0].metadata.get("old_tier").map(String::as_str), Some("free"));
    assert_eq!(logs[0].metadata.get("new_tier").map(String::as_str), Some("pro"));
}
