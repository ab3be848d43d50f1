use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use quotaguard::storage::{AuditLogger, MemoryStorage, Storage};
use quotaguard::types::{
    AuditEntry, ConsumeRequest, ConsumptionRecord, Entitlement, LimitAdjustment, Period,
    RateLimitDecision, RateLimitRequest, RefundRecord, RefundRequest, TierChangeRequest, Usage,
};
use quotaguard::{ManualClock, QuotaError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
}

pub fn clock() -> ManualClock {
    ManualClock::new(start())
}

pub fn entitlement(user_id: &str, tier: &str, start: DateTime<Utc>) -> Entitlement {
    Entitlement {
        user_id: user_id.into(),
        tier: tier.into(),
        subscription_start_date: start,
        expires_at: None,
        updated_at: start,
    }
}

/// In-memory backend that fails every call with `StorageUnavailable` while
/// `failing` is set. Reads can be slowed down with [`FlakyStorage::with_delay`].
#[derive(Debug, Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    failing: AtomicBool,
    calls: AtomicUsize,
    entitlement_reads: AtomicUsize,
    usage_reads: AtomicUsize,
    read_delay: Duration,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn entitlement_reads(&self) -> usize {
        self.entitlement_reads.load(Ordering::SeqCst)
    }

    pub fn usage_reads(&self) -> usize {
        self.usage_reads.load(Ordering::SeqCst)
    }

    async fn slow_read(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls that reached this backend, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), QuotaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(QuotaError::StorageUnavailable("injected outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError> {
        self.gate()?;
        self.slow_read(&self.entitlement_reads).await;
        self.inner.get_entitlement(user_id).await
    }

    async fn set_entitlement(&self, entitlement: &Entitlement) -> Result<(), QuotaError> {
        self.gate()?;
        self.inner.set_entitlement(entitlement).await
    }

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Option<Usage>, QuotaError> {
        self.gate()?;
        self.slow_read(&self.usage_reads).await;
        self.inner.get_usage(user_id, resource, period).await
    }

    async fn consume_quota(&self, req: &ConsumeRequest) -> Result<i64, QuotaError> {
        self.gate()?;
        self.inner.consume_quota(req).await
    }

    async fn apply_tier_change(&self, req: &TierChangeRequest) -> Result<(), QuotaError> {
        self.gate()?;
        self.inner.apply_tier_change(req).await
    }

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: &Usage,
        period: &Period,
    ) -> Result<(), QuotaError> {
        self.gate()?;
        self.inner.set_usage(user_id, resource, usage, period).await
    }

    async fn refund_quota(&self, req: &RefundRequest) -> Result<i64, QuotaError> {
        self.gate()?;
        self.inner.refund_quota(req).await
    }

    async fn get_refund_record(&self, key: &str) -> Result<Option<RefundRecord>, QuotaError> {
        self.gate()?;
        self.inner.get_refund_record(key).await
    }

    async fn get_consumption_record(
        &self,
        key: &str,
    ) -> Result<Option<ConsumptionRecord>, QuotaError> {
        self.gate()?;
        self.inner.get_consumption_record(key).await
    }

    async fn check_rate_limit(
        &self,
        req: &RateLimitRequest,
    ) -> Result<RateLimitDecision, QuotaError> {
        self.gate()?;
        self.inner.check_rate_limit(req).await
    }

    async fn record_rate_limit_request(&self, req: &RateLimitRequest) -> Result<(), QuotaError> {
        self.gate()?;
        self.inner.record_rate_limit_request(req).await
    }

    async fn add_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.gate()?;
        self.inner.add_limit(adj).await
    }

    async fn subtract_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.gate()?;
        self.inner.subtract_limit(adj).await
    }
}

#[async_trait]
impl AuditLogger for FlakyStorage {
    async fn log_audit_entry(&self, entry: &AuditEntry) -> Result<(), QuotaError> {
        self.gate()?;
        self.inner.log_audit_entry(entry).await
    }

    async fn get_audit_logs(&self, user_id: &str) -> Result<Vec<AuditEntry>, QuotaError> {
        self.inner.get_audit_logs(user_id).await
    }
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
