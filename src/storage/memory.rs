//! Transaction-safe in-process backend.
//!
//! A single mutex guards all state, so every mutation (including its bounds
//! check and idempotency-record write) runs as one unit. Nothing is awaited
//! while the lock is held.

use super::{AuditLogger, Storage};
use crate::error::QuotaError;
use crate::rate_limit::MemoryRateLimiter;
use crate::types::{
    checked_total, usage_key, AuditEntry, ConsumeRequest, ConsumptionRecord, Entitlement,
    LimitAdjustment, Period, PeriodType, RateLimitDecision, RateLimitRequest, RefundRecord,
    RefundRequest, TierChangeRequest, Usage, UNLIMITED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitOpKind {
    Add,
    Subtract,
}

impl LimitOpKind {
    fn as_str(&self) -> &'static str {
        match self {
            LimitOpKind::Add => "add_limit",
            LimitOpKind::Subtract => "subtract_limit",
        }
    }
}

#[derive(Debug, Default)]
struct State {
    entitlements: HashMap<String, Entitlement>,
    usage: HashMap<String, Usage>,
    // Limits written by a tier change; scoped to one period via the usage key.
    prorated_limits: HashMap<String, i64>,
    consumptions: HashMap<String, ConsumptionRecord>,
    refunds: HashMap<String, RefundRecord>,
    limit_ops: HashMap<String, (LimitOpKind, i64)>,
    audit: Vec<AuditEntry>,
}

impl State {
    /// Which operation kind already owns `key`, if any.
    fn key_owner(&self, key: &str, now: DateTime<Utc>) -> Option<&'static str> {
        if self.consumptions.get(key).is_some_and(|r| !r.is_expired(now)) {
            return Some("consume");
        }
        if self.refunds.contains_key(key) {
            return Some("refund");
        }
        self.limit_ops.get(key).map(|(kind, _)| kind.as_str())
    }

    fn conflict(&self, key: &str, ours: &str, now: DateTime<Utc>) -> Result<(), QuotaError> {
        match self.key_owner(key, now) {
            Some(existing) if existing != ours => Err(QuotaError::IdempotencyKeyExists {
                key: key.to_string(),
                existing: existing.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn upsert_usage(
        &mut self,
        key: String,
        template: UsageTemplate<'_>,
        update: impl FnOnce(&mut Usage),
    ) -> &Usage {
        let usage = self.usage.entry(key).or_insert_with(|| Usage {
            user_id: template.user_id.to_string(),
            resource: template.resource.to_string(),
            used: 0,
            limit: template.limit,
            period: template.period.clone(),
            tier: template.tier.to_string(),
            updated_at: template.now,
        });
        update(usage);
        usage.updated_at = template.now;
        usage
    }
}

struct UsageTemplate<'a> {
    user_id: &'a str,
    resource: &'a str,
    period: &'a Period,
    tier: &'a str,
    limit: i64,
    now: DateTime<Utc>,
}

/// Reference [`Storage`] and [`AuditLogger`] backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    limiter: MemoryRateLimiter,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn adjust_limit(
        &self,
        adj: &LimitAdjustment,
        kind: LimitOpKind,
    ) -> Result<i64, QuotaError> {
        if adj.period.period_type != PeriodType::Forever {
            return Err(QuotaError::InvalidPeriodType(format!(
                "{} requires a forever period, got {}",
                kind.as_str(),
                adj.period.period_type
            )));
        }

        let mut state = self.lock();
        if let Some(key) = &adj.idempotency_key {
            state.conflict(key, kind.as_str(), adj.now)?;
            if let Some((_, result)) = state.limit_ops.get(key) {
                return Ok(*result);
            }
        }

        let template = UsageTemplate {
            user_id: &adj.user_id,
            resource: &adj.resource,
            period: &adj.period,
            tier: &adj.tier,
            limit: adj.base_limit,
            now: adj.now,
        };
        let key = usage_key(&adj.user_id, &adj.resource, &adj.period);
        let new_limit = state
            .upsert_usage(key, template, |usage| {
                if usage.limit != UNLIMITED {
                    usage.limit = match kind {
                        LimitOpKind::Add => usage.limit.saturating_add(adj.amount),
                        LimitOpKind::Subtract => usage.limit.saturating_sub(adj.amount).max(0),
                    };
                }
            })
            .limit;

        if let Some(key) = &adj.idempotency_key {
            state.limit_ops.insert(key.clone(), (kind, new_limit));
        }
        Ok(new_limit)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_entitlement(&self, user_id: &str) -> Result<Option<Entitlement>, QuotaError> {
        Ok(self.lock().entitlements.get(user_id).cloned())
    }

    async fn set_entitlement(&self, entitlement: &Entitlement) -> Result<(), QuotaError> {
        self.lock().entitlements.insert(entitlement.user_id.clone(), entitlement.clone());
        Ok(())
    }

    async fn get_usage(
        &self,
        user_id: &str,
        resource: &str,
        period: &Period,
    ) -> Result<Option<Usage>, QuotaError> {
        Ok(self.lock().usage.get(&usage_key(user_id, resource, period)).cloned())
    }

    async fn consume_quota(&self, req: &ConsumeRequest) -> Result<i64, QuotaError> {
        if req.amount < 0 {
            return Err(QuotaError::InvalidAmount(req.amount));
        }

        let mut state = self.lock();
        if let Some(key) = &req.idempotency_key {
            state.conflict(key, "consume", req.now)?;
            let replay = state.consumptions.get(key).map(|r| (r.is_expired(req.now), r.new_used));
            match replay {
                Some((false, new_used)) => return Ok(new_used),
                Some((true, _)) => {
                    state.consumptions.remove(key);
                }
                None => {}
            }
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period);
        let existing = state.usage.get(&key);
        let used = existing.map_or(0, |u| u.used);
        let limit = match (req.period.period_type, existing) {
            (PeriodType::Forever, Some(usage)) => usage.limit,
            _ => state.prorated_limits.get(&key).copied().unwrap_or(req.limit),
        };

        let Some(total) = checked_total(used, req.amount, limit) else {
            return Err(QuotaError::QuotaExceeded {
                resource: req.resource.clone(),
                used,
                limit,
                requested: req.amount,
            });
        };

        let template = UsageTemplate {
            user_id: &req.user_id,
            resource: &req.resource,
            period: &req.period,
            tier: &req.tier,
            limit,
            now: req.now,
        };
        let new_used = state
            .upsert_usage(key, template, |usage| {
                usage.used = total;
                usage.limit = limit;
                usage.tier = req.tier.clone();
            })
            .used;

        if let Some(idem) = &req.idempotency_key {
            let expires_at = if req.idempotency_ttl.is_zero() {
                None
            } else {
                chrono::Duration::from_std(req.idempotency_ttl)
                    .ok()
                    .and_then(|ttl| req.now.checked_add_signed(ttl))
            };
            state.consumptions.insert(
                idem.clone(),
                ConsumptionRecord {
                    idempotency_key: idem.clone(),
                    user_id: req.user_id.clone(),
                    resource: req.resource.clone(),
                    amount: req.amount,
                    period_key: req.period.key(),
                    new_used,
                    recorded_at: req.now,
                    expires_at,
                },
            );
        }
        Ok(new_used)
    }

    async fn apply_tier_change(&self, req: &TierChangeRequest) -> Result<(), QuotaError> {
        let mut state = self.lock();
        let key = usage_key(&req.user_id, &req.resource, &req.period);
        let stored_used = state.usage.get(&key).map_or(req.current_used, |u| u.used);
        let adjusted = if req.adjusted_limit == UNLIMITED {
            UNLIMITED
        } else {
            req.adjusted_limit.max(stored_used)
        };

        state.prorated_limits.insert(key.clone(), adjusted);
        let template = UsageTemplate {
            user_id: &req.user_id,
            resource: &req.resource,
            period: &req.period,
            tier: &req.new_tier,
            limit: adjusted,
            now: req.changed_at,
        };
        state.upsert_usage(key, template, |usage| {
            usage.limit = adjusted;
            usage.tier = req.new_tier.clone();
        });
        Ok(())
    }

    async fn set_usage(
        &self,
        user_id: &str,
        resource: &str,
        usage: &Usage,
        period: &Period,
    ) -> Result<(), QuotaError> {
        let mut stored = usage.clone();
        stored.user_id = user_id.to_string();
        stored.resource = resource.to_string();
        stored.period = period.clone();
        self.lock().usage.insert(usage_key(user_id, resource, period), stored);
        Ok(())
    }

    async fn refund_quota(&self, req: &RefundRequest) -> Result<i64, QuotaError> {
        if req.amount < 0 {
            return Err(QuotaError::InvalidAmount(req.amount));
        }

        let mut state = self.lock();
        if let Some(key) = &req.idempotency_key {
            state.conflict(key, "refund", req.now)?;
            if let Some(record) = state.refunds.get(key) {
                return Ok(record.new_used);
            }
        }

        let key = usage_key(&req.user_id, &req.resource, &req.period);
        let new_used = match state.usage.get_mut(&key) {
            Some(usage) => {
                usage.used = usage.used.saturating_sub(req.amount).max(0);
                usage.updated_at = req.now;
                usage.used
            }
            None => 0,
        };

        if let Some(idem) = &req.idempotency_key {
            state.refunds.insert(
                idem.clone(),
                RefundRecord {
                    idempotency_key: idem.clone(),
                    user_id: req.user_id.clone(),
                    resource: req.resource.clone(),
                    amount: req.amount,
                    period_key: req.period.key(),
                    new_used,
                    reason: req.reason.clone(),
                    recorded_at: req.now,
                },
            );
        }
        Ok(new_used)
    }

    async fn get_refund_record(&self, key: &str) -> Result<Option<RefundRecord>, QuotaError> {
        Ok(self.lock().refunds.get(key).cloned())
    }

    async fn get_consumption_record(
        &self,
        key: &str,
    ) -> Result<Option<ConsumptionRecord>, QuotaError> {
        Ok(self.lock().consumptions.get(key).cloned())
    }

    async fn check_rate_limit(
        &self,
        req: &RateLimitRequest,
    ) -> Result<RateLimitDecision, QuotaError> {
        Ok(self.limiter.check_at(&req.user_id, &req.resource, &req.config, req.now))
    }

    async fn record_rate_limit_request(&self, req: &RateLimitRequest) -> Result<(), QuotaError> {
        self.limiter.record_at(&req.user_id, &req.resource, &req.config, req.now);
        Ok(())
    }

    async fn add_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.adjust_limit(adj, LimitOpKind::Add)
    }

    async fn subtract_limit(&self, adj: &LimitAdjustment) -> Result<i64, QuotaError> {
        self.adjust_limit(adj, LimitOpKind::Subtract)
    }
}

#[async_trait]
impl AuditLogger for MemoryStorage {
    async fn log_audit_entry(&self, entry: &AuditEntry) -> Result<(), QuotaError> {
        self.lock().audit.push(entry.clone());
        Ok(())
    }

    async fn get_audit_logs(&self, user_id: &str) -> Result<Vec<AuditEntry>, QuotaError> {
        Ok(self.lock().audit.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }
}
