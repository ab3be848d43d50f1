//! Configuration surface consumed by the [`Manager`](crate::manager::Manager).
//!
//! Every struct has a `Default` and chainable `with_*` setters; `Config::validate`
//! rejects the combinations listed on [`ConfigError`].

use crate::error::ConfigError;
use crate::types::{PeriodType, UNLIMITED};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Rate-limiting algorithm. Unrecognized names are preserved so validation can
/// report them and limiters can fail open on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(from = "String", into = "String"))]
pub enum RateLimitAlgorithm {
    TokenBucket,
    SlidingWindow,
    Unknown(String),
}

impl From<String> for RateLimitAlgorithm {
    fn from(s: String) -> Self {
        match s.as_str() {
            "token_bucket" => Self::TokenBucket,
            "sliding_window" => Self::SlidingWindow,
            _ => Self::Unknown(s),
        }
    }
}

impl From<&str> for RateLimitAlgorithm {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<RateLimitAlgorithm> for String {
    fn from(a: RateLimitAlgorithm) -> Self {
        a.to_string()
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => f.write_str("token_bucket"),
            Self::SlidingWindow => f.write_str("sliding_window"),
            Self::Unknown(name) => f.write_str(name),
        }
    }
}

/// Per-resource request-rate policy.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    /// Requests (tokens) per `window`.
    pub rate: i64,
    pub window: Duration,
    /// Bucket capacity; zero means "same as `rate`".
    #[cfg_attr(feature = "serde", serde(default))]
    pub burst: i64,
}

impl RateLimitConfig {
    pub fn token_bucket(rate: i64, window: Duration) -> Self {
        Self { algorithm: RateLimitAlgorithm::TokenBucket, rate, window, burst: 0 }
    }

    pub fn sliding_window(rate: i64, window: Duration) -> Self {
        Self { algorithm: RateLimitAlgorithm::SlidingWindow, rate, window, burst: 0 }
    }

    pub fn with_burst(mut self, burst: i64) -> Self {
        self.burst = burst;
        self
    }

    /// Effective bucket capacity.
    pub fn capacity(&self) -> i64 {
        if self.burst > 0 {
            self.burst
        } else {
            self.rate
        }
    }
}

/// Limits and policy for one tier.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct TierConfig {
    pub daily_quotas: HashMap<String, i64>,
    pub monthly_quotas: HashMap<String, i64>,
    /// Fractions in `[0, 1]`; sorted on validation.
    pub warning_thresholds: Vec<f64>,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Forever credit granted before any purchase exists.
    pub initial_forever_credits: HashMap<String, i64>,
    /// Periods tried in order for [`PeriodType::Auto`].
    pub consumption_order: Vec<PeriodType>,
}

impl TierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_daily(mut self, resource: impl Into<String>, limit: i64) -> Self {
        self.daily_quotas.insert(resource.into(), limit);
        self
    }

    pub fn with_monthly(mut self, resource: impl Into<String>, limit: i64) -> Self {
        self.monthly_quotas.insert(resource.into(), limit);
        self
    }

    pub fn with_warning_thresholds(mut self, thresholds: impl Into<Vec<f64>>) -> Self {
        self.warning_thresholds = thresholds.into();
        self
    }

    pub fn with_rate_limit(mut self, resource: impl Into<String>, config: RateLimitConfig) -> Self {
        self.rate_limits.insert(resource.into(), config);
        self
    }

    pub fn with_initial_forever_credit(mut self, resource: impl Into<String>, credit: i64) -> Self {
        self.initial_forever_credits.insert(resource.into(), credit);
        self
    }

    pub fn with_consumption_order(mut self, order: impl Into<Vec<PeriodType>>) -> Self {
        self.consumption_order = order.into();
        self
    }

    /// Configured limit for a daily or monthly period. Forever limits live on the
    /// stored usage record instead.
    pub fn limit(&self, period_type: PeriodType, resource: &str) -> Option<i64> {
        match period_type {
            PeriodType::Daily => self.daily_quotas.get(resource).copied(),
            PeriodType::Monthly => self.monthly_quotas.get(resource).copied(),
            PeriodType::Forever | PeriodType::Auto => None,
        }
    }

    /// Order used when consuming with [`PeriodType::Auto`].
    pub fn consumption_order(&self) -> Vec<PeriodType> {
        if self.consumption_order.is_empty() {
            vec![PeriodType::Monthly, PeriodType::Forever]
        } else {
            self.consumption_order.clone()
        }
    }
}

/// Cache capacities and lifetimes. Capacities must be non-zero while the
/// cache is enabled.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CacheConfig {
    pub enabled: bool,
    pub entitlement_ttl: Duration,
    pub usage_ttl: Duration,
    pub max_entitlements: usize,
    pub max_usage: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entitlement_ttl: Duration::from_secs(300),
            usage_ttl: Duration::from_secs(10),
            max_entitlements: 10_000,
            max_usage: 10_000,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_entitlements == 0 {
            return Err(ConfigError::ZeroCacheCapacity("max_entitlements"));
        }
        if self.max_usage == 0 {
            return Err(ConfigError::ZeroCacheCapacity("max_usage"));
        }
        Ok(())
    }
}

/// Breaker guarding the storage backend.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures before opening.
    pub failure_threshold: usize,
    /// Time spent open before the breaker reports half-open.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, ConfigError> {
        let cfg = Self { enabled: true, failure_threshold, reset_timeout };
        cfg.validate()?;
        Ok(cfg)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { enabled: false, failure_threshold: usize::MAX, reset_timeout: Duration::MAX }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.reset_timeout == Duration::ZERO {
            return Err(ConfigError::InvalidResetTimeout);
        }
        Ok(())
    }
}

/// Strategies available to the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum FallbackKind {
    Cache,
    Secondary,
    Optimistic,
}

/// Composition of the fallback chain.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Tried in order.
    pub strategies: Vec<FallbackKind>,
    /// Oldest `updated_at` a cached record may have and still be served.
    pub max_staleness: Duration,
    /// Share of the limit that may be consumed optimistically during an outage.
    pub optimistic_percentage: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategies: vec![FallbackKind::Cache, FallbackKind::Optimistic],
            max_staleness: Duration::from_secs(300),
            optimistic_percentage: 10.0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Config {
    pub default_tier: String,
    pub tiers: HashMap<String, TierConfig>,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub fallback: FallbackConfig,
    /// Lifetime of idempotency receipts in seconds; zero keeps them forever.
    pub idempotency_ttl_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), TierConfig::default());
        Self {
            default_tier: "free".to_string(),
            tiers,
            cache: CacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            fallback: FallbackConfig::default(),
            idempotency_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Config {
    /// Config whose only tier is `default_tier`.
    pub fn with_default_tier(name: impl Into<String>, tier: TierConfig) -> Self {
        let name = name.into();
        let mut tiers = HashMap::new();
        tiers.insert(name.clone(), tier);
        Self { default_tier: name, tiers, ..Self::default() }
    }

    pub fn with_tier(mut self, name: impl Into<String>, tier: TierConfig) -> Self {
        self.tiers.insert(name.into(), tier);
        self
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }

    /// Idempotency TTL as a `Duration`; callers must validate first.
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs.max(0) as u64)
    }

    /// Reject invalid configurations and normalize threshold ordering.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.default_tier.is_empty() {
            return Err(ConfigError::MissingDefaultTier);
        }
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(ConfigError::DefaultTierNotConfigured(self.default_tier.clone()));
        }

        for (name, tier) in self.tiers.iter_mut() {
            validate_tier(name, tier)?;
        }

        if self.idempotency_ttl_secs < 0 {
            return Err(ConfigError::NegativeIdempotencyTtl);
        }

        let pct = self.fallback.optimistic_percentage;
        if !(0.0..=100.0).contains(&pct) || pct.is_nan() {
            return Err(ConfigError::InvalidOptimisticPercentage(pct));
        }

        self.cache.validate()?;
        self.circuit_breaker.validate()
    }
}

fn validate_tier(name: &str, tier: &mut TierConfig) -> Result<(), ConfigError> {
    let quotas = tier
        .daily_quotas
        .iter()
        .chain(tier.monthly_quotas.iter())
        .chain(tier.initial_forever_credits.iter());
    for (resource, &value) in quotas {
        // -1 is the unlimited sentinel; anything else below zero is a typo.
        if value < 0 && value != UNLIMITED {
            return Err(ConfigError::NegativeQuota {
                tier: name.to_string(),
                resource: resource.clone(),
                value,
            });
        }
    }

    for &value in &tier.warning_thresholds {
        if !(0.0..=1.0).contains(&value) || value.is_nan() {
            return Err(ConfigError::InvalidWarningThreshold { tier: name.to_string(), value });
        }
    }
    tier.warning_thresholds.sort_by(|a, b| a.total_cmp(b));
    tier.warning_thresholds.dedup();

    for (resource, rl) in &tier.rate_limits {
        if let RateLimitAlgorithm::Unknown(algorithm) = &rl.algorithm {
            return Err(ConfigError::UnknownRateLimitAlgorithm {
                tier: name.to_string(),
                resource: resource.clone(),
                algorithm: algorithm.clone(),
            });
        }
        if rl.window.is_zero() {
            return Err(ConfigError::NonPositiveRateLimitWindow {
                tier: name.to_string(),
                resource: resource.clone(),
            });
        }
        if rl.burst < 0 {
            return Err(ConfigError::NegativeBurst {
                tier: name.to_string(),
                resource: resource.clone(),
                value: rl.burst,
            });
        }
        if rl.rate < 0 {
            return Err(ConfigError::NegativeRate {
                tier: name.to_string(),
                resource: resource.clone(),
                value: rl.rate,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config::with_default_tier(
            "free",
            TierConfig::new()
                .with_monthly("api_calls", 100)
                .with_warning_thresholds(vec![0.8, 0.5])
                .with_rate_limit("api_calls", RateLimitConfig::token_bucket(10, Duration::from_secs(1))),
        )
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("default config is valid");
    }

    #[test]
    fn thresholds_are_sorted_on_validation() {
        let mut cfg = valid();
        cfg.validate().unwrap();
        assert_eq!(cfg.tiers["free"].warning_thresholds, vec![0.5, 0.8]);
    }

    #[test]
    fn rejects_missing_and_unknown_default_tier() {
        let mut cfg = valid();
        cfg.default_tier.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::MissingDefaultTier));

        let mut cfg = valid();
        cfg.default_tier = "gold".into();
        assert_eq!(cfg.validate(), Err(ConfigError::DefaultTierNotConfigured("gold".into())));
    }

    #[test]
    fn rejects_negative_quota_but_allows_unlimited() {
        let mut cfg = Config::with_default_tier("free", TierConfig::new().with_daily("x", UNLIMITED));
        assert!(cfg.validate().is_ok());

        let mut cfg = Config::with_default_tier("free", TierConfig::new().with_daily("x", -5));
        assert!(matches!(cfg.validate(), Err(ConfigError::NegativeQuota { value: -5, .. })));
    }

    #[test]
    fn rejects_bad_thresholds() {
        let mut cfg = Config::with_default_tier(
            "free",
            TierConfig::new().with_warning_thresholds(vec![0.5, 1.5]),
        );
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidWarningThreshold { .. })));
    }

    #[test]
    fn rejects_bad_rate_limits() {
        let bad_algo = RateLimitConfig {
            algorithm: "leaky_bucket".into(),
            rate: 1,
            window: Duration::from_secs(1),
            burst: 0,
        };
        let mut cfg =
            Config::with_default_tier("free", TierConfig::new().with_rate_limit("api", bad_algo));
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownRateLimitAlgorithm { .. })));

        let zero_window = RateLimitConfig::token_bucket(1, Duration::ZERO);
        let mut cfg =
            Config::with_default_tier("free", TierConfig::new().with_rate_limit("api", zero_window));
        assert!(matches!(cfg.validate(), Err(ConfigError::NonPositiveRateLimitWindow { .. })));

        let neg_burst = RateLimitConfig::token_bucket(1, Duration::from_secs(1)).with_burst(-1);
        let mut cfg =
            Config::with_default_tier("free", TierConfig::new().with_rate_limit("api", neg_burst));
        assert!(matches!(cfg.validate(), Err(ConfigError::NegativeBurst { .. })));
    }

    #[test]
    fn rejects_negative_ttl_and_bad_percentage() {
        let mut cfg = valid();
        cfg.idempotency_ttl_secs = -1;
        assert_eq!(cfg.validate(), Err(ConfigError::NegativeIdempotencyTtl));

        let mut cfg = valid();
        cfg.fallback.optimistic_percentage = 150.0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidOptimisticPercentage(150.0)));
    }

    #[test]
    fn rejects_zero_cache_capacity_unless_disabled() {
        let mut cfg = valid();
        cfg.cache.max_usage = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCacheCapacity("max_usage")));

        let mut cfg = valid();
        cfg.cache.max_entitlements = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroCacheCapacity("max_entitlements")));

        cfg.cache.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn burst_defaults_to_rate() {
        let rl = RateLimitConfig::token_bucket(10, Duration::from_secs(1));
        assert_eq!(rl.capacity(), 10);
        assert_eq!(rl.with_burst(20).capacity(), 20);
    }

    #[test]
    fn breaker_config_validation() {
        assert_eq!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1)),
            Err(ConfigError::InvalidFailureThreshold)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::ZERO),
            Err(ConfigError::InvalidResetTimeout)
        );
        assert!(CircuitBreakerConfig::disabled().validate().is_ok());
    }

    #[test]
    fn default_consumption_order() {
        assert_eq!(
            TierConfig::new().consumption_order(),
            vec![PeriodType::Monthly, PeriodType::Forever]
        );
    }
}
