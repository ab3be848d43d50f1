#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Quota enforcement for multi-tenant services: per-user limits on named
//! resources, measured over daily, monthly (anchored to the subscription
//! start) and forever periods.
//!
//! ## Features
//!
//! - **Tiered quotas** with daily and monthly limits plus forever credits
//! - **Idempotent consumption** and refunds keyed by caller-supplied ids
//! - **Mid-cycle tier changes** prorated against the remaining cycle
//! - **Rate limiting** with token bucket and sliding window algorithms
//! - **Circuit breaker** around the storage backend
//! - **Fallback chain** (stale cache, secondary backend, optimistic budget)
//! - **Warnings** when usage crosses configured fractions of the limit
//! - **Telemetry** through a `tower::Service` sink
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaguard::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::with_default_tier(
//!         "free",
//!         TierConfig::new()
//!             .with_monthly("api_calls", 1_000)
//!             .with_warning_thresholds([0.8, 0.95]),
//!     );
//!     let manager = Manager::builder(Arc::new(MemoryStorage::new()))
//!         .config(config)
//!         .build()?;
//!
//!     let ctx = RequestContext::background();
//!     let used = manager
//!         .consume(
//!             &ctx,
//!             "user-42",
//!             "api_calls",
//!             1,
//!             PeriodType::Monthly,
//!             ConsumeOptions::new().with_idempotency_key("req-7f3a"),
//!         )
//!         .await?;
//!     assert_eq!(used, 1);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod coalesce;
pub mod config;
pub mod context;
pub mod cycle;
pub mod dynamic;
pub mod error;
pub mod fallback;
pub mod manager;
pub mod prelude;
pub mod rate_limit;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod warning;

// Re-exports
pub use cache::{Cache, CacheStats, LruCache, NoopCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStorage, CircuitState, StateObserver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, CircuitBreakerConfig, Config, FallbackConfig, FallbackKind, RateLimitAlgorithm,
    RateLimitConfig, TierConfig,
};
pub use context::RequestContext;
pub use dynamic::DynamicConfig;
pub use error::{ConfigError, QuotaError};
pub use fallback::{
    CacheFallback, CompositeFallback, FallbackStrategy, OptimisticFallback,
    SecondaryStorageFallback,
};
pub use manager::{
    AdminOptions, ConsumeOptions, LimitOptions, Manager, ManagerBuilder, RefundOptions, TierChange,
};
pub use rate_limit::{MemoryRateLimiter, RateLimiter, StorageRateLimiter};
pub use storage::{AuditLogger, MemoryStorage, Storage, TimeSource};
pub use telemetry::{LogSink, MemorySink, NullSink, QuotaEvent, TelemetrySink};
pub use types::{AuditEntry, Entitlement, Period, PeriodType, Usage, UNLIMITED};
pub use warning::{warning_fn, QuotaWarning, WarningHandler};
