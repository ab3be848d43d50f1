//! Convenient re-exports for common quotaguard types.
pub use crate::{
    cache::{Cache, CacheStats, LruCache},
    circuit_breaker::CircuitState,
    config::{
        CacheConfig, CircuitBreakerConfig, Config, FallbackConfig, FallbackKind, RateLimitConfig,
        TierConfig,
    },
    context::RequestContext,
    error::{ConfigError, QuotaError},
    manager::{AdminOptions, ConsumeOptions, LimitOptions, Manager, RefundOptions, TierChange},
    storage::{MemoryStorage, Storage},
    telemetry::{LogSink, MemorySink, QuotaEvent},
    types::{Entitlement, Period, PeriodType, Usage, UNLIMITED},
    warning::{warning_fn, QuotaWarning, WarningHandler},
};
