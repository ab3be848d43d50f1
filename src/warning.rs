//! Threshold-crossing callbacks.
//!
//! After a successful consume the manager compares usage before and after
//! against each configured fraction of the limit. Every boundary crossed fires
//! once, so a single large consumption can fire several warnings.

use crate::types::{PeriodType, UNLIMITED};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// One crossed threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaWarning {
    pub user_id: String,
    pub resource: String,
    pub period_type: PeriodType,
    /// Fraction of the limit, in `[0, 1]`.
    pub threshold: f64,
    pub used: i64,
    pub limit: i64,
    pub at: DateTime<Utc>,
}

/// Receives threshold warnings. Must not block.
pub trait WarningHandler: Send + Sync {
    fn on_warning(&self, warning: &QuotaWarning);
}

/// Discards warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWarningHandler;

impl WarningHandler for NoopWarningHandler {
    fn on_warning(&self, _warning: &QuotaWarning) {}
}

/// Adapts a closure into a [`WarningHandler`].
pub struct FnWarningHandler<F>(F);

impl<F> FnWarningHandler<F>
where
    F: Fn(&QuotaWarning) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FnWarningHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnWarningHandler")
    }
}

impl<F> WarningHandler for FnWarningHandler<F>
where
    F: Fn(&QuotaWarning) + Send + Sync,
{
    fn on_warning(&self, warning: &QuotaWarning) {
        (self.0)(warning)
    }
}

/// Shorthand for `Arc::new(FnWarningHandler::new(f))`.
pub fn warning_fn<F>(f: F) -> Arc<dyn WarningHandler>
where
    F: Fn(&QuotaWarning) + Send + Sync + 'static,
{
    Arc::new(FnWarningHandler::new(f))
}

/// Thresholds crossed when usage moves from `before` to `after`.
///
/// `thresholds` must be sorted ascending. Nothing is crossed for an unlimited
/// or non-positive limit.
pub fn crossed_thresholds(thresholds: &[f64], before: i64, after: i64, limit: i64) -> Vec<f64> {
    if limit == UNLIMITED || limit <= 0 {
        return Vec::new();
    }
    thresholds
        .iter()
        .copied()
        .filter(|&t| {
            let boundary = snap(t * limit as f64);
            (before as f64) < boundary && (after as f64) >= boundary
        })
        .collect()
}

// 0.8 * 100 is 80.00000000000001 in floating point.
fn snap(x: f64) -> f64 {
    let rounded = x.round();
    if (x - rounded).abs() < 1e-9 {
        rounded
    } else {
        x
    }
}
