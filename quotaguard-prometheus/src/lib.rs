//! Prometheus metrics sink for `quotaguard`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use quotaguard::telemetry::{ConsumptionEvent, QuotaEvent, TelemetrySink};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    events: IntCounterVec,
    units: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// Two counters are registered:
    /// - `quotaguard_events_total{kind, outcome}` counts every event.
    /// - `quotaguard_consumed_units_total{resource}` sums successfully consumed amounts.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let events = IntCounterVec::new(
            prometheus::Opts::new("quotaguard_events_total", "Quota manager events"),
            &["kind", "outcome"],
        )?;
        let units = IntCounterVec::new(
            prometheus::Opts::new("quotaguard_consumed_units_total", "Units consumed per resource"),
            &["resource"],
        )?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(units.clone()))?;
        Ok(Self { registry, events, units })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<QuotaEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: QuotaEvent) -> Self::Future {
        self.events.with_label_values(&[event.kind(), event.outcome()]).inc();
        if let QuotaEvent::Consumption(ConsumptionEvent::Consumed { resource, amount, .. }) = &event {
            match u64::try_from(*amount) {
                Ok(amount) => self.units.with_label_values(&[resource.as_str()]).inc_by(amount),
                Err(_) => tracing::debug!(amount, "negative consumed amount not recorded"),
            }
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
