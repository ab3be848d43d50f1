use quotaguard::circuit_breaker::CircuitState;
use quotaguard::telemetry::{
    CacheEvent, CacheKeyspace, CircuitBreakerEvent, ConsumptionEvent, FallbackEvent, QuotaEvent,
    RateLimitEvent,
};
use quotaguard::types::PeriodType;
use quotaguard_prometheus::PrometheusSink;
use prometheus::Registry;
use tower_service::Service;

fn counter_value(registry: &Registry, name: &str, label: &str, value: &str) -> f64 {
    let metric_families = registry.gather();
    let family = metric_families.iter().find(|mf| mf.get_name() == name);

    if let Some(family) = family {
        if let Some(m) = family
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_name() == label && l.get_value() == value))
        {
            if let Some(c) = m.get_counter().as_ref() {
                return c.value();
            }
        }
    }
    0.0
}

fn outcome(registry: &Registry, outcome: &str) -> f64 {
    counter_value(registry, "quotaguard_events_total", "outcome", outcome)
}

fn consumed(resource: &str, amount: i64) -> QuotaEvent {
    QuotaEvent::Consumption(ConsumptionEvent::Consumed {
        resource: resource.into(),
        period: PeriodType::Monthly,
        amount,
        new_used: amount,
    })
}

#[tokio::test]
async fn consumption_events_count_outcomes_and_units() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    sink.call(consumed("api", 3)).await.expect("sink call");
    sink.call(consumed("api", 4)).await.expect("sink call");
    sink.call(QuotaEvent::Consumption(ConsumptionEvent::Denied {
        resource: "api".into(),
        period: PeriodType::Daily,
        requested: 9,
    }))
    .await
    .expect("sink call");

    assert_eq!(outcome(&registry, "consumed"), 2.0);
    assert_eq!(outcome(&registry, "denied"), 1.0);
    assert_eq!(
        counter_value(&registry, "quotaguard_consumed_units_total", "resource", "api"),
        7.0
    );
}

#[tokio::test]
async fn resilience_events_are_labelled_by_kind() {
    let registry = Registry::new();
    let mut sink = PrometheusSink::new(registry.clone()).expect("Failed to create PrometheusSink");

    let cases = [
        (
            QuotaEvent::CircuitBreaker(CircuitBreakerEvent::Opened { from: CircuitState::Closed }),
            "opened",
        ),
        (QuotaEvent::CircuitBreaker(CircuitBreakerEvent::Closed), "closed"),
        (QuotaEvent::Fallback(FallbackEvent::Served { operation: "get_usage" }), "served"),
        (
            QuotaEvent::RateLimit(RateLimitEvent::FailedOpen { resource: "api".into() }),
            "failed_open",
        ),
        (QuotaEvent::Cache(CacheEvent::Hit { keyspace: CacheKeyspace::Usage }), "hit"),
    ];

    for (event, label) in cases {
        sink.call(event).await.expect("sink call");
        assert_eq!(outcome(&registry, label), 1.0);
    }
    assert_eq!(
        counter_value(&registry, "quotaguard_events_total", "kind", "circuit_breaker"),
        1.0,
        "each label pair is its own series"
    );
}

#[test]
fn duplicate_registration_fails() {
    let registry = Registry::new();
    let _first = PrometheusSink::new(registry.clone()).expect("first registration");
    assert!(PrometheusSink::new(registry).is_err());
}
