//! Integration tests for metrics binding and health reporting
//!
//! A registry built from settings is bound to an in-memory collector; calls
//! through the decorator pipeline must show up as counters, gauges and in
//! the health report.

use std::sync::Arc;
use std::time::Duration;

use bulwark::config::ResilienceSettings;
use bulwark::observability::binder::{
    BULKHEAD_AVAILABLE, BULKHEAD_PERMITTED, CIRCUIT_BREAKER_ERROR, CIRCUIT_BREAKER_NOT_PERMITTED,
    CIRCUIT_BREAKER_STATE, CIRCUIT_BREAKER_TRANSITIONS,
};
use bulwark::observability::{
    CapacityLevel, MetricsBinder, MetricsCollector, RecordingMetricsCollector,
};
use bulwark::resilience::{
    decorate, CircuitState, FailureKind, HealthReport, HealthStatus, ResilienceRegistry,
    ResilientSpec,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("payment gateway timed out")]
struct GatewayTimeout;

fn registry() -> ResilienceRegistry {
    let settings = ResilienceSettings::from_json_str(
        r#"{
            "services": {
                "payment-service": {
                    "circuit_breaker": {"minimum_number_of_calls": 2, "sliding_window_size": 2},
                    "bulkhead": {"max_concurrent_calls": 4}
                },
                "inventory-service": {
                    "circuit_breaker": {}
                }
            }
        }"#,
    )
    .unwrap();
    ResilienceRegistry::from_settings(settings).unwrap()
}

fn bound(registry: &ResilienceRegistry) -> (Arc<RecordingMetricsCollector>, MetricsBinder) {
    let collector = Arc::new(RecordingMetricsCollector::new());
    let binder = MetricsBinder::new(Arc::clone(&collector) as Arc<dyn MetricsCollector>);
    binder.bind_registry(registry);
    (collector, binder)
}

// ============================================================================
// Metrics
// ============================================================================

/// Validates metrics flowing from decorated calls.
///
/// Assertions:
/// - Failures and the CLOSED → OPEN transition are counted per breaker.
/// - The rejected third call increments `not_permitted`.
/// - Bulkhead admissions are counted, including the rejected call's.
/// - Gauges reflect the open breaker and the idle bulkhead.
#[tokio::test]
async fn test_decorated_calls_reported_through_binder() {
    let registry = registry();
    let (collector, binder) = bound(&registry);
    let policies =
        registry.policies_for(&ResilientSpec::new("payment-service").retry(false).bulkhead(true)).unwrap();
    let mut call = decorate(|| async { Err::<(), _>(GatewayTimeout) }, &policies);

    for _ in 0..2 {
        assert_eq!(call.call().await.unwrap_err().kind(), FailureKind::OperationFailed);
    }
    assert_eq!(call.call().await.unwrap_err().kind(), FailureKind::CircuitOpen);

    let name = [("name", "payment-service")];
    assert_eq!(collector.counter(CIRCUIT_BREAKER_ERROR, &name), 2);
    assert_eq!(collector.counter(CIRCUIT_BREAKER_NOT_PERMITTED, &name), 1);
    assert_eq!(
        collector.counter(
            CIRCUIT_BREAKER_TRANSITIONS,
            &[("name", "payment-service"), ("from_state", "CLOSED"), ("to_state", "OPEN")],
        ),
        1
    );
    assert_eq!(collector.counter(BULKHEAD_PERMITTED, &name), 3);

    let warnings = binder.record_gauges();

    assert!(warnings.is_empty());
    assert_eq!(collector.gauge(CIRCUIT_BREAKER_STATE, &name), Some(1.0));
    assert_eq!(
        collector.gauge(CIRCUIT_BREAKER_STATE, &[("name", "inventory-service")]),
        Some(0.0)
    );
    assert_eq!(collector.gauge(BULKHEAD_AVAILABLE, &name), Some(4.0));
}

#[tokio::test]
async fn test_saturated_bulkhead_reported_as_critical() {
    let registry = registry();
    let (_collector, binder) = bound(&registry);
    let bulkhead = registry.bulkhead("payment-service").unwrap();

    let permits: Vec<_> = (0..4).map(|_| bulkhead.try_enter().unwrap()).collect();
    let warnings = binder.record_gauges();
    drop(permits);

    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].name, "payment-service");
    assert_eq!(warnings[0].level, CapacityLevel::Critical);
    assert!(binder.record_gauges().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gauge_reporter_stops_on_shutdown() {
    let registry = registry();
    let (collector, binder) = bound(&registry);
    let binder = Arc::new(binder);
    let shutdown = CancellationToken::new();

    let reporter = Arc::clone(&binder).spawn_gauge_reporter(Duration::from_secs(10), shutdown.clone());
    registry.circuit_breakers().require("inventory-service").unwrap().transition_to_forced_open();
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert_eq!(
        collector.gauge(CIRCUIT_BREAKER_STATE, &[("name", "inventory-service")]),
        Some(CircuitState::ForcedOpen.gauge_value())
    );

    shutdown.cancel();
    reporter.await.unwrap();
}

// ============================================================================
// Health
// ============================================================================

/// Validates the health report over a registry.
///
/// Assertions:
/// - Every breaker is reported under its name.
/// - One open breaker makes the aggregate DOWN.
/// - The JSON rendering carries statuses and states in upper case.
#[tokio::test]
async fn test_health_report_over_registry() {
    let registry = registry();
    assert!(HealthReport::from_registry(&registry).is_up());

    registry.circuit_breakers().require("payment-service").unwrap().transition_to_open();
    let report = HealthReport::from_registry(&registry);

    assert_eq!(report.status, HealthStatus::Down);
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.open, 1);
    assert_eq!(report.down_breakers(), vec!["payment-service"]);

    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["status"], "DOWN");
    assert_eq!(json["circuit_breakers"]["payment-service"]["state"], "OPEN");
    assert_eq!(json["circuit_breakers"]["inventory-service"]["status"], "UP");
    assert!(json["circuit_breakers"]["payment-service"]["time_in_state_ms"].is_u64());
}
