//! Trait abstractions for metrics collection
//!
//! Policies never talk to a metrics backend directly. The
//! [`MetricsBinder`](super::MetricsBinder) translates their events into calls
//! on a [`MetricsCollector`], so any backend can be plugged in.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;

// ============================================================================
// Metrics Collection Traits
// ============================================================================

/// Trait for metrics collection implementations
///
/// Metric names are dotted (`resilience.circuitbreaker.success`); backends
/// with stricter naming rules translate them.
pub trait MetricsCollector: Send + Sync + Debug {
    /// Record a counter metric
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Record a gauge metric
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record a histogram metric
    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Record timing metric (in milliseconds)
    fn record_timing(&self, name: &str, duration_ms: u64, labels: &[(&str, &str)]) {
        self.record_histogram(name, duration_ms as f64, labels);
    }
}

/// No-op metrics collector for when metrics are disabled
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {
        // No-op
    }

    fn record_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {
        // No-op
    }

    fn record_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {
        // No-op
    }
}

// ============================================================================
// Recording Collector
// ============================================================================

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    let mut labels: Vec<(String, String)> =
        labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
    labels.sort();
    (name.to_string(), labels)
}

#[derive(Debug, Default)]
struct Recorded {
    counters: BTreeMap<SeriesKey, u64>,
    gauges: BTreeMap<SeriesKey, f64>,
    histograms: BTreeMap<SeriesKey, Vec<f64>>,
}

/// In-memory collector that keeps every series, for tests and diagnostics
///
/// Series are identified by name plus label set; label order does not
/// matter.
#[derive(Debug, Default)]
pub struct RecordingMetricsCollector {
    recorded: Mutex<Recorded>,
}

impl RecordingMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, `0` if never incremented
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.recorded.lock().counters.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    /// Sum of a counter over every label set
    pub fn counter_total(&self, name: &str) -> u64 {
        self.recorded
            .lock()
            .counters
            .iter()
            .filter(|((series, _), _)| series == name)
            .map(|(_, count)| count)
            .sum()
    }

    /// Last recorded gauge value
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.recorded.lock().gauges.get(&series_key(name, labels)).copied()
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.recorded.lock().histograms.get(&series_key(name, labels)).cloned().unwrap_or_default()
    }

    /// Names of every recorded series, deduplicated and sorted
    pub fn metric_names(&self) -> Vec<String> {
        let recorded = self.recorded.lock();
        let mut names: Vec<String> = recorded
            .counters
            .keys()
            .chain(recorded.gauges.keys())
            .chain(recorded.histograms.keys())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn clear(&self) {
        *self.recorded.lock() = Recorded::default();
    }
}

impl MetricsCollector for RecordingMetricsCollector {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self.recorded.lock().counters.entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.recorded.lock().gauges.insert(series_key(name, labels), value);
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.recorded.lock().histograms.entry(series_key(name, labels)).or_default().push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the noop metrics collector scenario.
    ///
    /// Assertion coverage: ensures the routine completes without panicking.
    #[test]
    fn test_noop_metrics_collector() {
        let collector = NoOpMetricsCollector;
        collector.increment_counter("resilience.retry.attempts", &[("name", "svc")]);
        collector.record_gauge("resilience.bulkhead.max.concurrent.calls", 25.0, &[]);
        collector.record_timing("resilience.circuitbreaker.calls", 12, &[]);
    }

    /// Validates series identity in the recording collector.
    ///
    /// Assertions:
    /// - Label order does not split a series.
    /// - Different label values are separate series.
    #[test]
    fn test_recording_collector_series() {
        let collector = RecordingMetricsCollector::new();
        let transition = [("name", "svc"), ("from_state", "CLOSED"), ("to_state", "OPEN")];
        collector.increment_counter("resilience.circuitbreaker.state.transitions", &transition);
        collector.increment_counter(
            "resilience.circuitbreaker.state.transitions",
            &[("to_state", "OPEN"), ("from_state", "CLOSED"), ("name", "svc")],
        );
        collector.increment_counter("resilience.circuitbreaker.success", &[("name", "a")]);
        collector.increment_counter("resilience.circuitbreaker.success", &[("name", "b")]);

        assert_eq!(collector.counter("resilience.circuitbreaker.state.transitions", &transition), 2);
        assert_eq!(collector.counter("resilience.circuitbreaker.success", &[("name", "a")]), 1);
        assert_eq!(collector.counter_total("resilience.circuitbreaker.success"), 2);
        assert_eq!(collector.counter("resilience.circuitbreaker.error", &[]), 0);
    }

    #[test]
    fn test_recording_collector_gauges_and_histograms() {
        let collector = RecordingMetricsCollector::new();
        collector.record_gauge("resilience.circuitbreaker.state", 0.0, &[("name", "svc")]);
        collector.record_gauge("resilience.circuitbreaker.state", 1.0, &[("name", "svc")]);
        collector.record_timing("resilience.circuitbreaker.calls", 40, &[("name", "svc")]);

        assert_eq!(collector.gauge("resilience.circuitbreaker.state", &[("name", "svc")]), Some(1.0));
        assert_eq!(collector.histogram("resilience.circuitbreaker.calls", &[("name", "svc")]), vec![40.0]);
        assert_eq!(
            collector.metric_names(),
            vec!["resilience.circuitbreaker.calls", "resilience.circuitbreaker.state"]
        );

        collector.clear();
        assert!(collector.metric_names().is_empty());
    }
}
