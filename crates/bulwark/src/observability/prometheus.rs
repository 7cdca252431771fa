//! Prometheus-backed [`MetricsCollector`]
//!
//! Metric families are created lazily on first use. Dots in names become
//! underscores and counters get a `_total` suffix, so
//! `resilience.circuitbreaker.success` is exported as
//! `resilience_circuitbreaker_success_total`. A family keeps the label names
//! of its first sample; later samples with a different label set are dropped
//! with a warning.

use std::fmt;

use dashmap::DashMap;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

use super::traits::MetricsCollector;

const TIMING_BUCKETS: &[f64] =
    &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0];

/// Exports metrics through a [`prometheus::Registry`]
pub struct PrometheusMetricsCollector {
    registry: Registry,
    counters: DashMap<String, CounterVec>,
    gauges: DashMap<String, GaugeVec>,
    histograms: DashMap<String, HistogramVec>,
}

impl fmt::Debug for PrometheusMetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusMetricsCollector")
            .field("counters", &self.counters.len())
            .field("gauges", &self.gauges.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

impl Default for PrometheusMetricsCollector {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl PrometheusMetricsCollector {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every family in the text exposition format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn register<C>(&self, name: &str, collector: C) -> Option<C>
    where
        C: prometheus::core::Collector + Clone + 'static,
    {
        match self.registry.register(Box::new(collector.clone())) {
            Ok(()) => Some(collector),
            Err(e) => {
                warn!(metric = name, error = %e, "Failed to register Prometheus metric");
                None
            }
        }
    }
}

/// `resilience.bulkhead.max.concurrent.calls` → `resilience_bulkhead_max_concurrent_calls`
pub fn sanitize_name(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect()
}

fn split_labels<'a>(labels: &[(&'a str, &'a str)]) -> (Vec<&'a str>, Vec<&'a str>) {
    labels.iter().copied().unzip()
}

impl MetricsCollector for PrometheusMetricsCollector {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let (keys, values) = split_labels(labels);
        let family = match self.counters.get(name) {
            Some(family) => family.clone(),
            None => {
                let metric_name = format!("{}_total", sanitize_name(name));
                let Ok(vec) = CounterVec::new(Opts::new(metric_name, name.to_string()), &keys)
                else {
                    warn!(metric = name, "Invalid counter definition");
                    return;
                };
                let Some(vec) = self.register(name, vec) else { return };
                self.counters.entry(name.to_string()).or_insert(vec).clone()
            }
        };
        match family.get_metric_with_label_values(&values) {
            Ok(counter) => counter.inc(),
            Err(e) => warn!(metric = name, error = %e, "Dropping counter sample"),
        }
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let (keys, values) = split_labels(labels);
        let family = match self.gauges.get(name) {
            Some(family) => family.clone(),
            None => {
                let Ok(vec) = GaugeVec::new(Opts::new(sanitize_name(name), name.to_string()), &keys)
                else {
                    warn!(metric = name, "Invalid gauge definition");
                    return;
                };
                let Some(vec) = self.register(name, vec) else { return };
                self.gauges.entry(name.to_string()).or_insert(vec).clone()
            }
        };
        match family.get_metric_with_label_values(&values) {
            Ok(gauge) => gauge.set(value),
            Err(e) => warn!(metric = name, error = %e, "Dropping gauge sample"),
        }
    }

    fn record_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let (keys, values) = split_labels(labels);
        let family = match self.histograms.get(name) {
            Some(family) => family.clone(),
            None => {
                let opts = HistogramOpts::new(sanitize_name(name), name.to_string())
                    .buckets(TIMING_BUCKETS.to_vec());
                let Ok(vec) = HistogramVec::new(opts, &keys) else {
                    warn!(metric = name, "Invalid histogram definition");
                    return;
                };
                let Some(vec) = self.register(name, vec) else { return };
                self.histograms.entry(name.to_string()).or_insert(vec).clone()
            }
        };
        match family.get_metric_with_label_values(&values) {
            Ok(histogram) => histogram.observe(value),
            Err(e) => warn!(metric = name, error = %e, "Dropping histogram sample"),
        }
    }
}
