//! Event → metrics bridge
//!
//! Binding an instance subscribes to its event stream: every event becomes a
//! counter increment (and, for recorded calls, a timing sample) with a `name`
//! label. Gauges are snapshots, pushed by [`MetricsBinder::record_gauges`] or
//! periodically by [`MetricsBinder::spawn_gauge_reporter`]; the same pass logs
//! capacity warnings for bulkheads above 80% and 90% usage.
//!
//! Binding the same instance twice subscribes twice and doubles its counters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::traits::MetricsCollector;
use crate::resilience::circuit_breaker::StateHandle;
use crate::resilience::{
    Bulkhead, BulkheadEvent, BulkheadEventKind, CircuitBreaker, CircuitBreakerEvent,
    CircuitBreakerEventKind, RateLimiter, RateLimiterEvent, RateLimiterEventKind,
    ResilienceRegistry, Retry, RetryEvent, RetryEventKind, ThreadPoolBulkhead,
};

// ---- Metric names ----

pub const CIRCUIT_BREAKER_SUCCESS: &str = "resilience.circuitbreaker.success";
pub const CIRCUIT_BREAKER_ERROR: &str = "resilience.circuitbreaker.error";
pub const CIRCUIT_BREAKER_IGNORED: &str = "resilience.circuitbreaker.ignored";
pub const CIRCUIT_BREAKER_NOT_PERMITTED: &str = "resilience.circuitbreaker.not_permitted";
pub const CIRCUIT_BREAKER_TRANSITIONS: &str = "resilience.circuitbreaker.state.transitions";
pub const CIRCUIT_BREAKER_STATE: &str = "resilience.circuitbreaker.state";
pub const CIRCUIT_BREAKER_CALLS: &str = "resilience.circuitbreaker.calls";

pub const RETRY_ATTEMPTS: &str = "resilience.retry.attempts";
pub const RETRY_SUCCESS: &str = "resilience.retry.success";
pub const RETRY_EXHAUSTED: &str = "resilience.retry.exhausted";

pub const RATE_LIMITER_SUCCESS: &str = "resilience.ratelimiter.success";
pub const RATE_LIMITER_REJECTED: &str = "resilience.ratelimiter.rejected";
pub const RATE_LIMITER_AVAILABLE: &str = "resilience.ratelimiter.available.permissions";
pub const RATE_LIMITER_WAITING: &str = "resilience.ratelimiter.waiting.tasks";

pub const BULKHEAD_PERMITTED: &str = "resilience.bulkhead.permitted";
pub const BULKHEAD_REJECTED: &str = "resilience.bulkhead.rejected";
pub const BULKHEAD_FINISHED: &str = "resilience.bulkhead.finished";
pub const BULKHEAD_AVAILABLE: &str = "resilience.bulkhead.available.concurrent.calls";
pub const BULKHEAD_MAX: &str = "resilience.bulkhead.max.concurrent.calls";

pub const THREAD_POOL_SIZE: &str = "resilience.bulkhead.threadpool.size";
pub const THREAD_POOL_CORE_SIZE: &str = "resilience.bulkhead.threadpool.core.size";
pub const THREAD_POOL_QUEUE_CAPACITY: &str = "resilience.bulkhead.threadpool.queue.capacity";
pub const THREAD_POOL_QUEUE_DEPTH: &str = "resilience.bulkhead.threadpool.queue.depth";
pub const THREAD_POOL_QUEUE_REMAINING: &str = "resilience.bulkhead.threadpool.queue.remaining";

const WARNING_USAGE: f64 = 0.8;
const CRITICAL_USAGE: f64 = 0.9;

/// Severity of a capacity warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapacityLevel {
    /// Usage above 80%
    Warning,
    /// Usage above 90%
    Critical,
}

impl CapacityLevel {
    pub fn for_usage(usage: f64) -> Option<Self> {
        if usage > CRITICAL_USAGE {
            Some(Self::Critical)
        } else if usage > WARNING_USAGE {
            Some(Self::Warning)
        } else {
            None
        }
    }
}

/// A bulkhead running close to its limit
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityWarning {
    pub name: String,
    /// `"bulkhead"` or `"thread-pool queue"`
    pub resource: &'static str,
    /// Fraction in use, 0.0 to 1.0
    pub usage: f64,
    pub level: CapacityLevel,
}

#[derive(Default)]
struct Bound {
    circuit_breakers: Vec<CircuitBreaker>,
    rate_limiters: Vec<RateLimiter>,
    bulkheads: Vec<Bulkhead>,
    thread_pool_bulkheads: Vec<ThreadPoolBulkhead>,
}

/// Subscribes a [`MetricsCollector`] to policy events
pub struct MetricsBinder {
    collector: Arc<dyn MetricsCollector>,
    bound: Mutex<Bound>,
}

impl fmt::Debug for MetricsBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = self.bound.lock();
        f.debug_struct("MetricsBinder")
            .field("collector", &self.collector)
            .field("circuit_breakers", &bound.circuit_breakers.len())
            .field("rate_limiters", &bound.rate_limiters.len())
            .field("bulkheads", &bound.bulkheads.len())
            .field("thread_pool_bulkheads", &bound.thread_pool_bulkheads.len())
            .finish()
    }
}

impl MetricsBinder {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self { collector, bound: Mutex::new(Bound::default()) }
    }

    pub fn collector(&self) -> &Arc<dyn MetricsCollector> {
        &self.collector
    }

    pub fn bind_circuit_breaker(&self, breaker: &CircuitBreaker) {
        let collector = Arc::clone(&self.collector);
        let state = breaker.state_handle();
        breaker.events().subscribe(move |event: &CircuitBreakerEvent| {
            record_circuit_breaker_event(collector.as_ref(), event, &state);
        });
        self.collector.record_gauge(
            CIRCUIT_BREAKER_STATE,
            breaker.state().gauge_value(),
            &[("name", breaker.name())],
        );
        self.bound.lock().circuit_breakers.push(breaker.clone());
        debug!(name = %breaker.name(), "Bound circuit breaker metrics");
    }

    pub fn bind_retry(&self, retry: &Retry) {
        let collector = Arc::clone(&self.collector);
        retry.events().subscribe(move |event: &RetryEvent| {
            let labels = [("name", event.name.as_ref())];
            match &event.kind {
                RetryEventKind::Retry { .. } => collector.increment_counter(RETRY_ATTEMPTS, &labels),
                RetryEventKind::Success { .. } => collector.increment_counter(RETRY_SUCCESS, &labels),
                RetryEventKind::Exhausted { .. } => {
                    collector.increment_counter(RETRY_EXHAUSTED, &labels);
                }
                RetryEventKind::IgnoredError { .. } | RetryEventKind::Error { .. } => {}
            }
        });
        debug!(name = %retry.name(), "Bound retry metrics");
    }

    pub fn bind_rate_limiter(&self, limiter: &RateLimiter) {
        let collector = Arc::clone(&self.collector);
        limiter.events().subscribe(move |event: &RateLimiterEvent| {
            let labels = [("name", event.name.as_ref())];
            let counter = match event.kind {
                RateLimiterEventKind::SuccessfulAcquire => RATE_LIMITER_SUCCESS,
                RateLimiterEventKind::FailedAcquire => RATE_LIMITER_REJECTED,
            };
            collector.increment_counter(counter, &labels);
        });
        self.bound.lock().rate_limiters.push(limiter.clone());
        debug!(name = %limiter.name(), "Bound rate limiter metrics");
    }

    pub fn bind_bulkhead(&self, bulkhead: &Bulkhead) {
        bulkhead.events().subscribe(self.bulkhead_consumer());
        self.bound.lock().bulkheads.push(bulkhead.clone());
        debug!(name = %bulkhead.name(), "Bound bulkhead metrics");
    }

    pub fn bind_thread_pool_bulkhead(&self, pool: &ThreadPoolBulkhead) {
        pool.events().subscribe(self.bulkhead_consumer());
        self.bound.lock().thread_pool_bulkheads.push(pool.clone());
        debug!(name = %pool.name(), "Bound thread-pool bulkhead metrics");
    }

    fn bulkhead_consumer(&self) -> impl Fn(&BulkheadEvent) + Send + Sync + 'static {
        let collector = Arc::clone(&self.collector);
        move |event: &BulkheadEvent| {
            let counter = match event.kind {
                BulkheadEventKind::CallPermitted => BULKHEAD_PERMITTED,
                BulkheadEventKind::CallRejected => BULKHEAD_REJECTED,
                BulkheadEventKind::CallFinished => BULKHEAD_FINISHED,
            };
            collector.increment_counter(counter, &[("name", event.name.as_ref())]);
        }
    }

    /// Bind every instance currently in `registry`
    ///
    /// Instances created later are not bound automatically.
    pub fn bind_registry(&self, registry: &ResilienceRegistry) {
        for (_, breaker) in registry.circuit_breakers().all() {
            self.bind_circuit_breaker(&breaker);
        }
        for (_, retry) in registry.retries().all() {
            self.bind_retry(&retry);
        }
        for (_, limiter) in registry.rate_limiters().all() {
            self.bind_rate_limiter(&limiter);
        }
        for (_, bulkhead) in registry.bulkheads().all() {
            self.bind_bulkhead(&bulkhead);
        }
        for (_, pool) in registry.thread_pool_bulkheads().all() {
            self.bind_thread_pool_bulkhead(&pool);
        }
    }

    /// Push gauge snapshots of every bound instance
    ///
    /// Returns the capacity warnings found in this pass; each is also logged.
    pub fn record_gauges(&self) -> Vec<CapacityWarning> {
        let bound = self.bound.lock();
        let collector = self.collector.as_ref();
        let mut warnings = Vec::new();

        for breaker in &bound.circuit_breakers {
            collector.record_gauge(
                CIRCUIT_BREAKER_STATE,
                breaker.state().gauge_value(),
                &[("name", breaker.name())],
            );
        }

        for limiter in &bound.rate_limiters {
            let metrics = limiter.metrics();
            let labels = [("name", limiter.name())];
            collector.record_gauge(
                RATE_LIMITER_AVAILABLE,
                f64::from(metrics.available_permissions),
                &labels,
            );
            collector.record_gauge(
                RATE_LIMITER_WAITING,
                metrics.number_of_waiting_tasks as f64,
                &labels,
            );
        }

        for bulkhead in &bound.bulkheads {
            let metrics = bulkhead.metrics();
            let labels = [("name", bulkhead.name())];
            collector.record_gauge(
                BULKHEAD_AVAILABLE,
                f64::from(metrics.available_concurrent_calls),
                &labels,
            );
            collector.record_gauge(BULKHEAD_MAX, f64::from(metrics.max_concurrent_calls), &labels);
            warnings.extend(capacity_warning(bulkhead.name(), "bulkhead", metrics.utilization()));
        }

        for pool in &bound.thread_pool_bulkheads {
            let metrics = pool.metrics();
            let labels = [("name", pool.name())];
            collector.record_gauge(THREAD_POOL_SIZE, f64::from(metrics.thread_pool_size), &labels);
            collector.record_gauge(
                THREAD_POOL_CORE_SIZE,
                f64::from(metrics.core_thread_pool_size),
                &labels,
            );
            collector.record_gauge(
                THREAD_POOL_QUEUE_CAPACITY,
                f64::from(metrics.queue_capacity),
                &labels,
            );
            collector.record_gauge(THREAD_POOL_QUEUE_DEPTH, f64::from(metrics.queue_depth), &labels);
            collector.record_gauge(
                THREAD_POOL_QUEUE_REMAINING,
                f64::from(metrics.remaining_queue_capacity),
                &labels,
            );
            if metrics.queue_capacity > 0 {
                let usage = f64::from(metrics.queue_depth) / f64::from(metrics.queue_capacity);
                warnings.extend(capacity_warning(pool.name(), "thread-pool queue", usage));
            }
        }

        warnings
    }

    /// Call [`record_gauges`](Self::record_gauges) every `interval` until
    /// `shutdown` is cancelled
    pub fn spawn_gauge_reporter(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.record_gauges();
                    }
                }
            }
            debug!("Gauge reporter stopped");
        })
    }
}

fn record_circuit_breaker_event(
    collector: &dyn MetricsCollector,
    event: &CircuitBreakerEvent,
    state: &StateHandle,
) {
    let name = event.name.as_ref();
    let labels = [("name", name)];
    match &event.kind {
        CircuitBreakerEventKind::Success { duration } => {
            collector.increment_counter(CIRCUIT_BREAKER_SUCCESS, &labels);
            collector.record_timing(
                CIRCUIT_BREAKER_CALLS,
                duration.as_millis() as u64,
                &[("name", name), ("kind", "successful")],
            );
        }
        CircuitBreakerEventKind::Error { duration, .. } => {
            collector.increment_counter(CIRCUIT_BREAKER_ERROR, &labels);
            collector.record_timing(
                CIRCUIT_BREAKER_CALLS,
                duration.as_millis() as u64,
                &[("name", name), ("kind", "failed")],
            );
        }
        CircuitBreakerEventKind::IgnoredError { .. } => {
            collector.increment_counter(CIRCUIT_BREAKER_IGNORED, &labels);
        }
        CircuitBreakerEventKind::CallNotPermitted => {
            collector.increment_counter(CIRCUIT_BREAKER_NOT_PERMITTED, &labels);
        }
        CircuitBreakerEventKind::StateTransition { from, to } => {
            let from_state = from.to_string();
            let to_state = to.to_string();
            collector.increment_counter(
                CIRCUIT_BREAKER_TRANSITIONS,
                &[("name", name), ("from_state", &from_state), ("to_state", &to_state)],
            );
            // Transitions published from different threads may arrive out of
            // order, so the gauge follows the live state rather than `to`.
            collector.record_gauge(CIRCUIT_BREAKER_STATE, state.current().gauge_value(), &labels);
        }
        CircuitBreakerEventKind::FailureRateExceeded { .. }
        | CircuitBreakerEventKind::SlowCallRateExceeded { .. }
        | CircuitBreakerEventKind::Reset => {}
    }
}

fn capacity_warning(name: &str, resource: &'static str, usage: f64) -> Option<CapacityWarning> {
    let level = CapacityLevel::for_usage(usage)?;
    let percent = usage * 100.0;
    match level {
        CapacityLevel::Critical => {
            error!(name, resource, usage_percent = percent, "Capacity critically high (>90%)");
        }
        CapacityLevel::Warning => {
            warn!(name, resource, usage_percent = percent, "Capacity high (>80%)");
        }
    }
    Some(CapacityWarning { name: name.to_string(), resource, usage, level })
}
