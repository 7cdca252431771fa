//! Resilience patterns for fault tolerance
//!
//! This module provides the policies that protect a unit of work:
//! - **Circuit Breaker**: stops calling a failing dependency once its failure
//!   or slow-call rate crosses a threshold, then probes it with trial calls
//! - **Retry**: repeats failed attempts with fixed or exponential backoff
//! - **Rate Limiter**: grants a fixed number of permits per refresh period
//! - **Bulkhead**: caps concurrent calls, either with a semaphore or with a
//!   bounded worker pool
//!
//! [`Decorators`] composes them around one operation in a fixed order and
//! substitutes a fallback for terminal failures. [`ResilienceRegistry`] holds
//! the named, process-wide instances and [`HealthReport`] aggregates breaker
//! states.
//!
//! ## Time
//!
//! Every policy reads time through a [`Clock`]. [`SystemClock`] follows tokio
//! time, so tests may pause it; [`MockClock`] is advanced by hand and makes
//! backoff and open-state waits instantaneous.
//!
//! ## Events
//!
//! Each instance owns an [`EventPublisher`]. Consumers run synchronously on
//! the publishing task, after internal locks are released, so they may call
//! back into the policy.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod decorators;
pub mod error;
pub mod event;
pub mod health;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod sliding_window;
pub mod thread_pool_bulkhead;

pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadConfigBuilder, BulkheadEvent, BulkheadEventKind,
    BulkheadMetrics, BulkheadPermit,
};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitBreakerEvent, CircuitBreakerEventKind, CircuitBreakerMetrics, CircuitState,
};
pub use classifier::FailureClassifier;
pub use clock::{Clock, MockClock, SystemClock};
pub use decorators::{
    decorate, decorate_with_fallback, Completion, DecoratedOperation, Decorators, Policies,
    ResilientSpec,
};
pub use error::{
    ConfigError, ConfigResult, FailureKind, Rejection, ResilienceError, ResilienceResult,
};
pub use event::EventPublisher;
pub use health::{CircuitBreakerHealth, HealthReport, HealthStatus, HealthSummary};
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterEvent,
    RateLimiterEventKind, RateLimiterMetrics,
};
pub use registry::{
    global, init_global, PolicyRegistry, ResilienceRegistry, ResilienceRegistryBuilder,
};
pub use retry::{
    BackoffStrategy, Retry, RetryConfig, RetryConfigBuilder, RetryContext, RetryDecision,
    RetryEvent, RetryEventKind, RetryMetrics,
};
pub use sliding_window::{CallOutcome, Measurement, SlidingWindow, WindowSnapshot};
pub use thread_pool_bulkhead::{
    TaskAborted, TaskHandle, ThreadPoolBulkhead, ThreadPoolBulkheadConfig,
    ThreadPoolBulkheadConfigBuilder, ThreadPoolBulkheadMetrics,
};
