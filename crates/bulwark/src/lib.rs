//! Resilience policies for async Rust services.
//!
//! Bulwark wraps a unit of work (any `FnMut() -> Future<Output = Result<T,
//! E>>`) in circuit breakers, retries, rate limiters and bulkheads, and
//! reports what they do through events, metrics and health reports.
//!
//! # Modules
//!
//! - [`resilience`]: the policies, the decorator pipeline, the registry and
//!   health reporting
//! - [`config`]: serde settings with per-service overrides, TOML/JSON loading
//!   and `BULWARK_*` environment overrides
//! - [`observability`]: the metrics collector abstraction and the event
//!   binder
//! - [`utils`]: duration serialization helpers
//!
//! # Feature Flags
//!
//! - `config` (default): TOML settings text and files
//! - `prometheus`: Prometheus-backed metrics collector
//!
//! # Example
//!
//! ```rust
//! use bulwark::resilience::{CircuitBreaker, Decorators, Retry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut call = Decorators::of(|| async { Ok::<_, std::io::Error>("stock: 12") })
//!     .with_circuit_breaker(CircuitBreaker::with_defaults("inventory-service"))
//!     .with_retry(Retry::with_defaults("inventory-service"))
//!     .decorate();
//!
//! let stock = call.call().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod config;
pub mod observability;
pub mod resilience;
pub mod utils;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use config::ResilienceSettings;
pub use observability::{MetricsBinder, MetricsCollector};
pub use resilience::{
    decorate, decorate_with_fallback, Bulkhead, CircuitBreaker, CircuitState, Clock,
    ConfigError, Decorators, FailureKind, HealthReport, RateLimiter, ResilienceError,
    ResilienceRegistry, ResilienceResult, ResilientSpec, Retry, SystemClock,
    ThreadPoolBulkhead,
};
pub use utils::serde::duration_millis;
