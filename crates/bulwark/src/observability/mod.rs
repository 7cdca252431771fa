//! Observability for resilience policies
//!
//! - **[`traits`]**: the [`MetricsCollector`] abstraction with no-op and
//!   in-memory implementations
//! - **[`binder`]**: turns policy events into counters and pushes gauge
//!   snapshots
//! - **`prometheus`** (feature `prometheus`): a Prometheus-backed collector
//!
//! Logging goes through `tracing` throughout the crate; this module only
//! covers metrics.

pub mod binder;
#[cfg(feature = "prometheus")]
pub mod prometheus;
pub mod traits;

pub use binder::{CapacityLevel, CapacityWarning, MetricsBinder};
#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusMetricsCollector;
pub use traits::{MetricsCollector, NoOpMetricsCollector, RecordingMetricsCollector};
