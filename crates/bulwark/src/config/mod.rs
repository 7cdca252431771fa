//! Resilience settings
//!
//! - **[`settings`]**: serde model with documented defaults and per-service
//!   overrides merged field by field
//! - **[`loader`]**: TOML/JSON loading and `BULWARK_*` environment overrides
//!
//! Settings only carry plain values. Failure classifiers are attached in
//! code through [`ResilienceRegistryBuilder`](crate::resilience::ResilienceRegistryBuilder).

pub mod loader;
pub mod settings;

pub use loader::ENV_PREFIX;
pub use settings::{
    BulkheadSettings, CircuitBreakerSettings, PolicyDefaults, RateLimiterSettings,
    ResilienceSettings, RetrySettings, ServiceOverrides, ThreadPoolBulkheadSettings,
};
