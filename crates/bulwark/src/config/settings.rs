//! Serde model of per-service policy settings

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resilience::{
    BulkheadConfig, CircuitBreakerConfig, CircuitBreakerConfigBuilder, ConfigError, ConfigResult,
    RateLimiterConfig, RetryConfig, RetryConfigBuilder, ThreadPoolBulkheadConfig,
};
use crate::utils::duration_str;

// ---- Per-policy settings ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    #[serde(with = "duration_str")]
    pub slow_call_duration_threshold: Duration,
    pub minimum_number_of_calls: u32,
    pub sliding_window_size: u32,
    #[serde(with = "duration_str")]
    pub wait_duration_in_open_state: Duration,
    pub permitted_number_of_calls_in_half_open_state: u32,
    pub automatic_transition_from_open_to_half_open_enabled: bool,
    pub register_health_indicator: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            failure_rate_threshold: config.failure_rate_threshold,
            slow_call_rate_threshold: config.slow_call_rate_threshold,
            slow_call_duration_threshold: config.slow_call_duration_threshold,
            minimum_number_of_calls: config.minimum_number_of_calls,
            sliding_window_size: config.sliding_window_size,
            wait_duration_in_open_state: config.wait_duration_in_open_state,
            permitted_number_of_calls_in_half_open_state: config
                .permitted_number_of_calls_in_half_open_state,
            automatic_transition_from_open_to_half_open_enabled: config
                .automatic_transition_from_open_to_half_open_enabled,
            register_health_indicator: config.register_health_indicator,
        }
    }
}

impl CircuitBreakerSettings {
    /// Builder pre-filled from these settings; classifiers stay at their
    /// defaults
    pub fn to_builder(&self) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(self.failure_rate_threshold)
            .slow_call_rate_threshold(self.slow_call_rate_threshold)
            .slow_call_duration_threshold(self.slow_call_duration_threshold)
            .minimum_number_of_calls(self.minimum_number_of_calls)
            .sliding_window_size(self.sliding_window_size)
            .wait_duration_in_open_state(self.wait_duration_in_open_state)
            .permitted_number_of_calls_in_half_open_state(
                self.permitted_number_of_calls_in_half_open_state,
            )
            .automatic_transition_from_open_to_half_open_enabled(
                self.automatic_transition_from_open_to_half_open_enabled,
            )
            .register_health_indicator(self.register_health_indicator)
    }

    pub fn to_config(&self) -> ConfigResult<CircuitBreakerConfig> {
        self.to_builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub initial_wait_duration: Duration,
    pub enable_exponential_backoff: bool,
    pub exponential_backoff_multiplier: f64,
    #[serde(with = "duration_str")]
    pub max_wait_duration: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            initial_wait_duration: config.initial_wait_duration,
            enable_exponential_backoff: config.enable_exponential_backoff,
            exponential_backoff_multiplier: config.exponential_backoff_multiplier,
            max_wait_duration: config.max_wait_duration,
        }
    }
}

impl RetrySettings {
    pub fn to_builder(&self) -> RetryConfigBuilder {
        RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .initial_wait_duration(self.initial_wait_duration)
            .enable_exponential_backoff(self.enable_exponential_backoff)
            .exponential_backoff_multiplier(self.exponential_backoff_multiplier)
            .max_wait_duration(self.max_wait_duration)
    }

    pub fn to_config(&self) -> ConfigResult<RetryConfig> {
        self.to_builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSettings {
    pub limit_for_period: u32,
    #[serde(with = "duration_str")]
    pub limit_refresh_period: Duration,
    #[serde(with = "duration_str")]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        let config = RateLimiterConfig::default();
        Self {
            limit_for_period: config.limit_for_period,
            limit_refresh_period: config.limit_refresh_period,
            timeout_duration: config.timeout_duration,
        }
    }
}

impl RateLimiterSettings {
    pub fn to_config(&self) -> ConfigResult<RateLimiterConfig> {
        RateLimiterConfig::builder()
            .limit_for_period(self.limit_for_period)
            .limit_refresh_period(self.limit_refresh_period)
            .timeout_duration(self.timeout_duration)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadSettings {
    pub max_concurrent_calls: u32,
    #[serde(with = "duration_str")]
    pub max_wait_duration: Duration,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        let config = BulkheadConfig::default();
        Self {
            max_concurrent_calls: config.max_concurrent_calls,
            max_wait_duration: config.max_wait_duration,
        }
    }
}

impl BulkheadSettings {
    pub fn to_config(&self) -> ConfigResult<BulkheadConfig> {
        BulkheadConfig::builder()
            .max_concurrent_calls(self.max_concurrent_calls)
            .max_wait_duration(self.max_wait_duration)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThreadPoolBulkheadSettings {
    pub core_thread_pool_size: u32,
    pub max_thread_pool_size: u32,
    pub queue_capacity: u32,
    #[serde(with = "duration_str")]
    pub keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadSettings {
    fn default() -> Self {
        let config = ThreadPoolBulkheadConfig::default();
        Self {
            core_thread_pool_size: config.core_thread_pool_size,
            max_thread_pool_size: config.max_thread_pool_size,
            queue_capacity: config.queue_capacity,
            keep_alive_duration: config.keep_alive_duration,
        }
    }
}

impl ThreadPoolBulkheadSettings {
    pub fn to_config(&self) -> ConfigResult<ThreadPoolBulkheadConfig> {
        ThreadPoolBulkheadConfig::builder()
            .core_thread_pool_size(self.core_thread_pool_size)
            .max_thread_pool_size(self.max_thread_pool_size)
            .queue_capacity(self.queue_capacity)
            .keep_alive_duration(self.keep_alive_duration)
            .build()
    }
}

// ---- Defaults and overrides ----

/// Settings applied to every service unless overridden
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyDefaults {
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub rate_limiter: RateLimiterSettings,
    pub bulkhead: BulkheadSettings,
    pub thread_pool_bulkhead: ThreadPoolBulkheadSettings,
}

/// Partial per-service settings, merged field by field over the defaults
///
/// A present section also makes the registry create that policy for the
/// service up front.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_pool_bulkhead: Option<Value>,
}

/// Complete resilience settings
///
/// ```toml
/// [defaults.circuit_breaker]
/// failure_rate_threshold = 50.0
/// wait_duration_in_open_state = "60s"
///
/// [services.payment-service.circuit_breaker]
/// failure_rate_threshold = 25.0
///
/// [services.payment-service.retry]
/// max_attempts = 5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    pub defaults: PolicyDefaults,
    pub services: BTreeMap<String, ServiceOverrides>,
}

impl ResilienceSettings {
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn overrides(&self, service: &str) -> Option<&ServiceOverrides> {
        self.services.get(service)
    }

    pub fn circuit_breaker(&self, service: &str) -> ConfigResult<CircuitBreakerSettings> {
        let patch = self.overrides(service).and_then(|o| o.circuit_breaker.as_ref());
        merge(&self.defaults.circuit_breaker, patch, "circuit_breaker", service)
    }

    pub fn retry(&self, service: &str) -> ConfigResult<RetrySettings> {
        let patch = self.overrides(service).and_then(|o| o.retry.as_ref());
        merge(&self.defaults.retry, patch, "retry", service)
    }

    pub fn rate_limiter(&self, service: &str) -> ConfigResult<RateLimiterSettings> {
        let patch = self.overrides(service).and_then(|o| o.rate_limiter.as_ref());
        merge(&self.defaults.rate_limiter, patch, "rate_limiter", service)
    }

    pub fn bulkhead(&self, service: &str) -> ConfigResult<BulkheadSettings> {
        let patch = self.overrides(service).and_then(|o| o.bulkhead.as_ref());
        merge(&self.defaults.bulkhead, patch, "bulkhead", service)
    }

    pub fn thread_pool_bulkhead(&self, service: &str) -> ConfigResult<ThreadPoolBulkheadSettings> {
        let patch = self.overrides(service).and_then(|o| o.thread_pool_bulkhead.as_ref());
        merge(&self.defaults.thread_pool_bulkhead, patch, "thread_pool_bulkhead", service)
    }

    /// Check the defaults and every service's merged settings
    pub fn validate(&self) -> ConfigResult<()> {
        let defaults = &self.defaults;
        defaults.circuit_breaker.to_config()?;
        defaults.retry.to_config()?;
        defaults.rate_limiter.to_config()?;
        defaults.bulkhead.to_config()?;
        defaults.thread_pool_bulkhead.to_config()?;

        for service in self.service_names() {
            let in_service = |err: ConfigError| match err {
                ConfigError::Invalid { message } => {
                    ConfigError::invalid(format!("service '{service}': {message}"))
                }
                other => other,
            };
            self.circuit_breaker(service)?.to_config().map_err(in_service)?;
            self.retry(service)?.to_config().map_err(in_service)?;
            self.rate_limiter(service)?.to_config().map_err(in_service)?;
            self.bulkhead(service)?.to_config().map_err(in_service)?;
            self.thread_pool_bulkhead(service)?.to_config().map_err(in_service)?;
        }
        Ok(())
    }
}

fn merge<S>(base: &S, patch: Option<&Value>, section: &str, service: &str) -> ConfigResult<S>
where
    S: Serialize + DeserializeOwned + Clone,
{
    let Some(patch) = patch else {
        return Ok(base.clone());
    };
    let Value::Object(fields) = patch else {
        return Err(ConfigError::Parse {
            message: format!("services.{service}.{section} must be a table"),
        });
    };

    let mut merged = serde_json::to_value(base)
        .map_err(|e| ConfigError::Parse { message: format!("{section}: {e}") })?;
    if let Value::Object(target) = &mut merged {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| ConfigError::Parse { message: format!("services.{service}.{section}: {e}") })
}
