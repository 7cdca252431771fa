//! Retry with fixed or exponential backoff
//!
//! A [`Retry`] runs an operation up to `max_attempts` times. Failures are
//! classified first: ignored failures and failures outside `retry_on` return
//! immediately, the rest are retried after a backoff wait taken from the
//! policy's [`Clock`], so only the calling task is suspended.
//!
//! The per-call bookkeeping lives in [`RetryContext`], which the decorator
//! pipeline drives directly to interleave circuit breaker checks between
//! attempts.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::classifier::FailureClassifier;
use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use super::event::EventPublisher;

//==============================================================================
// Configuration
//==============================================================================

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff: `initial * multiplier^(attempt - 1)`, capped
    Exponential { initial: Duration, multiplier: f64, max: Duration },
}

impl BackoffStrategy {
    /// Wait after the `attempt`-th failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffStrategy::Fixed(delay) => delay,
            BackoffStrategy::Exponential { initial, multiplier, max } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Wait before the first retry
    pub initial_wait_duration: Duration,
    /// Grow waits geometrically; when off every wait is `initial_wait_duration`
    pub enable_exponential_backoff: bool,
    /// Growth factor between consecutive waits
    pub exponential_backoff_multiplier: f64,
    /// Upper bound for a single wait
    pub max_wait_duration: Duration,
    /// Failures that are retried
    pub retry_on: FailureClassifier,
    /// Failures returned immediately without counting as a failed retry
    pub ignore: FailureClassifier,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait_duration: Duration::from_secs(1),
            enable_exponential_backoff: true,
            exponential_backoff_multiplier: 2.0,
            max_wait_duration: Duration::from_secs(10),
            retry_on: FailureClassifier::any(),
            ignore: FailureClassifier::none(),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }

        if self.enable_exponential_backoff {
            if !(self.exponential_backoff_multiplier >= 1.0) {
                return Err(ConfigError::invalid(format!(
                    "exponential_backoff_multiplier must be at least 1.0, got {}",
                    self.exponential_backoff_multiplier
                )));
            }
            if self.max_wait_duration < self.initial_wait_duration {
                return Err(ConfigError::invalid(
                    "max_wait_duration must not be shorter than initial_wait_duration",
                ));
            }
        }

        Ok(())
    }

    pub fn backoff(&self) -> BackoffStrategy {
        if self.enable_exponential_backoff {
            BackoffStrategy::Exponential {
                initial: self.initial_wait_duration,
                multiplier: self.exponential_backoff_multiplier,
                max: self.max_wait_duration,
            }
        } else {
            BackoffStrategy::Fixed(self.initial_wait_duration)
        }
    }

    /// How a failure is treated
    pub fn decide(&self, error: &(dyn Error + 'static)) -> RetryDecision {
        if self.ignore.matches(error) {
            RetryDecision::Ignore
        } else if self.retry_on.matches(error) {
            RetryDecision::Retry
        } else {
            RetryDecision::Stop
        }
    }
}

/// Decision for a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation after the backoff wait
    Retry,
    /// Return the failure as-is; it is not a retry failure
    Ignore,
    /// Don't retry the operation
    Stop,
}

/// Builder for RetryConfig with fluent API
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_wait_duration(mut self, wait: Duration) -> Self {
        self.config.initial_wait_duration = wait;
        self
    }

    pub fn enable_exponential_backoff(mut self, enabled: bool) -> Self {
        self.config.enable_exponential_backoff = enabled;
        self
    }

    pub fn exponential_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.exponential_backoff_multiplier = multiplier;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    /// Fixed wait between attempts
    pub fn fixed_backoff(self, wait: Duration) -> Self {
        self.initial_wait_duration(wait).enable_exponential_backoff(false)
    }

    pub fn retry_on(mut self, classifier: FailureClassifier) -> Self {
        self.config.retry_on = classifier;
        self
    }

    pub fn ignore(mut self, classifier: FailureClassifier) -> Self {
        self.config.ignore = classifier;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Events and Metrics
//==============================================================================

/// Event published by a retry
#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: RetryEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryEventKind {
    /// A retryable failure; the next attempt follows after `wait`
    Retry { attempt: u32, wait: Duration, message: String },
    /// Success after at least one retry; `attempts` includes the successful one
    Success { attempts: u32 },
    /// The final attempt failed with a retryable error
    Exhausted { attempts: u32, message: String },
    /// An ignored failure was returned to the caller
    IgnoredError { message: String },
    /// A non-retryable failure was returned to the caller
    Error { attempts: u32, message: String },
}

impl RetryEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "RETRY",
            Self::Success { .. } => "SUCCESS",
            Self::Exhausted { .. } => "EXHAUSTED",
            Self::IgnoredError { .. } => "IGNORED_ERROR",
            Self::Error { .. } => "ERROR",
        }
    }
}

/// Call counters of a retry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

//==============================================================================
// Retry
//==============================================================================

/// Named retry policy
pub struct Retry {
    name: Arc<str>,
    config: Arc<RetryConfig>,
    counters: Arc<RetryCounters>,
    events: Arc<EventPublisher<RetryEvent>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry").field("name", &self.name).field("config", &self.config).finish()
    }
}

impl Clone for Retry {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            counters: Arc::clone(&self.counters),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), RetryConfig::default(), Arc::new(SystemClock))
    }

    /// Create a retry with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(name.into(), config, clock))
    }

    fn from_parts(name: String, config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            counters: Arc::new(RetryCounters::default()),
            events: Arc::new(EventPublisher::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher<RetryEvent> {
        &self.events
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self
                .counters
                .successful_without_retry
                .load(Ordering::Relaxed),
            successful_calls_with_retry: self.counters.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Start bookkeeping for one logical call
    pub fn context(&self) -> RetryContext<'_> {
        RetryContext { retry: self, attempts: 0 }
    }

    /// Execute an operation with retry logic
    #[instrument(skip(self, operation), fields(name = %self.name, max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let mut context = self.context();

        loop {
            match operation().await {
                Ok(value) => {
                    context.on_success();
                    return Ok(value);
                }
                Err(error) => {
                    let wait = context.on_error(error)?;
                    context.wait(wait).await;
                }
            }
        }
    }

    fn publish(&self, kind: RetryEventKind) {
        if self.events.has_consumers() {
            self.events.publish(&RetryEvent {
                name: Arc::clone(&self.name),
                created_at: self.clock.system_time(),
                kind,
            });
        }
    }
}

/// Attempt bookkeeping for one logical call
#[derive(Debug)]
pub struct RetryContext<'a> {
    retry: &'a Retry,
    attempts: u32,
}

impl RetryContext<'_> {
    /// Attempts that have failed so far
    pub fn failed_attempts(&self) -> u32 {
        self.attempts
    }

    /// Report a successful attempt
    pub fn on_success(&self) {
        let counters = &self.retry.counters;
        if self.attempts == 0 {
            counters.successful_without_retry.fetch_add(1, Ordering::Relaxed);
            return;
        }

        counters.successful_with_retry.fetch_add(1, Ordering::Relaxed);
        let attempts = self.attempts + 1;
        info!(name = %self.retry.name, attempts, "Operation succeeded after retry");
        self.retry.publish(RetryEventKind::Success { attempts });
    }

    /// Report a failed attempt
    ///
    /// Returns the wait before the next attempt, or the terminal error when
    /// the failure is not retried or no attempts remain.
    pub fn on_error<E>(&mut self, error: E) -> Result<Duration, ResilienceError<E>>
    where
        E: Error + Send + Sync + 'static,
    {
        self.attempts += 1;
        let attempts = self.attempts;
        let retry = self.retry;
        let counters = &retry.counters;

        match retry.config.decide(&error) {
            RetryDecision::Ignore => {
                debug!(name = %retry.name, error = %error, "Failure ignored by retry");
                counters.failed_without_retry.fetch_add(1, Ordering::Relaxed);
                retry.publish(RetryEventKind::IgnoredError { message: error.to_string() });
                Err(ResilienceError::OperationFailed { source: error })
            }
            RetryDecision::Stop => {
                debug!(name = %retry.name, error = %error, "Failure is not retryable");
                self.count_failure(attempts);
                retry.publish(RetryEventKind::Error { attempts, message: error.to_string() });
                Err(ResilienceError::OperationFailed { source: error })
            }
            RetryDecision::Retry if attempts >= retry.config.max_attempts => {
                error!(name = %retry.name, attempts, error = %error, "Retry exhausted");
                self.count_failure(attempts);
                retry.publish(RetryEventKind::Exhausted { attempts, message: error.to_string() });
                Err(ResilienceError::RetryExhausted {
                    name: retry.name.to_string(),
                    attempts,
                    source: error,
                })
            }
            RetryDecision::Retry => {
                let wait = retry.config.backoff().delay_for(attempts);
                warn!(
                    name = %retry.name,
                    attempt = attempts,
                    max_attempts = retry.config.max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );
                retry.publish(RetryEventKind::Retry { attempt: attempts, wait, message: error.to_string() });
                Ok(wait)
            }
        }
    }

    fn count_failure(&self, attempts: u32) {
        let counters = &self.retry.counters;
        if attempts > 1 {
            counters.failed_with_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed_without_retry.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Suspend the calling task for a backoff wait
    pub async fn wait(&self, duration: Duration) {
        if !duration.is_zero() {
            self.retry.clock.sleep(duration).await;
        }
    }
}
