//! Count-based circuit breaker
//!
//! The breaker records call outcomes in a sliding window while CLOSED and
//! opens once enough calls were seen and the failure or slow-call rate
//! reaches its threshold. After `wait_duration_in_open_state` it lets a fixed
//! number of trial calls through (HALF_OPEN) and decides from exactly those
//! outcomes whether to close again or reopen.
//!
//! All window updates and transitions happen under one mutex; events are
//! published after it is released.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::classifier::FailureClassifier;
use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, Rejection, ResilienceError, ResilienceResult};
use super::event::EventPublisher;
use super::sliding_window::{CallOutcome, Measurement, SlidingWindow, WindowSnapshot};

//==============================================================================
// State
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
    /// Administrative: every call permitted, nothing evaluated
    Disabled,
    /// Administrative: every call rejected until an explicit transition
    ForcedOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
            Self::Disabled => 3.0,
            Self::ForcedOpen => 4.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::Disabled => write!(f, "DISABLED"),
            CircuitState::ForcedOpen => write!(f, "FORCED_OPEN"),
        }
    }
}

//==============================================================================
// Configuration
//==============================================================================

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate in percent at which the circuit opens
    pub failure_rate_threshold: f32,
    /// Slow call rate in percent at which the circuit opens
    pub slow_call_rate_threshold: f32,
    /// Calls taking at least this long count as slow
    pub slow_call_duration_threshold: Duration,
    /// Calls required in the window before rates are evaluated
    pub minimum_number_of_calls: u32,
    /// Number of most recent calls kept in the window
    pub sliding_window_size: u32,
    /// Time to stay open before trial calls are allowed
    pub wait_duration_in_open_state: Duration,
    /// Trial calls allowed (and required) in half-open state
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Move from open to half-open on the first request after the wait
    pub automatic_transition_from_open_to_half_open_enabled: bool,
    /// Failures that count against the breaker
    pub record_failure: FailureClassifier,
    /// Failures treated as successes
    pub ignore_failure: FailureClassifier,
    /// Whether health reports include this breaker
    pub register_health_indicator: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(5),
            minimum_number_of_calls: 10,
            sliding_window_size: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 5,
            automatic_transition_from_open_to_half_open_enabled: true,
            record_failure: FailureClassifier::any(),
            ignore_failure: FailureClassifier::none(),
            register_health_indicator: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        validate_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        validate_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;

        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid("minimum_number_of_calls must be greater than 0"));
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid("sliding_window_size must be greater than 0"));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "permitted_number_of_calls_in_half_open_state must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Calls needed before the closed window is evaluated
    ///
    /// Clamped to the window size, otherwise the breaker could never open.
    pub fn effective_minimum_calls(&self) -> u32 {
        self.minimum_number_of_calls.min(self.sliding_window_size)
    }
}

fn validate_percentage(field: &str, value: f32) -> ConfigResult<()> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!("{field} must be in (0, 100], got {value}")))
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    pub fn record_failure(mut self, classifier: FailureClassifier) -> Self {
        self.config.record_failure = classifier;
        self
    }

    pub fn ignore_failure(mut self, classifier: FailureClassifier) -> Self {
        self.config.ignore_failure = classifier;
        self
    }

    pub fn register_health_indicator(mut self, register: bool) -> Self {
        self.config.register_health_indicator = register;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Events and Metrics
//==============================================================================

/// Event published by a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: CircuitBreakerEventKind,
}

/// What happened
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEventKind {
    Success { duration: Duration },
    Error { duration: Duration, message: String },
    IgnoredError { duration: Duration, message: String },
    CallNotPermitted,
    StateTransition { from: CircuitState, to: CircuitState },
    FailureRateExceeded { failure_rate: f32 },
    SlowCallRateExceeded { slow_call_rate: f32 },
    Reset,
}

impl CircuitBreakerEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "SUCCESS",
            Self::Error { .. } => "ERROR",
            Self::IgnoredError { .. } => "IGNORED_ERROR",
            Self::CallNotPermitted => "NOT_PERMITTED",
            Self::StateTransition { .. } => "STATE_TRANSITION",
            Self::FailureRateExceeded { .. } => "FAILURE_RATE_EXCEEDED",
            Self::SlowCallRateExceeded { .. } => "SLOW_CALL_RATE_EXCEEDED",
            Self::Reset => "RESET",
        }
    }
}

/// Circuit breaker metrics for monitoring
///
/// Rates are `0.0` until the window holds the minimum number of calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub successful_calls: u32,
    pub not_permitted_calls: u64,
}

//==============================================================================
// Circuit Breaker
//==============================================================================

struct Machine {
    state: CircuitState,
    /// Bumped on every transition; outcomes carrying an older epoch are stale
    epoch: u64,
    closed_window: SlidingWindow,
    trial_window: SlidingWindow,
    trial_permits_issued: u32,
    opened_at: Instant,
    state_changed_at: Instant,
}

/// Named circuit breaker
///
/// Clones share state, so a breaker can be handed to every task that calls
/// the protected service.
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    machine: Arc<Mutex<Machine>>,
    not_permitted_calls: Arc<AtomicU64>,
    events: Arc<EventPublisher<CircuitBreakerEvent>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.machine.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &machine.state)
            .field("buffered_calls", &machine.closed_window.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Clone for CircuitBreaker {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            machine: Arc::clone(&self.machine),
            not_permitted_calls: Arc::clone(&self.not_permitted_calls),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker using the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), CircuitBreakerConfig::default(), Arc::new(SystemClock))
    }

    /// Create a circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(name.into(), config, clock))
    }

    fn from_parts(name: String, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let machine = Machine {
            state: CircuitState::Closed,
            epoch: 0,
            closed_window: SlidingWindow::new(config.sliding_window_size as usize),
            trial_window: SlidingWindow::new(
                config.permitted_number_of_calls_in_half_open_state as usize,
            ),
            trial_permits_issued: 0,
            opened_at: now,
            state_changed_at: now,
        };

        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            machine: Arc::new(Mutex::new(machine)),
            not_permitted_calls: Arc::new(AtomicU64::new(0)),
            events: Arc::new(EventPublisher::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Event stream of this breaker
    pub fn events(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.events
    }

    // ---- Permission ----

    /// Ask to run one call
    ///
    /// The returned permit must be settled with one of its `on_*` methods;
    /// dropping it unsettled (cancellation) releases a half-open trial slot
    /// and records nothing.
    pub fn try_acquire_permission(&self) -> Result<CallPermit, Rejection> {
        let now = self.clock.now();
        let mut pending = Vec::new();

        let (admitted, state, epoch) = {
            let mut machine = self.machine.lock();
            self.open_to_half_open_if_due(&mut machine, now, &mut pending);
            let admitted = match machine.state {
                CircuitState::Closed | CircuitState::Disabled => true,
                CircuitState::HalfOpen
                    if machine.trial_permits_issued
                        < self.config.permitted_number_of_calls_in_half_open_state =>
                {
                    machine.trial_permits_issued += 1;
                    true
                }
                CircuitState::HalfOpen | CircuitState::Open | CircuitState::ForcedOpen => false,
            };
            (admitted, machine.state, machine.epoch)
        };

        if admitted {
            self.publish(pending);
            return Ok(CallPermit { breaker: self.clone(), epoch, started_at: now, settled: false });
        }

        self.not_permitted_calls.fetch_add(1, Ordering::Relaxed);
        pending.push(CircuitBreakerEventKind::CallNotPermitted);
        self.publish(pending);
        debug!(name = %self.name, state = %state, "Circuit breaker rejecting call");

        Err(Rejection::CircuitOpen { name: self.name.to_string(), state })
    }

    fn release_permission(&self, epoch: u64) {
        let mut machine = self.machine.lock();
        if machine.epoch == epoch
            && machine.state == CircuitState::HalfOpen
            && machine.trial_permits_issued > 0
        {
            machine.trial_permits_issued -= 1;
            debug!(name = %self.name, "Released unused half-open trial permit");
        }
    }

    // ---- Outcome recording ----

    /// Record a successful call that took `duration`
    pub fn on_success(&self, duration: Duration) {
        self.record_success(None, duration);
    }

    /// Record a failed call, classified by the configured classifiers
    pub fn on_error(&self, duration: Duration, error: &(dyn Error + 'static)) {
        self.record_error(None, duration, error);
    }

    /// Record a raw outcome
    ///
    /// `CallOutcome::Slow` is a success counted as slow whatever `duration`
    /// says.
    pub fn on_outcome(&self, outcome: CallOutcome, duration: Duration) {
        self.record_outcome(None, outcome, duration);
    }

    fn record_success(&self, epoch: Option<u64>, duration: Duration) {
        self.record(epoch, false, false, duration, CircuitBreakerEventKind::Success { duration });
    }

    fn record_error(&self, epoch: Option<u64>, duration: Duration, error: &(dyn Error + 'static)) {
        if self.config.ignore_failure.matches(error) {
            let message = error.to_string();
            debug!(name = %self.name, error = %message, "Ignoring failure");
            self.record(
                epoch,
                false,
                false,
                duration,
                CircuitBreakerEventKind::IgnoredError { duration, message },
            );
        } else if self.config.record_failure.matches(error) {
            let message = error.to_string();
            self.record(epoch, true, false, duration, CircuitBreakerEventKind::Error { duration, message });
        } else {
            self.record_success(epoch, duration);
        }
    }

    fn record_outcome(&self, epoch: Option<u64>, outcome: CallOutcome, duration: Duration) {
        match outcome {
            CallOutcome::Success => self.record_success(epoch, duration),
            CallOutcome::Slow => {
                self.record(epoch, false, true, duration, CircuitBreakerEventKind::Success { duration });
            }
            CallOutcome::Failure => self.record(
                epoch,
                true,
                false,
                duration,
                CircuitBreakerEventKind::Error { duration, message: "recorded failure".to_string() },
            ),
        }
    }

    fn record(
        &self,
        epoch: Option<u64>,
        failed: bool,
        force_slow: bool,
        duration: Duration,
        event: CircuitBreakerEventKind,
    ) {
        let slow = force_slow || duration >= self.config.slow_call_duration_threshold;
        let measurement = Measurement::new(failed, slow, duration);
        let mut pending = Vec::new();

        {
            let mut machine = self.machine.lock();
            if epoch.is_some_and(|e| e != machine.epoch) {
                debug!(name = %self.name, "Discarding outcome of a call admitted in a previous state");
                return;
            }

            let now = self.clock.now();
            match machine.state {
                CircuitState::Closed => {
                    let snapshot = machine.closed_window.record(measurement);
                    pending.push(event);
                    if let Some(exceeded) =
                        self.threshold_exceeded(&snapshot, self.config.effective_minimum_calls())
                    {
                        pending.push(exceeded);
                        self.transition(&mut machine, CircuitState::Open, now, &mut pending);
                    }
                }
                CircuitState::HalfOpen => {
                    let snapshot = machine.trial_window.record(measurement);
                    pending.push(event);
                    let permitted = self.config.permitted_number_of_calls_in_half_open_state;
                    if snapshot.total_calls >= permitted {
                        match self.threshold_exceeded(&snapshot, permitted) {
                            Some(exceeded) => {
                                pending.push(exceeded);
                                self.transition(&mut machine, CircuitState::Open, now, &mut pending);
                            }
                            None => {
                                self.transition(&mut machine, CircuitState::Closed, now, &mut pending);
                            }
                        }
                    }
                }
                CircuitState::Open | CircuitState::ForcedOpen | CircuitState::Disabled => {}
            }
        }

        self.publish(pending);
    }

    fn threshold_exceeded(
        &self,
        snapshot: &WindowSnapshot,
        minimum_calls: u32,
    ) -> Option<CircuitBreakerEventKind> {
        if snapshot.total_calls < minimum_calls {
            return None;
        }

        let failure_rate = snapshot.failure_rate();
        if failure_rate >= self.config.failure_rate_threshold {
            return Some(CircuitBreakerEventKind::FailureRateExceeded { failure_rate });
        }

        let slow_call_rate = snapshot.slow_call_rate();
        if slow_call_rate >= self.config.slow_call_rate_threshold {
            return Some(CircuitBreakerEventKind::SlowCallRateExceeded { slow_call_rate });
        }

        None
    }

    // ---- Transitions ----

    fn open_to_half_open_if_due(
        &self,
        machine: &mut Machine,
        now: Instant,
        pending: &mut Vec<CircuitBreakerEventKind>,
    ) {
        if machine.state == CircuitState::Open
            && self.config.automatic_transition_from_open_to_half_open_enabled
            && now.saturating_duration_since(machine.opened_at)
                >= self.config.wait_duration_in_open_state
        {
            self.transition(machine, CircuitState::HalfOpen, now, pending);
        }
    }

    fn transition(
        &self,
        machine: &mut Machine,
        to: CircuitState,
        now: Instant,
        pending: &mut Vec<CircuitBreakerEventKind>,
    ) {
        let from = machine.state;
        machine.state = to;
        machine.epoch = machine.epoch.wrapping_add(1);
        machine.state_changed_at = now;
        machine.trial_window.clear();
        machine.trial_permits_issued = 0;

        match to {
            // Open keeps the window that tripped it for metrics and health.
            CircuitState::Open => machine.opened_at = now,
            CircuitState::Closed | CircuitState::Disabled | CircuitState::ForcedOpen => {
                machine.closed_window.clear();
            }
            CircuitState::HalfOpen => {}
        }

        if from == to {
            return;
        }

        warn!(name = %self.name, from = %from, to = %to, "Circuit breaker state transition");
        match to {
            CircuitState::Open | CircuitState::ForcedOpen => {
                error!(name = %self.name, state = %to, "Circuit breaker is open, calls will be rejected");
            }
            CircuitState::HalfOpen => {
                info!(name = %self.name, "Circuit breaker is half-open, testing recovery");
            }
            CircuitState::Closed if from == CircuitState::HalfOpen => {
                info!(name = %self.name, "Circuit breaker recovered and closed");
            }
            CircuitState::Closed | CircuitState::Disabled => {}
        }

        pending.push(CircuitBreakerEventKind::StateTransition { from, to });
    }

    fn manual_transition(&self, to: CircuitState) {
        let mut pending = Vec::new();
        {
            let mut machine = self.machine.lock();
            if machine.state != to {
                let now = self.clock.now();
                self.transition(&mut machine, to, now, &mut pending);
            }
        }
        self.publish(pending);
    }

    pub fn transition_to_closed(&self) {
        self.manual_transition(CircuitState::Closed);
    }

    pub fn transition_to_open(&self) {
        self.manual_transition(CircuitState::Open);
    }

    /// Start trial calls now, whatever the remaining open wait
    pub fn transition_to_half_open(&self) {
        self.manual_transition(CircuitState::HalfOpen);
    }

    pub fn transition_to_disabled(&self) {
        self.manual_transition(CircuitState::Disabled);
    }

    pub fn transition_to_forced_open(&self) {
        self.manual_transition(CircuitState::ForcedOpen);
    }

    /// Reset the circuit breaker to closed state with empty windows
    pub fn reset(&self) {
        let mut pending = Vec::new();
        {
            let mut machine = self.machine.lock();
            let now = self.clock.now();
            self.transition(&mut machine, CircuitState::Closed, now, &mut pending);
            self.not_permitted_calls.store(0, Ordering::Relaxed);
        }
        pending.push(CircuitBreakerEventKind::Reset);
        self.publish(pending);
        info!(name = %self.name, "Circuit breaker manually reset to closed state");
    }

    // ---- Introspection ----

    /// Current state; performs a due OPEN → HALF_OPEN transition
    pub fn state(&self) -> CircuitState {
        let mut pending = Vec::new();
        let state = {
            let mut machine = self.machine.lock();
            self.open_to_half_open_if_due(&mut machine, self.clock.now(), &mut pending);
            machine.state
        };
        self.publish(pending);
        state
    }

    /// Handle that reads the current state without keeping the breaker alive
    pub(crate) fn state_handle(&self) -> StateHandle {
        StateHandle { machine: Arc::clone(&self.machine) }
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Duration {
        let changed_at = self.machine.lock().state_changed_at;
        self.clock.now().saturating_duration_since(changed_at)
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let (snapshot, minimum_calls) = {
            let machine = self.machine.lock();
            match machine.state {
                CircuitState::HalfOpen => (
                    machine.trial_window.snapshot(),
                    self.config.permitted_number_of_calls_in_half_open_state,
                ),
                _ => (machine.closed_window.snapshot(), self.config.effective_minimum_calls()),
            }
        };
        let evaluated = snapshot.total_calls >= minimum_calls;

        CircuitBreakerMetrics {
            state,
            failure_rate: if evaluated { snapshot.failure_rate() } else { 0.0 },
            slow_call_rate: if evaluated { snapshot.slow_call_rate() } else { 0.0 },
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            slow_calls: snapshot.slow_calls,
            slow_failed_calls: snapshot.slow_failed_calls,
            successful_calls: snapshot.successful_calls(),
            not_permitted_calls: self.not_permitted_calls.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, kinds: Vec<CircuitBreakerEventKind>) {
        if kinds.is_empty() || !self.events.has_consumers() {
            return;
        }
        let created_at = self.clock.system_time();
        for kind in kinds {
            self.events.publish(&CircuitBreakerEvent { name: Arc::clone(&self.name), created_at, kind });
        }
    }

    // ---- Convenience wrappers ----

    /// Execute an operation with circuit breaker protection
    ///
    /// This method checks if the circuit allows execution, runs the operation
    /// if allowed, and records the result to update the circuit state.
    #[instrument(skip(self, operation), fields(name = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire_permission()?;

        match operation().await {
            Ok(result) => {
                permit.on_success();
                Ok(result)
            }
            Err(error) => {
                permit.on_error(&error);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(name = %self.name))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire_permission()?;

        match operation() {
            Ok(result) => {
                permit.on_success();
                Ok(result)
            }
            Err(error) => {
                permit.on_error(&error);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }
}

//==============================================================================
// Call Permit
//==============================================================================

/// Read-only view of a breaker's state, safe to capture in its own consumers
#[derive(Clone)]
pub(crate) struct StateHandle {
    machine: Arc<Mutex<Machine>>,
}

impl StateHandle {
    /// State as last stored; never performs a transition
    pub(crate) fn current(&self) -> CircuitState {
        self.machine.lock().state
    }
}

/// Permission to run one call through a [`CircuitBreaker`]
///
/// Measures the call from the moment it was issued. Outcomes reported after
/// the breaker changed state are discarded.
#[must_use = "an unsettled permit records nothing"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    epoch: u64,
    started_at: Instant,
    settled: bool,
}

impl CallPermit {
    /// Time since the permit was issued
    pub fn elapsed(&self) -> Duration {
        self.breaker.clock.now().saturating_duration_since(self.started_at)
    }

    pub fn on_success(mut self) {
        self.settled = true;
        let duration = self.elapsed();
        self.breaker.record_success(Some(self.epoch), duration);
    }

    pub fn on_error<E: Error + 'static>(mut self, error: &E) {
        self.settled = true;
        let duration = self.elapsed();
        self.breaker.record_error(Some(self.epoch), duration, error);
    }

    pub fn on_outcome(mut self, outcome: CallOutcome) {
        self.settled = true;
        let duration = self.elapsed();
        self.breaker.record_outcome(Some(self.epoch), outcome, duration);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_permission(self.epoch);
        }
    }
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.name)
            .field("epoch", &self.epoch)
            .finish()
    }
}
