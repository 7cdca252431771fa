//! Fixed-window rate limiter
//!
//! At most `limit_for_period` permits are handed out per
//! `limit_refresh_period`. Every refresh resets the available permits to the
//! limit and serves queued acquirers in arrival order. Acquirers that find no
//! permit wait (without spinning) for a refresh, up to their timeout.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, Rejection, ResilienceError, ResilienceResult};
use super::event::EventPublisher;

/// Configuration for a rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Permits available in each refresh period
    pub limit_for_period: u32,
    /// Length of a refresh period
    pub limit_refresh_period: Duration,
    /// Longest an acquirer waits for a permit; zero never waits
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 100,
            limit_refresh_period: Duration::from_secs(60),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.limit_for_period == 0 {
            return Err(ConfigError::invalid("limit_for_period must be greater than 0"));
        }
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::invalid("limit_refresh_period must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Event published by a rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: RateLimiterEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    SuccessfulAcquire,
    FailedAcquire,
}

/// Point-in-time view of a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterMetrics {
    pub available_permissions: u32,
    pub number_of_waiting_tasks: usize,
}

struct LimiterState {
    available_permits: u32,
    next_refresh_at: Instant,
    /// Each grant carries the end of the period it belongs to
    waiters: VecDeque<oneshot::Sender<Instant>>,
}

impl LimiterState {
    fn prune_cancelled(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
    }
}

/// Named fixed-window rate limiter
pub struct RateLimiter {
    name: Arc<str>,
    config: Arc<RateLimiterConfig>,
    state: Arc<Mutex<LimiterState>>,
    events: Arc<EventPublisher<RateLimiterEvent>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), RateLimiterConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(name.into(), config, clock))
    }

    fn from_parts(name: String, config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let state = LimiterState {
            available_permits: config.limit_for_period,
            next_refresh_at: clock.now() + config.limit_refresh_period,
            waiters: VecDeque::new(),
        };

        Self {
            name: Arc::from(name),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            events: Arc::new(EventPublisher::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.events
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.state.lock();
        self.refresh(&mut state, self.clock.now());
        state.prune_cancelled();
        RateLimiterMetrics {
            available_permissions: state.available_permits,
            number_of_waiting_tasks: state.waiters.len(),
        }
    }

    /// Start every period boundary that has passed
    ///
    /// Permits reset to the limit and queued acquirers are served FIFO. A
    /// waiter that already gave up is skipped without consuming a permit.
    fn refresh(&self, state: &mut LimiterState, now: Instant) {
        if now < state.next_refresh_at {
            return;
        }

        let period = self.config.limit_refresh_period;
        let behind = now.duration_since(state.next_refresh_at);
        let cycles = behind.as_nanos() / period.as_nanos() + 1;
        let advance = u32::try_from(cycles)
            .ok()
            .and_then(|c| period.checked_mul(c))
            .unwrap_or(behind + period);
        state.next_refresh_at += advance;
        state.available_permits = self.config.limit_for_period;

        let period_end = state.next_refresh_at;
        let mut granted = 0u32;
        while state.available_permits > 0 {
            let Some(waiter) = state.waiters.pop_front() else { break };
            if waiter.send(period_end).is_ok() {
                state.available_permits -= 1;
                granted += 1;
            }
        }

        debug!(
            name = %self.name,
            granted_to_waiters = granted,
            available = state.available_permits,
            "Rate limiter refreshed"
        );
    }

    /// Take a permit if one is free right now
    pub fn try_acquire_permission(&self) -> Result<(), Rejection> {
        let acquired = {
            let mut state = self.state.lock();
            self.refresh(&mut state, self.clock.now());
            state.prune_cancelled();
            if state.waiters.is_empty() && state.available_permits > 0 {
                state.available_permits -= 1;
                true
            } else {
                false
            }
        };

        if acquired {
            self.on_acquired();
            Ok(())
        } else {
            Err(self.on_rejected())
        }
    }

    /// Wait up to the configured timeout for a permit
    pub async fn acquire_permission(&self) -> Result<(), Rejection> {
        self.acquire(self.config.timeout_duration, None).await
    }

    pub async fn acquire_permission_with_timeout(&self, timeout: Duration) -> Result<(), Rejection> {
        self.acquire(timeout, None).await
    }

    /// Like [`acquire_permission`](Self::acquire_permission), giving up as
    /// soon as `token` is cancelled
    pub async fn acquire_permission_cancellable(
        &self,
        token: &CancellationToken,
    ) -> Result<(), Rejection> {
        self.acquire(self.config.timeout_duration, Some(token)).await
    }

    async fn acquire(
        &self,
        timeout: Duration,
        cancellation: Option<&CancellationToken>,
    ) -> Result<(), Rejection> {
        let start = self.clock.now();
        let deadline = start.checked_add(timeout);

        let receiver = {
            let mut state = self.state.lock();
            self.refresh(&mut state, start);
            state.prune_cancelled();

            if state.waiters.is_empty() && state.available_permits > 0 {
                state.available_permits -= 1;
                drop(state);
                self.on_acquired();
                return Ok(());
            }
            if timeout.is_zero() {
                drop(state);
                return Err(self.on_rejected());
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        let mut waiting = PendingGrant { limiter: self, receiver, settled: false };

        let cancelled = async {
            match cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(cancelled);

        loop {
            let now = self.clock.now();
            if deadline.is_some_and(|d| now >= d) {
                waiting.receiver.close();
                // A refresh may have granted us a permit just before closing.
                return match waiting.receiver.try_recv() {
                    Ok(_) => {
                        waiting.settled = true;
                        self.on_acquired();
                        Ok(())
                    }
                    Err(_) => Err(self.on_rejected()),
                };
            }

            let next_refresh_at = self.state.lock().next_refresh_at;
            let wake_at = deadline.map_or(next_refresh_at, |d| d.min(next_refresh_at));

            tokio::select! {
                biased;
                granted = &mut waiting.receiver => {
                    return match granted {
                        Ok(_) => {
                            waiting.settled = true;
                            self.on_acquired();
                            Ok(())
                        }
                        Err(_) => Err(self.on_rejected()),
                    };
                }
                () = &mut cancelled => {
                    debug!(name = %self.name, "Rate limiter wait cancelled");
                    // Dropping `waiting` hands back a grant that arrived meanwhile
                    return Err(self.on_rejected());
                }
                () = self.clock.sleep(wake_at.saturating_duration_since(now)) => {
                    let mut state = self.state.lock();
                    self.refresh(&mut state, self.clock.now());
                }
            }
        }
    }

    /// Put back a permit that was granted to a waiter who never used it
    ///
    /// The permit only counts while its period is still current. It goes to
    /// the next live waiter, or back to the free pool capped at the limit.
    fn return_grant(&self, period_end: Instant) {
        let mut state = self.state.lock();
        self.refresh(&mut state, self.clock.now());
        if state.next_refresh_at != period_end {
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(period_end).is_ok() {
                debug!(name = %self.name, "Unused permit passed to next waiter");
                return;
            }
        }
        state.available_permits = (state.available_permits + 1).min(self.config.limit_for_period);
        debug!(name = %self.name, available = state.available_permits, "Unused permit returned");
    }

    fn on_acquired(&self) {
        self.publish(RateLimiterEventKind::SuccessfulAcquire);
    }

    fn on_rejected(&self) -> Rejection {
        debug!(name = %self.name, "Rate limiter rejected call");
        self.publish(RateLimiterEventKind::FailedAcquire);
        Rejection::RateLimited {
            name: self.name.to_string(),
            limit_for_period: self.config.limit_for_period,
            period: self.config.limit_refresh_period,
        }
    }

    fn publish(&self, kind: RateLimiterEventKind) {
        if self.events.has_consumers() {
            self.events.publish(&RateLimiterEvent {
                name: Arc::clone(&self.name),
                created_at: self.clock.system_time(),
                kind,
            });
        }
    }

    /// Acquire a permit, then run the operation
    #[instrument(skip(self, operation), fields(name = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        self.acquire_permission().await?;
        operation().await.map_err(|source| ResilienceError::OperationFailed { source })
    }
}

/// A queued acquirer's side of the grant channel
///
/// Dropped without being settled (cancellation, or the acquiring future
/// itself being dropped), it returns any grant already sent to it.
struct PendingGrant<'a> {
    limiter: &'a RateLimiter,
    receiver: oneshot::Receiver<Instant>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.receiver.close();
        if let Ok(period_end) = self.receiver.try_recv() {
            self.limiter.return_grant(period_end);
        }
    }
}
