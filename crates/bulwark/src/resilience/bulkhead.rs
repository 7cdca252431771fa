//! Bulkhead pattern for limiting concurrent operations
//!
//! The bulkhead pattern prevents resource exhaustion by limiting the number
//! of concurrent operations. Named after ship bulkheads that contain flooding
//! to specific compartments, this pattern isolates failures and prevents
//! cascading resource exhaustion.
//!
//! This is the semaphore form: calls run on the caller's task and hold a
//! [`BulkheadPermit`] while they execute. See
//! [`ThreadPoolBulkhead`](super::ThreadPoolBulkhead) for the worker-pool form.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::clock::{Clock, SystemClock};
use super::error::{ConfigError, ConfigResult, Rejection, ResilienceError, ResilienceResult};
use super::event::EventPublisher;

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent operations allowed
    pub max_concurrent_calls: u32,
    /// Longest a caller waits for a free slot; zero rejects immediately
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent_calls: 25, max_wait_duration: Duration::from_millis(100) }
    }
}

impl BulkheadConfig {
    /// Create a new configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid("max_concurrent_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for BulkheadConfig
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    pub fn max_concurrent_calls(mut self, max: u32) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Events and Metrics
//==============================================================================

/// Event published by a bulkhead (both forms)
#[derive(Debug, Clone)]
pub struct BulkheadEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: BulkheadEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEventKind {
    CallPermitted,
    CallRejected,
    CallFinished,
}

/// Metrics for bulkhead monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: u32,
    pub max_concurrent_calls: u32,
    /// Calls admitted since creation
    pub permitted_calls: u64,
    /// Calls rejected since creation
    pub rejected_calls: u64,
}

impl BulkheadMetrics {
    pub fn concurrent_calls(&self) -> u32 {
        self.max_concurrent_calls.saturating_sub(self.available_concurrent_calls)
    }

    /// Calculate the current utilization as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        f64::from(self.concurrent_calls()) / f64::from(self.max_concurrent_calls.max(1))
    }

    /// Calculate the rejection rate as a fraction (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.permitted_calls + self.rejected_calls;
        if total == 0 {
            return 0.0;
        }
        self.rejected_calls as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.available_concurrent_calls == 0
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} concurrent ({:.1}% utilized), {} rejected",
            self.concurrent_calls(),
            self.max_concurrent_calls,
            self.utilization() * 100.0,
            self.rejected_calls
        )
    }
}

//==============================================================================
// Bulkhead
//==============================================================================

/// Semaphore bulkhead limiting concurrent calls
///
/// # Examples
///
/// ```rust
/// use bulwark::resilience::{Bulkhead, BulkheadConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BulkheadConfig::builder().max_concurrent_calls(5).build()?;
/// let bulkhead = Bulkhead::new("payment-service", config)?;
///
/// let result = bulkhead
///     .execute(|| async { Ok::<_, std::io::Error>("Success") })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    name: Arc<str>,
    config: Arc<BulkheadConfig>,
    semaphore: Arc<Semaphore>,
    permitted_calls: Arc<AtomicU64>,
    rejected_calls: Arc<AtomicU64>,
    events: Arc<EventPublisher<BulkheadEvent>>,
    clock: Arc<dyn Clock>,
}

impl Clone for Bulkhead {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: Arc::clone(&self.config),
            semaphore: Arc::clone(&self.semaphore),
            permitted_calls: Arc::clone(&self.permitted_calls),
            rejected_calls: Arc::clone(&self.rejected_calls),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("max_concurrent_calls", &self.config.max_concurrent_calls)
            .field("available_concurrent_calls", &self.semaphore.available_permits())
            .finish()
    }
}

impl Bulkhead {
    /// Create a new bulkhead with the given configuration
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a bulkhead with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::from_parts(name.into(), BulkheadConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: BulkheadConfig,
        clock: Arc<dyn Clock>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(name.into(), config, clock))
    }

    fn from_parts(name: String, config: BulkheadConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: Arc::from(name),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls as usize)),
            config: Arc::new(config),
            permitted_calls: Arc::new(AtomicU64::new(0)),
            rejected_calls: Arc::new(AtomicU64::new(0)),
            events: Arc::new(EventPublisher::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher<BulkheadEvent> {
        &self.events
    }

    /// Take a slot if one is free right now
    pub fn try_enter(&self) -> Result<BulkheadPermit, Rejection> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(self.admit(permit)),
            Err(_) => Err(self.reject()),
        }
    }

    /// Wait up to `max_wait_duration` for a slot
    pub async fn enter(&self) -> Result<BulkheadPermit, Rejection> {
        self.enter_inner(self.config.max_wait_duration, None).await
    }

    pub async fn enter_with_timeout(&self, timeout: Duration) -> Result<BulkheadPermit, Rejection> {
        self.enter_inner(timeout, None).await
    }

    /// Like [`enter`](Self::enter), giving up as soon as `token` is cancelled
    pub async fn enter_cancellable(
        &self,
        token: &CancellationToken,
    ) -> Result<BulkheadPermit, Rejection> {
        self.enter_inner(self.config.max_wait_duration, Some(token)).await
    }

    async fn enter_inner(
        &self,
        timeout: Duration,
        cancellation: Option<&CancellationToken>,
    ) -> Result<BulkheadPermit, Rejection> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.admit(permit));
        }
        if timeout.is_zero() {
            return Err(self.reject());
        }

        let cancelled = async {
            match cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            acquired = Arc::clone(&self.semaphore).acquire_owned() => match acquired {
                Ok(permit) => Ok(self.admit(permit)),
                Err(_) => Err(self.reject()),
            },
            () = cancelled => {
                debug!(name = %self.name, "Bulkhead wait cancelled");
                Err(self.reject())
            }
            () = self.clock.sleep(timeout) => Err(self.reject()),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.permitted_calls.fetch_add(1, Ordering::Relaxed);
        publish(&self.events, &self.name, self.clock.as_ref(), BulkheadEventKind::CallPermitted);
        BulkheadPermit {
            permit: Some(permit),
            name: Arc::clone(&self.name),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }

    fn reject(&self) -> Rejection {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        debug!(name = %self.name, "Bulkhead rejected call");
        publish(&self.events, &self.name, self.clock.as_ref(), BulkheadEventKind::CallRejected);
        Rejection::BulkheadFull {
            name: self.name.to_string(),
            max_concurrent_calls: self.config.max_concurrent_calls,
        }
    }

    /// Get bulkhead metrics
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: u32::try_from(self.semaphore.available_permits())
                .unwrap_or(u32::MAX),
            max_concurrent_calls: self.config.max_concurrent_calls,
            permitted_calls: self.permitted_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Execute an operation with bulkhead protection
    ///
    /// This method acquires a slot (waiting if necessary up to the configured
    /// wait), executes the operation, and releases the slot when done.
    #[instrument(skip(self, operation), fields(name = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let _permit = self.enter().await?;
        operation().await.map_err(|source| ResilienceError::OperationFailed { source })
    }
}

pub(crate) fn publish(
    events: &EventPublisher<BulkheadEvent>,
    name: &Arc<str>,
    clock: &dyn Clock,
    kind: BulkheadEventKind,
) {
    if events.has_consumers() {
        events.publish(&BulkheadEvent {
            name: Arc::clone(name),
            created_at: clock.system_time(),
            kind,
        });
    }
}

/// A held bulkhead slot
///
/// The slot is released exactly once when the permit is dropped, whether
/// the call succeeded, failed, panicked or was cancelled.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit {
    permit: Option<OwnedSemaphorePermit>,
    name: Arc<str>,
    events: Arc<EventPublisher<BulkheadEvent>>,
    clock: Arc<dyn Clock>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        // Release before publishing so consumers observe the freed slot.
        drop(self.permit.take());
        publish(&self.events, &self.name, self.clock.as_ref(), BulkheadEventKind::CallFinished);
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("bulkhead", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;

    use super::*;

    fn bulkhead(max: u32, wait: Duration) -> Bulkhead {
        let config =
            BulkheadConfig::builder().max_concurrent_calls(max).max_wait_duration(wait).build().unwrap();
        Bulkhead::new("inventory-service", config).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent_calls(0).build().is_err());
        let defaults = BulkheadConfig::default();
        assert_eq!(defaults.max_concurrent_calls, 25);
        assert_eq!(defaults.max_wait_duration, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_try_enter_rejects_when_full() {
        let bh = bulkhead(2, Duration::ZERO);

        let first = bh.try_enter().unwrap();
        let _second = bh.try_enter().unwrap();
        let rejection = bh.try_enter().unwrap_err();

        assert_eq!(
            rejection,
            Rejection::BulkheadFull { name: "inventory-service".into(), max_concurrent_calls: 2 }
        );
        assert!(bh.metrics().is_at_capacity());

        drop(first);
        assert_eq!(bh.metrics().available_concurrent_calls, 1);
        assert!(bh.try_enter().is_ok());
    }

    /// A waiting caller is admitted as soon as a slot is released.
    #[tokio::test(start_paused = true)]
    async fn test_waiter_admitted_on_release() {
        let bh = bulkhead(1, Duration::from_secs(1));
        let held = bh.enter().await.unwrap();

        let waiter = {
            let bh = bh.clone();
            tokio::spawn(async move { bh.enter().await.map(|_| tokio::time::Instant::now()) })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        let released_at = tokio::time::Instant::now();
        drop(held);

        let admitted_at = waiter.await.unwrap().unwrap();
        assert_eq!(admitted_at, released_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let bh = bulkhead(1, Duration::from_millis(100));
        let _held = bh.enter().await.unwrap();

        let start = tokio::time::Instant::now();
        let result = bh.enter().await;

        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(bh.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_rejects() {
        let bh = bulkhead(1, Duration::from_secs(60));
        let _held = bh.try_enter().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        assert!(bh.enter_cancellable(&token).await.is_err());
        assert_eq!(bh.metrics().available_concurrent_calls, 0);
    }

    /// The slot is released on failure as well as success.
    #[tokio::test]
    async fn test_execute_releases_slot_on_failure() {
        let bh = bulkhead(1, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let failed: ResilienceResult<(), std::io::Error> = bh
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::other("disk full"))
            })
            .await;
        assert!(matches!(failed, Err(ResilienceError::OperationFailed { .. })));

        let ok: ResilienceResult<u8, std::io::Error> = bh.execute(|| async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bh.metrics().available_concurrent_calls, 1);
    }

    #[tokio::test]
    async fn test_events_and_status_message() {
        let bh = bulkhead(1, Duration::ZERO);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bh.events().subscribe(move |ev: &BulkheadEvent| sink.lock().push(ev.kind));

        let permit = bh.try_enter().unwrap();
        let _ = bh.try_enter();
        drop(permit);

        assert_eq!(
            *seen.lock(),
            vec![
                BulkheadEventKind::CallPermitted,
                BulkheadEventKind::CallRejected,
                BulkheadEventKind::CallFinished,
            ]
        );
        let metrics = bh.metrics();
        assert_eq!(metrics.rejection_rate(), 0.5);
        assert_eq!(metrics.status_message(), "Bulkhead: 0/1 concurrent (0.0% utilized), 1 rejected");
    }
}
