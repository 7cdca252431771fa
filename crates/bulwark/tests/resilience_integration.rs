//! Integration tests for the resilience policies
//!
//! Each policy is driven through its public API the way a service would use
//! it: breakers with a `MockClock`, limiters and bulkheads on tokio's paused
//! clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark::resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    FailureClassifier, MockClock, RateLimiter, RateLimiterConfig, Rejection, ResilienceError,
    Retry, RetryConfig, ThreadPoolBulkhead, ThreadPoolBulkheadConfig,
};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
enum PaymentError {
    #[error("gateway timeout")]
    Timeout,
    #[error("card declined")]
    Declined,
}

/// Route policy logs to the test output; `RUST_LOG=bulwark=debug` shows them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn breaker_with(clock: &MockClock, config: CircuitBreakerConfig) -> CircuitBreaker {
    CircuitBreaker::with_clock("payment-service", config, Arc::new(clock.clone()))
        .expect("valid breaker config")
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Validates the CLOSED → OPEN transition at the threshold-crossing call.
///
/// Assertions:
/// - All calls before the crossing call are permitted and the state stays
///   CLOSED.
/// - The crossing call opens the circuit; the next call is rejected.
#[tokio::test]
async fn test_breaker_opens_exactly_at_threshold_crossing() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_rate_threshold(50.0)
        .minimum_number_of_calls(4)
        .sliding_window_size(10)
        .build()
        .unwrap();
    let breaker = breaker_with(&clock, config);

    // S, F, S: below the minimum, never evaluated
    for fail in [false, true, false] {
        let result = breaker
            .execute(|| async move {
                if fail {
                    Err(PaymentError::Timeout)
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(!matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // 4th call: 2 of 4 failed = 50%
    let _ = breaker.execute(|| async { Err::<(), _>(PaymentError::Timeout) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.execute(|| async { Ok::<_, PaymentError>(()) }).await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { state: CircuitState::Open, .. })));
    assert_eq!(breaker.metrics().not_permitted_calls, 1);
}

/// Validates the open wait and the half-open trial budget.
///
/// Assertions:
/// - Permission is refused until the full open wait has elapsed.
/// - The first attempt afterwards moves to HALF_OPEN and is permitted.
/// - Exactly the configured number of trial permits are issued.
/// - Successful trials close the circuit.
#[tokio::test]
async fn test_breaker_open_wait_and_half_open_trials() {
    init_tracing();
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .minimum_number_of_calls(2)
        .sliding_window_size(2)
        .wait_duration_in_open_state(Duration::from_secs(30))
        .permitted_number_of_calls_in_half_open_state(3)
        .build()
        .unwrap();
    let breaker = breaker_with(&clock, config);

    breaker.on_error(Duration::from_millis(5), &PaymentError::Timeout);
    breaker.on_error(Duration::from_millis(5), &PaymentError::Timeout);
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(29_999));
    assert!(matches!(
        breaker.try_acquire_permission(),
        Err(Rejection::CircuitOpen { state: CircuitState::Open, .. })
    ));

    clock.advance_millis(1);
    let trials: Vec<_> = (0..3).map(|_| breaker.try_acquire_permission().unwrap()).collect();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(matches!(
        breaker.try_acquire_permission(),
        Err(Rejection::CircuitOpen { state: CircuitState::HalfOpen, .. })
    ));

    for permit in trials {
        permit.on_success();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Validates that ignored failures do not count against the breaker.
///
/// Assertions:
/// - Declined cards are ignored; the window stays empty of failures.
#[tokio::test]
async fn test_breaker_ignores_classified_failures() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .minimum_number_of_calls(2)
        .sliding_window_size(2)
        .ignore_failure(FailureClassifier::predicate(|err| err.to_string() == "card declined"))
        .build()
        .unwrap();
    let breaker = breaker_with(&clock, config);

    for _ in 0..4 {
        let _ = breaker.execute(|| async { Err::<(), _>(PaymentError::Declined) }).await;
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().failed_calls, 0);
}

// ============================================================================
// Retry
// ============================================================================

/// Validates attempt count and exponential waits.
///
/// Assertions:
/// - Three attempts are made with waits of 1s then 2s.
/// - The error is `RetryExhausted` with `attempts == 3`.
#[tokio::test]
async fn test_retry_exhausts_with_exponential_waits() {
    init_tracing();
    let clock = MockClock::new();
    let config = RetryConfig::builder()
        .max_attempts(3)
        .initial_wait_duration(Duration::from_secs(1))
        .exponential_backoff_multiplier(2.0)
        .build()
        .unwrap();
    let retry = Retry::with_clock("payment-service", config, Arc::new(clock.clone())).unwrap();
    let attempts = AtomicU32::new(0);

    let result = retry
        .execute(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(PaymentError::Timeout) }
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(clock.recorded_sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    match result {
        Err(ResilienceError::RetryExhausted { attempts, source, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, PaymentError::Timeout));
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    init_tracing();
    let clock = MockClock::new();
    let retry = Retry::with_clock(
        "payment-service",
        RetryConfig::builder().max_attempts(5).build().unwrap(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let attempts = AtomicU32::new(0);

    let result = retry
        .execute(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(PaymentError::Timeout)
                } else {
                    Ok("captured")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "captured");
    assert_eq!(retry.metrics().successful_calls_with_retry, 1);
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Validates per-period limits with waiting acquirers.
///
/// Assertions:
/// - The 3rd acquisition in a period times out when the refresh is later
///   than its timeout.
/// - After the refresh exactly `limit_for_period` acquisitions succeed.
#[tokio::test(start_paused = true)]
async fn test_rate_limiter_period_limit() {
    let config = RateLimiterConfig::builder()
        .limit_for_period(2)
        .limit_refresh_period(Duration::from_secs(1))
        .timeout_duration(Duration::from_millis(200))
        .build()
        .unwrap();
    let limiter = RateLimiter::new("search-api", config).unwrap();

    limiter.acquire_permission().await.unwrap();
    limiter.acquire_permission().await.unwrap();
    let third = limiter.acquire_permission().await;
    assert!(matches!(third, Err(Rejection::RateLimited { limit_for_period: 2, .. })));

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(limiter.try_acquire_permission().is_ok());
    assert!(limiter.try_acquire_permission().is_ok());
    assert!(limiter.try_acquire_permission().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_waiter_served_at_refresh() {
    let config = RateLimiterConfig::builder()
        .limit_for_period(1)
        .limit_refresh_period(Duration::from_secs(1))
        .timeout_duration(Duration::from_secs(2))
        .build()
        .unwrap();
    let limiter = RateLimiter::new("search-api", config).unwrap();
    limiter.acquire_permission().await.unwrap();

    let start = tokio::time::Instant::now();
    limiter.acquire_permission().await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(limiter.metrics().available_permissions, 0);
}

// ============================================================================
// Bulkhead
// ============================================================================

/// Validates bounded waiting for a bulkhead slot.
///
/// Assertions:
/// - A second caller is rejected after `max_wait_duration` while the first
///   holds the only slot.
/// - Once the first call exits, the next caller is admitted immediately.
#[tokio::test(start_paused = true)]
async fn test_bulkhead_single_slot_wait_and_release() {
    let config = BulkheadConfig::builder()
        .max_concurrent_calls(1)
        .max_wait_duration(Duration::from_millis(100))
        .build()
        .unwrap();
    let bulkhead = Bulkhead::new("reports", config).unwrap();

    let first = bulkhead.enter().await.unwrap();
    let start = tokio::time::Instant::now();
    let second = bulkhead.enter().await;
    assert!(matches!(second, Err(Rejection::BulkheadFull { max_concurrent_calls: 1, .. })));
    assert_eq!(start.elapsed(), Duration::from_millis(100));

    let failed = bulkhead.execute(|| async { Err::<(), _>(PaymentError::Timeout) });
    drop(first);
    assert!(matches!(failed.await, Err(ResilienceError::OperationFailed { .. })));

    let start = tokio::time::Instant::now();
    let third = bulkhead.enter().await;
    assert!(third.is_ok());
    assert_eq!(start.elapsed(), Duration::ZERO);
}

/// Validates that slots always return after concurrent use.
///
/// Assertions:
/// - After many overlapping successes, failures and cancellations, every
///   slot is available again.
#[tokio::test(start_paused = true)]
async fn test_bulkhead_slots_restored_under_concurrency() {
    let config = BulkheadConfig::builder()
        .max_concurrent_calls(4)
        .max_wait_duration(Duration::from_secs(60))
        .build()
        .unwrap();
    let bulkhead = Bulkhead::new("reports", config).unwrap();

    let mut tasks = Vec::new();
    for i in 0..40_u64 {
        let bulkhead = bulkhead.clone();
        tasks.push(tokio::spawn(async move {
            let work = bulkhead.execute(|| async move {
                tokio::time::sleep(Duration::from_millis(10 + i % 7)).await;
                if i % 3 == 0 {
                    Err(PaymentError::Timeout)
                } else {
                    Ok(i)
                }
            });
            if i % 5 == 0 {
                // abandon the call part-way
                let _ = tokio::time::timeout(Duration::from_millis(5), work).await;
            } else {
                let _ = work.await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let metrics = bulkhead.metrics();
    assert_eq!(metrics.available_concurrent_calls, 4);
    assert_eq!(metrics.rejected_calls, 0);
}

// ============================================================================
// Thread-pool Bulkhead
// ============================================================================

#[tokio::test]
async fn test_thread_pool_runs_and_rejects_beyond_capacity() {
    let config = ThreadPoolBulkheadConfig::builder()
        .core_thread_pool_size(1)
        .max_thread_pool_size(1)
        .queue_capacity(1)
        .build()
        .unwrap();
    let pool = ThreadPoolBulkhead::new("exports", config).unwrap();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));

    let running = {
        let gate = Arc::clone(&gate);
        pool.submit(move || async move {
            let _ = gate.acquire().await;
            1
        })
        .unwrap()
    };
    let queued = pool.submit(|| async { 2 }).unwrap();
    assert!(matches!(pool.submit(|| async { 3 }), Err(Rejection::BulkheadFull { .. })));

    gate.add_permits(1);
    assert_eq!(running.await.unwrap(), 1);
    assert_eq!(queued.await.unwrap(), 2);

    let result = pool.execute(|| async { Err::<(), _>(PaymentError::Declined) }).await;
    assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
    pool.shutdown();
}
