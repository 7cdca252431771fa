//! Integration tests for the decorator pipeline
//!
//! Covers policy ordering, fallback substitution, cancellation and the
//! registry-driven `ResilientSpec` wiring.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark::config::ResilienceSettings;
use bulwark::resilience::{
    decorate, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    Completion, Decorators, FailureKind, MockClock, Policies, RateLimiter, RateLimiterConfig,
    ResilienceError, ResilienceRegistry, ResilientSpec, Retry, RetryConfig,
};
use thiserror::Error;
use tokio_test::{assert_pending, assert_ready, task};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
#[error("order service unavailable")]
struct Unavailable;

// ============================================================================
// End-to-end Scenario
// ============================================================================

/// Validates the bulkhead slot across a breaker rejection.
///
/// Pipeline: Bulkhead(1) → CircuitBreaker(50%, min 4, window 4) →
/// Retry(max 1) around an always-failing operation.
///
/// Assertions:
/// - After 4 failed calls the breaker is OPEN.
/// - The 5th call is rejected with `CircuitOpen` without running the
///   operation.
/// - The bulkhead slot is back after every call, including the rejected one.
#[tokio::test]
async fn test_bulkhead_slot_returned_after_breaker_rejection() {
    let clock = MockClock::new();
    let clock_handle: Arc<MockClock> = Arc::new(clock.clone());
    let bulkhead = Bulkhead::with_clock(
        "orders",
        BulkheadConfig::builder().max_concurrent_calls(1).build().unwrap(),
        clock_handle.clone(),
    )
    .unwrap();
    let breaker = CircuitBreaker::with_clock(
        "orders",
        CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .minimum_number_of_calls(4)
            .sliding_window_size(4)
            .build()
            .unwrap(),
        clock_handle.clone(),
    )
    .unwrap();
    let retry = Retry::with_clock(
        "orders",
        RetryConfig::builder().max_attempts(1).build().unwrap(),
        clock_handle,
    )
    .unwrap();
    let policies = Policies::new()
        .with_bulkhead(bulkhead.clone())
        .with_circuit_breaker(breaker.clone())
        .with_retry(retry);

    let invocations = AtomicU32::new(0);
    let mut call = decorate(
        || {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Unavailable) }
        },
        &policies,
    );

    for _ in 0..4 {
        let result = call.call().await;
        assert_eq!(result.unwrap_err().kind(), FailureKind::RetryExhausted);
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let fifth = call.call().await;

    assert!(matches!(fifth, Err(ResilienceError::CircuitOpen { state: CircuitState::Open, .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(bulkhead.metrics().available_concurrent_calls, 1);
    assert_eq!(bulkhead.metrics().permitted_calls, 5);
}

// ============================================================================
// Ordering and Fallback
// ============================================================================

/// Validates that the rate limiter is consulted once per call, not per
/// attempt.
///
/// Assertions:
/// - Three retry attempts consume a single permit.
#[tokio::test]
async fn test_rate_limiter_consulted_once_per_call() {
    let clock = MockClock::new();
    let limiter = RateLimiter::with_clock(
        "orders",
        RateLimiterConfig::builder()
            .limit_for_period(1)
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    // Separate timeline so retry waits do not refill the limiter
    let retry = Retry::with_clock("orders", RetryConfig::default(), Arc::new(MockClock::new())).unwrap();
    let attempts = AtomicU32::new(0);

    let mut call = Decorators::of(|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(Unavailable) }
    })
    .with_retry(retry)
    .with_rate_limiter(limiter.clone())
    .decorate();

    let first = call.call().await;
    assert_eq!(first.unwrap_err().kind(), FailureKind::RetryExhausted);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let second = call.call().await;
    assert!(matches!(second, Err(ResilienceError::RateLimited { limit_for_period: 1, .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "rejected before the operation ran");
}

/// Validates fallback substitution for admission rejections.
///
/// Assertions:
/// - A full bulkhead yields the fallback value tagged `BulkheadFull`.
#[tokio::test]
async fn test_fallback_for_bulkhead_rejection() {
    let bulkhead = Bulkhead::new(
        "orders",
        BulkheadConfig::builder()
            .max_concurrent_calls(1)
            .max_wait_duration(Duration::ZERO)
            .build()
            .unwrap(),
    )
    .unwrap();
    let _held = bulkhead.try_enter().unwrap();

    let mut call = Decorators::of(|| async { Ok::<Vec<&str>, Unavailable>(vec!["order-1"]) })
        .with_bulkhead(bulkhead.clone())
        .with_fallback(|_err| async { Vec::new() })
        .decorate();

    let completion = call.call_detailed().await.unwrap();

    assert_eq!(
        completion,
        Completion::Fallback { value: Vec::<&str>::new(), cause: FailureKind::BulkheadFull }
    );
}

#[tokio::test]
async fn test_success_is_primary_completion() {
    let mut call = Decorators::of(|| async { Ok::<_, Unavailable>(7) })
        .with_circuit_breaker(CircuitBreaker::with_defaults("orders"))
        .with_fallback(|_| async { 0 })
        .decorate();

    let completion = call.call_detailed().await.unwrap();

    assert!(!completion.is_degraded());
    assert_eq!(completion.into_inner(), 7);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Validates cancellation during a running operation.
///
/// Assertions:
/// - The call ends with `Cancelled` even though a fallback is configured.
/// - The breaker records nothing and its window stays empty.
/// - The bulkhead slot is released.
#[tokio::test(start_paused = true)]
async fn test_cancellation_records_nothing_and_releases_permits() {
    let bulkhead = Bulkhead::with_defaults("orders");
    let breaker = CircuitBreaker::with_defaults("orders");
    let token = CancellationToken::new();

    let mut call = Decorators::of(|| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, Unavailable>(())
    })
    .with_bulkhead(bulkhead.clone())
    .with_circuit_breaker(breaker.clone())
    .with_cancellation(token.clone())
    .with_fallback(|_| async {})
    .decorate();

    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });
    let result = call.call().await;
    cancel.await.unwrap();

    assert!(matches!(result, Err(ResilienceError::Cancelled)));
    assert_eq!(breaker.metrics().buffered_calls, 0);
    assert_eq!(bulkhead.metrics().available_concurrent_calls, 25);
}

/// Validates cancellation while queued on the rate limiter.
///
/// Assertions:
/// - A permit handed to the queued call at the refresh is given back when
///   the call is cancelled, within the same period.
#[tokio::test(start_paused = true)]
async fn test_cancelled_call_returns_rate_limiter_permit() {
    let limiter = RateLimiter::new(
        "orders",
        RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_millis(100))
            .timeout_duration(Duration::from_secs(5))
            .build()
            .unwrap(),
    )
    .unwrap();
    limiter.try_acquire_permission().unwrap();
    let token = CancellationToken::new();

    let mut call = Decorators::of(|| async { Ok::<_, Unavailable>(()) })
        .with_rate_limiter(limiter.clone())
        .with_cancellation(token.clone())
        .decorate();
    let mut queued = task::spawn(call.call());
    assert_pending!(queued.poll());

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(limiter.metrics().available_permissions, 0);
    token.cancel();
    let result = assert_ready!(queued.poll());
    drop(queued);

    assert!(matches!(result, Err(ResilienceError::Cancelled)));
    assert_eq!(limiter.metrics().available_permissions, 1);
}

// ============================================================================
// Registry Wiring
// ============================================================================

#[tokio::test]
async fn test_resilient_spec_resolves_shared_instances() {
    let registry = ResilienceRegistry::from_settings(ResilienceSettings::default()).unwrap();
    let spec = ResilientSpec::new("orders").retry(false);

    let policies = registry.policies_for(&spec).unwrap();
    let mut call = decorate(|| async { Err::<(), _>(Unavailable) }, &policies);
    let _ = call.call().await;

    let breaker = registry.circuit_breakers().require("orders").unwrap();
    assert_eq!(breaker.metrics().failed_calls, 1);
    assert!(registry.retries().is_empty());
}
