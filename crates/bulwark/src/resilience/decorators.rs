//! Composing policies around one operation
//!
//! [`Decorators`] collects the policies for an operation in any order and
//! always executes them the same way:
//!
//! ```text
//! bulkhead permit (held to the end)
//!   └─ rate limiter permit (once per call)
//!        └─ retry loop
//!             └─ circuit breaker permission (every attempt)
//!                  └─ operation
//! ```
//!
//! A circuit breaker rejection ends the call; it is never retried. A fallback
//! receives the terminal error and runs outside every policy. Cancellation
//! releases held permits, records nothing in the breaker and is reported as
//! [`ResilienceError::Cancelled`] without consulting the fallback.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bulkhead::Bulkhead;
use super::circuit_breaker::CircuitBreaker;
use super::error::{FailureKind, ResilienceError, ResilienceResult};
use super::rate_limiter::RateLimiter;
use super::retry::Retry;

type Fallback<T, E> = Arc<dyn Fn(ResilienceError<E>) -> BoxFuture<'static, T> + Send + Sync>;

/// The policies applied to one operation; absent ones are pass-throughs
#[derive(Debug, Clone, Default)]
pub struct Policies {
    pub bulkhead: Option<Bulkhead>,
    pub rate_limiter: Option<RateLimiter>,
    pub circuit_breaker: Option<CircuitBreaker>,
    pub retry: Option<Retry>,
}

impl Policies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bulkhead.is_none()
            && self.rate_limiter.is_none()
            && self.circuit_breaker.is_none()
            && self.retry.is_none()
    }
}

/// How a decorated call completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion<T> {
    /// The operation itself succeeded
    Primary(T),
    /// The fallback supplied the value after a terminal failure
    Fallback { value: T, cause: FailureKind },
}

impl<T> Completion<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Primary(value) | Self::Fallback { value, .. } => value,
        }
    }

    /// Whether the value came from the fallback
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// Builder collecting the policies for one operation
///
/// # Examples
///
/// ```rust
/// use bulwark::resilience::{CircuitBreaker, Decorators, Retry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::with_defaults("inventory-service");
/// let retry = Retry::with_defaults("inventory-service");
///
/// let mut call = Decorators::of(|| async { Ok::<_, std::io::Error>(12_u32) })
///     .with_retry(retry)
///     .with_circuit_breaker(breaker)
///     .with_fallback(|_err| async { 0 })
///     .decorate();
///
/// let stock = call.call().await?;
/// # Ok(())
/// # }
/// ```
pub struct Decorators<F, T, E>
where
    E: Error + Send + Sync + 'static,
{
    operation: F,
    policies: Policies,
    fallback: Option<Fallback<T, E>>,
    cancellation: Option<CancellationToken>,
}

impl<F, Fut, T, E> Decorators<F, T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + Send + Sync + 'static,
{
    pub fn of(operation: F) -> Self {
        Self { operation, policies: Policies::default(), fallback: None, cancellation: None }
    }

    pub fn with_policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.policies.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.policies.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.policies.circuit_breaker = Some(circuit_breaker);
        self
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.policies.retry = Some(retry);
        self
    }

    /// Substitute the result of `fallback` for any terminal failure except
    /// cancellation
    pub fn with_fallback<FB, FutB>(mut self, fallback: FB) -> Self
    where
        FB: Fn(ResilienceError<E>) -> FutB + Send + Sync + 'static,
        FutB: Future<Output = T> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |err| fallback(err).boxed()));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn decorate(self) -> DecoratedOperation<F, T, E> {
        DecoratedOperation {
            operation: self.operation,
            policies: self.policies,
            fallback: self.fallback,
            cancellation: self.cancellation,
        }
    }
}

/// An operation wrapped in its policies; every [`call`](Self::call) is one
/// protected invocation
pub struct DecoratedOperation<F, T, E>
where
    E: Error + Send + Sync + 'static,
{
    operation: F,
    policies: Policies,
    fallback: Option<Fallback<T, E>>,
    cancellation: Option<CancellationToken>,
}

impl<F, T, E> fmt::Debug for DecoratedOperation<F, T, E>
where
    E: Error + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratedOperation")
            .field("policies", &self.policies)
            .field("has_fallback", &self.fallback.is_some())
            .field("cancellable", &self.cancellation.is_some())
            .finish()
    }
}

impl<F, Fut, T, E> DecoratedOperation<F, T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + Send + Sync + 'static,
{
    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    /// Run one protected invocation
    pub async fn call(&mut self) -> ResilienceResult<T, E> {
        self.call_detailed().await.map(Completion::into_inner)
    }

    /// Run one protected invocation, reporting whether the fallback was used
    pub async fn call_detailed(&mut self) -> ResilienceResult<Completion<T>, E> {
        let outcome = match self.cancellation.clone() {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(ResilienceError::Cancelled),
                    result = run(&self.policies, &mut self.operation) => result,
                }
            }
            None => run(&self.policies, &mut self.operation).await,
        };

        match outcome {
            Ok(value) => Ok(Completion::Primary(value)),
            Err(ResilienceError::Cancelled) => {
                debug!("Decorated call cancelled");
                Err(ResilienceError::Cancelled)
            }
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    let cause = err.kind();
                    warn!(cause = %cause, error = %err, "Serving fallback result");
                    Ok(Completion::Fallback { value: fallback(err).await, cause })
                }
                None => Err(err),
            },
        }
    }
}

async fn run<F, Fut, T, E>(policies: &Policies, operation: &mut F) -> ResilienceResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + Send + Sync + 'static,
{
    let _bulkhead_permit = match &policies.bulkhead {
        Some(bulkhead) => Some(bulkhead.enter().await?),
        None => None,
    };

    if let Some(rate_limiter) = &policies.rate_limiter {
        rate_limiter.acquire_permission().await?;
    }

    let mut retry = policies.retry.as_ref().map(Retry::context);

    loop {
        let permit = match &policies.circuit_breaker {
            Some(breaker) => Some(breaker.try_acquire_permission()?),
            None => None,
        };

        match operation().await {
            Ok(value) => {
                if let Some(permit) = permit {
                    permit.on_success();
                }
                if let Some(retry) = &retry {
                    retry.on_success();
                }
                return Ok(value);
            }
            Err(error) => {
                if let Some(permit) = permit {
                    permit.on_error(&error);
                }
                match retry.as_mut() {
                    Some(retry) => {
                        let wait = retry.on_error(error)?;
                        retry.wait(wait).await;
                    }
                    None => return Err(ResilienceError::OperationFailed { source: error }),
                }
            }
        }
    }
}

/// Which named policies protect a service
///
/// Resolved into [`Policies`] by
/// [`ResilienceRegistry::policies_for`](super::registry::ResilienceRegistry::policies_for);
/// every enabled policy is looked up (or created) under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilientSpec {
    pub name: String,
    pub enable_circuit_breaker: bool,
    pub enable_retry: bool,
    pub enable_rate_limiter: bool,
    pub enable_bulkhead: bool,
}

impl ResilientSpec {
    /// Circuit breaker and retry on, rate limiter and bulkhead off
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable_circuit_breaker: true,
            enable_retry: true,
            enable_rate_limiter: false,
            enable_bulkhead: false,
        }
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.enable_circuit_breaker = enabled;
        self
    }

    pub fn retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    pub fn rate_limiter(mut self, enabled: bool) -> Self {
        self.enable_rate_limiter = enabled;
        self
    }

    pub fn bulkhead(mut self, enabled: bool) -> Self {
        self.enable_bulkhead = enabled;
        self
    }
}

/// Wrap `operation` in `policies`
pub fn decorate<F, Fut, T, E>(operation: F, policies: &Policies) -> DecoratedOperation<F, T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + Send + Sync + 'static,
{
    Decorators::of(operation).with_policies(policies.clone()).decorate()
}

/// Wrap `operation` in `policies`, substituting `fallback` on failure
pub fn decorate_with_fallback<F, Fut, T, E, FB, FutB>(
    operation: F,
    policies: &Policies,
    fallback: FB,
) -> DecoratedOperation<F, T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Error + Send + Sync + 'static,
    FB: Fn(ResilienceError<E>) -> FutB + Send + Sync + 'static,
    FutB: Future<Output = T> + Send + 'static,
{
    Decorators::of(operation).with_policies(policies.clone()).with_fallback(fallback).decorate()
}
