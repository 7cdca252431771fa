//! Error types shared by all resilience policies

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::circuit_breaker::CircuitState;

//==============================================================================
// Configuration Errors
//==============================================================================

/// Errors raised while building policies or loading settings
///
/// These are raised before any traffic flows; nothing else in the crate is
/// fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to read settings file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {message}")]
    Parse { message: String },

    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },

    #[error("No {kind} registered under '{name}'")]
    UnknownInstance { kind: &'static str, name: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

//==============================================================================
// Admission Rejections
//==============================================================================

/// A call refused by an admission-control policy before the operation ran
///
/// Policies return this from their permit APIs; it converts into the matching
/// [`ResilienceError`] variant through `?`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Circuit breaker '{name}' is {state}, rejecting calls")]
    CircuitOpen { name: String, state: CircuitState },

    #[error("Rate limiter '{name}' exhausted: {limit_for_period} permits per {period:?}")]
    RateLimited { name: String, limit_for_period: u32, period: Duration },

    #[error("Bulkhead '{name}' is full: {max_concurrent_calls} concurrent calls")]
    BulkheadFull { name: String, max_concurrent_calls: u32 },
}

impl Rejection {
    /// Name of the policy instance that rejected the call
    pub fn policy_name(&self) -> &str {
        match self {
            Self::CircuitOpen { name, .. }
            | Self::RateLimited { name, .. }
            | Self::BulkheadFull { name, .. } => name,
        }
    }
}

//==============================================================================
// Call Errors
//==============================================================================

/// Terminal condition of a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    CircuitOpen,
    RateLimited,
    BulkheadFull,
    RetryExhausted,
    OperationFailed,
    Cancelled,
}

impl FailureKind {
    /// Whether the call was refused before the operation ran
    pub fn is_rejection(self) -> bool {
        matches!(self, Self::CircuitOpen | Self::RateLimited | Self::BulkheadFull)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CircuitOpen => "CIRCUIT_OPEN_REJECTED",
            Self::RateLimited => "RATE_LIMITED_REJECTED",
            Self::BulkheadFull => "BULKHEAD_REJECTED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Errors that can occur in resilience operations
///
/// This error type is generic over the underlying operation error type `E`,
/// allowing it to wrap and preserve the original error information while
/// providing resilience-specific error variants.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open (or forced open), rejecting calls
    #[error("Circuit breaker '{name}' is {state}, rejecting calls")]
    CircuitOpen { name: String, state: CircuitState },

    /// No rate limiter permit became available in time
    #[error("Rate limiter '{name}' exhausted: {limit_for_period} permits per {period:?}")]
    RateLimited { name: String, limit_for_period: u32, period: Duration },

    /// Bulkhead capacity exceeded
    #[error("Bulkhead '{name}' is full: {max_concurrent_calls} concurrent calls")]
    BulkheadFull { name: String, max_concurrent_calls: u32 },

    /// Every attempt failed with a retryable error
    #[error("Retry '{name}' exhausted after {attempts} attempts")]
    RetryExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },

    /// The call was cancelled by its caller
    #[error("Call cancelled")]
    Cancelled,
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Classify the terminal condition
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::BulkheadFull { .. } => FailureKind::BulkheadFull,
            Self::RetryExhausted { .. } => FailureKind::RetryExhausted,
            Self::OperationFailed { .. } => FailureKind::OperationFailed,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether the call was refused before the operation ran
    pub fn is_rejection(&self) -> bool {
        self.kind().is_rejection()
    }

    /// The operation's own error, if the operation ran and failed
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::RetryExhausted { source, .. } | Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }

    /// Unwrap the operation's own error, if any
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::RetryExhausted { source, .. } | Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

impl<E> From<Rejection> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::CircuitOpen { name, state } => Self::CircuitOpen { name, state },
            Rejection::RateLimited { name, limit_for_period, period } => {
                Self::RateLimited { name, limit_for_period, period }
            }
            Rejection::BulkheadFull { name, max_concurrent_calls } => {
                Self::BulkheadFull { name, max_concurrent_calls }
            }
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;
