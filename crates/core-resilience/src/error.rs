//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;

/// Errors produced by the resilience primitives themselves
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// Transient error that may be retried
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Timeout occurred
    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    /// A retry policy or breaker configuration failed validation
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_) | ResilienceError::Timeout(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_)
                | ResilienceError::CircuitOpen { .. }
                | ResilienceError::InvalidPolicy(_)
        )
    }
}

impl Retryable for ResilienceError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Outcome of a call routed through a [`CircuitBreaker`](crate::CircuitBreaker).
///
/// `Open` is the distinct "breaker open" signal: the wrapped operation was
/// never invoked. `Inner` carries the operation's own failure.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    /// True when the call was rejected without running the operation
    pub fn is_open(&self) -> bool {
        matches!(self, GuardError::Open { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Inner(e) => Some(e),
            GuardError::Open { .. } => None,
        }
    }
}

impl From<GuardError<ResilienceError>> for ResilienceError {
    fn from(err: GuardError<ResilienceError>) -> Self {
        match err {
            GuardError::Open { name, retry_after } => {
                ResilienceError::CircuitOpen { name, retry_after }
            }
            GuardError::Inner(e) => e,
        }
    }
}
