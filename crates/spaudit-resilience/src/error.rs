//! Error types for the resilience primitives.

use std::time::Duration;
use thiserror::Error;

/// Why a single attempt of a retried operation did not succeed.
#[derive(Debug, Error)]
pub enum AttemptFailure<E>
where
    E: std::error::Error + 'static,
{
    /// The attempt exceeded the per-request timeout.
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    /// The operation returned an error.
    #[error(transparent)]
    Failed(E),
}

impl<E> AttemptFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Returns the operation error, if the attempt did not simply time out.
    pub fn error(&self) -> Option<&E> {
        match self {
            AttemptFailure::TimedOut(_) => None,
            AttemptFailure::Failed(e) => Some(e),
        }
    }
}

/// Errors surfaced by [`crate::retry::RetryStrategy::execute_with_retry`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation class has an open circuit; the operation was not invoked.
    #[error("circuit breaker open for {operation}")]
    CircuitOpen {
        /// Operation class whose breaker refused the call.
        operation: String,
    },

    /// The operation failed with an error that must not be retried.
    #[error("{operation} failed: {source}")]
    Permanent {
        /// Operation class that failed.
        operation: String,
        /// The non-retryable error.
        #[source]
        source: E,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("retries exhausted for {operation} after {attempts} attempts: {last}")]
    Exhausted {
        /// Operation class that failed.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        last: AttemptFailure<E>,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns true if the call was refused by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    /// Returns the underlying operation error, if any.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            RetryError::CircuitOpen { .. } => None,
            RetryError::Permanent { source, .. } => Some(source),
            RetryError::Exhausted { last, .. } => last.error(),
        }
    }
}

/// Errors surfaced by a [`crate::governor::Governor`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernorError {
    /// No slot became free within the allowed number of timed attempts.
    #[error("governor {governor} saturated: no slot after {attempts} attempts")]
    Saturated {
        /// Governor name.
        governor: String,
        /// Number of timed acquisition attempts made.
        attempts: u32,
    },

    /// The governor was closed and admits no more work.
    #[error("governor {governor} closed")]
    Closed {
        /// Governor name.
        governor: String,
    },
}
