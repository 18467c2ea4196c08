#![warn(missing_docs)]

//! spaudit resilience subsystem: windowed rate limiting, retry with per-operation circuit
//! breaking, named concurrency governors

pub mod circuitbreaker;
pub mod error;
pub mod governor;
pub mod ratelimit;
pub mod retry;

pub use circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::{AttemptFailure, GovernorError, RetryError};
pub use governor::{AcquirePolicy, Governor, GovernorPermit, GovernorStats};
pub use ratelimit::{
    OperationCosts, OperationKind, RateLimitConfig, RateLimitStats, RateLimiter, TenantSize,
};
pub use retry::{RetryConfig, RetryStrategy, Retryable};
