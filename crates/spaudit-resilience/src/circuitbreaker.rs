//! Circuit breaker for one class of remote operation.
//!
//! A breaker stops calling a dependency that keeps failing, so a sustained upstream
//! outage costs one fast error per call instead of a full retry cycle.
//!
//! # How It Works
//!
//! 1. **Closed**: Normal operation. Calls pass through. Consecutive failures are counted.
//! 2. **Open**: After `failure_threshold` consecutive failures every call is refused until
//!    `open_duration` has elapsed.
//! 3. **HalfOpen**: After the cooldown, `half_open_max_requests` trial calls are admitted.
//!    A success closes the circuit, a failure opens it again.
//!
//! # Example
//!
//! ```
//! use spaudit_resilience::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! if breaker.can_execute() {
//!     // issue the call
//!     breaker.record_success();
//! }
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Default failure threshold: consecutive failures required to open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default success threshold: consecutive half-open successes required to close the circuit.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
/// Default open duration in milliseconds before a trial call is admitted.
pub const DEFAULT_OPEN_DURATION_MS: u64 = 60_000;
/// Default number of trial calls admitted while half-open.
pub const DEFAULT_HALF_OPEN_MAX_REQUESTS: u32 = 1;

/// Represents the state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls are allowed through.
    Closed,
    /// Circuit is open; calls fail fast.
    Open,
    /// Cooldown elapsed; a limited number of trial calls are allowed.
    HalfOpen,
}

/// Configuration for the circuit breaker.
///
/// # Default Values
///
/// - `failure_threshold`: 5 consecutive failures to open
/// - `success_threshold`: 1 success to close from half-open
/// - `open_duration`: 60 seconds
/// - `half_open_max_requests`: 1 trial call
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes required to close the circuit from half-open.
    pub success_threshold: u32,
    /// Duration the circuit remains open before transitioning to half-open.
    pub open_duration: Duration,
    /// Maximum number of trial calls admitted in half-open state.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            open_duration: Duration::from_millis(DEFAULT_OPEN_DURATION_MS),
            half_open_max_requests: DEFAULT_HALF_OPEN_MAX_REQUESTS,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_admitted: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_admitted: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.half_open_admitted = 0;
    }
}

/// A thread-safe circuit breaker.
///
/// State transitions happen under a short critical section; no lock is held across an
/// `.await`, so a breaker can be shared freely between tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    /// Checks whether a call may proceed, admitting a trial call when the cooldown elapsed.
    ///
    /// Returns `true` if the call is allowed, `false` if it must fail fast.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_duration)
                    .unwrap_or(true);
                if cooled_down && self.config.half_open_max_requests > 0 {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.half_open_admitted = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_requests {
                    inner.half_open_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                } else {
                    inner.half_open_admitted = inner.half_open_admitted.saturating_sub(1);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.open();
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state without admitting a trial call.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Time left before an open circuit admits a trial call.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.open_duration.saturating_sub(at.elapsed()))
            }
            _ => None,
        }
    }

    /// Forces the circuit closed and clears all counters.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
