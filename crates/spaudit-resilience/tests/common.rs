//! Shared helpers for the resilience integration tests.

#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use spaudit_resilience::{RetryConfig, Retryable};

/// Remote-style failure with an HTTP-like status.
#[derive(Debug)]
pub struct StatusError(pub u16);

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

impl std::error::Error for StatusError {}

impl Retryable for StatusError {
    fn is_retryable(&self) -> bool {
        self.0 == 429 || self.0 >= 500
    }
}

/// Retry config without jitter and with a 1 ms base delay.
pub fn fast_retry(max_attempts: u32, threshold: u32, cooldown: Duration) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
        circuit_breaker_threshold: threshold,
        circuit_breaker_timeout: cooldown,
        ..RetryConfig::default()
    }
}

/// Counts invocations and fails the first `failures` of them with `status`.
#[derive(Clone)]
pub struct FlakyOp {
    calls: Arc<AtomicU32>,
    failures: u32,
    status: u16,
}

impl FlakyOp {
    pub fn new(failures: u32, status: u16) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            failures,
            status,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<u32, StatusError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(StatusError(self.status))
        } else {
            Ok(n)
        }
    }
}
