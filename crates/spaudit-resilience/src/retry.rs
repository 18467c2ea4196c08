//! Retry with exponential backoff and per-operation circuit breaking.
//!
//! Every distinct operation id owns one [`CircuitBreaker`]. Transient failures are retried
//! up to `max_attempts` with jittered exponential backoff and count towards the breaker;
//! permanent failures surface immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{AttemptFailure, RetryError};

/// Classifies an error as transient (worth retrying) or permanent.
pub trait Retryable {
    /// Returns true for transient errors: timeouts, throttling, server-side failures.
    fn is_retryable(&self) -> bool;
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per call, including the first (default: 3).
    pub max_attempts: u32,
    /// Backoff before the second attempt (default: 500ms).
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound for a single backoff (default: 30 seconds).
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add up to 10% random jitter to each backoff (default: true).
    pub jitter: bool,
    /// Timeout applied to each individual attempt (default: 120 seconds).
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Consecutive failures that open an operation's circuit (default: 5).
    pub circuit_breaker_threshold: u32,
    /// How long an opened circuit refuses calls (default: 60 seconds).
    #[serde(with = "millis")]
    pub circuit_breaker_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            request_timeout: Duration::from_secs(120),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            open_duration: self.circuit_breaker_timeout,
            ..CircuitBreakerConfig::default()
        }
    }
}

/// Retry executor holding one circuit breaker per operation id.
#[derive(Debug)]
pub struct RetryStrategy {
    config: RetryConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl RetryStrategy {
    /// Create a new strategy with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute `operation` under the breaker for `operation_id`, retrying transient failures.
    ///
    /// Each attempt is bounded by `request_timeout`; a timed-out attempt is treated as
    /// transient. Returns [`RetryError::CircuitOpen`] without invoking the operation when
    /// the breaker refuses the call, [`RetryError::Permanent`] for non-retryable errors and
    /// [`RetryError::Exhausted`] once the attempt cap is reached or the breaker opens
    /// mid-call.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation_id: &str,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Retryable + 'static,
    {
        self.execute_admitted(operation_id, || std::future::ready(()), operation)
            .await
    }

    /// Like [`RetryStrategy::execute_with_retry`], awaiting `admit` before every attempt.
    ///
    /// The admission wait (rate budget, for instance) runs after the breaker check and
    /// outside the per-attempt timeout, so time spent waiting for admission never counts as
    /// a failed attempt.
    pub async fn execute_admitted<T, E, A, AFut, F, Fut>(
        &self,
        operation_id: &str,
        mut admit: A,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        A: FnMut() -> AFut,
        AFut: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Retryable + 'static,
    {
        let breaker = self.breaker(operation_id);
        let mut attempt = 0u32;

        loop {
            if !breaker.can_execute() {
                tracing::debug!(operation = operation_id, "circuit open, failing fast");
                return Err(RetryError::CircuitOpen {
                    operation: operation_id.to_string(),
                });
            }

            admit().await;
            attempt += 1;
            tracing::debug!(
                operation = operation_id,
                attempt,
                max_attempts = self.config.max_attempts,
                "attempting operation"
            );

            let failure =
                match tokio::time::timeout(self.config.request_timeout, operation()).await {
                    Ok(Ok(value)) => {
                        breaker.record_success();
                        return Ok(value);
                    }
                    Ok(Err(e)) => AttemptFailure::Failed(e),
                    Err(_) => AttemptFailure::TimedOut(self.config.request_timeout),
                };

            let failure = match failure {
                AttemptFailure::Failed(source) if !source.is_retryable() => {
                    // A permanent error comes from a responsive dependency.
                    breaker.record_success();
                    tracing::warn!(operation = operation_id, error = %source, "permanent failure");
                    return Err(RetryError::Permanent {
                        operation: operation_id.to_string(),
                        source,
                    });
                }
                transient => transient,
            };

            breaker.record_failure();
            tracing::warn!(
                operation = operation_id,
                attempt,
                error = %failure,
                "attempt failed"
            );

            if attempt >= self.config.max_attempts || breaker.state() == CircuitState::Open {
                tracing::error!(operation = operation_id, attempts = attempt, "giving up");
                return Err(RetryError::Exhausted {
                    operation: operation_id.to_string(),
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = self.compute_backoff(attempt - 1);
            tracing::debug!(operation = operation_id, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
        }
    }

    /// Returns the breaker for `operation_id`, creating it on first use.
    pub fn breaker(&self, operation_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(operation_id) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(operation_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.breaker_config())))
            .value()
            .clone()
    }

    /// Returns the state of every breaker created so far, sorted by operation id.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Compute the backoff before retry number `attempt + 1`.
    ///
    /// Computes `base_delay * backoff_multiplier^attempt`, capped at `max_delay`, plus up to
    /// 10% uniform jitter when enabled.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as f64;
        let max_ms = self.config.max_delay.as_millis() as f64;
        let capped = (base_ms * self.config.backoff_multiplier.powi(attempt as i32)).min(max_ms);

        let jitter = if self.config.jitter && capped > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * 0.1)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter) as u64)
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("service unavailable")]
        Unavailable,
        #[error("not found")]
        NotFound,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Unavailable)
        }
    }

    fn strategy(max_attempts: u32, threshold: u32) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            circuit_breaker_threshold: threshold,
            circuit_breaker_timeout: Duration::from_secs(60),
            ..RetryConfig::default()
        })
    }

    async fn always_failing(
        strategy: &RetryStrategy,
        calls: &AtomicU32,
    ) -> Result<(), RetryError<TestError>> {
        strategy
            .execute_with_retry("list_children", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::Unavailable)
            })
            .await
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_timeout, Duration::from_secs(60));
        assert!(config.jitter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let s = strategy(3, 5);
        let calls = AtomicU32::new(0);
        let result = s
            .execute_with_retry("list_sites", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>("sites")
            })
            .await;
        assert_eq!(result.unwrap(), "sites");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let s = strategy(3, 5);
        let calls = AtomicU32::new(0);
        let result = s
            .execute_with_retry("list_sites", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Unavailable)
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(s.breaker("list_sites").failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let s = strategy(3, 5);
        let calls = AtomicU32::new(0);
        let result = s
            .execute_with_retry("role_assignments", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TestError::NotFound)
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.breaker("role_assignments").failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let s = strategy(3, 10);
        let calls = AtomicU32::new(0);
        let result = always_failing(&s, &calls).await;
        match result {
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, AttemptFailure::Failed(TestError::Unavailable)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let s = RetryStrategy::new(RetryConfig {
            max_attempts: 2,
            request_timeout: Duration::from_millis(50),
            base_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        });
        let calls = AtomicU32::new(0);
        let result = s
            .execute_with_retry("transitive_members", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, TestError>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted {
                last: AttemptFailure::TimedOut(_),
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_at_threshold_and_fails_fast() {
        let s = strategy(5, 5);
        let calls = AtomicU32::new(0);

        let first = always_failing(&s, &calls).await;
        assert!(matches!(first, Err(RetryError::Exhausted { attempts: 5, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(s.breaker("list_children").state(), CircuitState::Open);

        let second = always_failing(&s, &calls).await;
        assert!(second.as_ref().unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_trial_after_cooldown() {
        let s = strategy(5, 5);
        let calls = AtomicU32::new(0);
        let _ = always_failing(&s, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(61)).await;
        let trial = always_failing(&s, &calls).await;
        assert!(trial.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(s.breaker("list_children").state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_per_operation() {
        let s = strategy(1, 1);
        let calls = AtomicU32::new(0);
        let _ = always_failing(&s, &calls).await;
        assert_eq!(s.breaker("list_children").state(), CircuitState::Open);

        let other = s
            .execute_with_retry("list_libraries", || async { Ok::<_, TestError>(1) })
            .await;
        assert_eq!(other.unwrap(), 1);
        assert_eq!(
            s.breaker_states(),
            vec![
                ("list_children".to_string(), CircuitState::Open),
                ("list_libraries".to_string(), CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_wait_is_outside_attempt_timeout() {
        let s = strategy(1, 1);
        let admitted = AtomicU32::new(0);
        let result = s
            .execute_admitted(
                "list_children",
                || async {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(300)).await;
                },
                || async { Ok::<_, TestError>(7) },
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(s.breaker("list_children").state(), CircuitState::Closed);
        assert_eq!(s.breaker("list_children").failure_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_backoff_within_bounds(attempt in 0u32..20) {
            let s = RetryStrategy::new(RetryConfig::default());
            let base = (500f64 * 2f64.powi(attempt as i32)).min(30_000.0);
            let delay = s.compute_backoff(attempt).as_millis() as f64;
            prop_assert!(delay >= base.floor());
            prop_assert!(delay <= base * 1.1 + 1.0);
        }
    }
}
