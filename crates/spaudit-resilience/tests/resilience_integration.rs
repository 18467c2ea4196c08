//! Retry, breaker, governor and limiter exercised together the way the gateway uses them.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_retry, FlakyOp, StatusError};
use spaudit_resilience::{
    AcquirePolicy, CircuitState, Governor, GovernorError, OperationKind, RateLimitConfig,
    RateLimiter, RetryError, RetryStrategy,
};

#[tokio::test(start_paused = true)]
async fn test_breaker_admits_exactly_one_trial_after_cooldown() {
    let strategy = RetryStrategy::new(fast_retry(1, 3, Duration::from_secs(60)));
    let op = FlakyOp::new(u32::MAX, 503);

    for _ in 0..3 {
        let err = strategy
            .execute_with_retry("list_children", || op.call())
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 1, .. }));
    }
    assert_eq!(strategy.breaker("list_children").state(), CircuitState::Open);

    let refused = strategy
        .execute_with_retry("list_children", || op.call())
        .await
        .unwrap_err();
    assert!(refused.is_circuit_open());
    assert_eq!(op.calls(), 3);

    tokio::time::advance(Duration::from_secs(60)).await;

    // The trial fails, so the circuit reopens and the next call is refused again.
    let trial = strategy
        .execute_with_retry("list_children", || op.call())
        .await
        .unwrap_err();
    assert!(!trial.is_circuit_open());
    assert_eq!(op.calls(), 4);
    let again = strategy
        .execute_with_retry("list_children", || op.call())
        .await
        .unwrap_err();
    assert!(again.is_circuit_open());
    assert_eq!(op.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_within_attempt_cap() {
    let strategy = RetryStrategy::new(fast_retry(3, 5, Duration::from_secs(60)));
    let op = FlakyOp::new(2, 429);

    let value = strategy
        .execute_with_retry("role_assignments", || op.call())
        .await
        .unwrap();
    assert_eq!(value, 3);
    assert_eq!(
        strategy.breaker("role_assignments").state(),
        CircuitState::Closed
    );
    assert_eq!(strategy.breaker("role_assignments").failure_count(), 0);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried_and_keeps_circuit_closed() {
    let strategy = RetryStrategy::new(fast_retry(3, 1, Duration::from_secs(60)));
    let op = FlakyOp::new(u32::MAX, 404);

    let err = strategy
        .execute_with_retry("list_libraries", || op.call())
        .await
        .unwrap_err();
    assert!(matches!(err, RetryError::Permanent { source: StatusError(404), .. }));
    assert_eq!(op.calls(), 1);
    assert_eq!(strategy.breaker("list_libraries").state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_governed_calls_never_exceed_limit() {
    let governor = Arc::new(Governor::new("remote-calls", 3));
    let strategy = Arc::new(RetryStrategy::new(fast_retry(2, 100, Duration::from_secs(60))));

    let tasks: Vec<_> = (0..30)
        .map(|i| {
            let governor = Arc::clone(&governor);
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move {
                let _permit = governor.acquire().await?;
                let op = FlakyOp::new(i % 2, 503);
                let result = strategy
                    .execute_with_retry("list_children", || async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        op.call().await
                    })
                    .await;
                assert!(result.is_ok());
                Ok::<_, GovernorError>(())
            })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }

    let stats = governor.stats();
    assert_eq!(stats.peak_in_flight, 3);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.granted, 30);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_slot_skips_branch_instead_of_hanging() {
    let governor = Governor::new("remote-calls", 1);
    let _stuck = governor.acquire().await.unwrap();
    let policy = AcquirePolicy {
        timeout: Duration::from_secs(1),
        attempts: 3,
        base_backoff: Duration::from_millis(100),
    };

    let err = governor.acquire_with_backoff(&policy).await.unwrap_err();
    assert!(matches!(err, GovernorError::Saturated { attempts: 3, .. }));
    assert_eq!(governor.stats().contended, 3);
}

#[tokio::test(start_paused = true)]
async fn test_rate_window_throttles_then_resets() {
    let limiter = RateLimiter::new(RateLimitConfig {
        budget: Some(10),
        window_secs: 300,
        ..RateLimitConfig::default()
    });

    // Batch costs 5 units by default.
    limiter.acquire(OperationKind::Batch).await;
    limiter.acquire(OperationKind::Batch).await;
    assert!(!limiter.try_acquire(OperationKind::Delta));

    let start = tokio::time::Instant::now();
    limiter.acquire(OperationKind::Batch).await;
    assert!(start.elapsed() >= Duration::from_secs(300));
    assert_eq!(limiter.stats().throttled, 1);
}
