//! Named counting admission control.
//!
//! A [`Governor`] bounds how many units of one kind of work run at once. Independent
//! governors (site traversals, remote-call slots, storage writes) compose without
//! interacting. Permits are RAII: the slot is released when the [`GovernorPermit`] drops,
//! including when the holding future is cancelled.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GovernorError;

/// How a contended slot is waited for by [`Governor::acquire_with_backoff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquirePolicy {
    /// Longest single wait for a slot.
    pub timeout: Duration,
    /// Number of timed waits before giving up.
    pub attempts: u32,
    /// Pause after the first timed-out wait; doubles after each further one.
    pub base_backoff: Duration,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Point-in-time counters of a governor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernorStats {
    /// Governor name.
    pub name: String,
    /// Configured slot count.
    pub limit: usize,
    /// Permits currently held.
    pub in_flight: usize,
    /// Highest number of permits held at once.
    pub peak_in_flight: usize,
    /// Permits granted since creation.
    pub granted: u64,
    /// Timed waits that expired without a slot.
    pub contended: u64,
}

/// A named, bounded pool of concurrency slots.
#[derive(Debug)]
pub struct Governor {
    name: String,
    limit: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
    granted: AtomicU64,
    contended: AtomicU64,
}

/// A held slot; released on drop.
#[derive(Debug)]
pub struct GovernorPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Governor {
    /// Creates a governor admitting at most `limit` concurrent holders (minimum 1).
    pub fn new(name: impl Into<String>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            name: name.into(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
            granted: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Waits for a slot.
    pub async fn acquire(&self) -> Result<GovernorPermit, GovernorError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GovernorError::Closed {
                governor: self.name.clone(),
            })?;
        Ok(self.admit(permit))
    }

    /// Waits at most `timeout` for a slot; `Ok(None)` when the wait expired.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<GovernorPermit>, GovernorError> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Waits for a slot in bounded timed attempts with exponential pauses between them.
    ///
    /// Contention is the only thing retried: a closed governor fails immediately. After
    /// `policy.attempts` expired waits the caller gets [`GovernorError::Saturated`] and is
    /// expected to skip its unit of work.
    pub async fn acquire_with_backoff(
        &self,
        policy: &AcquirePolicy,
    ) -> Result<GovernorPermit, GovernorError> {
        let attempts = policy.attempts.max(1);
        for attempt in 0..attempts {
            if let Some(permit) = self.acquire_timeout(policy.timeout).await? {
                return Ok(permit);
            }
            tracing::debug!(
                governor = %self.name,
                attempt = attempt + 1,
                in_flight = self.in_flight(),
                "slot wait timed out"
            );
            if attempt + 1 < attempts {
                tokio::time::sleep(policy.base_backoff.saturating_mul(1 << attempt.min(16))).await;
            }
        }
        tracing::warn!(governor = %self.name, attempts, "no slot available, giving up");
        Err(GovernorError::Saturated {
            governor: self.name.clone(),
            attempts,
        })
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> GovernorPermit {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.granted.fetch_add(1, Ordering::Relaxed);
        GovernorPermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Stops admitting work; pending and future acquisitions fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Governor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured slot count.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            name: self.name.clone(),
            limit: self.limit,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            granted: self.granted.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let gov = Governor::new("remote-calls", 2);
        let a = gov.acquire().await.unwrap();
        let b = gov.acquire().await.unwrap();
        assert_eq!(gov.in_flight(), 2);
        drop(a);
        assert_eq!(gov.in_flight(), 1);
        drop(b);
        assert_eq!(gov.in_flight(), 0);
        assert_eq!(gov.peak_in_flight(), 2);
    }

    #[test]
    fn test_zero_limit_clamped() {
        assert_eq!(Governor::new("sites", 0).limit(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_under_fan_out() {
        let gov = Governor::new("remote-calls", 3);
        let tasks = (0..30).map(|_| async {
            let _permit = gov.acquire().await.unwrap();
            assert!(gov.in_flight() <= 3);
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        join_all(tasks).await;
        assert_eq!(gov.peak_in_flight(), 3);
        assert_eq!(gov.stats().granted, 30);
        assert_eq!(gov.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_expires() {
        let gov = Governor::new("storage-writes", 1);
        let _held = gov.acquire().await.unwrap();
        let waited = gov.acquire_timeout(Duration::from_millis(50)).await.unwrap();
        assert!(waited.is_none());
        assert_eq!(gov.stats().contended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_when_saturated() {
        let gov = Governor::new("remote-calls", 1);
        let _held = gov.acquire().await.unwrap();
        let policy = AcquirePolicy {
            timeout: Duration::from_millis(10),
            attempts: 3,
            base_backoff: Duration::from_millis(5),
        };
        let err = gov.acquire_with_backoff(&policy).await.unwrap_err();
        assert_eq!(
            err,
            GovernorError::Saturated {
                governor: "remote-calls".to_string(),
                attempts: 3
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_succeeds_once_slot_frees() {
        let gov = Arc::new(Governor::new("remote-calls", 1));
        let held = gov.acquire().await.unwrap();
        let releaser = async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            drop(held);
        };
        let policy = AcquirePolicy {
            timeout: Duration::from_millis(10),
            attempts: 3,
            base_backoff: Duration::from_millis(1),
        };
        let (permit, ()) = tokio::join!(gov.acquire_with_backoff(&policy), releaser);
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_closed_governor_rejects() {
        let gov = Governor::new("sites", 1);
        gov.close();
        assert!(matches!(
            gov.acquire().await,
            Err(GovernorError::Closed { .. })
        ));
    }
}
