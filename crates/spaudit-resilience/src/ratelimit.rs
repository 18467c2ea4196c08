//! Windowed, cost-weighted admission gate for outbound remote calls.
//!
//! The remote service grants each tenant a fixed budget of resource units per rolling
//! window. Every operation kind has a fixed cost; [`RateLimiter::acquire`] suspends the
//! caller until the current window has room for that cost.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Tenant size class, which determines the unit budget per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantSize {
    /// 6 000 units per window.
    Small,
    /// 9 000 units per window.
    Medium,
    /// 12 000 units per window.
    #[default]
    Large,
}

impl TenantSize {
    /// Units available per window for this tenant class.
    pub fn budget(self) -> u32 {
        match self {
            TenantSize::Small => 6_000,
            TenantSize::Medium => 9_000,
            TenantSize::Large => 12_000,
        }
    }
}

/// Kind of remote operation, used to look up its cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Incremental listing.
    Delta,
    /// Single-object read.
    SimpleGet,
    /// Read with filtering or paging.
    ComplexGet,
    /// Read that expands related objects.
    GetWithExpand,
    /// Bulk request carrying several sub-requests.
    Batch,
}

/// Cost in units of each operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationCosts {
    /// Incremental listing (default: 1).
    pub delta: u32,
    /// Single-object read (default: 2).
    pub simple_get: u32,
    /// Filtered or paged read (default: 3).
    pub complex_get: u32,
    /// Expanding read (default: 4).
    pub get_with_expand: u32,
    /// Bulk request (default: 5).
    pub batch: u32,
}

impl Default for OperationCosts {
    fn default() -> Self {
        Self {
            delta: 1,
            simple_get: 2,
            complex_get: 3,
            get_with_expand: 4,
            batch: 5,
        }
    }
}

impl OperationCosts {
    /// Returns the cost of `kind`.
    pub fn cost(&self, kind: OperationKind) -> u32 {
        match kind {
            OperationKind::Delta => self.delta,
            OperationKind::SimpleGet => self.simple_get,
            OperationKind::ComplexGet => self.complex_get,
            OperationKind::GetWithExpand => self.get_with_expand,
            OperationKind::Batch => self.batch,
        }
    }
}

/// Configuration for the windowed rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tenant class (default: large).
    pub tenant_size: TenantSize,
    /// Window length in seconds (default: 300).
    pub window_secs: u64,
    /// Explicit budget overriding the tenant class, when set.
    pub budget: Option<u32>,
    /// Per-kind operation costs.
    pub costs: OperationCosts,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tenant_size: TenantSize::default(),
            window_secs: DEFAULT_WINDOW_SECS,
            budget: None,
            costs: OperationCosts::default(),
        }
    }
}

impl RateLimitConfig {
    /// Effective units per window.
    pub fn effective_budget(&self) -> u32 {
        self.budget.unwrap_or_else(|| self.tenant_size.budget())
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Units consumed in the current window.
    pub used_in_window: u32,
    /// Units consumed since creation.
    pub total_units: u64,
    /// Calls admitted since creation.
    pub admitted: u64,
    /// Calls that had to wait for a new window.
    pub throttled: u64,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u32,
    stats: RateLimitStats,
}

/// Cost-weighted windowed rate limiter shared by all outbound calls.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    budget: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Creates a limiter whose first window starts now.
    pub fn new(config: RateLimitConfig) -> Self {
        let budget = config.effective_budget();
        Self {
            config,
            budget,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
                stats: RateLimitStats::default(),
            }),
        }
    }

    /// Waits until the budget admits one operation of `kind`, then charges its cost.
    pub async fn acquire(&self, kind: OperationKind) {
        let cost = self.config.costs.cost(kind);
        let mut waited = false;
        loop {
            let wait = match self.try_charge(cost) {
                None => {
                    if waited {
                        self.window.lock().stats.throttled += 1;
                    }
                    return;
                }
                Some(wait) => wait,
            };
            tracing::debug!(
                ?kind,
                cost,
                wait_ms = wait.as_millis() as u64,
                "rate budget exhausted, waiting for next window"
            );
            waited = true;
            tokio::time::sleep(wait).await;
        }
    }

    /// Charges `kind` if the current window has room; returns false otherwise.
    pub fn try_acquire(&self, kind: OperationKind) -> bool {
        self.try_charge(self.config.costs.cost(kind)).is_none()
    }

    /// Charges `cost` or returns how long until the window resets.
    fn try_charge(&self, cost: u32) -> Option<Duration> {
        let window_len = self.config.window();
        let mut window = self.window.lock();
        let elapsed = window.started.elapsed();
        if elapsed >= window_len {
            window.started = Instant::now();
            window.used = 0;
        }

        // An oversized cost is admitted into an empty window rather than never.
        if window.used + cost <= self.budget || window.used == 0 {
            window.used += cost;
            window.stats.total_units += u64::from(cost);
            window.stats.admitted += 1;
            None
        } else {
            Some(window_len.saturating_sub(window.started.elapsed()))
        }
    }

    /// Units left in the current window.
    pub fn remaining(&self) -> u32 {
        let window = self.window.lock();
        if window.started.elapsed() >= self.config.window() {
            self.budget
        } else {
            self.budget.saturating_sub(window.used)
        }
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> RateLimitStats {
        let window = self.window.lock();
        RateLimitStats {
            used_in_window: window.used,
            ..window.stats.clone()
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            budget: Some(budget),
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn test_tenant_budgets() {
        assert_eq!(TenantSize::Small.budget(), 6_000);
        assert_eq!(TenantSize::Medium.budget(), 9_000);
        assert_eq!(TenantSize::Large.budget(), 12_000);
        assert_eq!(RateLimitConfig::default().effective_budget(), 12_000);
    }

    #[test]
    fn test_operation_costs() {
        let costs = OperationCosts::default();
        assert_eq!(costs.cost(OperationKind::Delta), 1);
        assert_eq!(costs.cost(OperationKind::SimpleGet), 2);
        assert_eq!(costs.cost(OperationKind::ComplexGet), 3);
        assert_eq!(costs.cost(OperationKind::GetWithExpand), 4);
        assert_eq!(costs.cost(OperationKind::Batch), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_within_budget() {
        let rl = limiter(10);
        assert!(rl.try_acquire(OperationKind::Batch));
        assert!(rl.try_acquire(OperationKind::Batch));
        assert!(!rl.try_acquire(OperationKind::Delta));
        assert_eq!(rl.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let rl = limiter(4);
        assert!(rl.try_acquire(OperationKind::GetWithExpand));
        assert!(!rl.try_acquire(OperationKind::Delta));

        tokio::time::advance(Duration::from_secs(DEFAULT_WINDOW_SECS)).await;
        assert_eq!(rl.remaining(), 4);
        assert!(rl.try_acquire(OperationKind::Delta));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_next_window() {
        let rl = limiter(3);
        let start = Instant::now();
        rl.acquire(OperationKind::ComplexGet).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        rl.acquire(OperationKind::SimpleGet).await;
        assert!(start.elapsed() >= Duration::from_secs(DEFAULT_WINDOW_SECS));

        let stats = rl.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.total_units, 5);
        assert_eq!(stats.used_in_window, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cost_admitted_into_empty_window() {
        let rl = limiter(2);
        assert!(rl.try_acquire(OperationKind::Batch));
        assert!(!rl.try_acquire(OperationKind::Delta));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: RateLimitConfig =
            serde_json::from_str(r#"{"tenant_size":"small"}"#).unwrap();
        assert_eq!(config.effective_budget(), 6_000);
        assert_eq!(config.window_secs, 300);
        assert_eq!(config.costs, OperationCosts::default());
    }
}
