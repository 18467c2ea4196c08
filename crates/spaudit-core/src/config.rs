//! Audit configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid configuration.
//! Durations inside `retry` are given in milliseconds; everything else names its unit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spaudit_resilience::{AcquirePolicy, RateLimitConfig, RetryConfig};

use crate::cache::CacheConfig;
use crate::error::ConfigError;

/// Run-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock limit for the whole run in seconds; 0 disables it (default: 4 hours).
    pub global_timeout_secs: u64,
    /// Maximum errors kept on the run record (default: 100).
    pub error_cap: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            global_timeout_secs: 4 * 3_600,
            error_cap: 100,
        }
    }
}

impl RunConfig {
    /// Global timeout, if enabled.
    pub fn global_timeout(&self) -> Option<Duration> {
        (self.global_timeout_secs > 0).then(|| Duration::from_secs(self.global_timeout_secs))
    }
}

/// Discovery crawler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Sites traversed concurrently (default: 5).
    pub max_concurrent_sites: usize,
    /// Remote calls in flight across all sites (default: 20).
    pub max_concurrent_calls: usize,
    /// Folder depth below the library root at which traversal stops (default: 10).
    pub max_depth: u32,
    /// Items buffered before a storage flush (default: 100).
    pub batch_size: usize,
    /// Limit on one site's traversal in seconds (default: 300).
    pub site_timeout_secs: u64,
    /// Longest single wait for a remote-call slot in seconds (default: 30).
    pub slot_timeout_secs: u64,
    /// Timed waits for a remote-call slot before the branch is skipped (default: 3).
    pub slot_attempts: u32,
    /// Pause after the first timed-out slot wait in milliseconds (default: 1000).
    pub slot_backoff_ms: u64,
    /// Ask for active sites only.
    pub active_only: bool,
    /// Only crawl these site URLs, when non-empty.
    pub site_allowlist: Vec<String>,
    /// Keep personal (OneDrive) sites.
    pub include_personal_sites: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sites: 5,
            max_concurrent_calls: 20,
            max_depth: 10,
            batch_size: 100,
            site_timeout_secs: 300,
            slot_timeout_secs: 30,
            slot_attempts: 3,
            slot_backoff_ms: 1_000,
            active_only: false,
            site_allowlist: Vec::new(),
            include_personal_sites: false,
        }
    }
}

impl CrawlConfig {
    /// Slot acquisition policy of the remote-call governor.
    pub fn slot_policy(&self) -> AcquirePolicy {
        AcquirePolicy {
            timeout: Duration::from_secs(self.slot_timeout_secs),
            attempts: self.slot_attempts,
            base_backoff: Duration::from_millis(self.slot_backoff_ms),
        }
    }

    /// Limit on one site's traversal.
    pub fn site_timeout(&self) -> Duration {
        Duration::from_secs(self.site_timeout_secs)
    }
}

/// Permission resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Objects resolved concurrently (default: 10).
    pub batch_concurrency: usize,
    /// Probe objects with unique rules for sharing links (default: true).
    pub probe_sharing_links: bool,
    /// Fall back to a directory lookup to classify users (default: true).
    pub lookup_external_users: bool,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 10,
            probe_sharing_links: true,
            lookup_external_users: true,
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Journal file; in-memory storage when unset.
    pub journal_path: Option<PathBuf>,
    /// fsync after every journal write.
    pub sync_writes: bool,
    /// Rows per final storage batch (default: 1000).
    pub batch_size: usize,
    /// Concurrent storage writes (default: 4).
    pub write_concurrency: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            sync_writes: false,
            batch_size: 1_000,
            write_concurrency: 4,
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Run-level settings.
    pub run: RunConfig,
    /// Crawler settings.
    pub crawl: CrawlConfig,
    /// Resolver settings.
    pub permissions: PermissionConfig,
    /// Retry and circuit-breaker settings.
    pub retry: RetryConfig,
    /// Rate-limit settings.
    pub rate_limit: RateLimitConfig,
    /// Cache settings.
    pub cache: CacheConfig,
    /// Storage settings.
    pub store: StoreConfig,
}

impl AuditConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: AuditConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would stall or disable the run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.crawl.max_concurrent_sites, "crawl.max_concurrent_sites"),
            (self.crawl.max_concurrent_calls, "crawl.max_concurrent_calls"),
            (self.crawl.batch_size, "crawl.batch_size"),
            (self.crawl.slot_attempts as usize, "crawl.slot_attempts"),
            (self.permissions.batch_concurrency, "permissions.batch_concurrency"),
            (self.store.batch_size, "store.batch_size"),
            (self.store.write_concurrency, "store.write_concurrency"),
            (self.retry.max_attempts as usize, "retry.max_attempts"),
            (self.cache.capacity, "cache.capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.rate_limit.effective_budget() == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit budget and window must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaudit_resilience::TenantSize;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = AuditConfig::default();
        assert_eq!(config.crawl.max_depth, 10);
        assert_eq!(config.crawl.batch_size, 100);
        assert_eq!(config.crawl.site_timeout_secs, 300);
        assert_eq!(config.store.batch_size, 1_000);
        assert_eq!(config.permissions.batch_concurrency, 10);
        assert_eq!(config.cache.permission_ttl_secs, 3_600);
        assert_eq!(config.cache.group_ttl_secs, 21_600);
        assert_eq!(config.run.error_cap, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.rate_limit.effective_budget(), 12_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[crawl]
max_concurrent_sites = 2
active_only = true
site_allowlist = ["https://contoso.sharepoint.com/sites/hr"]

[rate_limit]
tenant_size = "medium"

[retry]
max_attempts = 5
base_delay = 250
"#
        )
        .unwrap();

        let config = AuditConfig::from_file(file.path()).unwrap();
        assert_eq!(config.crawl.max_concurrent_sites, 2);
        assert!(config.crawl.active_only);
        assert_eq!(config.crawl.max_concurrent_calls, 20);
        assert_eq!(config.rate_limit.tenant_size, TenantSize::Medium);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"store": {{"journal_path": "/tmp/audit.jsonl"}}}}"#).unwrap();
        let config = AuditConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.journal_path, Some(PathBuf::from("/tmp/audit.jsonl")));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            AuditConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = AuditConfig::default();
        config.crawl.max_concurrent_calls = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("crawl.max_concurrent_calls"));
    }
}
