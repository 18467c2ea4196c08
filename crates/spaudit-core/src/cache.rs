//! Cache backend with typed keys and per-entry time-to-live.
//!
//! Keys are a closed enum so the permission-set, group-expansion and library-listing
//! usages can never collide. [`TypedCache`] binds each key to one value type and stores
//! values as `bincode` bytes in any [`CacheBackend`].

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::CacheError;
use crate::model::ObjectKind;

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Resolved permission set of one object.
    Permissions {
        /// Object kind.
        kind: ObjectKind,
        /// Object id.
        id: String,
    },
    /// Transitive expansion of one group.
    GroupMembers {
        /// Group id.
        group_id: String,
    },
    /// Library listing of one site.
    SiteLibraries {
        /// Site id.
        site_id: String,
    },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Permissions { kind, id } => write!(f, "permissions:{}:{}", kind, id),
            CacheKey::GroupMembers { group_id } => write!(f, "group_members:{}", group_id),
            CacheKey::SiteLibraries { site_id } => write!(f, "site_libraries:{}", site_id),
        }
    }
}

/// Key/value cache with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the value unless absent or expired.
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores a value that expires after `ttl`.
    async fn set(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Drops a value.
    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Configuration for [`MemoryCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries before least-recently-used eviction.
    pub capacity: usize,
    /// Permission-set TTL in seconds (default: 1 hour).
    pub permission_ttl_secs: u64,
    /// Group-expansion TTL in seconds (default: 6 hours).
    pub group_ttl_secs: u64,
    /// Library-listing TTL in seconds (default: 1 hour).
    pub library_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 100_000,
            permission_ttl_secs: 3_600,
            group_ttl_secs: 6 * 3_600,
            library_ttl_secs: 3_600,
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped for capacity.
    pub evictions: u64,
    /// Live entries.
    pub size: usize,
}

struct CacheEntry {
    value: Vec<u8>,
    /// `None` when the TTL reaches past the clock's range.
    expires_at: Option<Instant>,
}

/// Bounded in-process LRU cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        MemoryCache {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache").field("stats", &self.stats()).finish()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = entries
            .peek(key)
            .map(|entry| entry.expires_at.map_or(false, |at| at <= Instant::now()));
        let value = match expired {
            Some(false) => entries.get(key).map(|entry| entry.value.clone()),
            Some(true) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: CacheKey, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now().checked_add(ttl),
        };
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

/// Typed view over a [`CacheBackend`].
///
/// Backend failures and undecodable values are logged and treated as misses; a cache
/// problem never fails the caller.
#[derive(Clone)]
pub struct TypedCache {
    backend: Arc<dyn CacheBackend>,
}

impl TypedCache {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        TypedCache { backend }
    }

    /// Decoded value for `key`, if present.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache read failed");
                return None;
            }
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "dropping undecodable cache entry");
                let _ = self.backend.invalidate(key).await;
                None
            }
        }
    }

    /// Stores `value` under `key` for `ttl`.
    pub async fn set<T: Serialize>(&self, key: CacheKey, value: &T, ttl: Duration) {
        let bytes = match bincode::serialize(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache encode failed");
                return;
            }
        };
        if let Err(e) = self.backend.set(key.clone(), bytes, ttl).await {
            tracing::warn!(key = %key, error = %e, "cache write failed");
        }
    }
}

impl fmt::Debug for TypedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupMember, GroupMembership};
    use chrono::Utc;

    fn group_key(id: &str) -> CacheKey {
        CacheKey::GroupMembers {
            group_id: id.to_string(),
        }
    }

    #[test]
    fn test_keys_do_not_collide() {
        let perm = CacheKey::Permissions {
            kind: ObjectKind::Site,
            id: "x".into(),
        };
        let libs = CacheKey::SiteLibraries { site_id: "x".into() };
        assert_ne!(perm, libs);
        assert_ne!(perm.to_string(), libs.to_string());
        assert_eq!(perm.to_string(), "permissions:site:x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let cache = MemoryCache::new(10);
        cache.set(group_key("g"), vec![1, 2], Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&group_key("g")).await.unwrap(), Some(vec![1, 2]));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&group_key("g")).await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let cache = MemoryCache::new(10);
        cache.set(group_key("g"), vec![3], Duration::MAX).await.unwrap();

        tokio::time::advance(Duration::from_secs(365 * 24 * 3_600)).await;
        assert_eq!(cache.get(&group_key("g")).await.unwrap(), Some(vec![3]));
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set(group_key("a"), vec![1], ttl).await.unwrap();
        cache.set(group_key("b"), vec![2], ttl).await.unwrap();
        cache.get(&group_key("a")).await.unwrap();
        cache.set(group_key("c"), vec![3], ttl).await.unwrap();

        assert!(cache.get(&group_key("b")).await.unwrap().is_none());
        assert!(cache.get(&group_key("a")).await.unwrap().is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_round_trip_and_type_mismatch() {
        let cache = TypedCache::new(Arc::new(MemoryCache::new(10)));
        let membership = GroupMembership {
            group_id: "g".into(),
            group_name: "Finance".into(),
            members: vec![GroupMember {
                id: "u".into(),
                display_name: "Ann".into(),
                login: Some("ann@corp.example".into()),
                is_external: false,
            }],
            nested_group_ids: vec!["g2".into()],
            total_user_count: 1,
            expanded_at: Utc::now(),
        };
        cache.set(group_key("g"), &membership, Duration::from_secs(60)).await;
        let back: Option<GroupMembership> = cache.get(&group_key("g")).await;
        assert_eq!(back, Some(membership));

        cache.set(group_key("n"), &7u8, Duration::from_secs(60)).await;
        let wrong: Option<GroupMembership> = cache.get(&group_key("n")).await;
        assert!(wrong.is_none());
    }
}
