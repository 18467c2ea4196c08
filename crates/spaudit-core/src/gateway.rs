//! Resilient front of the remote API.
//!
//! Every call runs under the retry strategy with the circuit breaker of its operation class.
//! Each attempt first waits for rate budget at the operation's cost; that wait is not part
//! of the attempt's timeout and never counts against the breaker.

use std::future::Future;
use std::sync::Arc;

use spaudit_resilience::{
    CircuitState, OperationKind, RateLimitConfig, RateLimitStats, RateLimiter, RetryConfig,
    RetryStrategy,
};

use crate::error::GatewayError;
use crate::model::ObjectRef;
use crate::remote::{
    ChildPage, DirectoryObject, GroupInfo, RemoteApi, RemoteLibrary, RemoteResult, RoleAssignment,
    SharingLink, SiteListing, SitePage, PRINCIPAL_BATCH_SIZE,
};

/// Rate-limited, retried, circuit-broken access to a [`RemoteApi`].
pub struct ApiGateway {
    api: Arc<dyn RemoteApi>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryStrategy>,
}

impl ApiGateway {
    /// Wraps `api` with shared resilience primitives.
    pub fn new(api: Arc<dyn RemoteApi>, limiter: Arc<RateLimiter>, retry: Arc<RetryStrategy>) -> Self {
        ApiGateway { api, limiter, retry }
    }

    /// Wraps `api` with fresh primitives built from configuration.
    pub fn from_config(api: Arc<dyn RemoteApi>, rate: RateLimitConfig, retry: RetryConfig) -> Self {
        Self::new(
            api,
            Arc::new(RateLimiter::new(rate)),
            Arc::new(RetryStrategy::new(retry)),
        )
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        kind: OperationKind,
        invoke: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let limiter: &RateLimiter = &self.limiter;
        self.retry
            .execute_admitted(operation, move || limiter.acquire(kind), invoke)
            .await
    }

    /// One page of the site listing.
    pub async fn list_sites(&self, listing: &SiteListing) -> Result<SitePage, GatewayError> {
        self.call("list_sites", OperationKind::Delta, || self.api.list_sites(listing))
            .await
    }

    /// Libraries of a site.
    pub async fn list_libraries(&self, site_id: &str) -> Result<Vec<RemoteLibrary>, GatewayError> {
        self.call("list_libraries", OperationKind::SimpleGet, || {
            self.api.list_libraries(site_id)
        })
        .await
    }

    /// One page of children.
    pub async fn list_children(
        &self,
        library_id: &str,
        parent_id: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ChildPage, GatewayError> {
        self.call("list_children", OperationKind::ComplexGet, || {
            self.api.list_children(library_id, parent_id, page_token)
        })
        .await
    }

    /// Unique-permissions check.
    pub async fn has_unique_role_assignments(&self, object: &ObjectRef) -> Result<bool, GatewayError> {
        self.call("has_unique_role_assignments", OperationKind::SimpleGet, || {
            self.api.has_unique_role_assignments(object)
        })
        .await
    }

    /// Role assignments of an object.
    pub async fn role_assignments(
        &self,
        object: &ObjectRef,
    ) -> Result<Vec<RoleAssignment>, GatewayError> {
        self.call("role_assignments", OperationKind::GetWithExpand, || {
            self.api.role_assignments(object)
        })
        .await
    }

    /// Transitive members of a group.
    pub async fn transitive_members(
        &self,
        group_id: &str,
    ) -> Result<Vec<DirectoryObject>, GatewayError> {
        self.call("transitive_members", OperationKind::ComplexGet, || {
            self.api.transitive_members(group_id)
        })
        .await
    }

    /// Group header.
    pub async fn group_info(&self, group_id: &str) -> Result<GroupInfo, GatewayError> {
        self.call("group_info", OperationKind::SimpleGet, || {
            self.api.group_info(group_id)
        })
        .await
    }

    /// Bulk principal lookup, one round trip per [`PRINCIPAL_BATCH_SIZE`] ids.
    pub async fn get_principals(&self, ids: &[String]) -> Result<Vec<DirectoryObject>, GatewayError> {
        let mut principals = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(PRINCIPAL_BATCH_SIZE) {
            let batch = self
                .call("get_principals", OperationKind::Batch, || {
                    self.api.get_principals(chunk)
                })
                .await?;
            principals.extend(batch);
        }
        Ok(principals)
    }

    /// Directory lookup of a login.
    pub async fn lookup_user(&self, login: &str) -> Result<Option<DirectoryObject>, GatewayError> {
        self.call("lookup_user", OperationKind::SimpleGet, || {
            self.api.lookup_user(login)
        })
        .await
    }

    /// Sharing links of an object.
    pub async fn sharing_links(&self, object: &ObjectRef) -> Result<Vec<SharingLink>, GatewayError> {
        self.call("sharing_links", OperationKind::SimpleGet, || {
            self.api.sharing_links(object)
        })
        .await
    }

    /// Breaker state per operation class.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.retry.breaker_states()
    }

    /// Rate limiter counters.
    pub fn rate_stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }
}

impl std::fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiGateway")
            .field("rate", &self.limiter.stats())
            .finish_non_exhaustive()
    }
}
