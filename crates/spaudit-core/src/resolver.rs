//! Permission resolver.
//!
//! Resolves the effective access rules of one inventory object. Objects with unique rules
//! are read from their role assignments (groups expanded transitively, sharing links
//! probed); inheriting objects copy the set of their nearest ancestor with unique rules,
//! resolving that ancestor through the same cache. Permission sets and group expansions
//! are cached under separate typed keys with separate TTLs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use spaudit_resilience::{Governor, GovernorStats};
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheKey, TypedCache};
use crate::config::PermissionConfig;
use crate::error::ResolveError;
use crate::gateway::ApiGateway;
use crate::model::{
    has_external_marker, GroupMember, GroupMembership, ObjectKind, ObjectRef, PermissionEntry,
    PermissionSet, PrincipalKind, Timestamp,
};
use crate::remote::{DirectoryObject, LinkScope, RoleAssignment};

/// Role granting no effective access; skipped.
const LIMITED_ACCESS: &str = "Limited Access";

/// Lookup of objects by id, used to walk the parent chain.
#[derive(Debug, Clone, Default)]
pub struct InventoryIndex {
    objects: HashMap<String, ObjectRef>,
}

impl InventoryIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an object.
    pub fn insert(&mut self, object: ObjectRef) {
        self.objects.insert(object.id.clone(), object);
    }

    /// Object by id.
    pub fn get(&self, id: &str) -> Option<&ObjectRef> {
        self.objects.get(id)
    }

    /// Static parent: site for libraries, folder or library for folders and files.
    pub fn parent_of(&self, object: &ObjectRef) -> Option<&ObjectRef> {
        match object.kind {
            ObjectKind::Site => None,
            _ => object.parent_id.as_deref().and_then(|id| self.get(id)),
        }
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl FromIterator<ObjectRef> for InventoryIndex {
    fn from_iter<I: IntoIterator<Item = ObjectRef>>(iter: I) -> Self {
        let mut index = InventoryIndex::new();
        for object in iter {
            index.insert(object);
        }
        index
    }
}

/// A remote failure absorbed while assembling a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    /// What failed, e.g. `file:abc` or `group:xyz`.
    pub scope: String,
    /// Error message.
    pub message: String,
}

impl ResolveFailure {
    fn new(scope: impl Into<String>, error: impl std::fmt::Display) -> Self {
        ResolveFailure {
            scope: scope.into(),
            message: error.to_string(),
        }
    }
}

/// A resolved set with the failures absorbed while assembling it.
///
/// Failures are reported once, by the resolution that fetched from the remote; a set
/// served from the cache carries none.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The permission set.
    pub set: PermissionSet,
    /// Remote failures that degraded the set.
    pub failures: Vec<ResolveFailure>,
}

/// Resolver counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    /// Sets assembled (cache misses).
    pub resolved: u64,
    /// Sets served from the cache.
    pub cache_hits: u64,
    /// Sets read from the object's own rules.
    pub unique: u64,
    /// Sets copied from an ancestor.
    pub inherited: u64,
    /// Role-assignment fetches that failed.
    pub assignment_failures: u64,
    /// Groups expanded remotely.
    pub groups_expanded: u64,
    /// Placeholder entries produced.
    pub unknown_entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    resolved: AtomicU64,
    cache_hits: AtomicU64,
    unique: AtomicU64,
    inherited: AtomicU64,
    assignment_failures: AtomicU64,
    groups_expanded: AtomicU64,
    unknown_entries: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Resolves permission sets through the gateway and the cache.
pub struct PermissionResolver {
    gateway: Arc<ApiGateway>,
    cache: TypedCache,
    config: PermissionConfig,
    permission_ttl: Duration,
    group_ttl: Duration,
    governor: Governor,
    counters: Counters,
}

impl PermissionResolver {
    /// Creates a resolver admitting `config.batch_concurrency` objects at once in batches.
    pub fn new(
        gateway: Arc<ApiGateway>,
        cache: TypedCache,
        config: PermissionConfig,
        cache_config: &CacheConfig,
    ) -> Self {
        PermissionResolver {
            gateway,
            cache,
            governor: Governor::new("permission-batch", config.batch_concurrency),
            config,
            permission_ttl: Duration::from_secs(cache_config.permission_ttl_secs),
            group_ttl: Duration::from_secs(cache_config.group_ttl_secs),
            counters: Counters::default(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ResolverStats {
        let c = &self.counters;
        ResolverStats {
            resolved: c.resolved.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            unique: c.unique.load(Ordering::Relaxed),
            inherited: c.inherited.load(Ordering::Relaxed),
            assignment_failures: c.assignment_failures.load(Ordering::Relaxed),
            groups_expanded: c.groups_expanded.load(Ordering::Relaxed),
            unknown_entries: c.unknown_entries.load(Ordering::Relaxed),
        }
    }

    /// Counters of the batch governor.
    pub fn governor_stats(&self) -> GovernorStats {
        self.governor.stats()
    }

    /// Resolves one object, walking `index` for inherited rules.
    pub async fn resolve(
        &self,
        index: &InventoryIndex,
        object: &ObjectRef,
    ) -> Result<Resolution, ResolveError> {
        self.resolve_boxed(index, object).await
    }

    /// Resolves `objects` concurrently under the batch governor; results keep input order.
    pub async fn resolve_batch(
        &self,
        index: &InventoryIndex,
        objects: &[ObjectRef],
    ) -> Vec<Result<Resolution, ResolveError>> {
        join_all(objects.iter().map(|object| self.resolve_admitted(index, object))).await
    }

    async fn resolve_admitted(
        &self,
        index: &InventoryIndex,
        object: &ObjectRef,
    ) -> Result<Resolution, ResolveError> {
        let _slot = self.governor.acquire().await?;
        self.resolve(index, object).await
    }

    fn resolve_boxed<'a>(
        &'a self,
        index: &'a InventoryIndex,
        object: &'a ObjectRef,
    ) -> BoxFuture<'a, Result<Resolution, ResolveError>> {
        async move {
            let key = CacheKey::Permissions {
                kind: object.kind,
                id: object.id.clone(),
            };
            if let Some(set) = self.cache.get::<PermissionSet>(&key).await {
                bump(&self.counters.cache_hits);
                return Ok(Resolution {
                    set,
                    failures: Vec::new(),
                });
            }

            let unique = match (object.kind, object.has_unique_permissions) {
                (ObjectKind::Site, _) => true,
                (_, Some(flag)) => flag,
                (_, None) => self
                    .gateway
                    .has_unique_role_assignments(object)
                    .await
                    .map_err(|source| ResolveError::Remote {
                        object_id: object.id.clone(),
                        source,
                    })?,
            };

            let mut failures = Vec::new();
            let set = if unique {
                bump(&self.counters.unique);
                self.resolve_unique(object, &mut failures).await
            } else {
                bump(&self.counters.inherited);
                self.resolve_inherited(index, object, &mut failures).await?
            };
            bump(&self.counters.resolved);
            debug!(
                kind = %object.kind,
                object_id = %object.id,
                unique,
                entries = set.entries.len(),
                failures = failures.len(),
                "permissions resolved"
            );
            self.cache.set(key, &set, self.permission_ttl).await;
            Ok(Resolution { set, failures })
        }
        .boxed()
    }

    async fn resolve_unique(
        &self,
        object: &ObjectRef,
        failures: &mut Vec<ResolveFailure>,
    ) -> PermissionSet {
        let now = Utc::now();
        let assignments = match self.gateway.role_assignments(object).await {
            Ok(assignments) => assignments,
            Err(e) => {
                warn!(kind = %object.kind, object_id = %object.id, error = %e, "role assignments unavailable");
                bump(&self.counters.assignment_failures);
                failures.push(ResolveFailure::new(scope_of(object), &e));
                Vec::new()
            }
        };

        let mut entries = Vec::new();
        for assignment in &assignments {
            entries.extend(self.assignment_entries(assignment, now, failures).await);
        }
        if entries.is_empty() {
            bump(&self.counters.unknown_entries);
            entries.push(PermissionEntry::unknown(now));
        }
        if self.config.probe_sharing_links {
            entries.extend(self.link_entries(object, now, failures).await);
        }
        PermissionSet::new(object, true, entries, now)
    }

    async fn resolve_inherited(
        &self,
        index: &InventoryIndex,
        object: &ObjectRef,
        failures: &mut Vec<ResolveFailure>,
    ) -> Result<PermissionSet, ResolveError> {
        let now = Utc::now();
        let Some(parent) = index.parent_of(object) else {
            warn!(kind = %object.kind, object_id = %object.id, "parent not in inventory, permissions unknown");
            bump(&self.counters.unknown_entries);
            let entry = PermissionEntry {
                is_inherited: true,
                ..PermissionEntry::unknown(now)
            };
            return Ok(PermissionSet::new(object, false, vec![entry], now));
        };

        let Resolution {
            set: parent_set,
            failures: parent_failures,
        } = self.resolve_boxed(index, parent).await?;
        failures.extend(parent_failures);
        let (source_id, source_path) = if parent_set.has_unique_permissions {
            (
                Some(parent_set.object_id.clone()),
                Some(parent_set.object_path.clone()),
            )
        } else {
            (
                parent_set.inheritance_source_id.clone(),
                parent_set.inheritance_source_path.clone(),
            )
        };

        let entries = parent_set
            .entries
            .iter()
            .map(|entry| match &source_id {
                Some(source) => entry.inherited_from(source),
                None => PermissionEntry {
                    is_inherited: true,
                    ..entry.clone()
                },
            })
            .collect();
        let mut set = PermissionSet::new(object, false, entries, now);
        set.inheritance_source_id = source_id;
        set.inheritance_source_path = source_path;
        Ok(set)
    }

    async fn assignment_entries(
        &self,
        assignment: &RoleAssignment,
        now: Timestamp,
        failures: &mut Vec<ResolveFailure>,
    ) -> Vec<PermissionEntry> {
        let roles: Vec<&str> = assignment
            .role_names
            .iter()
            .map(String::as_str)
            .filter(|role| !role.eq_ignore_ascii_case(LIMITED_ACCESS))
            .collect();
        if roles.is_empty() {
            return Vec::new();
        }

        let principal = &assignment.principal;
        let anonymous = principal.is_anonymous_guest
            || assignment.is_anonymous_link
            || principal.title.to_lowercase().contains("anonymous");
        let mut kind = if anonymous {
            PrincipalKind::AnonymousLink
        } else {
            PrincipalKind::from_code(principal.principal_type, &principal.login_name)
        };

        let claim = claim_login(&principal.login_name);
        let login = principal
            .email
            .clone()
            .filter(|mail| !mail.is_empty())
            .or_else(|| (!claim.is_empty()).then(|| claim.to_string()));

        if kind == PrincipalKind::User && self.config.lookup_external_users {
            if let Some(address) = login.as_deref().filter(|l| l.contains('@')) {
                if self.is_directory_guest(address, failures).await {
                    kind = PrincipalKind::External;
                }
            }
        }

        let membership = if kind == PrincipalKind::Group {
            self.expand_group(&principal.id, &principal.title, failures)
                .await
        } else {
            None
        };

        let mut entries = Vec::new();
        for role in roles {
            entries.push(PermissionEntry {
                principal_id: principal.id.clone(),
                principal_name: principal.title.clone(),
                principal_kind: kind,
                login: login.clone(),
                permission_level: role.to_string(),
                is_inherited: false,
                granted_at: Some(now),
                granted_by: None,
                inheritance_source: None,
                is_external: kind == PrincipalKind::External,
                is_anonymous_link: anonymous,
            });
            if let Some(membership) = &membership {
                entries.extend(
                    membership
                        .members
                        .iter()
                        .map(|member| member_entry(member, &membership.group_name, role, now)),
                );
            }
        }
        entries
    }

    /// Guest lookup in the directory; a failed lookup counts as not a guest.
    async fn is_directory_guest(&self, login: &str, failures: &mut Vec<ResolveFailure>) -> bool {
        match self.gateway.lookup_user(login).await {
            Ok(user) => user.map_or(false, |u| u.is_guest()),
            Err(e) => {
                debug!(login, error = %e, "directory lookup failed");
                failures.push(ResolveFailure::new(format!("user:{}", login), &e));
                false
            }
        }
    }

    /// Transitive members of a group, from the cache or the directory. `None` if the
    /// expansion failed; the failure is pushed to `failures`.
    pub async fn expand_group(
        &self,
        group_id: &str,
        group_name: &str,
        failures: &mut Vec<ResolveFailure>,
    ) -> Option<GroupMembership> {
        let key = CacheKey::GroupMembers {
            group_id: group_id.to_string(),
        };
        if let Some(membership) = self.cache.get::<GroupMembership>(&key).await {
            return Some(membership);
        }

        let objects = match self.gateway.transitive_members(group_id).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(group_id, error = %e, "group expansion failed");
                failures.push(ResolveFailure::new(format!("group:{}", group_id), &e));
                return None;
            }
        };

        let untyped: Vec<String> = objects
            .iter()
            .filter(|o| !o.is_group && o.user_type.is_none())
            .map(|o| o.id.clone())
            .collect();
        let hydrated: HashMap<String, DirectoryObject> = if untyped.is_empty() {
            HashMap::new()
        } else {
            match self.gateway.get_principals(&untyped).await {
                Ok(found) => found.into_iter().map(|o| (o.id.clone(), o)).collect(),
                Err(e) => {
                    warn!(group_id, error = %e, "principal hydration failed");
                    failures.push(ResolveFailure::new(format!("group:{}", group_id), &e));
                    HashMap::new()
                }
            }
        };

        let mut seen = BTreeSet::new();
        let mut members = Vec::new();
        let mut nested_group_ids = Vec::new();
        for object in objects {
            if object.is_group {
                nested_group_ids.push(object.id);
                continue;
            }
            if !seen.insert(object.id.clone()) {
                continue;
            }
            let object = hydrated.get(&object.id).cloned().unwrap_or(object);
            let login = object.login().map(str::to_string);
            let is_external =
                object.is_guest() || login.as_deref().map_or(false, has_external_marker);
            members.push(GroupMember {
                id: object.id,
                display_name: object.display_name,
                login,
                is_external,
            });
        }

        let membership = GroupMembership {
            group_id: group_id.to_string(),
            group_name: group_name.to_string(),
            total_user_count: members.len() as u32,
            members,
            nested_group_ids,
            expanded_at: Utc::now(),
        };
        bump(&self.counters.groups_expanded);
        debug!(
            group_id,
            users = membership.total_user_count,
            nested = membership.nested_group_ids.len(),
            "group expanded"
        );
        self.cache.set(key, &membership, self.group_ttl).await;
        Some(membership)
    }

    async fn link_entries(
        &self,
        object: &ObjectRef,
        now: Timestamp,
        failures: &mut Vec<ResolveFailure>,
    ) -> Vec<PermissionEntry> {
        let links = match self.gateway.sharing_links(object).await {
            Ok(links) => links,
            Err(e) => {
                warn!(kind = %object.kind, object_id = %object.id, error = %e, "sharing links unavailable");
                failures.push(ResolveFailure::new(scope_of(object), &e));
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for link in links {
            let level = link.access.permission_level().to_string();
            match link.scope {
                LinkScope::Anonymous => entries.push(PermissionEntry {
                    principal_id: format!("anonymous-link:{}", link.id),
                    principal_name: "Anyone with the link".to_string(),
                    principal_kind: PrincipalKind::AnonymousLink,
                    login: None,
                    permission_level: level,
                    is_inherited: false,
                    granted_at: link.created_at.or(Some(now)),
                    granted_by: None,
                    inheritance_source: None,
                    is_external: false,
                    is_anonymous_link: true,
                }),
                LinkScope::Users => {
                    for recipient in &link.recipients {
                        let login = recipient.login().map(str::to_string);
                        let external = recipient.is_guest()
                            || login.as_deref().map_or(false, has_external_marker);
                        if !external {
                            continue;
                        }
                        entries.push(PermissionEntry {
                            principal_id: recipient.id.clone(),
                            principal_name: recipient.display_name.clone(),
                            principal_kind: PrincipalKind::External,
                            login,
                            permission_level: level.clone(),
                            is_inherited: false,
                            granted_at: link.created_at.or(Some(now)),
                            granted_by: Some(format!("sharing-link:{}", link.id)),
                            inheritance_source: None,
                            is_external: true,
                            is_anonymous_link: false,
                        });
                    }
                }
                LinkScope::Organization => {}
            }
        }
        entries
    }
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn scope_of(object: &ObjectRef) -> String {
    format!("{}:{}", object.kind, object.id)
}

/// Account part of a claims-encoded login (`i:0#.f|membership|ann@corp.example`).
fn claim_login(login_name: &str) -> &str {
    login_name.rsplit('|').next().unwrap_or(login_name)
}

fn member_entry(member: &GroupMember, group_name: &str, role: &str, now: Timestamp) -> PermissionEntry {
    PermissionEntry {
        principal_id: member.id.clone(),
        principal_name: member.display_name.clone(),
        principal_kind: if member.is_external {
            PrincipalKind::External
        } else {
            PrincipalKind::User
        },
        login: member.login.clone(),
        permission_level: role.to_string(),
        is_inherited: false,
        granted_at: Some(now),
        granted_by: Some(group_name.to_string()),
        inheritance_source: None,
        is_external: member.is_external,
        is_anonymous_link: false,
    }
}
