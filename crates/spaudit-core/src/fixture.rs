//! Deterministic in-memory tenant implementing [`RemoteApi`].
//!
//! Used for dry runs (a synthetic tenant), for replaying a captured tenant snapshot, and
//! throughout the tests. Supports fault injection (poisoned folders, failing operations,
//! rejected active-only listings, call latency) and records per-operation call counts and
//! the peak number of concurrently in-flight calls.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RemoteError};
use crate::model::{ObjectKind, ObjectRef};
use crate::remote::{
    ChildPage, DirectoryObject, GroupInfo, ItemKind, LinkAccess, LinkScope, RemoteApi,
    RemoteLibrary, RemotePrincipal, RemoteResult, RemoteSite, RoleAssignment, SharingLink,
    SiteListing, SitePage, DriveItem, PRINCIPAL_BATCH_SIZE,
};

/// A library and its flat item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureLibrary {
    /// Library header.
    pub library: RemoteLibrary,
    /// Items of the library.
    #[serde(default)]
    pub items: Vec<FixtureItem>,
}

/// An item and its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureItem {
    /// Parent folder id; `None` for the library root.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// The item.
    pub item: DriveItem,
}

/// A site with its libraries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSite {
    /// Site header.
    pub site: RemoteSite,
    /// Libraries.
    #[serde(default)]
    pub libraries: Vec<FixtureLibrary>,
}

/// Access rules defined directly on one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePermissions {
    /// Role assignments.
    #[serde(default)]
    pub assignments: Vec<RoleAssignment>,
    /// Sharing links.
    #[serde(default)]
    pub links: Vec<SharingLink>,
}

/// A group and its direct members (user or group ids).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureGroup {
    /// Group id.
    pub id: String,
    /// Display name.
    pub display_name: String,
    /// Direct member ids.
    #[serde(default)]
    pub members: Vec<String>,
}

/// A complete tenant.
///
/// Objects listed in `permissions` hold unique rules; every other non-site object inherits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureTenant {
    /// Sites.
    #[serde(default)]
    pub sites: Vec<FixtureSite>,
    /// Unique rules by object id.
    #[serde(default)]
    pub permissions: BTreeMap<String, FixturePermissions>,
    /// Groups.
    #[serde(default)]
    pub groups: Vec<FixtureGroup>,
    /// Directory users.
    #[serde(default)]
    pub users: Vec<DirectoryObject>,
    /// Sites returned by the next incremental listing.
    #[serde(default)]
    pub delta_changes: Vec<RemoteSite>,
}

impl FixtureTenant {
    /// Loads a captured tenant from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Generates a synthetic tenant with `site_count` sites, reproducible for a given seed.
    pub fn synthetic(site_count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tenant = FixtureTenant::default();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single();

        for u in 0..20 {
            let guest = u % 7 == 0;
            tenant.users.push(DirectoryObject {
                id: format!("user-{}", u),
                display_name: format!("User {}", u),
                mail: Some(if guest {
                    format!("user{}@partner.example", u)
                } else {
                    format!("user{}@contoso.example", u)
                }),
                user_principal_name: None,
                user_type: Some(if guest { "Guest" } else { "Member" }.to_string()),
                is_group: false,
            });
        }
        tenant.groups.push(FixtureGroup {
            id: "group-staff".into(),
            display_name: "All Staff".into(),
            members: vec!["group-team".into(), "user-1".into(), "user-2".into()],
        });
        tenant.groups.push(FixtureGroup {
            id: "group-team".into(),
            display_name: "Project Team".into(),
            members: vec!["user-3".into(), "user-4".into(), "user-7".into()],
        });

        for s in 0..site_count {
            let site_id = format!("site-{}", s);
            tenant.permissions.insert(
                site_id.clone(),
                FixturePermissions {
                    assignments: vec![
                        assignment("group-staff", "All Staff", 4, "Edit"),
                        assignment(&format!("owner-{}", s), "Site Owner", 1, "Full Control"),
                    ],
                    links: Vec::new(),
                },
            );
            let mut libraries = Vec::new();
            for l in 0..rng.gen_range(1..=2) {
                let library_id = format!("{}-lib-{}", site_id, l);
                let mut items = Vec::new();
                let mut parents: Vec<Option<String>> = vec![None];
                for f in 0..rng.gen_range(1..=3) {
                    let folder_id = format!("{}-folder-{}", library_id, f);
                    items.push(FixtureItem {
                        parent_id: None,
                        item: DriveItem {
                            id: folder_id.clone(),
                            name: format!("Folder {}", f),
                            kind: ItemKind::Folder { child_count: None },
                            created_at: base,
                            modified_at: base,
                            created_by: None,
                            modified_by: None,
                            has_unique_permissions: None,
                        },
                    });
                    parents.push(Some(folder_id));
                }
                for i in 0..rng.gen_range(2..=8) {
                    let file_id = format!("{}-file-{}", library_id, i);
                    let parent = parents[rng.gen_range(0..parents.len())].clone();
                    if rng.gen_bool(0.2) {
                        let guest = &tenant.users[0];
                        tenant.permissions.insert(
                            file_id.clone(),
                            FixturePermissions {
                                assignments: vec![RoleAssignment {
                                    principal: RemotePrincipal {
                                        id: guest.id.clone(),
                                        title: guest.display_name.clone(),
                                        login_name: "user0_partner.example#ext#@contoso.onmicrosoft.com"
                                            .into(),
                                        email: guest.mail.clone(),
                                        principal_type: 1,
                                        is_anonymous_guest: false,
                                    },
                                    role_names: vec!["Read".into()],
                                    is_anonymous_link: false,
                                }],
                                links: if rng.gen_bool(0.3) {
                                    vec![SharingLink {
                                        id: format!("{}-link", file_id),
                                        scope: LinkScope::Anonymous,
                                        access: LinkAccess::View,
                                        recipients: Vec::new(),
                                        created_at: base,
                                    }]
                                } else {
                                    Vec::new()
                                },
                            },
                        );
                    }
                    items.push(FixtureItem {
                        parent_id: parent,
                        item: DriveItem {
                            id: file_id,
                            name: format!("report-{}.{}", i, ["docx", "XLSX", "pdf"][i % 3]),
                            kind: ItemKind::File {
                                size: rng.gen_range(1_000..50_000_000),
                                content_type: None,
                            },
                            created_at: base,
                            modified_at: base,
                            created_by: Some("User 1".into()),
                            modified_by: Some("User 2".into()),
                            has_unique_permissions: None,
                        },
                    });
                }
                libraries.push(FixtureLibrary {
                    library: RemoteLibrary {
                        id: library_id,
                        name: if l == 0 { "Documents".into() } else { format!("Library {}", l) },
                        web_url: None,
                        created_at: base,
                        modified_at: base,
                        item_count: Some(items.len() as u64),
                        has_unique_permissions: Some(false),
                    },
                    items,
                });
            }
            tenant.sites.push(FixtureSite {
                site: RemoteSite {
                    id: site_id,
                    url: format!("https://contoso.sharepoint.com/sites/project{}", s),
                    title: format!("Project {}", s),
                    template: Some(if s % 2 == 0 { "STS#3" } else { "GROUP#0" }.to_string()),
                    created_at: base,
                    modified_at: Some(Utc::now()),
                    storage_used: None,
                    is_archived: false,
                    is_deleted: false,
                },
                libraries,
            });
        }
        tenant
    }
}

/// Role assignment helper for building tenants.
pub fn assignment(principal_id: &str, title: &str, principal_type: i64, role: &str) -> RoleAssignment {
    RoleAssignment {
        principal: RemotePrincipal {
            id: principal_id.to_string(),
            title: title.to_string(),
            login_name: principal_id.to_string(),
            email: None,
            principal_type,
            is_anonymous_guest: false,
        },
        role_names: vec![role.to_string()],
        is_anonymous_link: false,
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`RemoteApi`] served from a [`FixtureTenant`].
pub struct FixtureApi {
    tenant: FixtureTenant,
    children: HashMap<(String, Option<String>), Vec<DriveItem>>,
    library_ids: BTreeSet<String>,
    page_size: usize,
    latency: Duration,
    poisoned: Mutex<HashMap<String, RemoteError>>,
    failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    reject_active_only: AtomicBool,
    calls: Mutex<BTreeMap<String, u64>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixtureApi {
    /// Serves `tenant` with a page size of 50 and no latency.
    pub fn new(tenant: FixtureTenant) -> Self {
        let mut children: HashMap<(String, Option<String>), Vec<DriveItem>> = HashMap::new();
        let mut library_ids = BTreeSet::new();
        for site in &tenant.sites {
            for library in &site.libraries {
                library_ids.insert(library.library.id.clone());
                for item in &library.items {
                    children
                        .entry((library.library.id.clone(), item.parent_id.clone()))
                        .or_default()
                        .push(item.item.clone());
                }
            }
        }
        FixtureApi {
            tenant,
            children,
            library_ids,
            page_size: 50,
            latency: Duration::ZERO,
            poisoned: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            reject_active_only: AtomicBool::new(false),
            calls: Mutex::new(BTreeMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sets the number of items per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Adds a fixed delay to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every child listing of `parent_id` fail with `error`.
    pub fn poison_folder(&self, parent_id: &str, error: RemoteError) {
        self.poisoned.lock().insert(parent_id.to_string(), error);
    }

    /// Makes the next `times` calls of `operation` fail with `error`.
    pub fn fail_operation(&self, operation: &str, times: usize, error: RemoteError) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(operation.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Makes active-only site listings fail with a 400.
    pub fn reject_active_only(&self, reject: bool) {
        self.reject_active_only.store(reject, Ordering::SeqCst);
    }

    /// Number of invocations of `operation`, including injected failures.
    pub fn calls(&self, operation: &str) -> u64 {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Total invocations.
    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    /// Highest number of concurrently in-flight calls.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: &str) -> RemoteResult<InFlight<'_>> {
        *self.calls.lock().entry(operation.to_string()).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight {
            counter: &self.in_flight,
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = self
            .failures
            .lock()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }

    fn page<T: Clone>(&self, items: &[T], token: Option<&str>) -> RemoteResult<(Vec<T>, Option<String>)> {
        let start = match token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| RemoteError::Malformed(format!("bad page token {}", t)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        Ok((items.get(start..end).unwrap_or_default().to_vec(), next))
    }

    fn user(&self, id: &str) -> Option<&DirectoryObject> {
        self.tenant.users.iter().find(|u| u.id == id)
    }

    fn group(&self, id: &str) -> Option<&FixtureGroup> {
        self.tenant.groups.iter().find(|g| g.id == id)
    }
}

#[async_trait]
impl RemoteApi for FixtureApi {
    async fn list_sites(&self, listing: &SiteListing) -> RemoteResult<SitePage> {
        let _call = self.enter("list_sites").await?;
        if listing.active_only && self.reject_active_only.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 400,
                message: "active-only filter not supported".into(),
            });
        }
        if listing.delta_token.is_some() && listing.page_token.is_none() {
            return Ok(SitePage {
                sites: self.tenant.delta_changes.clone(),
                next_page: None,
                delta_token: Some("delta-2".into()),
            });
        }
        let sites: Vec<RemoteSite> = self
            .tenant
            .sites
            .iter()
            .map(|s| s.site.clone())
            .filter(|s| !listing.active_only || !(s.is_archived || s.is_deleted))
            .collect();
        let (sites, next_page) = self.page(&sites, listing.page_token.as_deref())?;
        let delta_token = next_page.is_none().then(|| "delta-1".to_string());
        Ok(SitePage {
            sites,
            next_page,
            delta_token,
        })
    }

    async fn list_libraries(&self, site_id: &str) -> RemoteResult<Vec<RemoteLibrary>> {
        let _call = self.enter("list_libraries").await?;
        self.tenant
            .sites
            .iter()
            .find(|s| s.site.id == site_id)
            .map(|s| s.libraries.iter().map(|l| l.library.clone()).collect())
            .ok_or_else(|| RemoteError::not_found(format!("site {}", site_id)))
    }

    async fn list_children(
        &self,
        library_id: &str,
        parent_id: Option<&str>,
        page_token: Option<&str>,
    ) -> RemoteResult<ChildPage> {
        let _call = self.enter("list_children").await?;
        if !self.library_ids.contains(library_id) {
            return Err(RemoteError::not_found(format!("library {}", library_id)));
        }
        let poison_key = parent_id.unwrap_or(library_id);
        if let Some(error) = self.poisoned.lock().get(poison_key) {
            return Err(error.clone());
        }
        let key = (library_id.to_string(), parent_id.map(str::to_string));
        let items = self.children.get(&key).map(Vec::as_slice).unwrap_or_default();
        let (items, next_page) = self.page(items, page_token)?;
        Ok(ChildPage { items, next_page })
    }

    async fn has_unique_role_assignments(&self, object: &ObjectRef) -> RemoteResult<bool> {
        let _call = self.enter("has_unique_role_assignments").await?;
        Ok(object.kind == ObjectKind::Site || self.tenant.permissions.contains_key(&object.id))
    }

    async fn role_assignments(&self, object: &ObjectRef) -> RemoteResult<Vec<RoleAssignment>> {
        let _call = self.enter("role_assignments").await?;
        Ok(self
            .tenant
            .permissions
            .get(&object.id)
            .map(|p| p.assignments.clone())
            .unwrap_or_default())
    }

    async fn transitive_members(&self, group_id: &str) -> RemoteResult<Vec<DirectoryObject>> {
        let _call = self.enter("transitive_members").await?;
        let root = self
            .group(group_id)
            .ok_or_else(|| RemoteError::not_found(format!("group {}", group_id)))?;

        let mut seen = BTreeSet::from([root.id.clone()]);
        let mut queue: VecDeque<&FixtureGroup> = VecDeque::from([root]);
        let mut members = Vec::new();
        while let Some(group) = queue.pop_front() {
            for member in &group.members {
                if !seen.insert(member.clone()) {
                    continue;
                }
                if let Some(nested) = self.group(member) {
                    members.push(DirectoryObject {
                        id: nested.id.clone(),
                        display_name: nested.display_name.clone(),
                        mail: None,
                        user_principal_name: None,
                        user_type: None,
                        is_group: true,
                    });
                    queue.push_back(nested);
                } else if let Some(user) = self.user(member) {
                    // Membership listings omit the user type; callers hydrate it.
                    members.push(DirectoryObject {
                        user_type: None,
                        ..user.clone()
                    });
                }
            }
        }
        Ok(members)
    }

    async fn group_info(&self, group_id: &str) -> RemoteResult<GroupInfo> {
        let _call = self.enter("group_info").await?;
        self.group(group_id)
            .map(|g| GroupInfo {
                id: g.id.clone(),
                display_name: g.display_name.clone(),
            })
            .ok_or_else(|| RemoteError::not_found(format!("group {}", group_id)))
    }

    async fn get_principals(&self, ids: &[String]) -> RemoteResult<Vec<DirectoryObject>> {
        let _call = self.enter("get_principals").await?;
        if ids.len() > PRINCIPAL_BATCH_SIZE {
            return Err(RemoteError::Malformed(format!(
                "batch of {} exceeds {}",
                ids.len(),
                PRINCIPAL_BATCH_SIZE
            )));
        }
        Ok(ids.iter().filter_map(|id| self.user(id).cloned()).collect())
    }

    async fn lookup_user(&self, login: &str) -> RemoteResult<Option<DirectoryObject>> {
        let _call = self.enter("lookup_user").await?;
        Ok(self
            .tenant
            .users
            .iter()
            .find(|u| u.login().map_or(false, |l| l.eq_ignore_ascii_case(login)))
            .cloned())
    }

    async fn sharing_links(&self, object: &ObjectRef) -> RemoteResult<Vec<SharingLink>> {
        let _call = self.enter("sharing_links").await?;
        Ok(self
            .tenant
            .permissions
            .get(&object.id)
            .map(|p| p.links.clone())
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for FixtureApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureApi")
            .field("sites", &self.tenant.sites.len())
            .field("page_size", &self.page_size)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_ref(id: &str) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::Site,
            id: id.into(),
            path: String::new(),
            site_id: id.into(),
            library_id: None,
            parent_id: None,
            has_unique_permissions: Some(true),
        }
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = FixtureTenant::synthetic(4, 7);
        let b = FixtureTenant::synthetic(4, 7);
        let ids = |t: &FixtureTenant| -> Vec<String> {
            t.sites
                .iter()
                .flat_map(|s| s.libraries.iter().flat_map(|l| l.items.iter().map(|i| i.item.id.clone())))
                .collect()
        };
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.sites.len(), 4);
    }

    #[tokio::test]
    async fn test_pagination_and_delta_token() {
        let api = FixtureApi::new(FixtureTenant::synthetic(5, 1)).with_page_size(2);
        let mut listing = SiteListing::default();
        let mut seen = 0;
        loop {
            let page = api.list_sites(&listing).await.unwrap();
            seen += page.sites.len();
            match page.next_page {
                Some(next) => listing.page_token = Some(next),
                None => {
                    assert_eq!(page.delta_token.as_deref(), Some("delta-1"));
                    break;
                }
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(api.calls("list_sites"), 3);
    }

    #[tokio::test]
    async fn test_transitive_members_flatten_nested_groups() {
        let api = FixtureApi::new(FixtureTenant::synthetic(1, 1));
        let members = api.transitive_members("group-staff").await.unwrap();
        let users: BTreeSet<_> = members.iter().filter(|m| !m.is_group).map(|m| m.id.as_str()).collect();
        assert_eq!(users, BTreeSet::from(["user-1", "user-2", "user-3", "user-4", "user-7"]));
        assert!(members.iter().any(|m| m.is_group && m.id == "group-team"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let api = FixtureApi::new(FixtureTenant::synthetic(1, 1));
        api.fail_operation("role_assignments", 1, RemoteError::Timeout);
        assert_eq!(api.role_assignments(&site_ref("site-0")).await, Err(RemoteError::Timeout));
        assert_eq!(api.role_assignments(&site_ref("site-0")).await.unwrap().len(), 2);

        api.poison_folder("site-0-lib-0", RemoteError::unavailable("poisoned"));
        assert!(api.list_children("site-0-lib-0", None, None).await.is_err());
        assert_eq!(api.calls("list_children"), 1);
        assert_eq!(api.peak_in_flight(), 1);
    }
}
