//! Common tenants and helpers for the pipeline integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use spaudit_core::fixture::{
    assignment, FixtureGroup, FixtureItem, FixtureLibrary, FixturePermissions, FixtureSite,
};
use spaudit_core::model::{Row, Table};
use spaudit_core::remote::{
    DirectoryObject, DriveItem, ItemKind, RemoteLibrary, RemotePrincipal, RemoteSite,
    RoleAssignment,
};
use spaudit_core::store::{query_all, RowFilter};
use spaudit_core::{
    standard_stages, AuditConfig, CheckpointStore, FixtureApi, FixtureTenant, InventoryStore,
    Pipeline, RunContext, Stage, StageError,
};

/// Display name of the group granted Edit on every scenario site.
pub const OUTER_GROUP: &str = "Site Editors";
/// The user reached through the nested group.
pub const NESTED_USER: &str = "user-u";

/// Config tuned for fast tests: no jitter, short backoff.
pub fn test_config() -> AuditConfig {
    let mut config = AuditConfig::default();
    config.retry.jitter = false;
    config.retry.base_delay = std::time::Duration::from_millis(1);
    config.crawl.slot_backoff_ms = 1;
    config
}

fn folder_item(id: &str, name: &str) -> DriveItem {
    DriveItem {
        id: id.to_string(),
        name: name.to_string(),
        kind: ItemKind::Folder { child_count: Some(2) },
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single(),
        modified_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single(),
        created_by: None,
        modified_by: None,
        has_unique_permissions: None,
    }
}

fn file_item(id: &str, name: &str, size: u64) -> DriveItem {
    DriveItem {
        id: id.to_string(),
        name: name.to_string(),
        kind: ItemKind::File {
            size,
            content_type: None,
        },
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).single(),
        modified_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single(),
        created_by: Some("Ann".into()),
        modified_by: Some("Ann".into()),
        has_unique_permissions: None,
    }
}

fn external_read() -> RoleAssignment {
    RoleAssignment {
        principal: RemotePrincipal {
            id: "guest-x".into(),
            title: "Xavier (Partner)".into(),
            login_name: "i:0#.f|membership|xavier_partner.example#ext#@contoso.onmicrosoft.com"
                .into(),
            email: Some("xavier@partner.example".into()),
            principal_type: 1,
            is_anonymous_guest: false,
        },
        role_names: vec!["Read".into()],
        is_anonymous_link: false,
    }
}

/// Two sites, each with one library, one root folder and two files in it. `{site}-shared`
/// inherits; `{site}-private` holds a single external Read grant. Every site grants Edit
/// to a group that nests another group containing [`NESTED_USER`].
pub fn scenario_tenant() -> FixtureTenant {
    let mut tenant = FixtureTenant::default();
    tenant.users.push(DirectoryObject {
        id: NESTED_USER.into(),
        display_name: "Uma".into(),
        mail: Some("uma@contoso.example".into()),
        user_principal_name: None,
        user_type: Some("Member".into()),
        is_group: false,
    });
    tenant.groups.push(FixtureGroup {
        id: "group-outer".into(),
        display_name: OUTER_GROUP.into(),
        members: vec!["group-inner".into()],
    });
    tenant.groups.push(FixtureGroup {
        id: "group-inner".into(),
        display_name: "Inner Team".into(),
        members: vec![NESTED_USER.into()],
    });

    for name in ["alpha", "beta"] {
        let site_id = format!("site-{}", name);
        let library_id = format!("{}-docs", site_id);
        let folder_id = format!("{}-general", site_id);
        tenant.permissions.insert(
            site_id.clone(),
            FixturePermissions {
                assignments: vec![assignment("group-outer", OUTER_GROUP, 4, "Edit")],
                links: Vec::new(),
            },
        );
        tenant.permissions.insert(
            format!("{}-private", site_id),
            FixturePermissions {
                assignments: vec![external_read()],
                links: Vec::new(),
            },
        );
        tenant.sites.push(FixtureSite {
            site: RemoteSite {
                id: site_id.clone(),
                url: format!("https://contoso.sharepoint.com/sites/{}", name),
                title: format!("Project {}", name),
                template: Some("STS#3".into()),
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single(),
                modified_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single(),
                storage_used: None,
                is_archived: false,
                is_deleted: false,
            },
            libraries: vec![FixtureLibrary {
                library: RemoteLibrary {
                    id: library_id,
                    name: "Documents".into(),
                    web_url: None,
                    created_at: None,
                    modified_at: None,
                    item_count: Some(3),
                    has_unique_permissions: Some(false),
                },
                items: vec![
                    FixtureItem {
                        parent_id: None,
                        item: folder_item(&folder_id, "General"),
                    },
                    FixtureItem {
                        parent_id: Some(folder_id.clone()),
                        item: file_item(&format!("{}-shared", site_id), "Plan.DOCX", 2 * 1024 * 1024),
                    },
                    FixtureItem {
                        parent_id: Some(folder_id),
                        item: file_item(&format!("{}-private", site_id), "Salaries.xlsx", 4_096),
                    },
                ],
            }],
        });
    }
    tenant
}

/// Fails its first execution, before running the wrapped stage; delegates afterwards.
pub struct InterruptOnce {
    inner: Box<dyn Stage>,
    armed: AtomicBool,
}

impl InterruptOnce {
    pub fn new(inner: Box<dyn Stage>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Stage for InterruptOnce {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            return Err(StageError::Failed("interrupted".into()));
        }
        self.inner.execute(ctx).await
    }
}

/// Standard pipeline over `api`; the stage at `interrupt_at`, if any, fails once.
pub fn pipeline(
    run_id: &str,
    api: Arc<FixtureApi>,
    store: Arc<dyn InventoryStore>,
    config: &AuditConfig,
    interrupt_at: Option<usize>,
) -> Pipeline {
    let checkpoints = Arc::new(CheckpointStore::new(run_id, Arc::clone(&store)));
    let stages = standard_stages(api, Arc::clone(&store), Arc::clone(&checkpoints), config);
    let mut pipeline = Pipeline::new(store, checkpoints, config.run.clone());
    for (i, stage) in stages.into_iter().enumerate() {
        pipeline = if interrupt_at == Some(i) {
            pipeline.with_stage(Box::new(InterruptOnce::new(stage)))
        } else {
            pipeline.with_stage(stage)
        };
    }
    pipeline
}

/// Stored inventory and permission rows, keyed per table. Permission rows are reduced to
/// their keys since they carry observation timestamps.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub inventory: BTreeMap<Table, Vec<String>>,
    pub permission_keys: Vec<String>,
}

pub async fn snapshot(store: &dyn InventoryStore) -> Snapshot {
    let mut inventory = BTreeMap::new();
    for table in [Table::Sites, Table::Libraries, Table::Folders, Table::Files] {
        let mut rows: Vec<String> = query_all(store, table, RowFilter::All)
            .await
            .unwrap()
            .iter()
            .map(|row| serde_json::to_string(row).unwrap())
            .collect();
        rows.sort();
        inventory.insert(table, rows);
    }
    let mut permission_keys: Vec<String> = query_all(store, Table::Permissions, RowFilter::All)
        .await
        .unwrap()
        .iter()
        .map(Row::key)
        .collect();
    permission_keys.sort();
    Snapshot {
        inventory,
        permission_keys,
    }
}

pub async fn rows(store: &dyn InventoryStore, table: Table) -> Vec<Row> {
    query_all(store, table, RowFilter::All).await.unwrap()
}
