//! The standard audit stages and the pipeline assembled from them.
//!
//! discovery → validation → transformation → enrichment → permissions → storage

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use spaudit_resilience::Governor;
use tracing::{debug, info, warn};

use crate::cache::{MemoryCache, TypedCache};
use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::config::AuditConfig;
use crate::crawler::DiscoveryCrawler;
use crate::error::{StageError, StoreError};
use crate::gateway::ApiGateway;
use crate::model::{
    summarize, File, Library, ObjectRef, PermissionRow, Row, RunError, RunRecord, RunStatus,
    Site, Table, Timestamp,
};
use crate::pipeline::{Pipeline, RunContext, Stage};
use crate::remote::RemoteApi;
use crate::resolver::{PermissionResolver, Resolution};
use crate::store::{fetch_latest, InventoryStore};

/// Discovery stage name.
pub const DISCOVERY: &str = "discovery";
/// Validation stage name.
pub const VALIDATION: &str = "validation";
/// Transformation stage name.
pub const TRANSFORMATION: &str = "transformation";
/// Enrichment stage name.
pub const ENRICHMENT: &str = "enrichment";
/// Permission stage name.
pub const PERMISSIONS: &str = "permissions";
/// Storage stage name.
pub const STORAGE: &str = "storage";

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Crawls the tenant and loads the discovered inventory into the context.
pub struct DiscoveryStage {
    crawler: Arc<DiscoveryCrawler>,
}

impl DiscoveryStage {
    /// Stage driving `crawler`.
    pub fn new(crawler: Arc<DiscoveryCrawler>) -> Self {
        DiscoveryStage { crawler }
    }
}

#[async_trait]
impl Stage for DiscoveryStage {
    fn name(&self) -> &str {
        DISCOVERY
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let report = self.crawler.crawl().await?;
        ctx.errors.extend(report.errors);
        ctx.load_inventory(&report.site_ids).await?;

        ctx.metrics.set_custom("sites_filtered", report.sites_filtered as f64);
        ctx.metrics.set_custom("sites_resumed", report.sites_skipped as f64);
        ctx.metrics.set_custom("folders_depth_capped", report.depth_capped as f64);
        if report.used_fallback {
            ctx.metrics.set_custom("site_listing_fallback", 1.0);
        }
        Ok(())
    }
}

/// Checks required fields and parent references. Problems are recorded, not fatal.
#[derive(Debug, Default)]
pub struct ValidationStage;

#[async_trait]
impl Stage for ValidationStage {
    fn name(&self) -> &str {
        VALIDATION
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let mut problems = Vec::new();
        for site in &ctx.sites {
            if site.site_id.is_empty() {
                problems.push(RunError::new(VALIDATION, "site:", "site has no id"));
            }
            if !site.url.starts_with("https://") {
                problems.push(RunError::new(
                    VALIDATION,
                    format!("site:{}", site.site_id),
                    format!("invalid site url {:?}", site.url),
                ));
            }
        }

        let libraries: HashSet<&str> = ctx.libraries.iter().map(|l| l.library_id.as_str()).collect();
        let folders: HashSet<&str> = ctx.folders.iter().map(|f| f.folder_id.as_str()).collect();
        let placed = |library_id: &str, parent_id: &str| {
            libraries.contains(library_id)
                && (parent_id == library_id || folders.contains(parent_id))
        };
        for folder in &ctx.folders {
            if !placed(&folder.library_id, &folder.parent_id) {
                problems.push(RunError::new(
                    VALIDATION,
                    format!("folder:{}", folder.folder_id),
                    format!("unknown parent {} in library {}", folder.parent_id, folder.library_id),
                ));
            }
        }
        for file in &ctx.files {
            if !placed(&file.library_id, &file.parent_id) {
                problems.push(RunError::new(
                    VALIDATION,
                    format!("file:{}", file.file_id),
                    format!("unknown parent {} in library {}", file.parent_id, file.library_id),
                ));
            }
        }

        if !problems.is_empty() {
            warn!(run_id = %ctx.run_id, problems = problems.len(), "inventory validation problems");
        }
        ctx.errors.extend(problems);
        Ok(())
    }
}

/// Tenant name from a site URL host: `contoso.sharepoint.com` and
/// `contoso-my.sharepoint.com` both give `contoso`.
pub fn tenant_name(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    let label = host.split('.').next()?;
    let label = label.strip_suffix("-my").unwrap_or(label);
    (!label.is_empty()).then(|| label.to_lowercase())
}

/// Human-readable site type for a web template code.
pub fn site_type(template: Option<&str>) -> &'static str {
    match template.unwrap_or_default().to_uppercase().as_str() {
        "STS#0" => "Team Site",
        "STS#3" => "Team Site (Modern)",
        "GROUP#0" => "Microsoft 365 Group Site",
        "SITEPAGEPUBLISHING#0" => "Communication Site",
        _ => "Other",
    }
}

/// Lower-case extension of a file name, without the dot.
pub fn file_extension(name: &str) -> Option<String> {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

/// Derives tenant name, site type and file extensions.
#[derive(Debug, Default)]
pub struct TransformationStage;

#[async_trait]
impl Stage for TransformationStage {
    fn name(&self) -> &str {
        TRANSFORMATION
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        for site in &mut ctx.sites {
            site.tenant_name = tenant_name(&site.url);
            site.site_type = Some(site_type(site.template.as_deref()).to_string());
        }
        for file in &mut ctx.files {
            file.extension = file_extension(&file.name);
        }

        let store = ctx.store.as_ref();
        store
            .upsert(Table::Sites, ctx.sites.iter().cloned().map(Row::Site).collect())
            .await?;
        store
            .upsert(Table::Files, ctx.files.iter().cloned().map(Row::File).collect())
            .await?;
        Ok(())
    }
}

/// Size bucket of a file.
pub fn size_category(bytes: u64) -> &'static str {
    match bytes {
        b if b < MB => "Tiny",
        b if b < 10 * MB => "Small",
        b if b < 100 * MB => "Medium",
        b if b < GB => "Large",
        _ => "Huge",
    }
}

/// Age bucket by last modification relative to `now`.
pub fn age_category(modified_at: Timestamp, now: Timestamp) -> &'static str {
    match (now - modified_at).num_days() {
        d if d < 30 => "Recent",
        d if d < 90 => "Current",
        d if d < 365 => "Aging",
        d if d < 730 => "Old",
        _ => "Archived",
    }
}

/// Number of non-empty path segments.
pub fn path_depth(path: &str) -> u32 {
    path.split('/').filter(|s| !s.is_empty()).count() as u32
}

/// Adds size, age and depth categories and storage totals.
#[derive(Debug, Default)]
pub struct EnrichmentStage;

#[async_trait]
impl Stage for EnrichmentStage {
    fn name(&self) -> &str {
        ENRICHMENT
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let now = Utc::now();
        for folder in &mut ctx.folders {
            folder.path_depth = Some(path_depth(&folder.path));
        }
        let mut total_bytes: u64 = 0;
        for file in &mut ctx.files {
            file.size_category = Some(size_category(file.size_bytes).to_string());
            file.age_category = file
                .modified_at
                .map(|modified| age_category(modified, now).to_string());
            file.path_depth = Some(path_depth(&file.path));
            total_bytes += file.size_bytes;
        }

        let files = ctx.files.len();
        ctx.metrics.set_custom("total_storage_bytes", total_bytes as f64);
        ctx.metrics
            .set_custom("total_storage_gb", total_bytes as f64 / GB as f64);
        let average_mb = if files == 0 {
            0.0
        } else {
            total_bytes as f64 / files as f64 / MB as f64
        };
        ctx.metrics.set_custom("average_file_size_mb", average_mb);

        let store = ctx.store.as_ref();
        store
            .upsert(Table::Folders, ctx.folders.iter().cloned().map(Row::Folder).collect())
            .await?;
        store
            .upsert(Table::Files, ctx.files.iter().cloned().map(Row::File).collect())
            .await?;
        Ok(())
    }
}

/// Resolves every object's permissions, ancestors first, and persists the entries.
pub struct PermissionStage {
    resolver: Arc<PermissionResolver>,
}

impl PermissionStage {
    /// Stage driving `resolver`.
    pub fn new(resolver: Arc<PermissionResolver>) -> Self {
        PermissionStage { resolver }
    }
}

fn resolution_levels(ctx: &RunContext) -> Vec<Vec<ObjectRef>> {
    let mut folders_by_depth: BTreeMap<u32, Vec<ObjectRef>> = BTreeMap::new();
    for folder in &ctx.folders {
        folders_by_depth
            .entry(path_depth(&folder.path))
            .or_default()
            .push(folder.object_ref());
    }
    let mut levels = vec![
        ctx.sites.iter().map(Site::object_ref).collect(),
        ctx.libraries.iter().map(Library::object_ref).collect(),
    ];
    levels.extend(folders_by_depth.into_values());
    levels.push(ctx.files.iter().map(File::object_ref).collect());
    levels
}

#[async_trait]
impl Stage for PermissionStage {
    fn name(&self) -> &str {
        PERMISSIONS
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let index = ctx.index();
        let mut sets = Vec::new();
        let mut written: u64 = 0;

        for level in resolution_levels(ctx) {
            if level.is_empty() {
                continue;
            }
            let results = self.resolver.resolve_batch(&index, &level).await;
            let mut rows = Vec::new();
            for (object, result) in level.iter().zip(results) {
                match result {
                    Ok(Resolution { set, failures }) => {
                        ctx.errors.extend(failures.into_iter().map(|failure| {
                            RunError::new(PERMISSIONS, failure.scope, failure.message)
                        }));
                        rows.extend(
                            PermissionRow::from_set(&set, &object.site_id)
                                .into_iter()
                                .map(Row::Permission),
                        );
                        sets.push(set);
                    }
                    Err(e) => {
                        warn!(object_id = %object.id, kind = %object.kind, error = %e, "permission resolution failed");
                        ctx.errors.push(RunError::new(
                            PERMISSIONS,
                            format!("{}:{}", object.kind, object.id),
                            e,
                        ));
                    }
                }
            }
            debug!(objects = level.len(), rows = rows.len(), "permission level resolved");
            written += ctx.store.upsert(Table::Permissions, rows).await? as u64;
        }

        let totals = summarize(&sets);
        let stats = self.resolver.stats();
        info!(
            run_id = %ctx.run_id,
            objects = totals.objects,
            unique = totals.unique_objects,
            external_users = totals.external_users,
            anonymous_links = totals.anonymous_links,
            high_risk = totals.high_risk,
            cache_hits = stats.cache_hits,
            "permissions resolved"
        );
        ctx.metrics.set_custom("permission_rows", written as f64);
        ctx.metrics.set_custom("unique_permission_objects", totals.unique_objects as f64);
        ctx.metrics.set_custom("external_users", totals.external_users as f64);
        ctx.metrics.set_custom("anonymous_links", totals.anonymous_links as f64);
        ctx.metrics.set_custom("high_risk_objects", totals.high_risk as f64);
        ctx.metrics.set_custom("unknown_permission_entries", stats.unknown_entries as f64);

        ctx.permission_rows = written;
        ctx.permissions = sets;
        Ok(())
    }
}

/// Final batched write of every collection plus the run row.
pub struct StorageStage {
    governor: Governor,
    batch_size: usize,
}

impl StorageStage {
    /// Writes `batch_size` rows per call, at most `write_concurrency` calls at once.
    pub fn new(batch_size: usize, write_concurrency: usize) -> Self {
        StorageStage {
            governor: Governor::new("storage-write", write_concurrency),
            batch_size: batch_size.max(1),
        }
    }

    async fn write_batch(
        &self,
        store: &dyn InventoryStore,
        table: Table,
        rows: Vec<Row>,
    ) -> Result<usize, StageError> {
        let _slot = self.governor.acquire().await?;
        Ok(store.upsert(table, rows).await?)
    }
}

#[async_trait]
impl Stage for StorageStage {
    fn name(&self) -> &str {
        STORAGE
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        let collections: Vec<(Table, Vec<Row>)> = vec![
            (Table::Sites, ctx.sites.iter().cloned().map(Row::Site).collect()),
            (Table::Libraries, ctx.libraries.iter().cloned().map(Row::Library).collect()),
            (Table::Folders, ctx.folders.iter().cloned().map(Row::Folder).collect()),
            (Table::Files, ctx.files.iter().cloned().map(Row::File).collect()),
        ];
        let mut batches = Vec::new();
        for (table, rows) in collections {
            for chunk in rows.chunks(self.batch_size) {
                batches.push((table, chunk.to_vec()));
            }
        }

        let store = ctx.store.as_ref();
        let batch_count = batches.len();
        let results = join_all(
            batches
                .into_iter()
                .map(|(table, rows)| self.write_batch(store, table, rows)),
        )
        .await;
        let mut rows = 0;
        for result in results {
            rows += result?;
        }

        let started_at = match fetch_latest(store, Table::Runs, &ctx.run_id).await? {
            Some(Row::Run(previous)) => previous.started_at,
            _ => Utc::now(),
        };
        let record: RunRecord = ctx.run_record(started_at, RunStatus::Running);
        store.upsert(Table::Runs, vec![Row::Run(record)]).await?;

        let peak = self.governor.peak_in_flight();
        info!(run_id = %ctx.run_id, batches = batch_count, rows, peak_writers = peak, "inventory stored");
        Ok(())
    }
}

/// The six standard stages over `api`, sharing one gateway and cache.
pub fn standard_stages(
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn InventoryStore>,
    checkpoints: Arc<CheckpointStore>,
    config: &AuditConfig,
) -> Vec<Box<dyn Stage>> {
    let gateway = Arc::new(ApiGateway::from_config(
        api,
        config.rate_limit.clone(),
        config.retry.clone(),
    ));
    let cache = TypedCache::new(Arc::new(MemoryCache::new(config.cache.capacity)));

    let crawler = DiscoveryCrawler::new(
        Arc::clone(&gateway),
        store,
        checkpoints,
        cache.clone(),
        config.crawl.clone(),
        Duration::from_secs(config.cache.library_ttl_secs),
    );
    let resolver = PermissionResolver::new(
        gateway,
        cache,
        config.permissions.clone(),
        &config.cache,
    );

    vec![
        Box::new(DiscoveryStage::new(Arc::new(crawler))),
        Box::new(ValidationStage),
        Box::new(TransformationStage),
        Box::new(EnrichmentStage),
        Box::new(PermissionStage::new(Arc::new(resolver))),
        Box::new(StorageStage::new(
            config.store.batch_size,
            config.store.write_concurrency,
        )),
    ]
}

/// Builds the standard pipeline for `run_id` over `api`.
pub fn audit_pipeline(
    run_id: &str,
    api: Arc<dyn RemoteApi>,
    store: Arc<dyn InventoryStore>,
    config: &AuditConfig,
) -> Pipeline {
    let checkpoints = Arc::new(CheckpointStore::new(run_id, Arc::clone(&store)));
    standard_stages(api, Arc::clone(&store), Arc::clone(&checkpoints), config)
        .into_iter()
        .fold(
            Pipeline::new(store, checkpoints, config.run.clone()),
            Pipeline::with_stage,
        )
}

/// Latest saved status of `run_id`, if the run ever started.
pub async fn run_status(
    run_id: &str,
    store: Arc<dyn InventoryStore>,
) -> Result<Option<RunStatus>, StoreError> {
    CheckpointStore::new(run_id, store)
        .load(&CheckpointKind::PipelineStatus)
        .await
}
