//! Discovery crawler.
//!
//! Enumerates sites through the incremental listing, then each site's libraries and, per
//! library, the folder tree breadth-first from an explicit work queue. Two governors bound
//! the fan-out: one admits site traversals, the other remote calls across all sites.
//! Failures below the site listing are recorded in the [`CrawlReport`] and never abort
//! sibling branches.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use spaudit_resilience::{AcquirePolicy, Governor, GovernorError, GovernorStats};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, TypedCache};
use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::config::CrawlConfig;
use crate::error::{CrawlError, GatewayError, StoreError};
use crate::gateway::ApiGateway;
use crate::model::{File, Folder, Library, Row, RunError, Site, Table, Timestamp};
use crate::remote::{DriveItem, ItemKind, RemoteLibrary, RemoteSite, SiteListing};
use crate::store::{query_all, InventoryStore, RowFilter};

const STAGE: &str = "discovery";

const PERSONAL_URL_MARKERS: [&str; 3] = ["/personal/", "-my.sharepoint.com", "/portals/personal/"];
const PERSONAL_TEMPLATES: [&str; 2] = ["SPSPERS#0", "SPSPERS#10"];
const PERSONAL_NAME_MARKERS: [&str; 3] = ["onedrive", "personal workspace", "my site"];

const SYSTEM_TEMPLATES: [&str; 8] = [
    "SPSMSITEHOST",
    "REDIRECTSITE",
    "TEAMCHANNEL#1",
    "APPCATALOG#0",
    "SRCHCEN#0",
    "SPSCOMMU#0",
    "ENTERWIKI#0",
    "TENANTADMIN#0",
];

const INACTIVE_NAME_MARKERS: [&str; 30] = [
    "archived", "_archive", "archive_",
    "test-", "_test", "test_", "-test",
    "demo-", "_demo", "demo_", "-demo",
    "old-", "_old", "old_", "-old",
    "backup", "_backup", "backup_",
    "template", "_template", "template_",
    "temp-", "_temp", "temp_",
    "deleted", "_deleted", "deleted_",
    "inactive", "deprecated", "_deprecated",
];

/// Sites untouched for longer than this are treated as inactive in active-only mode.
const STALE_AFTER_DAYS: i64 = 730;

/// Why a listed site is left out of the crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Personal (OneDrive) site.
    Personal,
    /// System or infrastructure template.
    SystemTemplate,
    /// Archived flag set.
    Archived,
    /// Deleted flag set.
    Deleted,
    /// Title carries an inactive-site marker.
    InactiveName,
    /// Not modified within two years.
    Stale,
    /// Not on the configured allow-list.
    NotAllowed,
}

impl Exclusion {
    /// Stable snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Exclusion::Personal => "personal",
            Exclusion::SystemTemplate => "system_template",
            Exclusion::Archived => "archived",
            Exclusion::Deleted => "deleted",
            Exclusion::InactiveName => "inactive_name",
            Exclusion::Stale => "stale",
            Exclusion::NotAllowed => "not_allowed",
        }
    }
}

/// Lower-cases `url` and strips the scheme and trailing slashes.
pub fn normalize_site_url(url: &str) -> String {
    let url = url.trim().to_lowercase();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url.as_str());
    url.trim_end_matches('/').to_string()
}

/// Client-side site selection.
#[derive(Debug, Clone)]
pub struct SiteFilter {
    active_only: bool,
    include_personal: bool,
    allowlist: BTreeSet<String>,
    now: Timestamp,
}

impl SiteFilter {
    /// Filter for the given crawl settings, evaluated against the current time.
    pub fn new(config: &CrawlConfig) -> Self {
        SiteFilter {
            active_only: config.active_only,
            include_personal: config.include_personal_sites,
            allowlist: config
                .site_allowlist
                .iter()
                .map(|url| normalize_site_url(url))
                .collect(),
            now: Utc::now(),
        }
    }

    /// Evaluates staleness against `now` instead of the current time.
    pub fn with_now(mut self, now: Timestamp) -> Self {
        self.now = now;
        self
    }

    /// Reason to skip `site`, or `None` to crawl it.
    pub fn exclusion(&self, site: &RemoteSite) -> Option<Exclusion> {
        if !self.allowlist.is_empty() && !self.allowlist.contains(&normalize_site_url(&site.url)) {
            return Some(Exclusion::NotAllowed);
        }
        let template = site.template.as_deref().unwrap_or_default().to_uppercase();
        let title = site.title.to_lowercase();

        if !self.include_personal && is_personal(&site.url, &template, &title) {
            return Some(Exclusion::Personal);
        }
        if SYSTEM_TEMPLATES.contains(&template.as_str()) {
            return Some(Exclusion::SystemTemplate);
        }
        if site.is_deleted {
            return Some(Exclusion::Deleted);
        }
        if site.is_archived {
            return Some(Exclusion::Archived);
        }
        if INACTIVE_NAME_MARKERS.iter().any(|m| title.contains(m)) {
            return Some(Exclusion::InactiveName);
        }
        if self.active_only {
            if let Some(modified) = site.modified_at {
                if (self.now - modified).num_days() > STALE_AFTER_DAYS {
                    return Some(Exclusion::Stale);
                }
            }
        }
        None
    }
}

fn is_personal(url: &str, template: &str, title: &str) -> bool {
    let url = url.to_lowercase();
    PERSONAL_URL_MARKERS.iter().any(|m| url.contains(m))
        || PERSONAL_TEMPLATES.contains(&template)
        || PERSONAL_NAME_MARKERS.iter().any(|m| title.contains(m))
}

/// Outcome of one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Ids of the sites selected for this run, in id order.
    pub site_ids: Vec<String>,
    /// Sites traversed in this invocation.
    pub sites_crawled: usize,
    /// Sites skipped because an earlier invocation completed them.
    pub sites_skipped: usize,
    /// Listed sites left out by the site filter.
    pub sites_filtered: usize,
    /// Sites traversed with at least one branch error.
    pub sites_with_errors: usize,
    /// Libraries persisted.
    pub libraries: usize,
    /// Folders persisted.
    pub folders: usize,
    /// Files persisted.
    pub files: usize,
    /// Folders not descended into because of the depth cap.
    pub depth_capped: usize,
    /// Branch-local failures.
    pub errors: Vec<RunError>,
    /// The active-only listing failed and a full listing was used.
    pub used_fallback: bool,
    /// Sites were listed incrementally from a saved cursor.
    pub resumed_from_cursor: bool,
}

#[derive(Debug, Error)]
enum BranchError {
    #[error(transparent)]
    Remote(#[from] GatewayError),

    #[error(transparent)]
    Slot(#[from] GovernorError),
}

#[derive(Debug, Default)]
struct BranchTally {
    libraries: usize,
    folders: usize,
    files: usize,
    depth_capped: usize,
    errors: Vec<RunError>,
}

impl BranchTally {
    fn failed(scope: String, message: impl std::fmt::Display) -> Self {
        BranchTally {
            errors: vec![RunError::new(STAGE, scope, message)],
            ..BranchTally::default()
        }
    }

    fn merge(&mut self, other: BranchTally) {
        self.libraries += other.libraries;
        self.folders += other.folders;
        self.files += other.files;
        self.depth_capped += other.depth_capped;
        self.errors.extend(other.errors);
    }
}

enum SiteOutcome {
    Skipped,
    Crawled(BranchTally),
}

/// One pending child listing.
#[derive(Debug, Clone)]
struct WorkItem {
    /// Folder to list; `None` for the library root.
    item_id: Option<String>,
    path: String,
    /// Parent of the folder, or the site for the library root.
    parent_id: String,
    depth: u32,
}

type SiteListingResult = (Vec<RemoteSite>, Option<String>);

/// Site, library and folder-tree crawler.
pub struct DiscoveryCrawler {
    gateway: Arc<ApiGateway>,
    store: Arc<dyn InventoryStore>,
    checkpoints: Arc<CheckpointStore>,
    cache: TypedCache,
    config: CrawlConfig,
    library_ttl: Duration,
    slot_policy: AcquirePolicy,
    site_governor: Governor,
    call_governor: Arc<Governor>,
}

impl DiscoveryCrawler {
    /// Creates a crawler with its own site and remote-call governors.
    pub fn new(
        gateway: Arc<ApiGateway>,
        store: Arc<dyn InventoryStore>,
        checkpoints: Arc<CheckpointStore>,
        cache: TypedCache,
        config: CrawlConfig,
        library_ttl: Duration,
    ) -> Self {
        let call_governor = Arc::new(Governor::new("remote-calls", config.max_concurrent_calls));
        DiscoveryCrawler {
            gateway,
            store,
            checkpoints,
            cache,
            slot_policy: config.slot_policy(),
            site_governor: Governor::new("sites", config.max_concurrent_sites),
            call_governor,
            config,
            library_ttl,
        }
    }

    /// Uses a remote-call governor shared with other components.
    pub fn with_call_governor(mut self, governor: Arc<Governor>) -> Self {
        self.call_governor = governor;
        self
    }

    /// Counters of the site and remote-call governors.
    pub fn governor_stats(&self) -> Vec<GovernorStats> {
        vec![self.site_governor.stats(), self.call_governor.stats()]
    }

    /// Discovers and persists sites, then traverses every site not yet completed in this
    /// run.
    ///
    /// Only a failed site listing or a storage failure is returned as an error.
    pub async fn crawl(&self) -> Result<CrawlReport, CrawlError> {
        let mut report = CrawlReport::default();
        let sites = self.discover_sites(&mut report).await?;
        report.site_ids = sites.iter().map(|s| s.site_id.clone()).collect();
        info!(
            run_id = %self.checkpoints.run_id(),
            sites = sites.len(),
            filtered = report.sites_filtered,
            fallback = report.used_fallback,
            "site discovery complete"
        );

        let outcomes = join_all(sites.iter().map(|site| self.crawl_site_admitted(site))).await;

        let mut fatal = None;
        for (site, outcome) in sites.iter().zip(outcomes) {
            match outcome {
                Ok(SiteOutcome::Skipped) => report.sites_skipped += 1,
                Ok(SiteOutcome::Crawled(tally)) => {
                    report.sites_crawled += 1;
                    if !tally.errors.is_empty() {
                        report.sites_with_errors += 1;
                    }
                    report.libraries += tally.libraries;
                    report.folders += tally.folders;
                    report.files += tally.files;
                    report.depth_capped += tally.depth_capped;
                    report.errors.extend(tally.errors);
                }
                Err(e) => {
                    error!(site_id = %site.site_id, error = %e, "site crawl aborted");
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            run_id = %self.checkpoints.run_id(),
            crawled = report.sites_crawled,
            skipped = report.sites_skipped,
            libraries = report.libraries,
            folders = report.folders,
            files = report.files,
            errors = report.errors.len(),
            "crawl complete"
        );
        Ok(report)
    }

    async fn discover_sites(&self, report: &mut CrawlReport) -> Result<Vec<Site>, CrawlError> {
        let filter = SiteFilter::new(&self.config);
        let cursor: Option<String> = self
            .checkpoints
            .load(&CheckpointKind::SitesDeltaCursor)
            .await?;
        let known: Option<Vec<String>> = self
            .checkpoints
            .load(&CheckpointKind::DiscoveredSites)
            .await?;

        let mut sites: BTreeMap<String, Site> = BTreeMap::new();
        let (listed, delta_token) = match (cursor, known) {
            (Some(cursor), Some(known)) => {
                let ids: BTreeSet<String> = known.into_iter().collect();
                let rows = query_all(self.store.as_ref(), Table::Sites, RowFilter::SiteIds(ids)).await?;
                for row in rows {
                    if let Row::Site(site) = row {
                        sites.insert(site.site_id.clone(), site);
                    }
                }
                info!(known = sites.len(), "listing site changes since saved cursor");
                report.resumed_from_cursor = true;
                self.list_with_fallback(Some(cursor), report).await?
            }
            _ => self.list_with_fallback(None, report).await?,
        };

        let mut seen = BTreeSet::new();
        for remote in listed {
            if !seen.insert(remote.id.clone()) {
                debug!(site_id = %remote.id, "duplicate site in listing");
                continue;
            }
            match filter.exclusion(&remote) {
                Some(reason) => {
                    debug!(site_id = %remote.id, url = %remote.url, reason = reason.as_str(), "site excluded");
                    report.sites_filtered += 1;
                    sites.remove(&remote.id);
                }
                None => {
                    sites.insert(remote.id.clone(), to_site(&remote));
                }
            }
        }

        let sites: Vec<Site> = sites.into_values().collect();
        if !sites.is_empty() {
            self.store
                .upsert(Table::Sites, sites.iter().cloned().map(Row::Site).collect())
                .await?;
        }
        let ids: Vec<String> = sites.iter().map(|s| s.site_id.clone()).collect();
        self.checkpoints
            .save(&CheckpointKind::DiscoveredSites, &ids)
            .await?;
        if let Some(token) = delta_token {
            self.checkpoints
                .save(&CheckpointKind::SitesDeltaCursor, &token)
                .await?;
        }
        Ok(sites)
    }

    async fn list_with_fallback(
        &self,
        delta_token: Option<String>,
        report: &mut CrawlReport,
    ) -> Result<SiteListingResult, CrawlError> {
        match self.list_sites(delta_token.clone(), self.config.active_only).await {
            Ok(listing) => Ok(listing),
            Err(e) if self.config.active_only && !e.is_circuit_open() => {
                warn!(error = %e, "active-only site listing failed, falling back to a full listing");
                report.used_fallback = true;
                self.list_sites(delta_token, false)
                    .await
                    .map_err(CrawlError::SiteListing)
            }
            Err(e) => Err(CrawlError::SiteListing(e)),
        }
    }

    async fn list_sites(
        &self,
        delta_token: Option<String>,
        active_only: bool,
    ) -> Result<SiteListingResult, GatewayError> {
        let mut listing = SiteListing {
            delta_token,
            page_token: None,
            active_only,
        };
        let mut sites = Vec::new();
        loop {
            let page = self.gateway.list_sites(&listing).await?;
            debug!(sites = page.sites.len(), more = page.next_page.is_some(), "site page");
            sites.extend(page.sites);
            match page.next_page {
                Some(next) => listing.page_token = Some(next),
                None => return Ok((sites, page.delta_token)),
            }
        }
    }

    async fn crawl_site_admitted(&self, site: &Site) -> Result<SiteOutcome, CrawlError> {
        if self.checkpoints.is_site_completed(&site.site_id).await? {
            info!(site_id = %site.site_id, "site already crawled, skipping");
            return Ok(SiteOutcome::Skipped);
        }
        let scope = format!("site:{}", site.site_id);
        let _slot = match self.site_governor.acquire().await {
            Ok(slot) => slot,
            Err(e) => return Ok(SiteOutcome::Crawled(BranchTally::failed(scope, e))),
        };

        let timeout = self.config.site_timeout();
        let tally = match tokio::time::timeout(timeout, self.crawl_site(site)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(site_id = %site.site_id, ?timeout, "site crawl timed out");
                BranchTally::failed(scope, format!("site crawl timed out after {:?}", timeout))
            }
        };

        if tally.errors.is_empty() {
            self.checkpoints.mark_site_completed(&site.site_id).await?;
            info!(
                site_id = %site.site_id,
                libraries = tally.libraries,
                folders = tally.folders,
                files = tally.files,
                "site crawled"
            );
        } else {
            warn!(site_id = %site.site_id, errors = tally.errors.len(), "site crawled with errors");
        }
        Ok(SiteOutcome::Crawled(tally))
    }

    async fn crawl_site(&self, site: &Site) -> Result<BranchTally, StoreError> {
        let mut tally = BranchTally::default();
        let libraries = match self.site_libraries(&site.site_id).await {
            Ok(libraries) => libraries,
            Err(e) => {
                warn!(site_id = %site.site_id, error = %e, "library listing failed");
                tally.errors.push(RunError::new(STAGE, format!("site:{}", site.site_id), e));
                return Ok(tally);
            }
        };

        if !libraries.is_empty() {
            let rows = libraries
                .iter()
                .map(|l| Row::Library(to_library(&site.site_id, l)))
                .collect();
            self.store.upsert(Table::Libraries, rows).await?;
        }
        tally.libraries = libraries.len();

        let results = join_all(
            libraries
                .iter()
                .map(|library| self.crawl_library(&site.site_id, library)),
        )
        .await;
        for result in results {
            tally.merge(result?);
        }
        Ok(tally)
    }

    async fn site_libraries(&self, site_id: &str) -> Result<Vec<RemoteLibrary>, BranchError> {
        let key = CacheKey::SiteLibraries {
            site_id: site_id.to_string(),
        };
        if let Some(libraries) = self.cache.get::<Vec<RemoteLibrary>>(&key).await {
            debug!(site_id, libraries = libraries.len(), "library listing from cache");
            return Ok(libraries);
        }
        let libraries = {
            let _slot = self.call_governor.acquire_with_backoff(&self.slot_policy).await?;
            self.gateway.list_libraries(site_id).await?
        };
        self.cache.set(key, &libraries, self.library_ttl).await;
        Ok(libraries)
    }

    /// Breadth-first traversal of one library from an explicit queue, processed in waves
    /// of at most `max_concurrent_calls` listings.
    async fn crawl_library(
        &self,
        site_id: &str,
        library: &RemoteLibrary,
    ) -> Result<BranchTally, StoreError> {
        let mut tally = BranchTally::default();
        let mut queue = VecDeque::from([WorkItem {
            item_id: None,
            path: format!("/{}", library.name),
            parent_id: site_id.to_string(),
            depth: 0,
        }]);
        let batch_size = self.config.batch_size.max(1);
        let wave_size = self.config.max_concurrent_calls.max(1);
        let mut folders: Vec<Row> = Vec::new();
        let mut files: Vec<Row> = Vec::new();

        while !queue.is_empty() {
            let wave: Vec<WorkItem> = queue.drain(..queue.len().min(wave_size)).collect();
            let pages = join_all(
                wave.iter()
                    .map(|work| self.fetch_children(&library.id, work.item_id.as_deref())),
            )
            .await;

            for (work, page) in wave.into_iter().zip(pages) {
                let parent = work.item_id.clone().unwrap_or_else(|| library.id.clone());
                let items = match page {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(
                            site_id,
                            library_id = %library.id,
                            folder_id = %parent,
                            parent_id = %work.parent_id,
                            path = %work.path,
                            error = %e,
                            "folder listing failed, skipping branch"
                        );
                        tally.errors.push(RunError::new(STAGE, format!("folder:{}", parent), e));
                        continue;
                    }
                };

                for item in items {
                    let path = format!("{}/{}", work.path, item.name);
                    if let ItemKind::Folder { child_count } = &item.kind {
                        if *child_count != Some(0) {
                            if work.depth < self.config.max_depth {
                                queue.push_back(WorkItem {
                                    item_id: Some(item.id.clone()),
                                    path: path.clone(),
                                    parent_id: parent.clone(),
                                    depth: work.depth + 1,
                                });
                            } else {
                                debug!(folder_id = %item.id, %path, "depth cap reached");
                                tally.depth_capped += 1;
                            }
                        }
                    }
                    match item_row(site_id, &library.id, &parent, path, item) {
                        row @ Row::Folder(_) => {
                            tally.folders += 1;
                            folders.push(row);
                        }
                        row => {
                            tally.files += 1;
                            files.push(row);
                        }
                    }
                }

                if folders.len() >= batch_size {
                    self.store
                        .upsert(Table::Folders, std::mem::take(&mut folders))
                        .await?;
                }
                if files.len() >= batch_size {
                    self.store.upsert(Table::Files, std::mem::take(&mut files)).await?;
                }
            }
        }

        if !folders.is_empty() {
            self.store.upsert(Table::Folders, folders).await?;
        }
        if !files.is_empty() {
            self.store.upsert(Table::Files, files).await?;
        }
        debug!(
            site_id,
            library_id = %library.id,
            folders = tally.folders,
            files = tally.files,
            "library crawled"
        );
        Ok(tally)
    }

    /// Every child of one folder, following pagination; partial pages are discarded on
    /// failure.
    async fn fetch_children(
        &self,
        library_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<DriveItem>, BranchError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = {
                let _slot = self.call_governor.acquire_with_backoff(&self.slot_policy).await?;
                self.gateway
                    .list_children(library_id, parent_id, page_token.as_deref())
                    .await?
            };
            debug!(library_id, parent_id, items = page.items.len(), "children page");
            items.extend(page.items);
            match page.next_page {
                Some(next) => page_token = Some(next),
                None => return Ok(items),
            }
        }
    }
}

impl std::fmt::Debug for DiscoveryCrawler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCrawler")
            .field("run_id", &self.checkpoints.run_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn to_site(remote: &RemoteSite) -> Site {
    Site {
        site_id: remote.id.clone(),
        url: remote.url.clone(),
        title: remote.title.clone(),
        template: remote.template.clone(),
        created_at: remote.created_at,
        modified_at: remote.modified_at,
        storage_used: remote.storage_used,
        tenant_name: None,
        site_type: None,
    }
}

fn to_library(site_id: &str, remote: &RemoteLibrary) -> Library {
    Library {
        library_id: remote.id.clone(),
        site_id: site_id.to_string(),
        name: remote.name.clone(),
        web_url: remote.web_url.clone(),
        created_at: remote.created_at,
        modified_at: remote.modified_at,
        item_count: remote.item_count,
        has_unique_permissions: remote.has_unique_permissions,
    }
}

fn item_row(site_id: &str, library_id: &str, parent_id: &str, path: String, item: DriveItem) -> Row {
    match item.kind {
        ItemKind::Folder { child_count } => Row::Folder(Folder {
            folder_id: item.id,
            library_id: library_id.to_string(),
            site_id: site_id.to_string(),
            parent_id: parent_id.to_string(),
            name: item.name,
            path,
            child_count,
            has_unique_permissions: item.has_unique_permissions,
            created_at: item.created_at,
            modified_at: item.modified_at,
            path_depth: None,
        }),
        ItemKind::File { size, content_type } => Row::File(File {
            file_id: item.id,
            library_id: library_id.to_string(),
            site_id: site_id.to_string(),
            parent_id: parent_id.to_string(),
            name: item.name,
            path,
            size_bytes: size,
            content_type,
            created_at: item.created_at,
            modified_at: item.modified_at,
            created_by: item.created_by,
            modified_by: item.modified_by,
            has_unique_permissions: item.has_unique_permissions,
            extension: None,
            size_category: None,
            age_category: None,
            path_depth: None,
        }),
    }
}
