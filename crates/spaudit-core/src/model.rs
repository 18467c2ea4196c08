//! Inventory, permission and run records.
//!
//! Every remote entity is normalised into one of these typed records at the remote
//! boundary; nothing past the gateway handles raw payloads.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// UTC timestamp used throughout the model.
pub type Timestamp = DateTime<Utc>;

/// Kind of inventory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A site collection.
    Site,
    /// A document library.
    Library,
    /// A folder inside a library.
    Folder,
    /// A file inside a library.
    File,
}

impl ObjectKind {
    /// Stable lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Site => "site",
            ObjectKind::Library => "library",
            ObjectKind::Folder => "folder",
            ObjectKind::File => "file",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A site collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Stable remote id.
    pub site_id: String,
    /// Absolute URL.
    pub url: String,
    /// Display title.
    pub title: String,
    /// Web template code, e.g. `STS#3`.
    pub template: Option<String>,
    /// Creation time.
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    pub modified_at: Option<Timestamp>,
    /// Storage used in bytes.
    pub storage_used: Option<u64>,
    /// Tenant name derived from the URL host.
    pub tenant_name: Option<String>,
    /// Human-readable site type derived from the template.
    pub site_type: Option<String>,
}

/// A document library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    /// Stable remote id.
    pub library_id: String,
    /// Owning site.
    pub site_id: String,
    /// Display name.
    pub name: String,
    /// Absolute URL.
    pub web_url: Option<String>,
    /// Creation time.
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    pub modified_at: Option<Timestamp>,
    /// Item count reported by the remote.
    pub item_count: Option<u64>,
    /// Whether the library breaks inheritance, when known.
    pub has_unique_permissions: Option<bool>,
}

/// A folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    /// Stable remote id.
    pub folder_id: String,
    /// Owning library.
    pub library_id: String,
    /// Owning site.
    pub site_id: String,
    /// Parent folder id, or the library id for top-level folders.
    pub parent_id: String,
    /// Display name.
    pub name: String,
    /// Logical path starting with the library name.
    pub path: String,
    /// Direct child count, when reported.
    pub child_count: Option<u64>,
    /// Whether the folder breaks inheritance, when known.
    pub has_unique_permissions: Option<bool>,
    /// Creation time.
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    pub modified_at: Option<Timestamp>,
    /// Number of path segments.
    pub path_depth: Option<u32>,
}

/// A file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    /// Stable remote id.
    pub file_id: String,
    /// Owning library.
    pub library_id: String,
    /// Owning site.
    pub site_id: String,
    /// Parent folder id, or the library id for files at the library root.
    pub parent_id: String,
    /// Display name.
    pub name: String,
    /// Logical path starting with the library name.
    pub path: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// MIME type, when reported.
    pub content_type: Option<String>,
    /// Creation time.
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    pub modified_at: Option<Timestamp>,
    /// Author.
    pub created_by: Option<String>,
    /// Last editor.
    pub modified_by: Option<String>,
    /// Whether the file breaks inheritance, when known.
    pub has_unique_permissions: Option<bool>,
    /// Lower-case extension without the dot.
    pub extension: Option<String>,
    /// Size bucket.
    pub size_category: Option<String>,
    /// Age bucket by last modification.
    pub age_category: Option<String>,
    /// Number of path segments.
    pub path_depth: Option<u32>,
}

/// Position of an object in the site tree, as seen by the permission resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object id.
    pub id: String,
    /// Logical path or URL.
    pub path: String,
    /// Owning site.
    pub site_id: String,
    /// Owning library; `None` for sites.
    pub library_id: Option<String>,
    /// Parent id: site for libraries, folder or library for folders and files.
    pub parent_id: Option<String>,
    /// Pre-known unique-permissions flag.
    pub has_unique_permissions: Option<bool>,
}

impl Site {
    /// Resolver view of this site.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::Site,
            id: self.site_id.clone(),
            path: self.url.clone(),
            site_id: self.site_id.clone(),
            library_id: None,
            parent_id: None,
            has_unique_permissions: Some(true),
        }
    }
}

impl Library {
    /// Resolver view of this library.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::Library,
            id: self.library_id.clone(),
            path: format!("/{}", self.name),
            site_id: self.site_id.clone(),
            library_id: Some(self.library_id.clone()),
            parent_id: Some(self.site_id.clone()),
            has_unique_permissions: self.has_unique_permissions,
        }
    }
}

impl Folder {
    /// Resolver view of this folder.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::Folder,
            id: self.folder_id.clone(),
            path: self.path.clone(),
            site_id: self.site_id.clone(),
            library_id: Some(self.library_id.clone()),
            parent_id: Some(self.parent_id.clone()),
            has_unique_permissions: self.has_unique_permissions,
        }
    }
}

impl File {
    /// Resolver view of this file.
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: ObjectKind::File,
            id: self.file_id.clone(),
            path: self.path.clone(),
            site_id: self.site_id.clone(),
            library_id: Some(self.library_id.clone()),
            parent_id: Some(self.parent_id.clone()),
            has_unique_permissions: self.has_unique_permissions,
        }
    }
}

/// Kind of principal holding a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    /// Individual internal user.
    User,
    /// Security or mail-enabled group.
    Group,
    /// Platform-native group.
    SharePointGroup,
    /// Application principal.
    Application,
    /// Anonymous sharing link.
    AnonymousLink,
    /// User outside the owning organisation.
    External,
}

/// Login-name markers of guest accounts.
pub const EXTERNAL_MARKERS: [&str; 3] = ["#ext#", "_external_", "guest"];

/// Returns true if `login` carries a guest/external marker.
pub fn has_external_marker(login: &str) -> bool {
    let login = login.to_lowercase();
    EXTERNAL_MARKERS.iter().any(|marker| login.contains(marker))
}

impl PrincipalKind {
    /// Maps a remote principal-type code.
    ///
    /// 1 is a user (external if the login carries a guest marker), 2 and 4 are groups, 8 is
    /// a platform-native group, 16 an application. Unmapped codes are treated as users.
    pub fn from_code(code: i64, login: &str) -> Self {
        match code {
            2 | 4 => PrincipalKind::Group,
            8 => PrincipalKind::SharePointGroup,
            16 => PrincipalKind::Application,
            _ if has_external_marker(login) => PrincipalKind::External,
            _ => PrincipalKind::User,
        }
    }

    /// Stable snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
            PrincipalKind::SharePointGroup => "sharepoint_group",
            PrincipalKind::Application => "application",
            PrincipalKind::AnonymousLink => "anonymous_link",
            PrincipalKind::External => "external",
        }
    }
}

/// One (principal, permission level) grant on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    /// Principal id.
    pub principal_id: String,
    /// Principal display name.
    pub principal_name: String,
    /// Principal kind.
    pub principal_kind: PrincipalKind,
    /// Login name or e-mail, when known.
    pub login: Option<String>,
    /// Permission level, e.g. `Read` or `Edit`.
    pub permission_level: String,
    /// Whether the grant is inherited from an ancestor.
    pub is_inherited: bool,
    /// When the grant was observed.
    pub granted_at: Option<Timestamp>,
    /// Group through which the grant reaches this principal.
    pub granted_by: Option<String>,
    /// Id of the ancestor the grant is inherited from.
    pub inheritance_source: Option<String>,
    /// Principal is outside the owning organisation.
    pub is_external: bool,
    /// Grant is an anonymous sharing link.
    pub is_anonymous_link: bool,
}

/// Principal id of the placeholder entry used when no permissions could be determined.
pub const UNKNOWN_PRINCIPAL: &str = "unknown";

impl PermissionEntry {
    /// Placeholder entry for an object whose rules could not be determined.
    pub fn unknown(now: Timestamp) -> Self {
        PermissionEntry {
            principal_id: UNKNOWN_PRINCIPAL.to_string(),
            principal_name: "Unknown".to_string(),
            principal_kind: PrincipalKind::User,
            login: None,
            permission_level: "Unknown".to_string(),
            is_inherited: false,
            granted_at: Some(now),
            granted_by: None,
            inheritance_source: None,
            is_external: false,
            is_anonymous_link: false,
        }
    }

    /// Copy of this entry re-marked as inherited from `source`.
    pub fn inherited_from(&self, source: &str) -> Self {
        PermissionEntry {
            is_inherited: true,
            inheritance_source: Some(source.to_string()),
            ..self.clone()
        }
    }

    /// Domain part of the login, when it is an address.
    pub fn email_domain(&self) -> Option<String> {
        let login = self.login.as_deref()?;
        let (_, domain) = login.rsplit_once('@')?;
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_lowercase())
        }
    }
}

/// Resolved permission state of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    /// Object kind.
    pub object_kind: ObjectKind,
    /// Object id.
    pub object_id: String,
    /// Object path.
    pub object_path: String,
    /// Whether the object holds its own rules.
    pub has_unique_permissions: bool,
    /// Ordered grants.
    pub entries: Vec<PermissionEntry>,
    /// Distinct external principals among the entries.
    pub external_user_count: u32,
    /// Anonymous-link entries.
    pub anonymous_link_count: u32,
    /// Nearest ancestor with unique rules, for inherited sets.
    pub inheritance_source_id: Option<String>,
    /// Path of that ancestor.
    pub inheritance_source_path: Option<String>,
    /// Resolution time.
    pub resolved_at: Timestamp,
}

impl PermissionSet {
    /// Creates a set and computes its counters.
    pub fn new(
        object: &ObjectRef,
        has_unique_permissions: bool,
        entries: Vec<PermissionEntry>,
        resolved_at: Timestamp,
    ) -> Self {
        let mut set = PermissionSet {
            object_kind: object.kind,
            object_id: object.id.clone(),
            object_path: object.path.clone(),
            has_unique_permissions,
            entries,
            external_user_count: 0,
            anonymous_link_count: 0,
            inheritance_source_id: None,
            inheritance_source_path: None,
            resolved_at,
        };
        set.recount();
        set
    }

    fn recount(&mut self) {
        let external: BTreeSet<&str> = self
            .entries
            .iter()
            .filter(|e| e.is_external && !e.is_anonymous_link)
            .map(|e| e.principal_id.as_str())
            .collect();
        self.external_user_count = external.len() as u32;
        self.anonymous_link_count =
            self.entries.iter().filter(|e| e.is_anonymous_link).count() as u32;
    }

    /// Exposure of this object to principals outside the organisation.
    pub fn exposure(&self) -> ExposureSummary {
        let external_domains: BTreeSet<String> = self
            .entries
            .iter()
            .filter(|e| e.is_external)
            .filter_map(PermissionEntry::email_domain)
            .collect();
        ExposureSummary {
            external_users: self.external_user_count,
            anonymous_links: self.anonymous_link_count,
            external_domains: external_domains.into_iter().collect(),
            risk_level: RiskLevel::assess(self.external_user_count, self.anonymous_link_count),
        }
    }
}

/// Exposure risk of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No external principals.
    None,
    /// A few external principals.
    Low,
    /// More than ten external principals.
    Medium,
    /// At least one anonymous link.
    High,
}

impl RiskLevel {
    /// Classifies by external-user and anonymous-link counts.
    pub fn assess(external_users: u32, anonymous_links: u32) -> Self {
        if anonymous_links > 0 {
            RiskLevel::High
        } else if external_users > 10 {
            RiskLevel::Medium
        } else if external_users > 0 {
            RiskLevel::Low
        } else {
            RiskLevel::None
        }
    }
}

/// Exposure of one permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureSummary {
    /// Distinct external principals.
    pub external_users: u32,
    /// Anonymous links.
    pub anonymous_links: u32,
    /// Sorted external e-mail domains.
    pub external_domains: Vec<String>,
    /// Risk classification.
    pub risk_level: RiskLevel,
}

/// Aggregate exposure over many sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposureTotals {
    /// Sets examined.
    pub objects: usize,
    /// Sets with unique rules.
    pub unique_objects: usize,
    /// Sum of external-user counts.
    pub external_users: u64,
    /// Sum of anonymous-link counts.
    pub anonymous_links: u64,
    /// Sets classified High.
    pub high_risk: usize,
    /// Sets classified Medium.
    pub medium_risk: usize,
    /// Sets classified Low.
    pub low_risk: usize,
}

/// Aggregates exposure counts over `sets`.
pub fn summarize<'a>(sets: impl IntoIterator<Item = &'a PermissionSet>) -> ExposureTotals {
    let mut totals = ExposureTotals::default();
    for set in sets {
        totals.objects += 1;
        if set.has_unique_permissions {
            totals.unique_objects += 1;
        }
        totals.external_users += u64::from(set.external_user_count);
        totals.anonymous_links += u64::from(set.anonymous_link_count);
        match RiskLevel::assess(set.external_user_count, set.anonymous_link_count) {
            RiskLevel::High => totals.high_risk += 1,
            RiskLevel::Medium => totals.medium_risk += 1,
            RiskLevel::Low => totals.low_risk += 1,
            RiskLevel::None => {}
        }
    }
    totals
}

/// A user reached through group expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Directory id.
    pub id: String,
    /// Display name.
    pub display_name: String,
    /// E-mail or user principal name.
    pub login: Option<String>,
    /// Outside the organisation.
    pub is_external: bool,
}

/// Transitive expansion of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    /// Group id.
    pub group_id: String,
    /// Group display name.
    pub group_name: String,
    /// Distinct user members, direct or through nested groups.
    pub members: Vec<GroupMember>,
    /// Ids of nested groups encountered.
    pub nested_group_ids: Vec<String>,
    /// Number of distinct users.
    pub total_user_count: u32,
    /// Expansion time.
    pub expanded_at: Timestamp,
}

/// Storage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    /// Site rows.
    Sites,
    /// Library rows.
    Libraries,
    /// Folder rows.
    Folders,
    /// File rows.
    Files,
    /// Permission entry rows.
    Permissions,
    /// Run status rows.
    Runs,
}

impl Table {
    /// Stable lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Sites => "sites",
            Table::Libraries => "libraries",
            Table::Folders => "folders",
            Table::Files => "files",
            Table::Permissions => "permissions",
            Table::Runs => "runs",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One permission entry tagged with the object it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRow {
    /// Object kind.
    pub object_kind: ObjectKind,
    /// Object id.
    pub object_id: String,
    /// Owning site.
    pub site_id: String,
    /// The grant.
    pub entry: PermissionEntry,
}

impl PermissionRow {
    /// Rows for every entry of `set`.
    pub fn from_set(set: &PermissionSet, site_id: &str) -> Vec<PermissionRow> {
        set.entries
            .iter()
            .map(|entry| PermissionRow {
                object_kind: set.object_kind,
                object_id: set.object_id.clone(),
                site_id: site_id.to_string(),
                entry: entry.clone(),
            })
            .collect()
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no stage started.
    Pending,
    /// Stages executing.
    Running,
    /// Every stage succeeded with no recorded errors.
    Completed,
    /// Every stage succeeded but branch errors were recorded.
    CompletedWithErrors,
    /// A stage failed or the run timed out.
    Failed,
}

impl RunStatus {
    /// Stable snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
        }
    }

    /// Completed and failed runs accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::CompletedWithErrors | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A branch-local or stage error recorded on the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Stage that recorded the error.
    pub stage: String,
    /// What the error applies to, e.g. `site:abc` or `folder:xyz`.
    pub scope: String,
    /// Error message.
    pub message: String,
    /// When it was recorded.
    pub at: Timestamp,
}

impl RunError {
    /// Creates an error stamped with the current time.
    pub fn new(stage: &str, scope: impl Into<String>, message: impl fmt::Display) -> Self {
        RunError {
            stage: stage.to_string(),
            scope: scope.into(),
            message: message.to_string(),
            at: Utc::now(),
        }
    }
}

/// Capped list of run errors with an uncapped total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLog {
    entries: Vec<RunError>,
    total: usize,
    cap: usize,
}

impl ErrorLog {
    /// Keeps at most `cap` entries.
    pub fn with_cap(cap: usize) -> Self {
        ErrorLog {
            entries: Vec::new(),
            total: 0,
            cap,
        }
    }

    /// Records an error.
    pub fn push(&mut self, error: RunError) {
        self.total += 1;
        if self.entries.len() < self.cap {
            self.entries.push(error);
        }
    }

    /// Records several errors.
    pub fn extend(&mut self, errors: impl IntoIterator<Item = RunError>) {
        for error in errors {
            self.push(error);
        }
    }

    /// Carries over errors of an earlier invocation. `total` also counts entries that were
    /// dropped by the cap.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = RunError>, total: usize) {
        let before = self.total;
        self.extend(entries);
        let restored = self.total - before;
        self.total += total.saturating_sub(restored);
    }

    /// Retained entries.
    pub fn entries(&self) -> &[RunError] {
        &self.entries
    }

    /// Number of errors recorded, including dropped ones.
    pub fn total(&self) -> usize {
        self.total
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Status row of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub run_id: String,
    /// Start time.
    pub started_at: Timestamp,
    /// End time, for terminal states.
    pub finished_at: Option<Timestamp>,
    /// Status.
    pub status: RunStatus,
    /// Site count.
    pub sites: u64,
    /// Library count.
    pub libraries: u64,
    /// Folder count.
    pub folders: u64,
    /// File count.
    pub files: u64,
    /// Permission row count.
    pub permissions: u64,
    /// Total errors recorded.
    pub error_count: u64,
    /// Failing stage, for failed runs.
    pub failed_stage: Option<String>,
    /// Failure message, for failed runs.
    pub failure: Option<String>,
    /// Retained errors.
    pub errors: Vec<RunError>,
}

/// A storable row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Row {
    /// Site row.
    Site(Site),
    /// Library row.
    Library(Library),
    /// Folder row.
    Folder(Folder),
    /// File row.
    File(File),
    /// Permission row.
    Permission(PermissionRow),
    /// Run status row.
    Run(RunRecord),
}

impl Row {
    /// Table the row belongs to.
    pub fn table(&self) -> Table {
        match self {
            Row::Site(_) => Table::Sites,
            Row::Library(_) => Table::Libraries,
            Row::Folder(_) => Table::Folders,
            Row::File(_) => Table::Files,
            Row::Permission(_) => Table::Permissions,
            Row::Run(_) => Table::Runs,
        }
    }

    /// Unique key within the table.
    pub fn key(&self) -> String {
        match self {
            Row::Site(s) => s.site_id.clone(),
            Row::Library(l) => l.library_id.clone(),
            Row::Folder(f) => f.folder_id.clone(),
            Row::File(f) => f.file_id.clone(),
            Row::Permission(p) => format!(
                "{}|{}|{}|{}|{}|{}",
                p.object_kind,
                p.object_id,
                p.entry.principal_id,
                p.entry.permission_level,
                p.entry.granted_by.as_deref().unwrap_or(""),
                p.entry.is_anonymous_link
            ),
            Row::Run(r) => r.run_id.clone(),
        }
    }

    /// Id of the object the row describes.
    pub fn object_id(&self) -> &str {
        match self {
            Row::Site(s) => &s.site_id,
            Row::Library(l) => &l.library_id,
            Row::Folder(f) => &f.folder_id,
            Row::File(f) => &f.file_id,
            Row::Permission(p) => &p.object_id,
            Row::Run(r) => &r.run_id,
        }
    }

    /// Owning site, for inventory and permission rows.
    pub fn site_id(&self) -> Option<&str> {
        match self {
            Row::Site(s) => Some(&s.site_id),
            Row::Library(l) => Some(&l.site_id),
            Row::Folder(f) => Some(&f.site_id),
            Row::File(f) => Some(&f.site_id),
            Row::Permission(p) => Some(&p.site_id),
            Row::Run(_) => None,
        }
    }
}
