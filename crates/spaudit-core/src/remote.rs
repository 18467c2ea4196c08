//! Remote content API capability surface.
//!
//! The core does not assume a wire protocol: any client that can list sites, libraries and
//! folder children and read role assignments, group memberships, principals and sharing
//! links implements [`RemoteApi`]. Payloads are normalised into the typed records below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::model::{ObjectRef, Timestamp};

/// Maximum principal ids per bulk lookup.
pub const PRINCIPAL_BATCH_SIZE: usize = 20;

/// Parameters of one site-listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteListing {
    /// Cursor returned by a previous complete listing; only changes are returned.
    pub delta_token: Option<String>,
    /// Continuation of the current listing.
    pub page_token: Option<String>,
    /// Ask the server to return active sites only.
    pub active_only: bool,
}

/// A site as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSite {
    /// Stable id.
    pub id: String,
    /// Absolute URL.
    pub url: String,
    /// Display title.
    pub title: String,
    /// Web template code.
    #[serde(default)]
    pub template: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    #[serde(default)]
    pub modified_at: Option<Timestamp>,
    /// Storage used in bytes.
    #[serde(default)]
    pub storage_used: Option<u64>,
    /// Archived flag.
    #[serde(default)]
    pub is_archived: bool,
    /// Deleted flag; in a delta listing, a tombstone.
    #[serde(default)]
    pub is_deleted: bool,
}

/// One page of a site listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitePage {
    /// Sites in server order.
    pub sites: Vec<RemoteSite>,
    /// Continuation token, if more pages follow.
    pub next_page: Option<String>,
    /// Cursor for the next incremental listing, on the final page.
    pub delta_token: Option<String>,
}

/// A document library as reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLibrary {
    /// Stable id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Absolute URL.
    #[serde(default)]
    pub web_url: Option<String>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    #[serde(default)]
    pub modified_at: Option<Timestamp>,
    /// Item count.
    #[serde(default)]
    pub item_count: Option<u64>,
    /// Unique-permissions flag, when reported.
    #[serde(default)]
    pub has_unique_permissions: Option<bool>,
}

/// Folder or file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A folder.
    Folder {
        /// Direct child count, when reported.
        #[serde(default)]
        child_count: Option<u64>,
    },
    /// A file.
    File {
        /// Size in bytes.
        #[serde(default)]
        size: u64,
        /// MIME type.
        #[serde(default)]
        content_type: Option<String>,
    },
}

/// A child of a library or folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveItem {
    /// Stable id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Folder or file.
    pub kind: ItemKind,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
    /// Last modification time.
    #[serde(default)]
    pub modified_at: Option<Timestamp>,
    /// Author.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Last editor.
    #[serde(default)]
    pub modified_by: Option<String>,
    /// Unique-permissions flag, when reported.
    #[serde(default)]
    pub has_unique_permissions: Option<bool>,
}

/// One page of children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPage {
    /// Children in server order.
    pub items: Vec<DriveItem>,
    /// Continuation token, if more pages follow.
    pub next_page: Option<String>,
}

/// Principal named by a role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePrincipal {
    /// Principal id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Login name.
    #[serde(default)]
    pub login_name: String,
    /// E-mail, when known.
    #[serde(default)]
    pub email: Option<String>,
    /// Principal-type code.
    #[serde(default = "default_principal_type")]
    pub principal_type: i64,
    /// Anonymous guest flag.
    #[serde(default)]
    pub is_anonymous_guest: bool,
}

fn default_principal_type() -> i64 {
    1
}

/// Raw role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Principal holding the roles.
    pub principal: RemotePrincipal,
    /// Role definition names, e.g. `Read`.
    pub role_names: Vec<String>,
    /// Assignment created by an anonymous link.
    #[serde(default)]
    pub is_anonymous_link: bool,
}

/// Directory entry (user or group) returned by membership and bulk lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    /// Directory id.
    pub id: String,
    /// Display name.
    pub display_name: String,
    /// E-mail.
    #[serde(default)]
    pub mail: Option<String>,
    /// User principal name.
    #[serde(default)]
    pub user_principal_name: Option<String>,
    /// `Member` or `Guest`, when known.
    #[serde(default)]
    pub user_type: Option<String>,
    /// True for groups.
    #[serde(default)]
    pub is_group: bool,
}

impl DirectoryObject {
    /// E-mail or user principal name.
    pub fn login(&self) -> Option<&str> {
        self.mail.as_deref().or(self.user_principal_name.as_deref())
    }

    /// Guest account by user type.
    pub fn is_guest(&self) -> bool {
        self.user_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("guest"))
    }
}

/// Group header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group id.
    pub id: String,
    /// Display name.
    pub display_name: String,
}

/// Audience of a sharing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkScope {
    /// Anyone with the link.
    Anonymous,
    /// Anyone in the organisation.
    Organization,
    /// Named recipients.
    Users,
}

/// Access granted by a sharing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAccess {
    /// Read-only.
    View,
    /// Read-write.
    Edit,
}

impl LinkAccess {
    /// Permission level granted.
    pub fn permission_level(self) -> &'static str {
        match self {
            LinkAccess::View => "Read",
            LinkAccess::Edit => "Edit",
        }
    }
}

/// A sharing link on one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingLink {
    /// Link id.
    pub id: String,
    /// Audience.
    pub scope: LinkScope,
    /// Access kind.
    pub access: LinkAccess,
    /// Named recipients, for `Users` links.
    #[serde(default)]
    pub recipients: Vec<DirectoryObject>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

/// Result alias for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Capability interface of the remote content API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of the (incremental) site listing.
    async fn list_sites(&self, listing: &SiteListing) -> RemoteResult<SitePage>;

    /// Document libraries of a site.
    async fn list_libraries(&self, site_id: &str) -> RemoteResult<Vec<RemoteLibrary>>;

    /// One page of children of `parent_id`, or of the library root when `None`.
    async fn list_children(
        &self,
        library_id: &str,
        parent_id: Option<&str>,
        page_token: Option<&str>,
    ) -> RemoteResult<ChildPage>;

    /// Whether the object holds its own role assignments.
    async fn has_unique_role_assignments(&self, object: &ObjectRef) -> RemoteResult<bool>;

    /// Role assignments defined on the object.
    async fn role_assignments(&self, object: &ObjectRef) -> RemoteResult<Vec<RoleAssignment>>;

    /// Every member of a group, nested groups flattened; nested groups themselves are
    /// included with `is_group` set.
    async fn transitive_members(&self, group_id: &str) -> RemoteResult<Vec<DirectoryObject>>;

    /// Group header.
    async fn group_info(&self, group_id: &str) -> RemoteResult<GroupInfo>;

    /// Bulk principal lookup; at most [`PRINCIPAL_BATCH_SIZE`] ids per call.
    async fn get_principals(&self, ids: &[String]) -> RemoteResult<Vec<DirectoryObject>>;

    /// Directory entry for a login, if one exists.
    async fn lookup_user(&self, login: &str) -> RemoteResult<Option<DirectoryObject>>;

    /// Sharing links on the object.
    async fn sharing_links(&self, object: &ObjectRef) -> RemoteResult<Vec<SharingLink>>;
}
