//! DiscoveredEntity domain entity
//!
//! Every organization, workspace, app and file found during traversal is
//! recorded as a [`DiscoveredEntity`]. The record is written once, right
//! after discovery, and afterwards only its status and pending export
//! handle may change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{BatchId, JobId, RemoteId};

/// Name used when sanitizing leaves nothing behind
const UNNAMED: &str = "unnamed";

/// Subdirectory of an app folder that holds its attached files
pub const FILES_DIR: &str = "files";

/// Level of the hierarchy an entity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Workspace,
    App,
    File,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Organization => write!(f, "organization"),
            EntityKind::Workspace => write!(f, "workspace"),
            EntityKind::App => write!(f, "app"),
            EntityKind::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(EntityKind::Organization),
            "workspace" => Ok(EntityKind::Workspace),
            "app" => Ok(EntityKind::App),
            "file" => Ok(EntityKind::File),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown entity kind: {other}"
            ))),
        }
    }
}

/// Processing status of a discovered entity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum EntityStatus {
    #[default]
    Discovered,
    /// App spreadsheet export written to disk
    Exported,
    /// Blob written to disk
    Downloaded,
    Failed(String),
}

impl EntityStatus {
    /// Name used for storage, without the failure reason
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Discovered => "discovered",
            EntityStatus::Exported => "exported",
            EntityStatus::Downloaded => "downloaded",
            EntityStatus::Failed(_) => "failed",
        }
    }

    /// Rebuilds a status from its storage name and optional failure reason
    pub fn from_parts(name: &str, reason: Option<String>) -> Result<Self, DomainError> {
        match name {
            "discovered" => Ok(EntityStatus::Discovered),
            "exported" => Ok(EntityStatus::Exported),
            "downloaded" => Ok(EntityStatus::Downloaded),
            "failed" => Ok(EntityStatus::Failed(reason.unwrap_or_default())),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown entity status: {other}"
            ))),
        }
    }
}

/// Identifiers of the ancestors of an entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentIds {
    pub organization: Option<RemoteId>,
    pub workspace: Option<RemoteId>,
    pub app: Option<RemoteId>,
}

/// A node of the remote hierarchy recorded during traversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    job_id: JobId,
    kind: EntityKind,
    parents: ParentIds,
    remote_id: RemoteId,
    name: String,
    destination_path: PathBuf,
    size_bytes: Option<u64>,
    item_count: Option<u64>,
    download_url: Option<String>,
    mime_type: Option<String>,
    status: EntityStatus,
    export_batch: Option<BatchId>,
}

impl DiscoveredEntity {
    /// Creates a freshly discovered entity
    pub fn new(
        job_id: JobId,
        kind: EntityKind,
        parents: ParentIds,
        remote_id: RemoteId,
        name: impl Into<String>,
        destination_path: PathBuf,
    ) -> Self {
        Self {
            job_id,
            kind,
            parents,
            remote_id,
            name: name.into(),
            destination_path,
            size_bytes: None,
            item_count: None,
            download_url: None,
            mime_type: None,
            status: EntityStatus::Discovered,
            export_batch: None,
        }
    }

    // --- Builder-style setters used at discovery time ---

    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    #[must_use]
    pub fn with_item_count(mut self, item_count: u64) -> Self {
        self.item_count = Some(item_count);
        self
    }

    #[must_use]
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Restores the mutable fields when loading from storage
    #[must_use]
    pub fn with_state(mut self, status: EntityStatus, export_batch: Option<BatchId>) -> Self {
        self.status = status;
        self.export_batch = export_batch;
        self
    }

    // --- Getters ---

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn parents(&self) -> &ParentIds {
        &self.parents
    }

    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub fn item_count(&self) -> Option<u64> {
        self.item_count
    }

    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn status(&self) -> &EntityStatus {
        &self.status
    }

    pub fn export_batch(&self) -> Option<BatchId> {
        self.export_batch
    }
}

/// Makes a remote name safe to use as a single path component
///
/// Path separators, characters reserved on common filesystems and control
/// characters are replaced with `_`; surrounding whitespace and trailing
/// dots are dropped. An empty result becomes `unnamed`.
pub fn sanitize_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim().trim_end_matches('.').trim_end();
    if trimmed.is_empty() || trimmed == ".." {
        UNNAMED.to_string()
    } else {
        trimmed.to_string()
    }
}

/// File name of an app's spreadsheet export
pub fn export_file_name(app_name: &str) -> String {
    format!("{}_export.xlsx", sanitize_component(app_name))
}
