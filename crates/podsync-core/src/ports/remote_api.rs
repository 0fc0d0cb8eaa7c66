//! Remote API port (driven/secondary port)
//!
//! This module defines the interface to the remote resource service that
//! hosts the organization → workspace → app → item/file hierarchy. The
//! production adapter targets the Podio REST API, but the engine only
//! sees the operations below.
//!
//! ## Design Notes
//!
//! - Every call returns [`ApiReply`], which carries the quota figures the
//!   server reported so the quota tracker can reconcile its buckets.
//! - Errors are a structured [`ApiError`] rather than `anyhow`, because the
//!   engine must tell rate limits, invalid requests and expired credentials
//!   apart without inspecting message text.
//! - [`ApiOperation`] describes each call (method and endpoint) so the
//!   request gate can classify it before it is issued.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::errors::ScanError;
use crate::domain::export::{ExportFile, ExportStatus};
use crate::domain::newtypes::{BatchId, RemoteId};
use crate::domain::quota::QuotaHeaders;

// ============================================================================
// Port-level DTOs
// ============================================================================

/// An organization visible to the authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: RemoteId,
    pub name: String,
}

/// A workspace inside an organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: RemoteId,
    pub name: String,
}

/// An application (item container) inside a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: RemoteId,
    pub name: String,
}

/// A file attached to items of an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: RemoteId,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
    pub download_url: Option<String>,
}

/// Offset-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }

    /// The request for the page after this one
    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Response to an export submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSubmission {
    /// The service produced the file synchronously
    Immediate(ExportFile),
    /// The service queued a batch that must be polled
    Batch(BatchId),
}

/// One poll of an export batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPoll {
    pub status: ExportStatus,
    pub file: Option<ExportFile>,
    /// Server-reported reason when the batch failed
    pub failure: Option<String>,
}

// ============================================================================
// Reply and error types
// ============================================================================

/// A successful reply together with the quota headers that came with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiReply<T> {
    pub value: T,
    pub quota: Option<QuotaHeaders>,
}

impl<T> ApiReply<T> {
    /// Reply without any quota information
    pub fn new(value: T) -> Self {
        Self { value, quota: None }
    }

    /// Reply carrying quota headers
    pub fn with_quota(value: T, quota: QuotaHeaders) -> Self {
        Self {
            value,
            quota: Some(quota),
        }
    }
}

/// Structured failure reported by a remote API adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The server rejected the call because a quota ran out
    #[error("rate limited by server")]
    RateLimited {
        /// Server-provided wait, if any
        retry_after: Option<Duration>,
        /// Quota figures sent with the rejection
        quota: Option<QuotaHeaders>,
    },

    /// Credentials missing or expired
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials valid but access denied
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The request was malformed or a parameter was out of range
    #[error("invalid request: {message}")]
    InvalidRequest {
        code: Option<String>,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// 5xx response
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Connection, DNS, TLS or timeout failure
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<ApiError> for ScanError {
    fn from(err: ApiError) -> Self {
        match err {
            // The gate converts rate limits into QuotaExhausted with a deadline;
            // reaching this arm means a caller bypassed it.
            ApiError::RateLimited { .. } => {
                ScanError::TransientNetwork("rate limited outside the request gate".to_string())
            }
            ApiError::Unauthorized(msg) | ApiError::Forbidden(msg) => ScanError::AuthExpired(msg),
            ApiError::InvalidRequest { code, message } => {
                ScanError::InvalidRequest { code, message }
            }
            ApiError::Server { status, message } => {
                ScanError::TransientNetwork(format!("HTTP {status}: {message}"))
            }
            ApiError::Network(msg) => ScanError::TransientNetwork(msg),
            ApiError::NotFound(msg) => ScanError::Remote(format!("not found: {msg}")),
            ApiError::InvalidResponse(msg) => ScanError::Remote(format!("invalid response: {msg}")),
        }
    }
}

// ============================================================================
// Operation descriptors
// ============================================================================

/// HTTP method of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// Description of a remote call, used for quota classification and logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOperation {
    ListOrganizations,
    ListWorkspaces(RemoteId),
    ListApps(RemoteId),
    CountItems(RemoteId),
    ListFiles { app: RemoteId, page: PageRequest },
    SubmitExport(RemoteId),
    PollExport(BatchId),
    DownloadBlob(RemoteId),
}

impl ApiOperation {
    pub fn method(&self) -> HttpMethod {
        match self {
            ApiOperation::SubmitExport(_) => HttpMethod::Post,
            _ => HttpMethod::Get,
        }
    }

    /// Endpoint path of the operation on the remote service
    pub fn endpoint(&self) -> String {
        match self {
            ApiOperation::ListOrganizations => "/org/".to_string(),
            ApiOperation::ListWorkspaces(org) => format!("/space/org/{org}/"),
            ApiOperation::ListApps(space) => format!("/app/space/{space}/"),
            ApiOperation::CountItems(app) => format!("/item/app/{app}/count"),
            ApiOperation::ListFiles { app, page } => format!(
                "/file/app/{app}/?limit={}&offset={}",
                page.limit, page.offset
            ),
            ApiOperation::SubmitExport(app) => format!("/item/app/{app}/export/xlsx/"),
            ApiOperation::PollExport(batch) => format!("/batch/{batch}"),
            ApiOperation::DownloadBlob(file) => format!("/file/{file}/download"),
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ApiOperation::ListOrganizations => "list_organizations",
            ApiOperation::ListWorkspaces(_) => "list_workspaces",
            ApiOperation::ListApps(_) => "list_apps",
            ApiOperation::CountItems(_) => "count_items",
            ApiOperation::ListFiles { .. } => "list_files",
            ApiOperation::SubmitExport(_) => "submit_export",
            ApiOperation::PollExport(_) => "poll_export",
            ApiOperation::DownloadBlob(_) => "download_blob",
        }
    }
}

// ============================================================================
// IRemoteApi trait
// ============================================================================

/// Port trait for the remote resource service
///
/// Implementations perform exactly one HTTP exchange per call and never
/// retry or sleep; pacing, quotas and retries belong to the engine.
#[async_trait::async_trait]
pub trait IRemoteApi: Send + Sync {
    /// Lists every organization visible to the caller
    async fn list_organizations(&self) -> Result<ApiReply<Vec<Organization>>, ApiError>;

    /// Lists the workspaces of an organization
    async fn list_workspaces(&self, org: RemoteId) -> Result<ApiReply<Vec<Workspace>>, ApiError>;

    /// Lists the apps of a workspace
    async fn list_apps(&self, workspace: RemoteId) -> Result<ApiReply<Vec<App>>, ApiError>;

    /// Returns the number of items in an app
    async fn count_items(&self, app: RemoteId) -> Result<ApiReply<u64>, ApiError>;

    /// Lists one page of files attached to an app
    async fn list_files(
        &self,
        app: RemoteId,
        page: PageRequest,
    ) -> Result<ApiReply<Vec<RemoteFile>>, ApiError>;

    /// Requests a spreadsheet export of an app
    async fn submit_export(&self, app: RemoteId) -> Result<ApiReply<ExportSubmission>, ApiError>;

    /// Polls an export batch
    async fn poll_export(&self, batch: BatchId) -> Result<ApiReply<ExportPoll>, ApiError>;

    /// Downloads the bytes behind a file link
    async fn download_blob(&self, url: &str) -> Result<ApiReply<Vec<u8>>, ApiError>;
}
