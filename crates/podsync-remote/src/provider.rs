//! PodioRemote - IRemoteApi implementation for the Podio REST API
//!
//! Wraps the [`PodioClient`] and maps Podio's JSON payloads to the
//! port-level DTOs.
//!
//! ## Design Notes
//!
//! - Endpoints come from [`ApiOperation::endpoint`], so the paths the gate
//!   classifies are exactly the paths requested.
//! - Podio's payloads vary between endpoints and API versions: file lists
//!   arrive bare or wrapped in `files`, and export submissions return a
//!   batch id in one of three places or the finished file directly. The
//!   response types below accept every observed shape.

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use podsync_core::domain::{BatchId, ExportFile, ExportStatus, RemoteId};
use podsync_core::ports::{
    ApiError, ApiOperation, ApiReply, App, ExportPoll, ExportSubmission, IRemoteApi,
    Organization, PageRequest, RemoteFile, Workspace,
};

use crate::client::PodioClient;

const UNNAMED_APP: &str = "Unnamed app";

// ============================================================================
// Podio response types
// ============================================================================

/// Entry of `GET /org/`
#[derive(Debug, Deserialize)]
struct PodioOrg {
    org_id: u64,
    name: String,
}

/// Entry of `GET /space/org/{id}/`
#[derive(Debug, Deserialize)]
struct PodioSpace {
    space_id: u64,
    name: String,
}

/// Entry of `GET /app/space/{id}/`
#[derive(Debug, Deserialize)]
struct PodioApp {
    app_id: u64,
    config: Option<PodioAppConfig>,
}

#[derive(Debug, Deserialize)]
struct PodioAppConfig {
    name: Option<String>,
}

/// Body of `GET /item/app/{id}/count`
#[derive(Debug, Deserialize)]
struct PodioCount {
    count: u64,
}

/// A file attached to an app or produced by an export
#[derive(Debug, Deserialize)]
struct PodioFile {
    file_id: u64,
    name: Option<String>,
    size: Option<u64>,
    mimetype: Option<String>,
    link: Option<String>,
    perma_link: Option<String>,
}

impl PodioFile {
    fn link(&self) -> Option<String> {
        self.link
            .clone()
            .filter(|l| !l.is_empty())
            .or_else(|| self.perma_link.clone().filter(|l| !l.is_empty()))
    }

    fn into_remote_file(self) -> RemoteFile {
        let download_url = self.link();
        RemoteFile {
            id: RemoteId::new(self.file_id),
            name: self
                .name
                .unwrap_or_else(|| format!("file_{}", self.file_id)),
            size_bytes: self.size.unwrap_or(0),
            mime_type: self.mimetype,
            download_url,
        }
    }

    /// Converts to an export file; `None` if Podio gave no download link
    fn into_export_file(self, fallback_name: &str) -> Option<ExportFile> {
        let download_url = self.link()?;
        Some(ExportFile {
            file_id: RemoteId::new(self.file_id),
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
            download_url,
            size_bytes: self.size,
        })
    }
}

/// Body of `GET /file/app/{id}/`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PodioFilePage {
    List(Vec<PodioFile>),
    Wrapped { files: Vec<PodioFile> },
}

impl PodioFilePage {
    fn into_files(self) -> Vec<PodioFile> {
        match self {
            PodioFilePage::List(files) | PodioFilePage::Wrapped { files } => files,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PodioBatchRef {
    batch_id: u64,
}

/// Body of `POST /item/app/{id}/export/xlsx/`
#[derive(Debug, Deserialize)]
struct PodioExportResponse {
    batch_id: Option<u64>,
    batch: Option<PodioBatchRef>,
    id: Option<u64>,
    file: Option<PodioFile>,
}

/// Body of `GET /batch/{id}`
#[derive(Debug, Deserialize)]
struct PodioBatch {
    status: String,
    file: Option<PodioFile>,
    #[serde(default)]
    completed: u64,
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    skipped: u64,
}

fn parse_status(status: &str) -> Option<ExportStatus> {
    match status {
        "created" => Some(ExportStatus::Created),
        "processing" => Some(ExportStatus::Processing),
        "completed" => Some(ExportStatus::Completed),
        "failed" => Some(ExportStatus::Failed),
        _ => None,
    }
}

// ============================================================================
// PodioRemote
// ============================================================================

/// [`IRemoteApi`] backed by the Podio REST API
#[derive(Debug, Clone)]
pub struct PodioRemote {
    client: PodioClient,
}

impl PodioRemote {
    pub fn new(client: PodioClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PodioClient {
        &self.client
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        operation: ApiOperation,
    ) -> Result<ApiReply<T>, ApiError> {
        self.client
            .send_json(Method::GET, &operation.endpoint())
            .await
    }
}

fn map_reply<T, U>(reply: ApiReply<T>, f: impl FnOnce(T) -> U) -> ApiReply<U> {
    ApiReply {
        value: f(reply.value),
        quota: reply.quota,
    }
}

#[async_trait::async_trait]
impl IRemoteApi for PodioRemote {
    async fn list_organizations(&self) -> Result<ApiReply<Vec<Organization>>, ApiError> {
        let reply: ApiReply<Vec<PodioOrg>> = self.get(ApiOperation::ListOrganizations).await?;
        Ok(map_reply(reply, |orgs| {
            orgs.into_iter()
                .map(|o| Organization {
                    id: RemoteId::new(o.org_id),
                    name: o.name,
                })
                .collect()
        }))
    }

    async fn list_workspaces(&self, org: RemoteId) -> Result<ApiReply<Vec<Workspace>>, ApiError> {
        let reply: ApiReply<Vec<PodioSpace>> = self.get(ApiOperation::ListWorkspaces(org)).await?;
        Ok(map_reply(reply, |spaces| {
            spaces
                .into_iter()
                .map(|s| Workspace {
                    id: RemoteId::new(s.space_id),
                    name: s.name,
                })
                .collect()
        }))
    }

    async fn list_apps(&self, workspace: RemoteId) -> Result<ApiReply<Vec<App>>, ApiError> {
        let reply: ApiReply<Vec<PodioApp>> = self.get(ApiOperation::ListApps(workspace)).await?;
        Ok(map_reply(reply, |apps| {
            apps.into_iter()
                .map(|a| App {
                    id: RemoteId::new(a.app_id),
                    name: a
                        .config
                        .and_then(|c| c.name)
                        .unwrap_or_else(|| UNNAMED_APP.to_string()),
                })
                .collect()
        }))
    }

    async fn count_items(&self, app: RemoteId) -> Result<ApiReply<u64>, ApiError> {
        let reply: ApiReply<PodioCount> = self.get(ApiOperation::CountItems(app)).await?;
        Ok(map_reply(reply, |c| c.count))
    }

    async fn list_files(
        &self,
        app: RemoteId,
        page: PageRequest,
    ) -> Result<ApiReply<Vec<RemoteFile>>, ApiError> {
        let reply: ApiReply<PodioFilePage> =
            self.get(ApiOperation::ListFiles { app, page }).await?;
        let reply = map_reply(reply, |page| {
            page.into_files()
                .into_iter()
                .map(PodioFile::into_remote_file)
                .collect::<Vec<_>>()
        });
        debug!(%app, offset = page.offset, count = reply.value.len(), "Listed files");
        Ok(reply)
    }

    async fn submit_export(&self, app: RemoteId) -> Result<ApiReply<ExportSubmission>, ApiError> {
        let operation = ApiOperation::SubmitExport(app);
        let body = serde_json::json!({});
        let reply: ApiReply<PodioExportResponse> = self
            .client
            .send_json_with(Method::POST, &operation.endpoint(), Some(&body))
            .await?;

        let ApiReply { value, quota } = reply;
        let submission = if let Some(batch) = value
            .batch_id
            .or(value.batch.map(|b| b.batch_id))
            .or(value.id)
        {
            ExportSubmission::Batch(BatchId::new(batch))
        } else if let Some(file) = value.file {
            let file = file
                .into_export_file(&format!("export_{app}.xlsx"))
                .ok_or_else(|| {
                    ApiError::InvalidResponse(format!("export of app {app} has no download link"))
                })?;
            ExportSubmission::Immediate(file)
        } else {
            return Err(ApiError::InvalidResponse(format!(
                "export of app {app} returned neither a batch nor a file"
            )));
        };
        debug!(%app, ?submission, "Export submitted");
        Ok(ApiReply {
            value: submission,
            quota,
        })
    }

    async fn poll_export(&self, batch: BatchId) -> Result<ApiReply<ExportPoll>, ApiError> {
        let reply: ApiReply<PodioBatch> = self.get(ApiOperation::PollExport(batch)).await?;
        let ApiReply { value, quota } = reply;

        // Unknown states are treated as still running.
        let status = parse_status(&value.status).unwrap_or_else(|| {
            warn!(%batch, status = %value.status, "Unknown export batch status");
            ExportStatus::Processing
        });
        debug!(
            %batch,
            %status,
            completed = value.completed,
            failed = value.failed,
            skipped = value.skipped,
            "Export batch polled"
        );

        let failure = (status == ExportStatus::Failed).then(|| {
            format!(
                "batch reported failure ({} completed, {} failed)",
                value.completed, value.failed
            )
        });
        let file = value
            .file
            .and_then(|f| f.into_export_file(&format!("export_{batch}.xlsx")));
        Ok(ApiReply {
            value: ExportPoll {
                status,
                file,
                failure,
            },
            quota,
        })
    }

    async fn download_blob(&self, url: &str) -> Result<ApiReply<Vec<u8>>, ApiError> {
        self.client.send_bytes(url).await
    }
}
