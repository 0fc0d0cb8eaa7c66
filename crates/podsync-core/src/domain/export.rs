//! Asynchronous export job
//!
//! The remote service produces app spreadsheets as server-side batches.
//! A batch only moves forward through its states; `Completed` and
//! `Failed` are terminal.

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{BatchId, RemoteId};

/// Server-side status of an export batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Completed | ExportStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            ExportStatus::Created => 0,
            ExportStatus::Processing => 1,
            ExportStatus::Completed | ExportStatus::Failed => 2,
        }
    }
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportStatus::Created => write!(f, "created"),
            ExportStatus::Processing => write!(f, "processing"),
            ExportStatus::Completed => write!(f, "completed"),
            ExportStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reference to a finished export file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFile {
    pub file_id: RemoteId,
    pub name: String,
    pub download_url: String,
    pub size_bytes: Option<u64>,
}

/// A server-side export batch being driven to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncExportJob {
    batch_id: BatchId,
    status: ExportStatus,
    result_ref: Option<ExportFile>,
}

impl AsyncExportJob {
    /// Creates a freshly submitted batch
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            status: ExportStatus::Created,
            result_ref: None,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn status(&self) -> ExportStatus {
        self.status
    }

    pub fn result_ref(&self) -> Option<&ExportFile> {
        self.result_ref.as_ref()
    }

    /// Moves the batch to `next`
    ///
    /// Re-reporting the current state is accepted. A completed batch keeps
    /// the first result reference it received.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if `next` is behind the current
    /// state or the batch is already terminal in a different state.
    pub fn advance(
        &mut self,
        next: ExportStatus,
        result_ref: Option<ExportFile>,
    ) -> Result<(), DomainError> {
        if next == self.status {
            if self.result_ref.is_none() {
                self.result_ref = result_ref;
            }
            return Ok(());
        }
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            return Err(DomainError::InvalidState {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next == ExportStatus::Completed {
            self.result_ref = result_ref;
        }
        Ok(())
    }
}
