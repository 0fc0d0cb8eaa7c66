//! Domain error types
//!
//! This module defines two error families:
//! - [`DomainError`] for validation failures and invalid state transitions
//!   on domain entities
//! - [`ScanError`] for the outcomes of a traversal step, which the walker
//!   uses to decide between retrying, suspending, recording a failed unit
//!   and aborting the job

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::newtypes::BatchId;
use super::quota::QuotaCategory;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// A traversal cursor would move backwards
    #[error("Checkpoint regression: {0}")]
    CheckpointRegression(String),

    /// Completion was requested while work is still outstanding
    #[error("Job cannot complete: {0}")]
    IncompleteJob(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

/// Errors produced while traversing the remote hierarchy
///
/// Every remote failure is mapped into one of these variants at the
/// gate boundary so that callers match on structure rather than on
/// message text.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScanError {
    /// The local or server quota for a category is exhausted
    #[error("Quota exhausted for {category} operations, resuming at {resume_at}")]
    QuotaExhausted {
        /// Category whose quota ran out
        category: QuotaCategory,
        /// Earliest time another call of that category may be issued
        resume_at: DateTime<Utc>,
    },

    /// Network failure or server-side (5xx) error
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The request itself was rejected (bad parameters, invalid limit)
    #[error("Invalid request{}: {message}", .code.as_deref().map(|c| format!(" ({c})")).unwrap_or_default())]
    InvalidRequest {
        /// Machine-readable error code reported by the service
        code: Option<String>,
        /// Human-readable explanation
        message: String,
    },

    /// Credentials were rejected
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// The job was cancelled by the user
    #[error("Scan cancelled")]
    Cancelled,

    /// The remote export job reported failure
    #[error("Export batch {} failed: {reason}", batch_label(.batch_id))]
    AsyncJobFailed {
        /// Handle of the failed batch, if one was issued
        batch_id: Option<BatchId>,
        /// Reason reported by the service or detected locally
        reason: String,
    },

    /// The remote export job did not finish within the allotted time
    #[error("Export batch {batch_id} timed out after {}s", .elapsed.as_secs())]
    AsyncJobTimeout {
        /// Handle of the batch that was being polled
        batch_id: BatchId,
        /// Polling time spent, excluding quota suspensions
        elapsed: Duration,
    },

    /// Non-transient remote failure (not found, malformed payload)
    #[error("Remote error: {0}")]
    Remote(String),

    /// The checkpoint store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The write path failed
    #[error("Write error: {0}")]
    Write(String),
}

fn batch_label(batch_id: &Option<BatchId>) -> String {
    batch_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "<unsubmitted>".to_string())
}

impl ScanError {
    /// Returns true if the retrier may repeat the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::TransientNetwork(_))
    }

    /// Returns true if the error suspends traversal until quota is available
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, ScanError::QuotaExhausted { .. })
    }

    /// Returns true if the error aborts the whole job rather than a single unit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::AuthExpired(_) | ScanError::InvalidRequest { .. } | ScanError::Storage(_)
        )
    }

    /// Short machine-readable code, used when recording failed units
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::QuotaExhausted { .. } => "quota_exhausted",
            ScanError::TransientNetwork(_) => "transient_network",
            ScanError::InvalidRequest { .. } => "invalid_request",
            ScanError::AuthExpired(_) => "auth_expired",
            ScanError::Cancelled => "cancelled",
            ScanError::AsyncJobFailed { .. } => "export_failed",
            ScanError::AsyncJobTimeout { .. } => "export_timeout",
            ScanError::Remote(_) => "remote",
            ScanError::Storage(_) => "storage",
            ScanError::Write(_) => "write",
        }
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::Storage(format!("{err:#}"))
    }
}
