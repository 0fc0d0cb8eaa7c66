//! ScanJob domain entity and the job state machine
//!
//! A [`ScanJob`] is one end-to-end traversal attempt. It carries a
//! summary only once the traversal has fully completed with no failed
//! units and no outstanding quota suspension; a job without a summary
//! that was not cancelled is resumable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::ScanCounters;
use super::errors::DomainError;
use super::newtypes::{JobId, RemoteId};
use super::quota::{ActiveRateLimit, QuotaCategory};

/// Estimated spreadsheet size per app before item volume is considered
const EXPORT_BASE_BYTES: u64 = 50 * 1024;

/// Additional spreadsheet size per thousand items
const EXPORT_BYTES_PER_THOUSAND_ITEMS: f64 = 50.0 * 1024.0;

/// Estimated spreadsheet size per app when the item count is unknown
const EXPORT_FALLBACK_BYTES: u64 = 100 * 1024;

/// Final figures of a completed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub organizations: u64,
    pub workspaces: u64,
    pub apps: u64,
    pub items: u64,
    pub files: u64,
    /// File bytes plus the estimated size of the app spreadsheets
    pub total_bytes: u64,
    pub completed_at: DateTime<Utc>,
}

impl ScanSummary {
    /// Builds a summary from final counters, estimating export sizes
    pub fn from_counters(counters: &ScanCounters, completed_at: DateTime<Utc>) -> Self {
        Self {
            organizations: counters.organizations,
            workspaces: counters.workspaces,
            apps: counters.apps,
            items: counters.items,
            files: counters.files,
            total_bytes: counters.bytes + estimate_export_bytes(counters.apps, counters.items),
            completed_at,
        }
    }
}

/// Estimates the combined size of the per-app spreadsheet exports
pub fn estimate_export_bytes(apps: u64, items: u64) -> u64 {
    if apps == 0 {
        return 0;
    }
    if items == 0 {
        return apps * EXPORT_FALLBACK_BYTES;
    }
    let avg_items_per_app = items as f64 / apps as f64;
    let per_app = EXPORT_BASE_BYTES as f64
        + (avg_items_per_app / 1000.0) * EXPORT_BYTES_PER_THOUSAND_ITEMS;
    (per_app * apps as f64).round() as u64
}

/// One end-to-end traversal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanJob {
    id: JobId,
    created_at: DateTime<Utc>,
    title: Option<String>,
    cancelled: bool,
    summary: Option<ScanSummary>,
}

impl ScanJob {
    /// Creates a new job that has not started traversing yet
    pub fn new(title: Option<String>) -> Self {
        Self {
            id: JobId::new(),
            created_at: Utc::now(),
            title,
            cancelled: false,
            summary: None,
        }
    }

    /// Reconstitutes a job from storage
    pub fn with_id(
        id: JobId,
        created_at: DateTime<Utc>,
        title: Option<String>,
        cancelled: bool,
        summary: Option<ScanSummary>,
    ) -> Self {
        Self {
            id,
            created_at,
            title,
            cancelled,
            summary,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn summary(&self) -> Option<&ScanSummary> {
        self.summary.as_ref()
    }

    /// Returns true if the job finished with a summary
    pub fn is_completed(&self) -> bool {
        self.summary.is_some()
    }

    /// Returns true if the job may be picked up by automatic resume
    pub fn is_resumable(&self) -> bool {
        !self.cancelled && self.summary.is_none()
    }

    /// Flags the job as cancelled by the user
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the job already completed.
    pub fn cancel(&mut self) -> Result<(), DomainError> {
        if self.summary.is_some() {
            return Err(DomainError::InvalidState {
                from: "completed".to_string(),
                to: "cancelled".to_string(),
            });
        }
        self.cancelled = true;
        Ok(())
    }

    /// Attaches the final summary
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the job was cancelled.
    pub fn complete(&mut self, summary: ScanSummary) -> Result<(), DomainError> {
        if self.cancelled {
            return Err(DomainError::InvalidState {
                from: "cancelled".to_string(),
                to: "completed".to_string(),
            });
        }
        self.summary = Some(summary);
        Ok(())
    }
}

/// Which level of the hierarchy a failed unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Organization,
    Workspace,
    App,
    /// The spreadsheet export of an app
    Export,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::Organization => write!(f, "organization"),
            UnitKind::Workspace => write!(f, "workspace"),
            UnitKind::App => write!(f, "app"),
            UnitKind::Export => write!(f, "export"),
        }
    }
}

impl std::str::FromStr for UnitKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(UnitKind::Organization),
            "workspace" => Ok(UnitKind::Workspace),
            "app" => Ok(UnitKind::App),
            "export" => Ok(UnitKind::Export),
            other => Err(DomainError::ValidationFailed(format!(
                "unknown unit kind: {other}"
            ))),
        }
    }
}

/// A branch of the hierarchy that could not be completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUnit {
    kind: UnitKind,
    remote_id: RemoteId,
    name: String,
    reason: String,
    attempts: u32,
    recorded_at: DateTime<Utc>,
}

impl FailedUnit {
    pub fn new(
        kind: UnitKind,
        remote_id: RemoteId,
        name: impl Into<String>,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            kind,
            remote_id,
            name: name.into(),
            reason: reason.into(),
            attempts,
            recorded_at: Utc::now(),
        }
    }

    /// Reconstitutes a failed unit from storage
    pub fn with_timestamp(
        kind: UnitKind,
        remote_id: RemoteId,
        name: impl Into<String>,
        reason: impl Into<String>,
        attempts: u32,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            remote_id,
            name: name.into(),
            reason: reason.into(),
            attempts,
            recorded_at,
        }
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

impl std::fmt::Display for FailedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}' ({}): {} after {} attempt(s)",
            self.kind, self.name, self.remote_id, self.reason, self.attempts
        )
    }
}

/// Everything the walker knows at the end of a traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub summary: ScanSummary,
    pub failed_units: Vec<FailedUnit>,
    pub active_limit: Option<ActiveRateLimit>,
}

impl JobCompletion {
    /// Checks that the job may be finalized
    ///
    /// # Errors
    /// Returns `DomainError::IncompleteJob` if any unit failed or a quota
    /// suspension is still active.
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.failed_units.is_empty() {
            let failed_orgs = self
                .failed_units
                .iter()
                .filter(|u| u.kind() == UnitKind::Organization)
                .count();
            return Err(DomainError::IncompleteJob(format!(
                "{} failed unit(s), {} of them organizations",
                self.failed_units.len(),
                failed_orgs
            )));
        }
        if let Some(limit) = &self.active_limit {
            return Err(DomainError::IncompleteJob(format!(
                "{} quota suspended until {}",
                limit.category(),
                limit.resume_at()
            )));
        }
        Ok(())
    }
}

/// Why a job is suspended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SuspendReason {
    /// Waiting for a quota window to reopen
    Quota {
        category: QuotaCategory,
        resume_at: DateTime<Utc>,
    },
    /// Paused by the operator
    ManualPause,
}

/// Lifecycle state of a running job
///
/// Only the walker transitions this state; everything else observes it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum JobState {
    #[default]
    Idle,
    Initializing,
    Traversing,
    Suspended(SuspendReason),
    Cancelled,
    Completed,
    /// Traversal ended but some units failed; never upgraded to completed
    Incomplete {
        failed_units: usize,
    },
    Failed(String),
}

impl JobState {
    /// Returns true if the job can make no further progress in this run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Cancelled
                | JobState::Completed
                | JobState::Incomplete { .. }
                | JobState::Failed(_)
        )
    }

    /// Returns true if the job is waiting on quota or the operator
    pub fn is_suspended(&self) -> bool {
        matches!(self, JobState::Suspended(_))
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Idle => write!(f, "idle"),
            JobState::Initializing => write!(f, "initializing"),
            JobState::Traversing => write!(f, "traversing"),
            JobState::Suspended(SuspendReason::Quota {
                category,
                resume_at,
            }) => write!(
                f,
                "paused: {} quota exhausted, resuming at {}",
                category,
                resume_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            JobState::Suspended(SuspendReason::ManualPause) => write!(f, "paused"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Completed => write!(f, "completed"),
            JobState::Incomplete { failed_units } => {
                write!(f, "completed with {failed_units} failed unit(s)")
            }
            JobState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
