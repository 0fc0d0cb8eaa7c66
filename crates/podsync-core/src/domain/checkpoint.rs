//! Traversal checkpoint and scan counters
//!
//! A [`TraversalCheckpoint`] is a cursor into the organization → workspace
//! → app hierarchy. Each index names the next unit to process:
//!
//! - organizations below `org_index` are complete
//! - within organization `org_index`, workspaces below `workspace_index`
//!   are complete
//! - within that workspace, apps below `app_index` are complete
//!
//! The cursor only moves forward. A checkpoint also carries the counters
//! for exactly the work it covers, so a resumed job restores its totals
//! without recounting.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::JobId;

/// Running totals of discovered entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounters {
    pub organizations: u64,
    pub workspaces: u64,
    pub apps: u64,
    pub items: u64,
    pub files: u64,
    /// Sum of discovered file sizes
    pub bytes: u64,
}

impl ScanCounters {
    /// Adds another set of counters to this one
    pub fn absorb(&mut self, other: &ScanCounters) {
        self.organizations += other.organizations;
        self.workspaces += other.workspaces;
        self.apps += other.apps;
        self.items += other.items;
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

impl std::fmt::Display for ScanCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} orgs, {} workspaces, {} apps, {} items, {} files",
            self.organizations, self.workspaces, self.apps, self.items, self.files
        )
    }
}

/// Whether the totals for the current level have been discovered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFlags {
    pub workspaces_counted: bool,
    pub apps_counted: bool,
}

/// Durable record of traversal progress for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalCheckpoint {
    job_id: JobId,
    org_index: u32,
    org_total: u32,
    workspace_index: u32,
    workspace_total: u32,
    app_index: u32,
    app_total: u32,
    flags: CheckpointFlags,
    counters: ScanCounters,
    updated_at: DateTime<Utc>,
}

impl TraversalCheckpoint {
    /// Creates a cursor positioned before the first organization
    pub fn new(job_id: JobId, org_total: u32) -> Self {
        Self {
            job_id,
            org_index: 0,
            org_total,
            workspace_index: 0,
            workspace_total: 0,
            app_index: 0,
            app_total: 0,
            flags: CheckpointFlags::default(),
            counters: ScanCounters::default(),
            updated_at: Utc::now(),
        }
    }

    /// Reconstitutes a checkpoint from storage
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        job_id: JobId,
        org_index: u32,
        org_total: u32,
        workspace_index: u32,
        workspace_total: u32,
        app_index: u32,
        app_total: u32,
        flags: CheckpointFlags,
        counters: ScanCounters,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            org_index,
            org_total,
            workspace_index,
            workspace_total,
            app_index,
            app_total,
            flags,
            counters,
            updated_at,
        }
    }

    // --- Getters ---

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn org_index(&self) -> u32 {
        self.org_index
    }

    pub fn org_total(&self) -> u32 {
        self.org_total
    }

    pub fn workspace_index(&self) -> u32 {
        self.workspace_index
    }

    pub fn workspace_total(&self) -> u32 {
        self.workspace_total
    }

    pub fn app_index(&self) -> u32 {
        self.app_index
    }

    pub fn app_total(&self) -> u32 {
        self.app_total
    }

    pub fn flags(&self) -> CheckpointFlags {
        self.flags
    }

    pub fn counters(&self) -> &ScanCounters {
        &self.counters
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// The (org, workspace, app) cursor as a tuple
    pub fn cursor(&self) -> (u32, u32, u32) {
        (self.org_index, self.workspace_index, self.app_index)
    }

    /// Returns true once every organization has been processed
    pub fn is_finished(&self) -> bool {
        self.org_index >= self.org_total
    }

    /// Fraction of the hierarchy covered by the cursor, in `[0, 1]`
    ///
    /// Organizations are weighted equally; within the current organization
    /// completed workspaces contribute proportionally.
    pub fn fraction_complete(&self) -> f64 {
        if self.org_total == 0 {
            return 0.0;
        }
        let mut orgs = f64::from(self.org_index.min(self.org_total));
        if self.workspace_total > 0 && self.org_index < self.org_total {
            orgs += f64::from(self.workspace_index) / f64::from(self.workspace_total);
        }
        (orgs / f64::from(self.org_total)).clamp(0.0, 1.0)
    }

    // --- Cursor movement ---

    /// Updates the organization total after re-listing on resume
    pub fn set_org_total(&mut self, total: u32) {
        self.org_total = total;
        self.touch();
    }

    /// Records the workspace count for the current organization
    pub fn begin_organization(&mut self, workspace_total: u32) {
        self.workspace_total = workspace_total;
        self.flags.workspaces_counted = true;
        self.touch();
    }

    /// Records the app count for the current workspace
    pub fn begin_workspace(&mut self, app_total: u32) {
        self.app_total = app_total;
        self.flags.apps_counted = true;
        self.touch();
    }

    /// Marks `count` further apps of the current workspace as complete
    ///
    /// # Errors
    /// Returns `DomainError::CheckpointRegression` if the cursor would move
    /// past the known app total.
    pub fn complete_apps(&mut self, count: u32) -> Result<(), DomainError> {
        let next = self.app_index + count;
        if self.flags.apps_counted && next > self.app_total {
            return Err(DomainError::CheckpointRegression(format!(
                "app index {next} exceeds app total {}",
                self.app_total
            )));
        }
        self.app_index = next;
        self.touch();
        Ok(())
    }

    /// Marks the current workspace as complete and moves to the next one
    pub fn complete_workspace(&mut self) {
        self.workspace_index += 1;
        self.app_index = 0;
        self.app_total = 0;
        self.flags.apps_counted = false;
        self.touch();
    }

    /// Marks the current organization as complete and moves to the next one
    pub fn complete_organization(&mut self) {
        self.org_index += 1;
        self.workspace_index = 0;
        self.workspace_total = 0;
        self.app_index = 0;
        self.app_total = 0;
        self.flags = CheckpointFlags::default();
        self.touch();
    }

    /// Replaces the counters covered by this checkpoint
    pub fn set_counters(&mut self, counters: ScanCounters) {
        self.counters = counters;
    }

    /// Verifies that this checkpoint does not move backwards relative to `previous`
    ///
    /// # Errors
    /// Returns `DomainError::CheckpointRegression` if the job differs or the
    /// cursor is lexicographically behind the previous one.
    pub fn ensure_follows(&self, previous: &TraversalCheckpoint) -> Result<(), DomainError> {
        if self.job_id != previous.job_id {
            return Err(DomainError::CheckpointRegression(format!(
                "checkpoint for job {} cannot follow job {}",
                self.job_id, previous.job_id
            )));
        }
        if self.cursor().cmp(&previous.cursor()) == Ordering::Less {
            return Err(DomainError::CheckpointRegression(format!(
                "cursor {:?} is behind {:?}",
                self.cursor(),
                previous.cursor()
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
