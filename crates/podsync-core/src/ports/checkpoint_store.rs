//! Checkpoint store port (driven/secondary port)
//!
//! This module defines the interface for persisting scan jobs, their
//! traversal checkpoints, the entities discovered along the way, failed
//! units and active quota suspensions.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, in-memory) and don't need domain-level classification.
//! - `save_checkpoint` must reject a cursor that moves backwards, and
//!   `finalize_job` must reject a completion while failed units or an
//!   active limit remain; the walker relies on both guarantees.
//! - `save_entity` is idempotent: re-discovering an entity during an
//!   at-least-once redo leaves the stored record unchanged.

use std::time::Duration;

use crate::domain::{
    newtypes::{BatchId, JobId, RemoteId},
    ActiveRateLimit, DiscoveredEntity, EntityKind, EntityStatus, FailedUnit, JobCompletion,
    QuotaCategory, ScanJob, ScanSummary, TraversalCheckpoint, UnitKind,
};

/// Port trait for job and checkpoint persistence
#[async_trait::async_trait]
pub trait ICheckpointStore: Send + Sync {
    // --- Jobs ---

    /// Creates a new job and returns its identifier
    async fn begin_job(&self, title: Option<&str>) -> anyhow::Result<JobId>;

    /// Retrieves a job by ID
    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<ScanJob>>;

    /// Retrieves the most recently created job
    async fn latest_job(&self) -> anyhow::Result<Option<ScanJob>>;

    /// Returns the most recent job if it is neither completed nor cancelled
    ///
    /// Older incomplete jobs are never returned: a cancelled or completed
    /// job that is newer supersedes them.
    async fn find_incomplete_job(&self) -> anyhow::Result<Option<ScanJob>>;

    /// Returns the newest completed job younger than `max_age`
    async fn find_recent_completed(&self, max_age: Duration) -> anyhow::Result<Option<ScanJob>>;

    /// Attaches the summary to a job after validating the completion
    ///
    /// # Errors
    /// Fails if the completion does not validate, the job has unresolved
    /// failed units, or the job was cancelled.
    async fn finalize_job(
        &self,
        job_id: &JobId,
        completion: &JobCompletion,
    ) -> anyhow::Result<ScanSummary>;

    /// Flags a job as cancelled by the user
    async fn mark_cancelled(&self, job_id: &JobId) -> anyhow::Result<()>;

    // --- Checkpoints ---

    /// Persists the checkpoint of a job
    ///
    /// # Errors
    /// Fails if the cursor is behind the stored checkpoint.
    async fn save_checkpoint(
        &self,
        job_id: &JobId,
        checkpoint: &TraversalCheckpoint,
    ) -> anyhow::Result<()>;

    /// Loads the checkpoint of a job
    async fn load_checkpoint(&self, job_id: &JobId) -> anyhow::Result<Option<TraversalCheckpoint>>;

    // --- Discovered entities ---

    /// Records a discovered entity unless it is already stored
    async fn save_entity(&self, entity: &DiscoveredEntity) -> anyhow::Result<()>;

    /// Updates the status of a stored entity
    async fn update_entity_status(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
        status: &EntityStatus,
    ) -> anyhow::Result<()>;

    /// Records (or clears) the pending export batch of an app
    async fn set_export_batch(
        &self,
        job_id: &JobId,
        app_id: RemoteId,
        batch: Option<BatchId>,
    ) -> anyhow::Result<()>;

    /// Retrieves a stored entity
    async fn get_entity(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<Option<DiscoveredEntity>>;

    /// Lists the entities of a job, optionally restricted to one kind
    async fn list_entities(
        &self,
        job_id: &JobId,
        kind: Option<EntityKind>,
    ) -> anyhow::Result<Vec<DiscoveredEntity>>;

    // --- Failed units ---

    /// Records a failed unit, replacing an earlier record for the same unit
    async fn record_failed_unit(&self, job_id: &JobId, unit: &FailedUnit) -> anyhow::Result<()>;

    /// Removes a failed unit after a later attempt succeeded
    async fn resolve_failed_unit(
        &self,
        job_id: &JobId,
        kind: UnitKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<()>;

    /// Lists the unresolved failed units of a job
    async fn list_failed_units(&self, job_id: &JobId) -> anyhow::Result<Vec<FailedUnit>>;

    // --- Active rate limits ---

    /// Persists an active limit, replacing any earlier one for the category
    async fn save_active_limit(&self, limit: &ActiveRateLimit) -> anyhow::Result<()>;

    /// Loads every persisted active limit
    async fn load_active_limits(&self) -> anyhow::Result<Vec<ActiveRateLimit>>;

    /// Removes the persisted limit of a category
    async fn clear_active_limit(&self, category: QuotaCategory) -> anyhow::Result<()>;
}
