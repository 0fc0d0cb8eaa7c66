//! SQLite implementation of ICheckpointStore
//!
//! Concrete SQLite-based implementation of the checkpoint store port
//! defined in podsync-core. It handles the mapping between domain types and
//! rows, and enforces the two guarantees the walker relies on: checkpoints
//! never move backwards and a job never completes with outstanding work.
//!
//! ## Type Mapping
//!
//! | Domain Type        | SQL Type | Strategy                                 |
//! |--------------------|----------|------------------------------------------|
//! | JobId              | TEXT     | UUID string via `to_string()` / `FromStr` |
//! | RemoteId, BatchId  | INTEGER  | `as_u64()` cast to i64                   |
//! | DateTime<Utc>      | TEXT     | RFC 3339 via `to_rfc3339()`              |
//! | EntityKind         | TEXT     | snake_case via `Display` / `FromStr`     |
//! | UnitKind           | TEXT     | snake_case via `Display` / `FromStr`     |
//! | EntityStatus       | TEXT     | `as_str()` plus a separate reason column |
//! | QuotaCategory      | TEXT     | `as_str()` / `FromStr`                   |
//! | ScanCounters       | TEXT     | serde_json                               |
//! | ParentIds          | TEXT     | serde_json                               |
//! | ScanSummary        | TEXT     | serde_json                               |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use podsync_core::domain::{
    newtypes::{BatchId, JobId, RemoteId},
    ActiveRateLimit, CheckpointFlags, DiscoveredEntity, EntityKind, EntityStatus, FailedUnit,
    JobCompletion, ParentIds, QuotaCategory, ScanCounters, ScanJob, ScanSummary,
    TraversalCheckpoint, UnitKind,
};
use podsync_core::ports::ICheckpointStore;

use crate::CacheError;

/// SQLite-based implementation of the checkpoint store port
///
/// All operations go through the connection pool; the store itself holds
/// no state and is cheap to clone.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<ScanJob>, CacheError> {
        let row = sqlx::query("SELECT * FROM scan_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn require_job(&self, job_id: &JobId) -> anyhow::Result<ScanJob> {
        self.fetch_job(job_id)
            .await?
            .ok_or_else(|| CacheError::NotFound(format!("job {job_id}")).into())
    }

    /// Writes the mutable columns of a job back
    async fn store_job(&self, job: &ScanJob) -> Result<(), CacheError> {
        let summary = job
            .summary()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CacheError::SerializationError(format!("Invalid summary: {e}")))?;
        let completed_at = job.summary().map(|s| s.completed_at.to_rfc3339());

        sqlx::query(
            "UPDATE scan_jobs SET cancelled = ?, summary = ?, completed_at = ? WHERE id = ?",
        )
        .bind(job.is_cancelled())
        .bind(&summary)
        .bind(&completed_at)
        .bind(job.id().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a DateTime<Utc> from an RFC 3339 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn to_db_id(id: u64) -> i64 {
    id as i64
}

fn from_db_id(id: i64) -> RemoteId {
    RemoteId::new(id as u64)
}

fn from_db_count(value: Option<i64>) -> Option<u64> {
    value.map(|v| v.max(0) as u64)
}

fn from_db_index(value: i64) -> Result<u32, CacheError> {
    u32::try_from(value)
        .map_err(|_| CacheError::SerializationError(format!("Invalid cursor index: {value}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, s: &str) -> Result<T, CacheError> {
    serde_json::from_str(s)
        .map_err(|e| CacheError::SerializationError(format!("Invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value)
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize {what}: {e}")))
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn job_from_row(row: &SqliteRow) -> Result<ScanJob, CacheError> {
    let id_str: String = row.try_get("id")?;
    let created_at_str: String = row.try_get("created_at")?;
    let title: Option<String> = row.try_get("title")?;
    let cancelled: bool = row.try_get("cancelled")?;
    let summary_str: Option<String> = row.try_get("summary")?;

    let id = JobId::from_str(&id_str).map_err(|e| {
        CacheError::SerializationError(format!("Invalid JobId '{}': {}", id_str, e))
    })?;
    let summary: Option<ScanSummary> = summary_str
        .as_deref()
        .map(|s| parse_json("summary", s))
        .transpose()?;

    Ok(ScanJob::with_id(
        id,
        parse_datetime(&created_at_str)?,
        title,
        cancelled,
        summary,
    ))
}

fn checkpoint_from_row(job_id: JobId, row: &SqliteRow) -> Result<TraversalCheckpoint, CacheError> {
    let counters: ScanCounters = parse_json("counters", &row.try_get::<String, _>("counters")?)?;
    let flags = CheckpointFlags {
        workspaces_counted: row.try_get("workspaces_counted")?,
        apps_counted: row.try_get("apps_counted")?,
    };
    let updated_at = parse_datetime(&row.try_get::<String, _>("updated_at")?)?;

    Ok(TraversalCheckpoint::from_parts(
        job_id,
        from_db_index(row.try_get("org_index")?)?,
        from_db_index(row.try_get("org_total")?)?,
        from_db_index(row.try_get("workspace_index")?)?,
        from_db_index(row.try_get("workspace_total")?)?,
        from_db_index(row.try_get("app_index")?)?,
        from_db_index(row.try_get("app_total")?)?,
        flags,
        counters,
        updated_at,
    ))
}

fn entity_from_row(row: &SqliteRow) -> Result<DiscoveredEntity, CacheError> {
    let job_str: String = row.try_get("job_id")?;
    let kind_str: String = row.try_get("kind")?;
    let remote_id: i64 = row.try_get("remote_id")?;
    let parents_str: String = row.try_get("parents")?;
    let name: String = row.try_get("name")?;
    let destination: String = row.try_get("destination_path")?;
    let size_bytes: Option<i64> = row.try_get("size_bytes")?;
    let item_count: Option<i64> = row.try_get("item_count")?;
    let download_url: Option<String> = row.try_get("download_url")?;
    let mime_type: Option<String> = row.try_get("mime_type")?;
    let status_str: String = row.try_get("status")?;
    let status_reason: Option<String> = row.try_get("status_reason")?;
    let export_batch: Option<i64> = row.try_get("export_batch")?;

    let job_id = JobId::from_str(&job_str)
        .map_err(|e| CacheError::SerializationError(format!("Invalid JobId '{job_str}': {e}")))?;
    let kind = EntityKind::from_str(&kind_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let parents: ParentIds = parse_json("parents", &parents_str)?;
    let status = EntityStatus::from_parts(&status_str, status_reason)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    let mut entity = DiscoveredEntity::new(
        job_id,
        kind,
        parents,
        from_db_id(remote_id),
        name,
        PathBuf::from(destination),
    );
    if let Some(size) = from_db_count(size_bytes) {
        entity = entity.with_size(size);
    }
    if let Some(count) = from_db_count(item_count) {
        entity = entity.with_item_count(count);
    }
    if let Some(url) = download_url {
        entity = entity.with_download_url(url);
    }
    if let Some(mime) = mime_type {
        entity = entity.with_mime_type(mime);
    }
    let batch = export_batch.map(|b| BatchId::new(b as u64));
    Ok(entity.with_state(status, batch))
}

fn failed_unit_from_row(row: &SqliteRow) -> Result<FailedUnit, CacheError> {
    let kind_str: String = row.try_get("kind")?;
    let remote_id: i64 = row.try_get("remote_id")?;
    let name: String = row.try_get("name")?;
    let reason: String = row.try_get("reason")?;
    let attempts: i64 = row.try_get("attempts")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    let kind = UnitKind::from_str(&kind_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;

    Ok(FailedUnit::with_timestamp(
        kind,
        from_db_id(remote_id),
        name,
        reason,
        attempts.clamp(0, i64::from(u32::MAX)) as u32,
        parse_datetime(&recorded_at)?,
    ))
}

fn active_limit_from_row(row: &SqliteRow) -> Result<ActiveRateLimit, CacheError> {
    let category_str: String = row.try_get("category")?;
    let resume_at: String = row.try_get("resume_at")?;
    let category = QuotaCategory::from_str(&category_str)
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    Ok(ActiveRateLimit::new(category, parse_datetime(&resume_at)?))
}

// ============================================================================
// ICheckpointStore implementation
// ============================================================================

#[async_trait::async_trait]
impl ICheckpointStore for SqliteCheckpointStore {
    // --- Jobs ---

    async fn begin_job(&self, title: Option<&str>) -> anyhow::Result<JobId> {
        let job = ScanJob::new(title.map(str::to_string));

        sqlx::query("INSERT INTO scan_jobs (id, created_at, title, cancelled) VALUES (?, ?, ?, 0)")
            .bind(job.id().to_string())
            .bind(job.created_at().to_rfc3339())
            .bind(job.title())
            .execute(&self.pool)
            .await
            .context("Failed to create scan job")?;

        tracing::debug!(job_id = %job.id(), "Created scan job");
        Ok(*job.id())
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<ScanJob>> {
        Ok(self.fetch_job(job_id).await?)
    }

    async fn latest_job(&self) -> anyhow::Result<Option<ScanJob>> {
        // Insertion order, so jobs created within the same instant still sort
        let row = sqlx::query("SELECT * FROM scan_jobs ORDER BY rowid DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    async fn find_incomplete_job(&self) -> anyhow::Result<Option<ScanJob>> {
        Ok(self.latest_job().await?.filter(ScanJob::is_resumable))
    }

    async fn find_recent_completed(&self, max_age: Duration) -> anyhow::Result<Option<ScanJob>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age)?;
        let rows = sqlx::query(
            "SELECT * FROM scan_jobs WHERE summary IS NOT NULL ORDER BY rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let job = job_from_row(row)?;
            if job.summary().is_some_and(|s| s.completed_at >= cutoff) {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    async fn finalize_job(
        &self,
        job_id: &JobId,
        completion: &JobCompletion,
    ) -> anyhow::Result<ScanSummary> {
        completion.validate()?;

        let unresolved: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM failed_units WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        if unresolved > 0 {
            bail!("job {job_id} has {unresolved} unresolved failed unit(s)");
        }

        let mut job = self.require_job(job_id).await?;
        job.complete(completion.summary.clone())?;
        self.store_job(&job).await?;

        tracing::info!(job_id = %job_id, "Scan job finalized");
        Ok(completion.summary.clone())
    }

    async fn mark_cancelled(&self, job_id: &JobId) -> anyhow::Result<()> {
        let mut job = self.require_job(job_id).await?;
        job.cancel()?;
        self.store_job(&job).await?;
        tracing::info!(job_id = %job_id, "Scan job marked cancelled");
        Ok(())
    }

    // --- Checkpoints ---

    async fn save_checkpoint(
        &self,
        job_id: &JobId,
        checkpoint: &TraversalCheckpoint,
    ) -> anyhow::Result<()> {
        if checkpoint.job_id() != job_id {
            bail!(
                "checkpoint belongs to job {}, not {job_id}",
                checkpoint.job_id()
            );
        }
        if let Some(previous) = self.load_checkpoint(job_id).await? {
            checkpoint.ensure_follows(&previous)?;
        }

        let flags = checkpoint.flags();
        let counters = to_json("counters", checkpoint.counters())?;

        sqlx::query(
            "INSERT OR REPLACE INTO scan_checkpoints \
             (job_id, org_index, org_total, workspace_index, workspace_total, \
              app_index, app_total, workspaces_counted, apps_counted, counters, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(i64::from(checkpoint.org_index()))
        .bind(i64::from(checkpoint.org_total()))
        .bind(i64::from(checkpoint.workspace_index()))
        .bind(i64::from(checkpoint.workspace_total()))
        .bind(i64::from(checkpoint.app_index()))
        .bind(i64::from(checkpoint.app_total()))
        .bind(flags.workspaces_counted)
        .bind(flags.apps_counted)
        .bind(&counters)
        .bind(checkpoint.updated_at().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(job_id = %job_id, cursor = ?checkpoint.cursor(), "Saved checkpoint");
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: &JobId) -> anyhow::Result<Option<TraversalCheckpoint>> {
        let row = sqlx::query("SELECT * FROM scan_checkpoints WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .as_ref()
            .map(|r| checkpoint_from_row(*job_id, r))
            .transpose()?)
    }

    // --- Discovered entities ---

    async fn save_entity(&self, entity: &DiscoveredEntity) -> anyhow::Result<()> {
        let parents = to_json("parents", entity.parents())?;
        let status = entity.status();
        let reason = match status {
            EntityStatus::Failed(reason) => Some(reason.as_str()),
            _ => None,
        };

        // A re-discovered entity keeps its stored status and batch
        sqlx::query(
            "INSERT OR IGNORE INTO discovered_entities \
             (job_id, kind, remote_id, parents, name, destination_path, size_bytes, \
              item_count, download_url, mime_type, status, status_reason, export_batch, \
              discovered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entity.job_id().to_string())
        .bind(entity.kind().to_string())
        .bind(to_db_id(entity.remote_id().as_u64()))
        .bind(&parents)
        .bind(entity.name())
        .bind(entity.destination_path().to_string_lossy().into_owned())
        .bind(entity.size_bytes().map(to_db_id))
        .bind(entity.item_count().map(to_db_id))
        .bind(entity.download_url())
        .bind(entity.mime_type())
        .bind(status.as_str())
        .bind(reason)
        .bind(entity.export_batch().map(|b| to_db_id(b.as_u64())))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_entity_status(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
        status: &EntityStatus,
    ) -> anyhow::Result<()> {
        let reason = match status {
            EntityStatus::Failed(reason) => Some(reason.as_str()),
            _ => None,
        };
        let result = sqlx::query(
            "UPDATE discovered_entities SET status = ?, status_reason = ? \
             WHERE job_id = ? AND kind = ? AND remote_id = ?",
        )
        .bind(status.as_str())
        .bind(reason)
        .bind(job_id.to_string())
        .bind(kind.to_string())
        .bind(to_db_id(remote_id.as_u64()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(format!("{kind} {remote_id} in job {job_id}")).into());
        }
        Ok(())
    }

    async fn set_export_batch(
        &self,
        job_id: &JobId,
        app_id: RemoteId,
        batch: Option<BatchId>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE discovered_entities SET export_batch = ? \
             WHERE job_id = ? AND kind = ? AND remote_id = ?",
        )
        .bind(batch.map(|b| to_db_id(b.as_u64())))
        .bind(job_id.to_string())
        .bind(EntityKind::App.to_string())
        .bind(to_db_id(app_id.as_u64()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(format!("app {app_id} in job {job_id}")).into());
        }
        tracing::trace!(job_id = %job_id, app = %app_id, ?batch, "Updated export batch");
        Ok(())
    }

    async fn get_entity(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<Option<DiscoveredEntity>> {
        let row = sqlx::query(
            "SELECT * FROM discovered_entities WHERE job_id = ? AND kind = ? AND remote_id = ?",
        )
        .bind(job_id.to_string())
        .bind(kind.to_string())
        .bind(to_db_id(remote_id.as_u64()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(entity_from_row).transpose()?)
    }

    async fn list_entities(
        &self,
        job_id: &JobId,
        kind: Option<EntityKind>,
    ) -> anyhow::Result<Vec<DiscoveredEntity>> {
        let rows = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT * FROM discovered_entities WHERE job_id = ? AND kind = ? \
                     ORDER BY rowid",
                )
                .bind(job_id.to_string())
                .bind(kind.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM discovered_entities WHERE job_id = ? ORDER BY rowid")
                    .bind(job_id.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let entities = rows
            .iter()
            .map(entity_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    // --- Failed units ---

    async fn record_failed_unit(&self, job_id: &JobId, unit: &FailedUnit) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO failed_units \
             (job_id, kind, remote_id, name, reason, attempts, recorded_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job_id.to_string())
        .bind(unit.kind().to_string())
        .bind(to_db_id(unit.remote_id().as_u64()))
        .bind(unit.name())
        .bind(unit.reason())
        .bind(i64::from(unit.attempts()))
        .bind(unit.recorded_at().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            job_id = %job_id,
            kind = %unit.kind(),
            remote_id = %unit.remote_id(),
            "Recorded failed unit"
        );
        Ok(())
    }

    async fn resolve_failed_unit(
        &self,
        job_id: &JobId,
        kind: UnitKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM failed_units WHERE job_id = ? AND kind = ? AND remote_id = ?")
            .bind(job_id.to_string())
            .bind(kind.to_string())
            .bind(to_db_id(remote_id.as_u64()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_failed_units(&self, job_id: &JobId) -> anyhow::Result<Vec<FailedUnit>> {
        let rows = sqlx::query("SELECT * FROM failed_units WHERE job_id = ? ORDER BY rowid")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        let units = rows
            .iter()
            .map(failed_unit_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(units)
    }

    // --- Active rate limits ---

    async fn save_active_limit(&self, limit: &ActiveRateLimit) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO active_rate_limits (category, resume_at) VALUES (?, ?)")
            .bind(limit.category().as_str())
            .bind(limit.resume_at().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_active_limits(&self) -> anyhow::Result<Vec<ActiveRateLimit>> {
        let rows = sqlx::query("SELECT * FROM active_rate_limits")
            .fetch_all(&self.pool)
            .await?;
        let mut limits = rows
            .iter()
            .map(active_limit_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        limits.sort_by_key(|l| QuotaCategory::ALL.iter().position(|c| *c == l.category()));
        Ok(limits)
    }

    async fn clear_active_limit(&self, category: QuotaCategory) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM active_rate_limits WHERE category = ?")
            .bind(category.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
