//! In-memory adapters
//!
//! [`MemoryCheckpointStore`] enforces the same rules as the SQLite store
//! (forward-only checkpoints, gated finalization, idempotent entity
//! writes) without touching disk. It backs the engine tests and runs that
//! do not need to survive a restart.
//!
//! [`MemoryWriteSink`] records blobs and directories instead of writing
//! them; the CLI uses it for `--dry-run`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use chrono::Utc;

use podsync_core::domain::{
    ActiveRateLimit, BatchId, DiscoveredEntity, EntityKind, EntityStatus, FailedUnit, JobCompletion,
    JobId, QuotaCategory, RemoteId, ScanJob, ScanSummary, TraversalCheckpoint, UnitKind,
};
use podsync_core::ports::{ICheckpointStore, IWritePathSink};

// ============================================================================
// MemoryCheckpointStore
// ============================================================================

#[derive(Debug, Default)]
struct StoreState {
    /// Jobs in creation order
    jobs: Vec<ScanJob>,
    checkpoints: HashMap<JobId, TraversalCheckpoint>,
    /// Entities per job in discovery order
    entities: HashMap<JobId, Vec<DiscoveredEntity>>,
    failed_units: HashMap<JobId, Vec<FailedUnit>>,
    active_limits: HashMap<QuotaCategory, ActiveRateLimit>,
}

impl StoreState {
    fn job_mut(&mut self, job_id: &JobId) -> anyhow::Result<&mut ScanJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id() == job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))
    }

    fn entity_mut(
        &mut self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<&mut DiscoveredEntity> {
        self.entities
            .get_mut(job_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|e| e.kind() == kind && e.remote_id() == remote_id)
            })
            .ok_or_else(|| anyhow!("{kind} {remote_id} not recorded for job {job_id}"))
    }
}

/// Checkpoint store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<StoreState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ICheckpointStore for MemoryCheckpointStore {
    async fn begin_job(&self, title: Option<&str>) -> anyhow::Result<JobId> {
        let job = ScanJob::new(title.map(str::to_string));
        let id = *job.id();
        self.lock().jobs.push(job);
        Ok(id)
    }

    async fn get_job(&self, job_id: &JobId) -> anyhow::Result<Option<ScanJob>> {
        Ok(self.lock().jobs.iter().find(|j| j.id() == job_id).cloned())
    }

    async fn latest_job(&self) -> anyhow::Result<Option<ScanJob>> {
        Ok(self.lock().jobs.last().cloned())
    }

    async fn find_incomplete_job(&self) -> anyhow::Result<Option<ScanJob>> {
        Ok(self
            .lock()
            .jobs
            .last()
            .filter(|j| j.is_resumable())
            .cloned())
    }

    async fn find_recent_completed(&self, max_age: Duration) -> anyhow::Result<Option<ScanJob>> {
        let max_age = chrono::Duration::from_std(max_age)?;
        let cutoff = Utc::now() - max_age;
        Ok(self
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|j| j.summary().is_some_and(|s| s.completed_at >= cutoff))
            .cloned())
    }

    async fn finalize_job(
        &self,
        job_id: &JobId,
        completion: &JobCompletion,
    ) -> anyhow::Result<ScanSummary> {
        completion.validate()?;
        let mut state = self.lock();
        let unresolved = state.failed_units.get(job_id).map_or(0, Vec::len);
        if unresolved > 0 {
            bail!("job {job_id} has {unresolved} unresolved failed unit(s)");
        }
        let job = state.job_mut(job_id)?;
        job.complete(completion.summary.clone())?;
        Ok(completion.summary.clone())
    }

    async fn mark_cancelled(&self, job_id: &JobId) -> anyhow::Result<()> {
        self.lock().job_mut(job_id)?.cancel()?;
        Ok(())
    }

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
        let mut state = self.lock();
        if let Some(previous) = state.checkpoints.get(job_id) {
            checkpoint.ensure_follows(previous)?;
        }
        state.checkpoints.insert(*job_id, checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, job_id: &JobId) -> anyhow::Result<Option<TraversalCheckpoint>> {
        Ok(self.lock().checkpoints.get(job_id).cloned())
    }

    async fn save_entity(&self, entity: &DiscoveredEntity) -> anyhow::Result<()> {
        let mut state = self.lock();
        let list = state.entities.entry(*entity.job_id()).or_default();
        let known = list
            .iter()
            .any(|e| e.kind() == entity.kind() && e.remote_id() == entity.remote_id());
        if !known {
            list.push(entity.clone());
        }
        Ok(())
    }

    async fn update_entity_status(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
        status: &EntityStatus,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        let entity = state.entity_mut(job_id, kind, remote_id)?;
        let batch = entity.export_batch();
        *entity = entity.clone().with_state(status.clone(), batch);
        Ok(())
    }

    async fn set_export_batch(
        &self,
        job_id: &JobId,
        app_id: RemoteId,
        batch: Option<BatchId>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock();
        let entity = state.entity_mut(job_id, EntityKind::App, app_id)?;
        let status = entity.status().clone();
        *entity = entity.clone().with_state(status, batch);
        Ok(())
    }

    async fn get_entity(
        &self,
        job_id: &JobId,
        kind: EntityKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<Option<DiscoveredEntity>> {
        Ok(self.lock().entities.get(job_id).and_then(|list| {
            list.iter()
                .find(|e| e.kind() == kind && e.remote_id() == remote_id)
                .cloned()
        }))
    }

    async fn list_entities(
        &self,
        job_id: &JobId,
        kind: Option<EntityKind>,
    ) -> anyhow::Result<Vec<DiscoveredEntity>> {
        Ok(self
            .lock()
            .entities
            .get(job_id)
            .map(|list| {
                list.iter()
                    .filter(|e| kind.map_or(true, |k| e.kind() == k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_failed_unit(&self, job_id: &JobId, unit: &FailedUnit) -> anyhow::Result<()> {
        let mut state = self.lock();
        let list = state.failed_units.entry(*job_id).or_default();
        list.retain(|u| !(u.kind() == unit.kind() && u.remote_id() == unit.remote_id()));
        list.push(unit.clone());
        Ok(())
    }

    async fn resolve_failed_unit(
        &self,
        job_id: &JobId,
        kind: UnitKind,
        remote_id: RemoteId,
    ) -> anyhow::Result<()> {
        if let Some(list) = self.lock().failed_units.get_mut(job_id) {
            list.retain(|u| !(u.kind() == kind && u.remote_id() == remote_id));
        }
        Ok(())
    }

    async fn list_failed_units(&self, job_id: &JobId) -> anyhow::Result<Vec<FailedUnit>> {
        Ok(self
            .lock()
            .failed_units
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_active_limit(&self, limit: &ActiveRateLimit) -> anyhow::Result<()> {
        self.lock().active_limits.insert(limit.category(), *limit);
        Ok(())
    }

    async fn load_active_limits(&self) -> anyhow::Result<Vec<ActiveRateLimit>> {
        let state = self.lock();
        Ok(QuotaCategory::ALL
            .iter()
            .filter_map(|c| state.active_limits.get(c).copied())
            .collect())
    }

    async fn clear_active_limit(&self, category: QuotaCategory) -> anyhow::Result<()> {
        self.lock().active_limits.remove(&category);
        Ok(())
    }
}

// ============================================================================
// MemoryWriteSink
// ============================================================================

#[derive(Debug, Default)]
struct SinkState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

/// Write sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryWriteSink {
    state: Mutex<SinkState>,
}

impl MemoryWriteSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contents written to `path`, if any
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Every written path, sorted
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    /// Every directory ensured, sorted
    pub fn dirs(&self) -> Vec<PathBuf> {
        self.lock().dirs.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl IWritePathSink for MemoryWriteSink {
    async fn write_blob(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let mut state = self.lock();
        if let Some(parent) = path.parent() {
            for ancestor in parent.ancestors() {
                if !ancestor.as_os_str().is_empty() {
                    state.dirs.insert(ancestor.to_path_buf());
                }
            }
        }
        state.files.insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    async fn ensure_dir(&self, path: &Path) -> anyhow::Result<()> {
        let mut state = self.lock();
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                state.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        let state = self.lock();
        Ok(state.files.contains_key(path) || state.dirs.contains(path))
    }
}

// ============================================================================
// Unit tests
// ============================================================================
