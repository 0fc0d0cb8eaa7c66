//! Hierarchy walker: the traversal state machine
//!
//! Walks organizations → workspaces → apps, persisting every discovered
//! entity and a forward-only [`TraversalCheckpoint`] as it goes, so that a
//! job interrupted by quota exhaustion, a crash or an operator can resume
//! without redoing completed work.
//!
//! ## Architecture
//!
//! ```text
//! HierarchyWalker
//!   ├── ScanControl     (state, cancel, pause, force-resume)
//!   ├── RequestGate     (one call in flight, quota reservation)
//!   │     └── QuotaTracker
//!   ├── BackoffRetrier  (transient failures)
//!   ├── AsyncJobPoller  (app exports)
//!   └── ports: IRemoteApi, ICheckpointStore, IWritePathSink, IProgressSink
//! ```
//!
//! ## Design Notes
//!
//! - Organizations and workspaces are strictly sequential; apps of one
//!   workspace fan out in bounded chunks.
//! - The checkpoint advances over the contiguous prefix of successful
//!   apps. Entities are persisted before the counters that include them.
//! - A failed organization pins the persisted checkpoint: later
//!   organizations are still walked, but nothing after the failure is
//!   checkpointed, so the next resume retries from the failed one.
//! - Only the walker transitions [`JobState`].
//! - Progress stays monotonic across runs of one job on the same walker:
//!   each run's reporter starts from the highest percentage published so
//!   far, even when a pinned checkpoint resumes from an earlier cursor.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use podsync_core::config::Config;
use podsync_core::domain::{
    export_file_name, sanitize_component, ActiveRateLimit, DiscoveredEntity, EntityKind,
    EntityStatus, FailedUnit, JobCompletion, JobId, JobState, ParentIds, RemoteId, ScanCounters,
    ScanError, ScanJob, ScanSummary, SuspendReason, TraversalCheckpoint, UnitKind, FILES_DIR,
};
use podsync_core::ports::{
    ApiError, ApiOperation, ApiReply, App, ICheckpointStore, IProgressSink, IRemoteApi,
    IWritePathSink, Organization, PageRequest, RemoteFile, Workspace,
};

use crate::clock::Clock;
use crate::control::ScanControl;
use crate::gate::{OperationClassifier, RequestGate, DEFAULT_HEAVY_MARKERS};
use crate::poller::{AsyncJobPoller, ExportHandle, PollerOptions};
use crate::progress::ProgressReporter;
use crate::quota::{QuotaSettings, QuotaTracker};
use crate::retry::{BackoffRetrier, RetryPolicy};

// ============================================================================
// Options, dependencies and outcome
// ============================================================================

/// What a traversal does with each app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Discover and record the hierarchy only
    #[default]
    ScanOnly,
    /// Also export every app to a spreadsheet
    Export,
}

/// Tunables of a walker
#[derive(Debug, Clone)]
pub struct WalkerOptions {
    pub mode: ScanMode,
    /// Apps processed concurrently within a workspace
    pub app_concurrency: usize,
    /// Consecutive quota failures before an organization is recorded as failed
    pub max_org_attempts: u32,
    pub files_page_size: u32,
    /// Pause between organizations
    pub unit_delay: Duration,
    /// Wait out quota suspensions instead of stopping
    pub auto_wait: bool,
    pub quota: QuotaSettings,
    pub retry: RetryPolicy,
    pub poller: PollerOptions,
    pub dispatch_delay: Duration,
    pub default_retry_after: Duration,
    pub heavy_markers: Vec<String>,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::ScanOnly,
            app_concurrency: 3,
            max_org_attempts: 3,
            files_page_size: 100,
            unit_delay: Duration::from_millis(100),
            auto_wait: true,
            quota: QuotaSettings::default(),
            retry: RetryPolicy::default(),
            poller: PollerOptions::default(),
            dispatch_delay: Duration::from_millis(50),
            default_retry_after: Duration::from_secs(60),
            heavy_markers: DEFAULT_HEAVY_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl From<&Config> for WalkerOptions {
    fn from(config: &Config) -> Self {
        Self {
            mode: if config.traversal.export_apps {
                ScanMode::Export
            } else {
                ScanMode::ScanOnly
            },
            app_concurrency: config.traversal.app_concurrency.max(1),
            max_org_attempts: config.traversal.max_org_attempts.max(1),
            files_page_size: config.traversal.files_page_size.max(1),
            unit_delay: config.traversal.unit_delay(),
            auto_wait: config.quota.auto_wait,
            quota: QuotaSettings::from(&config.quota),
            retry: RetryPolicy::from(&config.retry),
            poller: PollerOptions::from(config),
            dispatch_delay: config.quota.dispatch_delay(),
            default_retry_after: config.quota.default_retry_after(),
            heavy_markers: config.quota.heavy_endpoints.clone(),
        }
    }
}

/// Adapters a walker runs against
#[derive(Clone)]
pub struct WalkerDeps {
    pub remote: Arc<dyn IRemoteApi>,
    pub store: Arc<dyn ICheckpointStore>,
    pub sink: Arc<dyn IWritePathSink>,
    pub progress: Arc<dyn IProgressSink>,
    pub clock: Arc<dyn Clock>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every unit succeeded; the summary is recorded on the job
    Completed { job_id: JobId, summary: ScanSummary },
    /// Traversal finished with failed units; the job stays resumable
    Incomplete {
        job_id: JobId,
        failed_units: Vec<FailedUnit>,
    },
    /// Stopped on a quota limit because auto-wait is off
    Suspended {
        job_id: JobId,
        limit: ActiveRateLimit,
    },
    /// Stopped at a safe point on operator request
    Paused { job_id: JobId },
    /// Cancelled; the job will not be resumed automatically
    Cancelled { job_id: JobId },
    /// A recent completed job was reused without traversing
    Reused(ScanJob),
}

impl ScanOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            ScanOutcome::Completed { job_id, .. }
            | ScanOutcome::Incomplete { job_id, .. }
            | ScanOutcome::Suspended { job_id, .. }
            | ScanOutcome::Paused { job_id }
            | ScanOutcome::Cancelled { job_id } => *job_id,
            ScanOutcome::Reused(job) => *job.id(),
        }
    }
}

// ============================================================================
// Internal run state
// ============================================================================

/// Whether a traversal step ran to completion
enum Step {
    Done,
    Paused,
}

/// Whether traversal continues after handling a quota suspension
enum Flow {
    Continue,
    Exit(ScanOutcome),
}

struct Run {
    job_id: JobId,
    /// Cursor that always advances; persisted unless `pinned`
    cursor: TraversalCheckpoint,
    /// Set once an organization failed; the stored checkpoint stays put
    pinned: bool,
    reporter: Arc<ProgressReporter>,
}

impl Run {
    fn counters(&self) -> ScanCounters {
        *self.cursor.counters()
    }

    fn absorb(&mut self, tally: &ScanCounters) {
        let mut counters = self.counters();
        counters.absorb(tally);
        self.cursor.set_counters(counters);
    }
}

/// Severity order used when several apps of a chunk fail at once
fn severity(err: &ScanError) -> u8 {
    if err.is_fatal() {
        3
    } else if *err == ScanError::Cancelled {
        2
    } else if err.is_quota_exhausted() {
        1
    } else {
        0
    }
}

fn write_error(err: anyhow::Error) -> ScanError {
    ScanError::Write(format!("{err:#}"))
}

// ============================================================================
// HierarchyWalker
// ============================================================================

/// Drives one scan job at a time over the remote hierarchy
pub struct HierarchyWalker {
    deps: WalkerDeps,
    options: WalkerOptions,
    control: ScanControl,
    gate: Arc<RequestGate>,
    retrier: BackoffRetrier,
    poller: AsyncJobPoller,
    /// Serializes checkpoint writes
    checkpoint_writer: Mutex<()>,
    running: StdMutex<Option<JobId>>,
    /// Reporter of the run in progress
    reporter: StdMutex<Option<Arc<ProgressReporter>>>,
    /// Highest percentage published per job
    high_water: StdMutex<HashMap<JobId, f64>>,
}

impl HierarchyWalker {
    pub fn new(deps: WalkerDeps, options: WalkerOptions) -> Self {
        let tracker = Arc::new(QuotaTracker::new(
            options.quota.clone(),
            Arc::clone(&deps.clock),
        ));
        let control = ScanControl::with_store(Arc::clone(&tracker), Arc::clone(&deps.store));
        let gate = Arc::new(RequestGate::new(
            tracker,
            OperationClassifier::new(options.heavy_markers.iter().cloned()),
            options.dispatch_delay,
            options.default_retry_after,
            control.cancellation(),
        ));
        let retrier = BackoffRetrier::new(options.retry).with_cancellation(control.cancellation());
        let poller = AsyncJobPoller::new(
            Arc::clone(&deps.remote),
            Arc::clone(&gate),
            retrier.clone(),
            control.clone(),
            PollerOptions {
                auto_wait: options.auto_wait,
                ..options.poller
            },
        );
        Self {
            deps,
            options,
            control,
            gate,
            retrier,
            poller,
            checkpoint_writer: Mutex::new(()),
            running: StdMutex::new(None),
            reporter: StdMutex::new(None),
            high_water: StdMutex::new(HashMap::new()),
        }
    }

    /// Control handle shared with the operator
    pub fn control(&self) -> &ScanControl {
        &self.control
    }

    pub fn options(&self) -> &WalkerOptions {
        &self.options
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Begins a fresh job
    ///
    /// # Errors
    /// Returns the fatal error (`AuthExpired`, `InvalidRequest`, `Storage`,
    /// ...) that aborted the job; its checkpoint is retained.
    #[instrument(skip(self))]
    pub async fn start(&self, title: Option<&str>) -> Result<ScanOutcome, ScanError> {
        let job_id = self.deps.store.begin_job(title).await?;
        info!(job_id = %job_id, "Starting scan job");
        self.run(job_id).await
    }

    /// Continues a job from its stored checkpoint
    ///
    /// Completed jobs report their summary and cancelled jobs are left
    /// alone; neither is traversed again. A job created with
    /// `ICheckpointStore::begin_job` that has no checkpoint yet starts from
    /// the first organization, which lets callers know the job id before
    /// traversal begins.
    ///
    /// # Errors
    /// `ScanError::Storage` if the job does not exist, or the fatal error
    /// that aborted the run.
    #[instrument(skip(self))]
    pub async fn resume_from_checkpoint(&self, job_id: JobId) -> Result<ScanOutcome, ScanError> {
        let job = self
            .deps
            .store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| ScanError::Storage(format!("job {job_id} not found")))?;

        if let Some(summary) = job.summary() {
            info!(job_id = %job_id, "Job already completed");
            return Ok(ScanOutcome::Completed {
                job_id,
                summary: summary.clone(),
            });
        }
        if job.is_cancelled() {
            warn!(job_id = %job_id, "Refusing to resume a cancelled job");
            return Ok(ScanOutcome::Cancelled { job_id });
        }

        info!(job_id = %job_id, "Running scan job from its checkpoint");
        self.run(job_id).await
    }

    /// Resumes the latest incomplete job, or starts a fresh one
    ///
    /// # Errors
    /// See [`HierarchyWalker::start`].
    pub async fn resume_or_start(&self, title: Option<&str>) -> Result<ScanOutcome, ScanError> {
        match self.deps.store.find_incomplete_job().await? {
            Some(job) => self.resume_from_checkpoint(*job.id()).await,
            None => self.start(title).await,
        }
    }

    /// Returns a completed job younger than `max_age`, if one exists
    ///
    /// # Errors
    /// `ScanError::Storage` if the store cannot be read.
    pub async fn reuse_recent(&self, max_age: Duration) -> Result<Option<ScanOutcome>, ScanError> {
        let recent = self.deps.store.find_recent_completed(max_age).await?;
        if let Some(job) = &recent {
            info!(job_id = %job.id(), "Reusing recent completed scan");
        }
        Ok(recent.map(ScanOutcome::Reused))
    }

    /// Cancels a job, running or not
    ///
    /// # Errors
    /// `ScanError::Storage` if the job cannot be flagged.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<(), ScanError> {
        let running = *self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running == Some(job_id) {
            self.control.cancel();
            return Ok(());
        }
        self.deps.store.mark_cancelled(&job_id).await?;
        info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    /// Clears every active limit, in memory and in the store
    ///
    /// # Returns
    /// Number of limits cleared in memory; zero is a no-op.
    ///
    /// # Errors
    /// `ScanError::Storage` if persisted limits cannot be removed.
    pub async fn force_resume(&self) -> Result<usize, ScanError> {
        let cleared = self.control.force_resume();
        for limit in self.deps.store.load_active_limits().await? {
            self.deps.store.clear_active_limit(limit.category()).await?;
        }
        Ok(cleared)
    }

    // ========================================================================
    // Run lifecycle
    // ========================================================================

    async fn run(&self, job_id: JobId) -> Result<ScanOutcome, ScanError> {
        let floor = self
            .high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .copied()
            .unwrap_or(0.0);
        let reporter = Arc::new(ProgressReporter::with_floor(
            job_id,
            Arc::clone(&self.deps.progress),
            floor,
        ));

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(job_id);
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&reporter));
        self.control.begin_run();
        let result = self.traverse(job_id, Arc::clone(&reporter)).await;
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.reporter.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, reporter.last_percent());

        match result {
            Ok(outcome) => Ok(outcome),
            Err(ScanError::Cancelled) => {
                self.deps.store.mark_cancelled(&job_id).await?;
                self.control.set_state(JobState::Cancelled);
                info!(job_id = %job_id, "Scan cancelled");
                Ok(ScanOutcome::Cancelled { job_id })
            }
            Err(e) => {
                error!(job_id = %job_id, code = e.code(), error = %e, "Scan aborted");
                self.control.set_state(JobState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn traverse(
        &self,
        job_id: JobId,
        reporter: Arc<ProgressReporter>,
    ) -> Result<ScanOutcome, ScanError> {
        self.control.set_state(JobState::Initializing);

        let persisted = self.deps.store.load_active_limits().await?;
        self.control.tracker().restore(persisted);
        self.control.prune_persisted_limits().await?;

        let stored = self.deps.store.load_checkpoint(&job_id).await?;
        let resumed = stored.is_some();
        let cursor = stored.unwrap_or_else(|| TraversalCheckpoint::new(job_id, 0));
        let mut run = Run {
            job_id,
            cursor,
            pinned: false,
            reporter,
        };

        self.control.set_state(JobState::Traversing);
        run.reporter.report(
            ProgressReporter::percent_for(&run.cursor),
            if resumed {
                "Resuming scan"
            } else {
                "Starting scan"
            },
            &run.counters(),
            JobState::Traversing,
        );

        if resumed {
            if let Flow::Exit(outcome) = self.retry_failed_exports(&mut run).await? {
                return Ok(outcome);
            }
        }

        let organizations = loop {
            match self
                .call(ApiOperation::ListOrganizations, || {
                    self.deps.remote.list_organizations()
                })
                .await
            {
                Ok(orgs) => break orgs,
                Err(ScanError::QuotaExhausted {
                    category,
                    resume_at,
                }) => {
                    let limit = ActiveRateLimit::new(category, resume_at);
                    if let Flow::Exit(outcome) = self.on_quota(&run, limit).await? {
                        return Ok(outcome);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        info!(count = organizations.len(), "Organizations listed");

        for org in &organizations {
            self.persist(&self.org_entity(job_id, org)).await?;
        }
        run.cursor.set_org_total(organizations.len() as u32);
        self.save_checkpoint(&run).await?;

        let start = run.cursor.org_index() as usize;
        for (index, org) in organizations.iter().enumerate().skip(start) {
            if let Some(outcome) = self.safe_point(&run)? {
                return Ok(outcome);
            }
            if index > start && !self.options.unit_delay.is_zero() {
                self.pause_between_units().await?;
            }
            if let Flow::Exit(outcome) = self.process_organization(&mut run, org).await? {
                return Ok(outcome);
            }
        }

        self.finalize(&run).await
    }

    /// Checks cancellation and pause at a unit boundary
    fn safe_point(&self, run: &Run) -> Result<Option<ScanOutcome>, ScanError> {
        if self.control.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if self.control.is_pause_requested() {
            return Ok(Some(self.paused(run)));
        }
        Ok(None)
    }

    fn paused(&self, run: &Run) -> ScanOutcome {
        let state = JobState::Suspended(SuspendReason::ManualPause);
        self.control.set_state(state.clone());
        run.reporter.report(
            run.reporter.last_percent(),
            "paused",
            &run.counters(),
            state,
        );
        info!(job_id = %run.job_id, "Scan paused");
        ScanOutcome::Paused {
            job_id: run.job_id,
        }
    }

    async fn pause_between_units(&self) -> Result<(), ScanError> {
        let cancel = self.control.cancellation_token();
        tokio::select! {
            _ = tokio::time::sleep(self.options.unit_delay) => Ok(()),
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
        }
    }

    // ========================================================================
    // Quota suspension
    // ========================================================================

    /// Announces a quota suspension and waits it out if auto-wait is on
    async fn on_quota(&self, run: &Run, limit: ActiveRateLimit) -> Result<Flow, ScanError> {
        let limit = self
            .control
            .tracker()
            .active_limit()
            .map_or(limit, |active| active.merge(limit));
        warn!(
            job_id = %run.job_id,
            category = %limit.category(),
            resume_at = %limit.resume_at(),
            "Quota exhausted"
        );

        let state = JobState::Suspended(SuspendReason::Quota {
            category: limit.category(),
            resume_at: limit.resume_at(),
        });
        self.control.set_state(state.clone());
        self.control.persist_active_limits().await?;
        run.reporter.report(
            run.reporter.last_percent(),
            state.to_string(),
            &run.counters(),
            state,
        );

        if !self.options.auto_wait {
            return Ok(Flow::Exit(ScanOutcome::Suspended {
                job_id: run.job_id,
                limit,
            }));
        }
        self.control.wait_for_quota(limit).await?;
        Ok(Flow::Continue)
    }

    // ========================================================================
    // Organizations
    // ========================================================================

    #[instrument(skip(self, run, org), fields(org = %org.id))]
    async fn process_organization(
        &self,
        run: &mut Run,
        org: &Organization,
    ) -> Result<Flow, ScanError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.walk_organization(run, org).await {
                Ok(Step::Done) => {
                    self.deps
                        .store
                        .resolve_failed_unit(&run.job_id, UnitKind::Organization, org.id)
                        .await?;
                    run.cursor.complete_organization();
                    self.save_checkpoint(run).await?;
                    self.report(run, format!("Finished organization {}", org.name));
                    return Ok(Flow::Continue);
                }
                Ok(Step::Paused) => return Ok(Flow::Exit(self.paused(run))),
                Err(ScanError::QuotaExhausted {
                    category,
                    resume_at,
                }) => {
                    let limit = ActiveRateLimit::new(category, resume_at);
                    if attempts >= self.options.max_org_attempts {
                        self.fail_organization(run, org, "quota exhausted", attempts)
                            .await?;
                        return self.on_quota(run, limit).await;
                    }
                    if let Flow::Exit(outcome) = self.on_quota(run, limit).await? {
                        return Ok(Flow::Exit(outcome));
                    }
                    info!(org = %org.name, attempt = attempts + 1, "Retrying organization");
                }
                Err(e) if e.is_fatal() || e == ScanError::Cancelled => return Err(e),
                Err(e) => {
                    self.fail_organization(run, org, &e.to_string(), attempts)
                        .await?;
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// Records a failed organization and moves the in-memory cursor past it
    async fn fail_organization(
        &self,
        run: &mut Run,
        org: &Organization,
        reason: &str,
        attempts: u32,
    ) -> Result<(), ScanError> {
        warn!(org = %org.name, org_id = %org.id, reason, attempts, "Organization failed");
        let unit = FailedUnit::new(UnitKind::Organization, org.id, &org.name, reason, attempts);
        self.deps.store.record_failed_unit(&run.job_id, &unit).await?;
        if !run.pinned {
            debug!(cursor = ?run.cursor.cursor(), "Checkpoint pinned at failed organization");
            run.pinned = true;
        }
        run.cursor.complete_organization();
        Ok(())
    }

    async fn walk_organization(&self, run: &mut Run, org: &Organization) -> Result<Step, ScanError> {
        let org_dir = PathBuf::from(sanitize_component(&org.name));
        self.deps
            .sink
            .ensure_dir(&org_dir)
            .await
            .map_err(write_error)?;

        let workspaces = self
            .call(ApiOperation::ListWorkspaces(org.id), || {
                self.deps.remote.list_workspaces(org.id)
            })
            .await?;

        for ws in &workspaces {
            self.persist(&self.workspace_entity(run.job_id, org, ws, &org_dir))
                .await?;
        }
        if !run.cursor.flags().workspaces_counted {
            run.absorb(&ScanCounters {
                organizations: 1,
                workspaces: workspaces.len() as u64,
                ..ScanCounters::default()
            });
            run.cursor.begin_organization(workspaces.len() as u32);
            self.save_checkpoint(run).await?;
        }

        let start = run.cursor.workspace_index() as usize;
        for ws in workspaces.iter().skip(start) {
            if self.control.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if self.control.is_pause_requested() {
                return Ok(Step::Paused);
            }
            if let Step::Paused = self.walk_workspace(run, org, ws, &org_dir).await? {
                return Ok(Step::Paused);
            }
            run.cursor.complete_workspace();
            self.save_checkpoint(run).await?;
            self.report(run, format!("Scanned {} / {}", org.name, ws.name));
        }
        Ok(Step::Done)
    }

    // ========================================================================
    // Workspaces and apps
    // ========================================================================

    async fn walk_workspace(
        &self,
        run: &mut Run,
        org: &Organization,
        ws: &Workspace,
        org_dir: &Path,
    ) -> Result<Step, ScanError> {
        let ws_dir = org_dir.join(sanitize_component(&ws.name));
        self.deps
            .sink
            .ensure_dir(&ws_dir)
            .await
            .map_err(write_error)?;

        let apps = self
            .call(ApiOperation::ListApps(ws.id), || {
                self.deps.remote.list_apps(ws.id)
            })
            .await?;
        if !run.cursor.flags().apps_counted {
            run.cursor.begin_workspace(apps.len() as u32);
            self.save_checkpoint(run).await?;
        }

        let job_id = run.job_id;
        let chunk_size = self.options.app_concurrency.max(1);
        let mut next = (run.cursor.app_index() as usize).min(apps.len());

        while next < apps.len() {
            if self.control.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if self.control.is_pause_requested() {
                return Ok(Step::Paused);
            }

            let chunk = &apps[next..(next + chunk_size).min(apps.len())];
            let results = join_all(
                chunk
                    .iter()
                    .map(|app| self.process_app(job_id, org, ws, app, &ws_dir)),
            )
            .await;

            let mut completed = 0u32;
            let mut failure: Option<ScanError> = None;
            for result in results {
                match result {
                    Ok(tally) if failure.is_none() => {
                        run.absorb(&tally);
                        completed += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(match failure {
                            Some(current) if severity(&current) >= severity(&e) => current,
                            _ => e,
                        });
                    }
                }
            }

            if completed > 0 {
                run.cursor
                    .complete_apps(completed)
                    .map_err(|e| ScanError::Storage(e.to_string()))?;
                self.save_checkpoint(run).await?;
                self.report(run, format!("Scanned apps of {} / {}", org.name, ws.name));
            }
            if let Some(e) = failure {
                return Err(e);
            }
            next += chunk.len();
        }
        Ok(Step::Done)
    }

    /// Discovers one app and its files, exporting it in export mode
    ///
    /// Returns the counters covering the app.
    async fn process_app(
        &self,
        job_id: JobId,
        org: &Organization,
        ws: &Workspace,
        app: &App,
        ws_dir: &Path,
    ) -> Result<ScanCounters, ScanError> {
        if self.control.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let app_dir = ws_dir.join(sanitize_component(&app.name));
        self.deps
            .sink
            .ensure_dir(&app_dir)
            .await
            .map_err(write_error)?;

        let items = self
            .call(ApiOperation::CountItems(app.id), || {
                self.deps.remote.count_items(app.id)
            })
            .await?;
        let files = self.list_all_files(app.id).await?;

        let parents = ParentIds {
            organization: Some(org.id),
            workspace: Some(ws.id),
            app: None,
        };
        let app_entity = DiscoveredEntity::new(
            job_id,
            EntityKind::App,
            parents,
            app.id,
            &app.name,
            app_dir.clone(),
        )
        .with_item_count(items);
        self.persist(&app_entity).await?;

        let files_dir = app_dir.join(FILES_DIR);
        let file_parents = ParentIds {
            app: Some(app.id),
            ..parents
        };
        let mut bytes = 0u64;
        for file in &files {
            bytes += file.size_bytes;
            self.persist(&file_entity(job_id, file_parents, file, &files_dir))
                .await?;
        }
        if !files.is_empty() {
            self.deps
                .sink
                .ensure_dir(&files_dir)
                .await
                .map_err(write_error)?;
        }
        debug!(app = %app.name, items, files = files.len(), "App discovered");

        if self.options.mode == ScanMode::Export {
            let stored = self
                .deps
                .store
                .get_entity(&job_id, EntityKind::App, app.id)
                .await?
                .unwrap_or(app_entity);
            self.export_or_record(job_id, &stored, 1).await?;
        }

        Ok(ScanCounters {
            apps: 1,
            items,
            files: files.len() as u64,
            bytes,
            ..ScanCounters::default()
        })
    }

    async fn list_all_files(&self, app: RemoteId) -> Result<Vec<RemoteFile>, ScanError> {
        let mut page = PageRequest::first(self.options.files_page_size.max(1));
        let mut files = Vec::new();
        loop {
            let batch = self
                .call(ApiOperation::ListFiles { app, page }, || {
                    self.deps.remote.list_files(app, page)
                })
                .await?;
            let short = (batch.len() as u32) < page.limit;
            files.extend(batch);
            if short {
                return Ok(files);
            }
            page = page.next();
        }
    }

    // ========================================================================
    // Exports
    // ========================================================================

    /// Exports an app, recording a failed unit when the export itself fails
    ///
    /// Quota, cancellation and fatal errors propagate; everything else
    /// stays contained to this app.
    async fn export_or_record(
        &self,
        job_id: JobId,
        app: &DiscoveredEntity,
        attempts: u32,
    ) -> Result<(), ScanError> {
        match self.export_app(job_id, app).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_quota_exhausted() || e.is_fatal() || e == ScanError::Cancelled => {
                Err(e)
            }
            Err(e) => {
                warn!(app = %app.name(), error = %e, "App export failed");
                if matches!(e, ScanError::AsyncJobFailed { .. }) {
                    self.deps
                        .store
                        .set_export_batch(&job_id, app.remote_id(), None)
                        .await?;
                }
                self.deps
                    .store
                    .update_entity_status(
                        &job_id,
                        EntityKind::App,
                        app.remote_id(),
                        &EntityStatus::Failed(e.to_string()),
                    )
                    .await?;
                let unit = FailedUnit::new(
                    UnitKind::Export,
                    app.remote_id(),
                    app.name(),
                    e.to_string(),
                    attempts,
                );
                self.deps.store.record_failed_unit(&job_id, &unit).await?;
                Ok(())
            }
        }
    }

    async fn export_app(&self, job_id: JobId, app: &DiscoveredEntity) -> Result<(), ScanError> {
        let target = app.destination_path().join(export_file_name(app.name()));
        if *app.status() == EntityStatus::Exported
            && self.deps.sink.exists(&target).await.map_err(write_error)?
        {
            debug!(app = %app.name(), "Export already present");
            return Ok(());
        }

        let handle = match app.export_batch() {
            Some(batch) => {
                info!(app = %app.name(), batch_id = %batch, "Resuming pending export");
                ExportHandle::Pending(batch)
            }
            None => {
                let handle = self.poller.submit(app.remote_id()).await?;
                if let Some(batch) = handle.batch_id() {
                    self.deps
                        .store
                        .set_export_batch(&job_id, app.remote_id(), Some(batch))
                        .await?;
                }
                handle
            }
        };

        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let file = self
            .poller
            .await_completion(&handle, reporter.as_deref())
            .await?;
        let bytes = self.poller.download(&file).await?;
        self.deps
            .sink
            .write_blob(&target, &bytes)
            .await
            .map_err(write_error)?;

        self.deps
            .store
            .set_export_batch(&job_id, app.remote_id(), None)
            .await?;
        self.deps
            .store
            .update_entity_status(&job_id, EntityKind::App, app.remote_id(), &EntityStatus::Exported)
            .await?;
        self.deps
            .store
            .resolve_failed_unit(&job_id, UnitKind::Export, app.remote_id())
            .await?;
        info!(app = %app.name(), bytes = bytes.len(), "App exported");
        Ok(())
    }

    /// Retries the exports that failed in an earlier run of the job
    async fn retry_failed_exports(&self, run: &mut Run) -> Result<Flow, ScanError> {
        let failed: Vec<FailedUnit> = self
            .deps
            .store
            .list_failed_units(&run.job_id)
            .await?
            .into_iter()
            .filter(|u| u.kind() == UnitKind::Export)
            .collect();
        if failed.is_empty() {
            return Ok(Flow::Continue);
        }
        info!(count = failed.len(), "Retrying failed exports");

        for unit in failed {
            if let Some(outcome) = self.safe_point(run)? {
                return Ok(Flow::Exit(outcome));
            }
            let Some(app) = self
                .deps
                .store
                .get_entity(&run.job_id, EntityKind::App, unit.remote_id())
                .await?
            else {
                warn!(app_id = %unit.remote_id(), "Failed export has no recorded app");
                continue;
            };
            loop {
                match self
                    .export_or_record(run.job_id, &app, unit.attempts() + 1)
                    .await
                {
                    Ok(()) => break,
                    Err(ScanError::QuotaExhausted {
                        category,
                        resume_at,
                    }) => {
                        let limit = ActiveRateLimit::new(category, resume_at);
                        if let Flow::Exit(outcome) = self.on_quota(run, limit).await? {
                            return Ok(Flow::Exit(outcome));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(Flow::Continue)
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    async fn finalize(&self, run: &Run) -> Result<ScanOutcome, ScanError> {
        let failed_units = self.deps.store.list_failed_units(&run.job_id).await?;
        let active_limit = self.control.tracker().active_limit();
        let counters = run.counters();

        if !failed_units.is_empty() || active_limit.is_some() {
            let state = JobState::Incomplete {
                failed_units: failed_units.len(),
            };
            self.control.set_state(state.clone());
            run.reporter.report(
                run.reporter.last_percent(),
                state.to_string(),
                &counters,
                state,
            );
            warn!(
                job_id = %run.job_id,
                failed = failed_units.len(),
                "Scan finished incomplete"
            );
            return Ok(ScanOutcome::Incomplete {
                job_id: run.job_id,
                failed_units,
            });
        }

        let completion = JobCompletion {
            summary: ScanSummary::from_counters(&counters, self.deps.clock.now()),
            failed_units: Vec::new(),
            active_limit: None,
        };
        let summary = self
            .deps
            .store
            .finalize_job(&run.job_id, &completion)
            .await?;
        run.reporter
            .complete(format!("Scan complete: {counters}"), &counters, &[], None)
            .map_err(|e| ScanError::Storage(e.to_string()))?;
        self.control.set_state(JobState::Completed);
        info!(job_id = %run.job_id, %counters, total_bytes = summary.total_bytes, "Scan complete");

        Ok(ScanOutcome::Completed {
            job_id: run.job_id,
            summary,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Issues a remote call through the retrier and the gate
    async fn call<T, F, Fut>(&self, op: ApiOperation, f: F) -> Result<T, ScanError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<ApiReply<T>, ApiError>>,
    {
        self.retrier
            .retry(op.name(), || self.gate.submit(&op, &f))
            .await
    }

    async fn persist(&self, entity: &DiscoveredEntity) -> Result<(), ScanError> {
        self.deps.store.save_entity(entity).await?;
        Ok(())
    }

    async fn save_checkpoint(&self, run: &Run) -> Result<(), ScanError> {
        if run.pinned {
            return Ok(());
        }
        let _writer = self.checkpoint_writer.lock().await;
        self.deps
            .store
            .save_checkpoint(&run.job_id, &run.cursor)
            .await?;
        Ok(())
    }

    fn report(&self, run: &Run, message: String) {
        run.reporter.report(
            ProgressReporter::percent_for(&run.cursor),
            message,
            &run.counters(),
            JobState::Traversing,
        );
    }

    fn org_entity(&self, job_id: JobId, org: &Organization) -> DiscoveredEntity {
        DiscoveredEntity::new(
            job_id,
            EntityKind::Organization,
            ParentIds::default(),
            org.id,
            &org.name,
            PathBuf::from(sanitize_component(&org.name)),
        )
    }

    fn workspace_entity(
        &self,
        job_id: JobId,
        org: &Organization,
        ws: &Workspace,
        org_dir: &Path,
    ) -> DiscoveredEntity {
        DiscoveredEntity::new(
            job_id,
            EntityKind::Workspace,
            ParentIds {
                organization: Some(org.id),
                ..ParentIds::default()
            },
            ws.id,
            &ws.name,
            org_dir.join(sanitize_component(&ws.name)),
        )
    }
}

fn file_entity(
    job_id: JobId,
    parents: ParentIds,
    file: &RemoteFile,
    files_dir: &Path,
) -> DiscoveredEntity {
    let mut entity = DiscoveredEntity::new(
        job_id,
        EntityKind::File,
        parents,
        file.id,
        &file.name,
        files_dir.join(sanitize_component(&file.name)),
    )
    .with_size(file.size_bytes);
    if let Some(url) = &file.download_url {
        entity = entity.with_download_url(url.clone());
    }
    if let Some(mime) = &file.mime_type {
        entity = entity.with_mime_type(mime.clone());
    }
    entity
}
