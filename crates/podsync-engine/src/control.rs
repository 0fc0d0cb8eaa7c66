//! Job state and operator controls
//!
//! [`ScanControl`] is the handle shared by the walker, the poller and
//! whoever drives a job (CLI, tests). It owns:
//!
//! - the cancellation token checked before every remote call
//! - the manual pause flag checked at every unit boundary
//! - the current [`JobState`], published over a `tokio::sync::watch`
//!   channel so observers never poll
//! - the force-resume signal that cuts a quota wait short
//!
//! [`StoreWatch`] lets a second process control a running job through the
//! checkpoint store: flagging the job cancelled cancels it, and removing a
//! persisted active limit force-resumes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podsync_core::domain::{
    ActiveRateLimit, JobId, JobState, QuotaCategory, ScanError, SuspendReason,
};
use podsync_core::ports::ICheckpointStore;

use crate::quota::QuotaTracker;

// ============================================================================
// RunCancellation
// ============================================================================

/// Cancellation source whose token is replaced at the start of every run
///
/// Holders keep the source, not a token, so a cancel always reaches the
/// run in progress and never outlives it.
#[derive(Debug, Clone, Default)]
pub struct RunCancellation {
    current: Arc<StdMutex<CancellationToken>>,
}

impl RunCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the current run
    pub fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancel(&self) {
        self.token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Installs a fresh token for a new run and returns it
    pub fn renew(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
        fresh
    }
}

// ============================================================================
// ScanControl
// ============================================================================

struct ControlInner {
    cancel: RunCancellation,
    pause: AtomicBool,
    resume: Notify,
    state: watch::Sender<JobState>,
    tracker: Arc<QuotaTracker>,
    store: Option<Arc<dyn ICheckpointStore>>,
}

/// Shared control handle of one job run
#[derive(Clone)]
pub struct ScanControl {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for ScanControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanControl")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .field("pause_requested", &self.is_pause_requested())
            .finish()
    }
}

impl ScanControl {
    pub fn new(tracker: Arc<QuotaTracker>) -> Self {
        Self::build(tracker, None)
    }

    /// Creates a control whose quota suspensions are mirrored in `store`
    pub fn with_store(tracker: Arc<QuotaTracker>, store: Arc<dyn ICheckpointStore>) -> Self {
        Self::build(tracker, Some(store))
    }

    fn build(tracker: Arc<QuotaTracker>, store: Option<Arc<dyn ICheckpointStore>>) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        Self {
            inner: Arc::new(ControlInner {
                cancel: RunCancellation::new(),
                pause: AtomicBool::new(false),
                resume: Notify::new(),
                state,
                tracker,
                store,
            }),
        }
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.inner.tracker
    }

    // --- Cancellation ---

    /// Requests cancellation; the next safe point aborts the run
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!("Cancellation requested");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token of the current run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.token()
    }

    /// Cancellation source shared with the request gate
    pub fn cancellation(&self) -> RunCancellation {
        self.inner.cancel.clone()
    }

    /// Prepares the control for a new run
    ///
    /// Installs a fresh cancellation token and clears any pause request, so
    /// a cancel or pause aimed at an earlier run does not leak into this one.
    pub fn begin_run(&self) {
        self.inner.cancel.renew();
        self.clear_pause();
    }

    // --- Manual pause ---

    /// Requests a pause at the next unit boundary
    pub fn pause(&self) {
        if !self.inner.pause.swap(true, Ordering::SeqCst) {
            info!("Pause requested");
        }
    }

    pub fn is_pause_requested(&self) -> bool {
        self.inner.pause.load(Ordering::SeqCst)
    }

    /// Clears a pause request so a resumed run can proceed
    pub fn clear_pause(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    // --- Force resume ---

    /// Clears every active limit and wakes any quota waiter
    ///
    /// # Returns
    /// The number of limits removed. With none set this is a no-op.
    pub fn force_resume(&self) -> usize {
        let cleared = self.inner.tracker.clear_all();
        if cleared > 0 {
            info!(cleared, "Force resume: quota wait cut short");
            self.inner.resume.notify_waiters();
        } else {
            debug!("Force resume with no active limit");
        }
        cleared
    }

    // --- State ---

    pub fn state(&self) -> JobState {
        self.inner.state.borrow().clone()
    }

    /// Subscribes to state transitions
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.inner.state.subscribe()
    }

    /// Publishes a new state
    pub fn set_state(&self, state: JobState) {
        let previous = self.inner.state.send_replace(state.clone());
        if previous != state {
            debug!(from = %previous, to = %state, "Job state changed");
        }
    }

    // --- Persisted limits ---

    /// Writes every active limit of the tracker to the store
    ///
    /// # Errors
    /// Returns `ScanError::Storage` if the store rejects the write.
    pub async fn persist_active_limits(&self) -> Result<(), ScanError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        for limit in self.inner.tracker.active_limits() {
            store.save_active_limit(&limit).await?;
        }
        Ok(())
    }

    /// Removes persisted limits the tracker no longer holds
    ///
    /// # Errors
    /// Returns `ScanError::Storage` if the store rejects the write.
    pub async fn prune_persisted_limits(&self) -> Result<(), ScanError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        for category in QuotaCategory::ALL {
            if self.inner.tracker.active_limit_for(category).is_none() {
                store.clear_active_limit(category).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // wait_for_quota()
    // ========================================================================

    /// Suspends until every active limit has lifted
    ///
    /// Publishes `Suspended(Quota)` while waiting and `Traversing` afterwards.
    /// A force resume ends the wait early.
    ///
    /// # Errors
    /// Returns `ScanError::Cancelled` if the job is cancelled while waiting,
    /// or `ScanError::Storage` if the limit cannot be mirrored in the store.
    pub async fn wait_for_quota(&self, limit: ActiveRateLimit) -> Result<(), ScanError> {
        self.set_state(JobState::Suspended(SuspendReason::Quota {
            category: limit.category(),
            resume_at: limit.resume_at(),
        }));
        self.persist_active_limits().await?;
        let clock = Arc::clone(self.inner.tracker.clock());
        let cancel = self.cancellation_token();

        loop {
            let notified = self.inner.resume.notified();
            tokio::pin!(notified);
            // Register before checking the tracker so a force resume racing
            // with this check is not lost.
            notified.as_mut().enable();

            if self.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let Some(current) = self.inner.tracker.active_limit() else {
                break;
            };
            info!(
                category = %current.category(),
                resume_at = %current.resume_at(),
                "Waiting for quota window"
            );

            tokio::select! {
                _ = clock.sleep_until(current.resume_at()) => {}
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            }
        }

        self.prune_persisted_limits().await?;
        self.set_state(JobState::Traversing);
        Ok(())
    }
}

// ============================================================================
// StoreWatch
// ============================================================================

/// Background task relaying out-of-process controls from the store
pub struct StoreWatch {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StoreWatch {
    /// Starts polling the store every `interval`
    pub fn spawn(
        store: Arc<dyn ICheckpointStore>,
        job_id: JobId,
        control: ScanControl,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut saw_limit = false;

            loop {
                // The run may renew its token after the watch starts.
                let done = control.cancellation_token();
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match store.get_job(&job_id).await {
                    Ok(Some(job)) if job.is_cancelled() => {
                        info!(job_id = %job_id, "Job cancelled from another process");
                        control.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "Store watch failed to read job"),
                }

                match store.load_active_limits().await {
                    Ok(limits) => {
                        if saw_limit
                            && limits.is_empty()
                            && control.tracker().active_limit().is_some()
                        {
                            info!(job_id = %job_id, "Active limit cleared from another process");
                            control.force_resume();
                        }
                        saw_limit = !limits.is_empty();
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Store watch failed to read limits")
                    }
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the watcher and waits for it to exit
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for StoreWatch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::memory::MemoryCheckpointStore;
    use crate::quota::QuotaSettings;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    fn control_with(clock: Arc<dyn Clock>) -> ScanControl {
        ScanControl::new(Arc::new(QuotaTracker::new(QuotaSettings::default(), clock)))
    }

    #[test]
    fn test_force_resume_without_limit_is_noop() {
        let control = control_with(Arc::new(ManualClock::new(t0())));
        control.set_state(JobState::Traversing);
        assert_eq!(control.force_resume(), 0);
        assert_eq!(control.state(), JobState::Traversing);
    }

    #[test]
    fn test_pause_flag() {
        let control = control_with(Arc::new(ManualClock::new(t0())));
        assert!(!control.is_pause_requested());
        control.pause();
        control.pause();
        assert!(control.is_pause_requested());
        control.clear_pause();
        assert!(!control.is_pause_requested());
    }

    #[test]
    fn test_begin_run_discards_earlier_cancel() {
        let control = control_with(Arc::new(ManualClock::new(t0())));
        let gate_side = control.cancellation();
        let stale = control.cancellation_token();
        control.cancel();
        control.pause();
        assert!(gate_side.is_cancelled());

        control.begin_run();
        assert!(stale.is_cancelled());
        assert!(!control.is_cancelled());
        assert!(!gate_side.is_cancelled());
        assert!(!control.is_pause_requested());

        control.cancel();
        assert!(gate_side.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_quota_until_deadline() {
        let clock = Arc::new(ManualClock::new(t0()));
        let control = control_with(clock.clone());
        let resume_at = t0() + chrono::Duration::seconds(600);
        let limit = control
            .tracker()
            .set_active(QuotaCategory::Lightweight, resume_at);

        let mut states = control.subscribe();
        control.wait_for_quota(limit).await.unwrap();

        assert!(clock.now() >= resume_at);
        assert_eq!(control.state(), JobState::Traversing);
        assert!(states.has_changed().unwrap());
        assert!(control.tracker().active_limit().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_resume_cuts_wait_short() {
        let control = control_with(Arc::new(SystemClock));
        let resume_at = Utc::now() + chrono::Duration::hours(1);
        let limit = control
            .tracker()
            .set_active(QuotaCategory::Heavyweight, resume_at);

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_for_quota(limit).await })
        };

        let mut states = control.subscribe();
        states.wait_for(JobState::is_suspended).await.unwrap();
        assert_eq!(control.force_resume(), 1);

        waiter.await.unwrap().unwrap();
        assert!(Utc::now() < resume_at);
        assert_eq!(control.state(), JobState::Traversing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let control = control_with(Arc::new(SystemClock));
        let limit = control.tracker().set_active(
            QuotaCategory::Lightweight,
            Utc::now() + chrono::Duration::hours(1),
        );

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_for_quota(limit).await })
        };
        let mut states = control.subscribe();
        states.wait_for(JobState::is_suspended).await.unwrap();
        control.cancel();

        assert_eq!(waiter.await.unwrap(), Err(ScanError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_for_quota_mirrors_limit_in_store() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = Arc::new(QuotaTracker::new(QuotaSettings::default(), clock));
        let control = ScanControl::with_store(tracker, store.clone());
        let limit = control.tracker().set_active(
            QuotaCategory::Lightweight,
            t0() + chrono::Duration::seconds(60),
        );

        control.persist_active_limits().await.unwrap();
        assert_eq!(store.load_active_limits().await.unwrap(), vec![limit]);

        control.wait_for_quota(limit).await.unwrap();
        assert!(store.load_active_limits().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_watch_relays_cancellation() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let job_id = store.begin_job(None).await.unwrap();
        let control = control_with(Arc::new(SystemClock));

        let watch = StoreWatch::spawn(
            store.clone(),
            job_id,
            control.clone(),
            Duration::from_millis(200),
        );
        store.mark_cancelled(&job_id).await.unwrap();

        control.cancellation_token().cancelled().await;
        assert!(control.is_cancelled());
        watch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_watch_relays_force_resume() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let job_id = store.begin_job(None).await.unwrap();
        let control = control_with(Arc::new(SystemClock));
        let limit = control.tracker().set_active(
            QuotaCategory::Lightweight,
            Utc::now() + chrono::Duration::hours(1),
        );
        store.save_active_limit(&limit).await.unwrap();

        let watch = StoreWatch::spawn(
            store.clone(),
            job_id,
            control.clone(),
            Duration::from_millis(200),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        store
            .clear_active_limit(QuotaCategory::Lightweight)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(control.tracker().active_limit().is_none());
        watch.shutdown().await;
    }
}
