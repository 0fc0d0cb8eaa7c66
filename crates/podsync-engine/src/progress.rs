//! Progress reporting
//!
//! [`ProgressReporter`] sits between the walker and an [`IProgressSink`].
//! It guarantees two things sinks can rely on:
//!
//! - the percentage of a job never decreases
//! - 100% is only ever emitted by [`ProgressReporter::complete`], and only
//!   when nothing failed and no quota suspension is outstanding
//!
//! During traversal the percentage lives in the 1-95 band:
//! `1 + 94 * fraction_complete`, capped at 95. A reporter built with
//! [`ProgressReporter::with_floor`] starts from the percentage an earlier
//! run of the same job already published.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::info;

use podsync_core::domain::{
    ActiveRateLimit, DomainError, FailedUnit, JobId, JobState, ScanCounters, SuspendReason,
    TraversalCheckpoint,
};
use podsync_core::ports::{IProgressSink, ProgressUpdate};

/// Highest percentage `report` will emit
const REPORT_CEILING: f64 = 99.0;

/// Upper bound of the traversal band
const TRAVERSAL_CEILING: f64 = 95.0;

#[derive(Debug, Default)]
struct ReporterState {
    percent: f64,
    counters: ScanCounters,
    completed: bool,
}

/// Monotonic progress emitter for one job
pub struct ProgressReporter {
    job_id: JobId,
    sink: Arc<dyn IProgressSink>,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, sink: Arc<dyn IProgressSink>) -> Self {
        Self::with_floor(job_id, sink, 0.0)
    }

    /// Reporter that never emits less than `floor`
    ///
    /// The floor is capped at the top of the traversal band.
    pub fn with_floor(job_id: JobId, sink: Arc<dyn IProgressSink>, floor: f64) -> Self {
        let floor = if floor.is_nan() {
            0.0
        } else {
            floor.clamp(0.0, TRAVERSAL_CEILING)
        };
        Self {
            job_id,
            sink,
            state: Mutex::new(ReporterState {
                percent: floor,
                ..ReporterState::default()
            }),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Last percentage emitted
    pub fn last_percent(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .percent
    }

    /// Percentage corresponding to a checkpoint cursor
    pub fn percent_for(checkpoint: &TraversalCheckpoint) -> f64 {
        (1.0 + 94.0 * checkpoint.fraction_complete()).min(TRAVERSAL_CEILING)
    }

    /// Emits an update
    ///
    /// `percent` is clamped to `[0, 99]` and never below the previous
    /// value. Returns the percentage actually emitted. After completion
    /// further reports are dropped.
    pub fn report(
        &self,
        percent: f64,
        message: impl Into<String>,
        counters: &ScanCounters,
        state: JobState,
    ) -> f64 {
        let emitted = {
            let mut inner = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.completed {
                return inner.percent;
            }
            let clamped = if percent.is_nan() {
                0.0
            } else {
                percent.clamp(0.0, REPORT_CEILING)
            };
            inner.percent = inner.percent.max(clamped);
            inner.counters = *counters;
            inner.percent
        };
        self.sink.on_progress(&ProgressUpdate {
            job_id: self.job_id,
            percent: emitted,
            message: message.into(),
            counters: *counters,
            state,
        });
        emitted
    }

    /// Announces a quota suspension with the last percentage and counters
    ///
    /// For callers that hit the limit away from the traversal cursor, such
    /// as export polling.
    pub fn suspended(&self, limit: &ActiveRateLimit) -> f64 {
        let (percent, counters) = {
            let inner = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (inner.percent, inner.counters)
        };
        let state = JobState::Suspended(SuspendReason::Quota {
            category: limit.category(),
            resume_at: limit.resume_at(),
        });
        self.report(percent, state.to_string(), &counters, state)
    }

    /// Emits the final 100% update
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` and emits nothing if any unit
    /// failed or a rate limit is still active.
    pub fn complete(
        &self,
        message: impl Into<String>,
        counters: &ScanCounters,
        failed_units: &[FailedUnit],
        active_limit: Option<&ActiveRateLimit>,
    ) -> Result<(), DomainError> {
        if !failed_units.is_empty() || active_limit.is_some() {
            return Err(DomainError::InvalidState {
                from: if failed_units.is_empty() {
                    "suspended".to_string()
                } else {
                    format!("incomplete ({} failed units)", failed_units.len())
                },
                to: "completed".to_string(),
            });
        }
        {
            let mut inner = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            inner.percent = 100.0;
            inner.completed = true;
        }
        self.sink.on_progress(&ProgressUpdate {
            job_id: self.job_id,
            percent: 100.0,
            message: message.into(),
            counters: *counters,
            state: JobState::Completed,
        });
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Logs every update at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl IProgressSink for TracingProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        info!(
            job_id = %update.job_id,
            percent = format_args!("{:.1}", update.percent),
            state = %update.state,
            counters = %update.counters,
            "{}",
            update.message
        );
    }
}

/// Forwards updates to an unbounded channel
///
/// Sending never blocks; updates are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl IProgressSink for ChannelProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        let _ = self.tx.send(update.clone());
    }
}
