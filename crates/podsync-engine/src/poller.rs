//! Driving server-side export batches to completion
//!
//! Submitting an app export either yields the spreadsheet at once or a
//! batch handle that must be polled. [`AsyncJobPoller`] hides the
//! difference behind [`ExportHandle`] and owns the polling loop.
//!
//! ## Design Notes
//!
//! - Every poll goes through the request gate and the retrier.
//! - A quota suspension during polling keeps the handle: the loop waits
//!   (if auto-wait is on) and polls the same batch again. Time spent
//!   suspended does not count towards the timeout. The suspension is
//!   announced through the run's reporter before waiting.
//! - On timeout the remote batch is left alone; only the local wait ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use podsync_core::config::Config;
use podsync_core::domain::{
    ActiveRateLimit, AsyncExportJob, BatchId, ExportFile, ExportStatus, RemoteId, ScanError,
};
use podsync_core::ports::{ApiOperation, ExportSubmission, IRemoteApi};

use crate::control::ScanControl;
use crate::gate::RequestGate;
use crate::progress::ProgressReporter;
use crate::retry::BackoffRetrier;

// ============================================================================
// Options and handle
// ============================================================================

/// Polling cadence and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerOptions {
    pub poll_interval: Duration,
    /// Budget of active polling time, quota suspensions excluded
    pub timeout: Duration,
    /// Wait out quota suspensions instead of returning them
    pub auto_wait: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(1800),
            auto_wait: true,
        }
    }
}

impl From<&Config> for PollerOptions {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.export.poll_interval(),
            timeout: config.export.timeout(),
            auto_wait: config.quota.auto_wait,
        }
    }
}

/// Result of an export submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportHandle {
    /// The file was produced synchronously
    Immediate(ExportFile),
    /// A batch that must be polled
    Pending(BatchId),
}

impl ExportHandle {
    /// Batch to poll, if any
    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            ExportHandle::Immediate(_) => None,
            ExportHandle::Pending(batch) => Some(*batch),
        }
    }
}

impl From<ExportSubmission> for ExportHandle {
    fn from(submission: ExportSubmission) -> Self {
        match submission {
            ExportSubmission::Immediate(file) => ExportHandle::Immediate(file),
            ExportSubmission::Batch(batch) => ExportHandle::Pending(batch),
        }
    }
}

// ============================================================================
// AsyncJobPoller
// ============================================================================

/// Submits, polls and downloads app exports
pub struct AsyncJobPoller {
    remote: Arc<dyn IRemoteApi>,
    gate: Arc<RequestGate>,
    retrier: BackoffRetrier,
    control: ScanControl,
    options: PollerOptions,
}

impl AsyncJobPoller {
    pub fn new(
        remote: Arc<dyn IRemoteApi>,
        gate: Arc<RequestGate>,
        retrier: BackoffRetrier,
        control: ScanControl,
        options: PollerOptions,
    ) -> Self {
        Self {
            remote,
            gate,
            retrier,
            control,
            options,
        }
    }

    pub fn options(&self) -> &PollerOptions {
        &self.options
    }

    /// Requests a spreadsheet export of `app`
    ///
    /// # Errors
    /// Any gate or remote error, including `ScanError::QuotaExhausted`.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, app: RemoteId) -> Result<ExportHandle, ScanError> {
        let op = ApiOperation::SubmitExport(app);
        let submission = self
            .retrier
            .retry(op.name(), || {
                self.gate.submit(&op, || self.remote.submit_export(app))
            })
            .await?;
        let handle = ExportHandle::from(submission);
        debug!(batch_id = ?handle.batch_id(), "Export submitted");
        Ok(handle)
    }

    // ========================================================================
    // await_completion()
    // ========================================================================

    /// Polls `handle` until the export finishes
    ///
    /// A quota suspension waited out here is published through `reporter`.
    ///
    /// # Errors
    /// - `ScanError::AsyncJobFailed` if the batch failed or finished without
    ///   a file reference
    /// - `ScanError::AsyncJobTimeout` once the polling budget is spent
    /// - `ScanError::QuotaExhausted` when auto-wait is off; the handle stays
    ///   valid for a later call
    /// - `ScanError::Cancelled` if the job is cancelled
    pub async fn await_completion(
        &self,
        handle: &ExportHandle,
        reporter: Option<&ProgressReporter>,
    ) -> Result<ExportFile, ScanError> {
        let batch_id = match handle {
            ExportHandle::Immediate(file) => return Ok(file.clone()),
            ExportHandle::Pending(batch_id) => *batch_id,
        };

        let op = ApiOperation::PollExport(batch_id);
        let cancel = self.control.cancellation_token();
        let mut job = AsyncExportJob::new(batch_id);
        let mut elapsed = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }

            let started = Instant::now();
            let poll = self
                .retrier
                .retry(op.name(), || {
                    self.gate.submit(&op, || self.remote.poll_export(batch_id))
                })
                .await;

            match poll {
                Ok(poll) => {
                    if let Err(e) = job.advance(poll.status, poll.file) {
                        warn!(
                            batch_id = %batch_id,
                            reported = %poll.status,
                            error = %e,
                            "Ignoring export status regression"
                        );
                    }
                    match job.status() {
                        ExportStatus::Completed => {
                            return job.result_ref().cloned().ok_or_else(|| {
                                ScanError::AsyncJobFailed {
                                    batch_id: Some(batch_id),
                                    reason: "export completed without a file reference"
                                        .to_string(),
                                }
                            });
                        }
                        ExportStatus::Failed => {
                            return Err(ScanError::AsyncJobFailed {
                                batch_id: Some(batch_id),
                                reason: poll
                                    .failure
                                    .unwrap_or_else(|| "export failed".to_string()),
                            });
                        }
                        ExportStatus::Created | ExportStatus::Processing => {}
                    }
                }
                Err(ScanError::QuotaExhausted {
                    category,
                    resume_at,
                }) => {
                    if !self.options.auto_wait {
                        return Err(ScanError::QuotaExhausted {
                            category,
                            resume_at,
                        });
                    }
                    let limit = ActiveRateLimit::new(category, resume_at);
                    let limit = self
                        .control
                        .tracker()
                        .active_limit()
                        .map_or(limit, |active| active.merge(limit));
                    info!(
                        batch_id = %batch_id,
                        category = %limit.category(),
                        resume_at = %limit.resume_at(),
                        "Export polling suspended"
                    );
                    if let Some(reporter) = reporter {
                        reporter.suspended(&limit);
                    }
                    self.control.wait_for_quota(limit).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            elapsed += started.elapsed();
            if elapsed >= self.options.timeout {
                warn!(
                    batch_id = %batch_id,
                    elapsed_secs = elapsed.as_secs(),
                    "Export polling timed out"
                );
                return Err(ScanError::AsyncJobTimeout { batch_id, elapsed });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            }
            elapsed += self.options.poll_interval;
        }
    }

    /// Fetches the bytes of a finished export as a heavyweight call
    ///
    /// # Errors
    /// Any gate or remote error.
    pub async fn download(&self, file: &ExportFile) -> Result<Vec<u8>, ScanError> {
        let op = ApiOperation::DownloadBlob(file.file_id);
        self.retrier
            .retry(op.name(), || {
                self.gate
                    .submit(&op, || self.remote.download_blob(&file.download_url))
            })
            .await
    }
}

// ============================================================================
// Unit tests
// ============================================================================
