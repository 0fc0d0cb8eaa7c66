//! Outbound request gate
//!
//! Every remote call passes through [`RequestGate::submit`]. The gate
//! classifies the call, reserves quota, paces dispatches, feeds the
//! server's quota figures back to the tracker and turns rate-limit replies
//! into [`ScanError::QuotaExhausted`].
//!
//! ## Design Notes
//!
//! - One fair async mutex is held across the call, so exactly one request
//!   is in flight and waiters are served in arrival order.
//! - The closure is only invoked after cancellation and quota checks pass:
//!   a rejected submission never reaches the network.
//! - Pacing happens before quota is reserved, and a cancel during the
//!   dispatch delay drops the call without spending quota.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use podsync_core::domain::{QuotaCategory, ScanError};
use podsync_core::ports::{ApiError, ApiOperation, ApiReply, HttpMethod};

use crate::control::RunCancellation;
use crate::quota::QuotaTracker;

/// Endpoint fragments that mark a GET as heavyweight by default
pub const DEFAULT_HEAVY_MARKERS: &[&str] = &["/file/", "/xlsx/", "/download_link"];

// ============================================================================
// OperationClassifier
// ============================================================================

/// Decides which quota category an operation draws from
#[derive(Debug, Clone)]
pub struct OperationClassifier {
    heavy_markers: Vec<String>,
}

impl Default for OperationClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_HEAVY_MARKERS.iter().map(|m| m.to_string()))
    }
}

impl OperationClassifier {
    pub fn new(heavy_markers: impl IntoIterator<Item = String>) -> Self {
        Self {
            heavy_markers: heavy_markers.into_iter().collect(),
        }
    }

    /// Non-GET calls and endpoints containing a heavy marker are heavyweight
    pub fn classify(&self, method: HttpMethod, endpoint: &str) -> QuotaCategory {
        if method != HttpMethod::Get
            || self
                .heavy_markers
                .iter()
                .any(|marker| endpoint.contains(marker.as_str()))
        {
            QuotaCategory::Heavyweight
        } else {
            QuotaCategory::Lightweight
        }
    }

    pub fn classify_operation(&self, operation: &ApiOperation) -> QuotaCategory {
        self.classify(operation.method(), &operation.endpoint())
    }
}

// ============================================================================
// RequestGate
// ============================================================================

/// The single outbound queue to the remote service
pub struct RequestGate {
    tracker: Arc<QuotaTracker>,
    classifier: OperationClassifier,
    dispatch_delay: Duration,
    default_retry_after: Duration,
    cancel: RunCancellation,
    /// Held across each call; stores when the previous dispatch started
    last_dispatch: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("classifier", &self.classifier)
            .field("dispatch_delay", &self.dispatch_delay)
            .field("default_retry_after", &self.default_retry_after)
            .finish()
    }
}

impl RequestGate {
    pub fn new(
        tracker: Arc<QuotaTracker>,
        classifier: OperationClassifier,
        dispatch_delay: Duration,
        default_retry_after: Duration,
        cancel: RunCancellation,
    ) -> Self {
        Self {
            tracker,
            classifier,
            dispatch_delay,
            default_retry_after,
            cancel,
            last_dispatch: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    pub fn classifier(&self) -> &OperationClassifier {
        &self.classifier
    }

    // ========================================================================
    // submit()
    // ========================================================================

    /// Issues one remote call under quota control
    ///
    /// # Errors
    /// - `ScanError::Cancelled` if the job was cancelled; the call is not issued
    /// - `ScanError::QuotaExhausted` if the category has no quota left, or the
    ///   server answered with a rate limit
    /// - any other [`ApiError`] mapped into [`ScanError`]
    pub async fn submit<T, F, Fut>(&self, operation: &ApiOperation, call: F) -> Result<T, ScanError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ApiReply<T>, ApiError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let method = operation.method();
        let endpoint = operation.endpoint();
        let category = self.classifier.classify(method, &endpoint);

        let mut last_dispatch = self.last_dispatch.lock().await;
        let cancel = self.cancel.token();

        if let Some(previous) = *last_dispatch {
            let next_allowed = previous + self.dispatch_delay;
            if next_allowed > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(next_allowed) => {}
                    _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                }
            }
        }

        // Waiting for the queue may have taken a while.
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        self.tracker.reserve(category)?;

        let started = Instant::now();
        *last_dispatch = Some(started);
        let result = call().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(reply) => {
                if let Some(headers) = &reply.quota {
                    self.tracker.observe(category, headers);
                }
                debug!(
                    %method,
                    endpoint = %endpoint,
                    %category,
                    outcome = "ok",
                    elapsed_ms,
                    "Remote call dispatched"
                );
                Ok(reply.value)
            }
            Err(ApiError::RateLimited { retry_after, quota }) => {
                if let Some(headers) = &quota {
                    self.tracker.observe(category, headers);
                }
                let wait = retry_after.unwrap_or(self.default_retry_after);
                let resume_at = self.tracker.clock().now()
                    + chrono::Duration::from_std(wait)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let limit = self.tracker.set_active(category, resume_at);
                warn!(
                    %method,
                    endpoint = %endpoint,
                    %category,
                    outcome = "rate_limited",
                    elapsed_ms,
                    retry_after_secs = wait.as_secs(),
                    "Server rate limit hit"
                );
                Err(ScanError::QuotaExhausted {
                    category,
                    resume_at: limit.resume_at(),
                })
            }
            Err(err) => {
                warn!(
                    %method,
                    endpoint = %endpoint,
                    %category,
                    outcome = "error",
                    elapsed_ms,
                    error = %err,
                    "Remote call failed"
                );
                Err(ScanError::from(err))
            }
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use podsync_core::domain::{QuotaHeaders, RemoteId};
    use podsync_core::ports::PageRequest;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::quota::QuotaSettings;

    fn t0() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    fn gate_with(general: u32, heavy: u32) -> (RequestGate, Arc<ManualClock>, RunCancellation) {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = Arc::new(QuotaTracker::new(
            QuotaSettings {
                general_limit: general,
                heavy_limit: heavy,
                window: Duration::from_secs(3600),
            },
            clock.clone(),
        ));
        let cancel = RunCancellation::new();
        let gate = RequestGate::new(
            tracker,
            OperationClassifier::default(),
            Duration::from_millis(50),
            Duration::from_secs(60),
            cancel.clone(),
        );
        (gate, clock, cancel)
    }

    #[test]
    fn test_classification() {
        let classifier = OperationClassifier::default();
        let app = RemoteId::new(1);
        assert_eq!(
            classifier.classify_operation(&ApiOperation::ListOrganizations),
            QuotaCategory::Lightweight
        );
        assert_eq!(
            classifier.classify_operation(&ApiOperation::CountItems(app)),
            QuotaCategory::Lightweight
        );
        assert_eq!(
            classifier.classify_operation(&ApiOperation::ListFiles {
                app,
                page: PageRequest::first(100),
            }),
            QuotaCategory::Heavyweight
        );
        assert_eq!(
            classifier.classify_operation(&ApiOperation::SubmitExport(app)),
            QuotaCategory::Heavyweight
        );
        assert_eq!(
            classifier.classify_operation(&ApiOperation::DownloadBlob(app)),
            QuotaCategory::Heavyweight
        );
        assert_eq!(
            classifier.classify(HttpMethod::Get, "/item/app/1/download_link"),
            QuotaCategory::Heavyweight
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_call_observes_headers() {
        let (gate, _, _) = gate_with(1000, 250);
        let value = gate
            .submit(&ApiOperation::ListOrganizations, || async {
                Ok(ApiReply::with_quota(
                    7u32,
                    QuotaHeaders {
                        limit: Some(1000),
                        remaining: Some(12),
                    },
                ))
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let light = gate
            .tracker()
            .snapshot()
            .into_iter()
            .find(|b| b.category() == QuotaCategory::Lightweight)
            .unwrap();
        assert_eq!(light.remaining(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_quota_never_invokes_call() {
        let (gate, _, _) = gate_with(1, 1);
        let calls = AtomicUsize::new(0);
        let op = ApiOperation::ListOrganizations;

        for _ in 0..3 {
            let _ = gate
                .submit(&op, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(ApiReply::new(()))
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = gate
            .submit(&op, || async { Ok(ApiReply::new(())) })
            .await
            .unwrap_err();
        assert!(err.is_quota_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_gate_never_invokes_call() {
        let (gate, _, cancel) = gate_with(10, 10);
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let err = gate
            .submit(&ApiOperation::ListOrganizations, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(ApiReply::new(()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, ScanError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_dispatch_delay_skips_call() {
        let (gate, _, cancel) = gate_with(10, 10);
        let op = ApiOperation::ListOrganizations;
        gate.submit(&op, || async { Ok(ApiReply::new(())) })
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let submit = gate.submit(&op, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiReply::new(()))
        });
        let cancel_soon = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(submit, cancel_soon);

        assert_eq!(result, Err(ScanError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let light = gate
            .tracker()
            .snapshot()
            .into_iter()
            .find(|b| b.category() == QuotaCategory::Lightweight)
            .unwrap();
        assert_eq!(light.remaining(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_reply_sets_active_limit() {
        let (gate, clock, _) = gate_with(1000, 250);
        let op = ApiOperation::SubmitExport(RemoteId::new(4));
        let err = gate
            .submit(&op, || async {
                Err::<ApiReply<()>, _>(ApiError::RateLimited {
                    retry_after: Some(Duration::from_secs(120)),
                    quota: None,
                })
            })
            .await
            .unwrap_err();

        let expected = clock.now() + chrono::Duration::seconds(120);
        assert_eq!(
            err,
            ScanError::QuotaExhausted {
                category: QuotaCategory::Heavyweight,
                resume_at: expected,
            }
        );
        let limit = gate
            .tracker()
            .active_limit_for(QuotaCategory::Heavyweight)
            .unwrap();
        assert_eq!(limit.resume_at(), expected);
        assert!(gate
            .tracker()
            .active_limit_for(QuotaCategory::Lightweight)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_retry_after_uses_default() {
        let (gate, clock, _) = gate_with(1000, 250);
        let err = gate
            .submit(&ApiOperation::ListOrganizations, || async {
                Err::<ApiReply<()>, _>(ApiError::RateLimited {
                    retry_after: None,
                    quota: None,
                })
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ScanError::QuotaExhausted {
                category: QuotaCategory::Lightweight,
                resume_at: clock.now() + chrono::Duration::seconds(60),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_mapped() {
        let (gate, _, _) = gate_with(10, 10);
        let err = gate
            .submit(&ApiOperation::ListOrganizations, || async {
                Err::<ApiReply<()>, _>(ApiError::Server {
                    status: 502,
                    message: "bad gateway".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_call_in_flight() {
        let (gate, _, _) = gate_with(100, 100);
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let op = ApiOperation::ListOrganizations;

        let calls = (0..6).map(|_| {
            gate.submit(&op, || async {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ApiReply::new(()))
            })
        });
        let results = futures_util::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_delay_spaces_calls() {
        let (gate, _, _) = gate_with(100, 100);
        let op = ApiOperation::ListOrganizations;
        let started = Instant::now();
        for _ in 0..3 {
            gate.submit(&op, || async { Ok(ApiReply::new(())) })
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
