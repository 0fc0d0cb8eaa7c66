//! podsync Engine - Rate-gated scheduling and resumable traversal
//!
//! Provides:
//! - Per-category hourly quota accounting reconciled with server headers
//! - A single outbound request gate with cooperative suspension
//! - Exponential backoff with jitter for transient failures
//! - A checkpointed walk over organizations, workspaces and apps
//! - Polling of server-side export batches
//! - Monotonic progress reporting and operator controls
//!
//! ## Modules
//!
//! - [`quota`] - QuotaTracker, the only owner of quota buckets and active limits
//! - [`gate`] - RequestGate, through which every remote call passes
//! - [`retry`] - BackoffRetrier and its policy
//! - [`control`] - ScanControl (job state, cancel, pause, force-resume) and StoreWatch
//! - [`progress`] - ProgressReporter and stock progress sinks
//! - [`poller`] - AsyncJobPoller for export batches
//! - [`walker`] - HierarchyWalker, the traversal state machine
//! - [`clock`] - Clock abstraction (system and manual)
//! - [`filesystem`] - Local write sink (atomic writes)
//! - [`memory`] - In-memory checkpoint store and write sink

pub mod clock;
pub mod control;
pub mod filesystem;
pub mod gate;
pub mod memory;
pub mod poller;
pub mod progress;
pub mod quota;
pub mod retry;
pub mod walker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{ScanControl, StoreWatch};
pub use filesystem::LocalWriteSink;
pub use gate::{OperationClassifier, RequestGate};
pub use memory::{MemoryCheckpointStore, MemoryWriteSink};
pub use poller::{AsyncJobPoller, ExportHandle, PollerOptions};
pub use progress::{ChannelProgressSink, ProgressReporter, TracingProgressSink};
pub use quota::{QuotaSettings, QuotaTracker};
pub use retry::{BackoffRetrier, RetryPolicy};
pub use walker::{HierarchyWalker, ScanMode, ScanOutcome, WalkerDeps, WalkerOptions};
