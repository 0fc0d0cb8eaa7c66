//! Progress sink port (driven/secondary port)
//!
//! Progress updates flow from the engine to whatever presents them: a
//! terminal, a log, a GUI channel.
//!
//! ## Design Notes
//!
//! - The method is synchronous and infallible. Sinks must tolerate
//!   arbitrarily frequent calls and must never fail or block the job;
//!   a sink that needs I/O should hand the update to a channel.

use serde::{Deserialize, Serialize};

use crate::domain::{JobId, JobState, ScanCounters};

/// A single progress update for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: JobId,
    /// Percentage in `[0, 100]`, non-decreasing per job
    pub percent: f64,
    pub message: String,
    pub counters: ScanCounters,
    pub state: JobState,
}

/// Port trait for progress presentation
pub trait IProgressSink: Send + Sync {
    /// Receives one progress update
    fn on_progress(&self, update: &ProgressUpdate);
}
