//! Domain entities and business logic
//!
//! This module contains the core domain types for podsync:
//! - Newtypes for type-safe identifiers
//! - Quota buckets and active rate limits
//! - Traversal checkpoints and scan counters
//! - Scan jobs, completion records and the job state machine
//! - Discovered entities and destination path naming
//! - Asynchronous export jobs
//! - Domain-specific error types

pub mod checkpoint;
pub mod entity;
pub mod errors;
pub mod export;
pub mod job;
pub mod newtypes;
pub mod quota;

// Re-export commonly used types
pub use checkpoint::{CheckpointFlags, ScanCounters, TraversalCheckpoint};
pub use entity::{
    export_file_name, sanitize_component, DiscoveredEntity, EntityKind, EntityStatus, ParentIds,
    FILES_DIR,
};
pub use errors::{DomainError, ScanError};
pub use export::{AsyncExportJob, ExportFile, ExportStatus};
pub use job::{
    estimate_export_bytes, FailedUnit, JobCompletion, JobState, ScanJob, ScanSummary,
    SuspendReason, UnitKind,
};
pub use newtypes::{BatchId, JobId, RemoteId};
pub use quota::{ActiveRateLimit, QuotaBucket, QuotaCategory, QuotaHeaders};
