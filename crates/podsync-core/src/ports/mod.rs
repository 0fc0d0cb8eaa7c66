//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the engine depends
//! on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteApi`] - The quota-limited remote resource service
//! - [`ICheckpointStore`] - Persistent jobs, checkpoints and discovered entities
//! - [`IWritePathSink`] - Writing blobs to the local destination
//! - [`IProgressSink`] - Progress presentation

pub mod checkpoint_store;
pub mod progress;
pub mod remote_api;
pub mod write_sink;

pub use checkpoint_store::ICheckpointStore;
pub use progress::{IProgressSink, ProgressUpdate};
pub use remote_api::{
    ApiError, ApiOperation, ApiReply, App, ExportPoll, ExportSubmission, HttpMethod, IRemoteApi,
    Organization, PageRequest, RemoteFile, Workspace,
};
pub use write_sink::IWritePathSink;
