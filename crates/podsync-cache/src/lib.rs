//! podsync Cache - durable job and checkpoint storage
//!
//! SQLite-based persistence for:
//! - Scan jobs and their final summaries
//! - Traversal checkpoints
//! - Discovered organizations, workspaces, apps and files
//! - Failed units and active quota suspensions
//!
//! ## Architecture
//!
//! This crate implements the `ICheckpointStore` port from `podsync-core`
//! using SQLite as the storage backend. It is a driven (secondary) adapter:
//! the walker only ever talks to the port.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteCheckpointStore`] - Full `ICheckpointStore` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use podsync_cache::{DatabasePool, SqliteCheckpointStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/podsync/podsync.db")).await?;
//! let store = SqliteCheckpointStore::new(pool.pool().clone());
//! // Use store as ICheckpointStore...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteCheckpointStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row could not be turned back into a domain value
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A row the operation requires does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
