//! Write path port (driven/secondary port)
//!
//! The only capability the engine needs from the local platform: write a
//! blob to a path and make sure a directory exists. Desktop builds write
//! to the filesystem; tests and dry runs keep everything in memory.

use std::path::Path;

/// Port trait for the final write path
#[async_trait::async_trait]
pub trait IWritePathSink: Send + Sync {
    /// Writes `bytes` to `path`, replacing any existing content
    ///
    /// Implementations must not leave a partially written file at `path`.
    async fn write_blob(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()>;

    /// Creates `path` and its parents if they don't exist
    async fn ensure_dir(&self, path: &Path) -> anyhow::Result<()>;

    /// Returns true if something exists at `path`
    async fn exists(&self, path: &Path) -> anyhow::Result<bool>;
}
