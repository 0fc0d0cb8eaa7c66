//! Local write sink (secondary/driven adapter)
//!
//! Implements [`IWritePathSink`] on top of `tokio::fs`, rooted at the
//! backup directory.
//!
//! ## Design Decisions
//!
//! - **Rooted paths**: relative paths are resolved against the backup
//!   root; absolute paths must already lie inside it and `..` components
//!   are rejected, so nothing is written outside the root.
//! - **Atomic writes**: write-to-temp + rename, so an interrupted export
//!   never leaves a truncated spreadsheet behind.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use tracing::{debug, instrument};

use podsync_core::ports::IWritePathSink;

/// Filesystem sink writing under a backup root
#[derive(Debug, Clone)]
pub struct LocalWriteSink {
    root: PathBuf,
}

impl LocalWriteSink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `path` to its location under the root
    fn resolve(&self, path: &Path) -> anyhow::Result<PathBuf> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            bail!("path {} escapes the backup root", path.display());
        }
        if path.is_absolute() {
            if !path.starts_with(&self.root) {
                bail!(
                    "path {} is outside the backup root {}",
                    path.display(),
                    self.root.display()
                );
            }
            return Ok(path.to_path_buf());
        }
        Ok(self.root.join(path))
    }
}

#[async_trait::async_trait]
impl IWritePathSink for LocalWriteSink {
    #[instrument(skip(self, bytes), fields(path = %path.display(), len = bytes.len()))]
    async fn write_blob(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let target = self.resolve(path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Same directory as the target, so the rename stays on one filesystem.
        let tmp_path = {
            let mut p = target.as_os_str().to_owned();
            p.push(".part");
            PathBuf::from(p)
        };

        debug!(?tmp_path, "writing to temporary file");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &target)
            .await
            .with_context(|| format!("failed to move into {}", target.display()))?;

        debug!("write complete");
        Ok(())
    }

    async fn ensure_dir(&self, path: &Path) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))
    }

    async fn exists(&self, path: &Path) -> anyhow::Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&target).await?)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_write_blob_creates_parents() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path());
        let path = Path::new("Acme/Sales/Deals/Deals_export.xlsx");

        sink.write_blob(path, b"xlsx bytes").await.unwrap();

        let written = std::fs::read(dir.path().join(path)).unwrap();
        assert_eq!(written, b"xlsx bytes");
        assert!(sink.exists(path).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_blob_replaces_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path());
        let path = Path::new("report.xlsx");

        sink.write_blob(path, b"first").await.unwrap();
        sink.write_blob(path, b"second").await.unwrap();

        assert_eq!(std::fs::read(dir.path().join(path)).unwrap(), b"second");
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_dir_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path());
        let path = Path::new("Acme/Sales/Deals/files");

        sink.ensure_dir(path).await.unwrap();
        sink.ensure_dir(path).await.unwrap();
        assert!(dir.path().join(path).is_dir());
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_is_accepted() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path());
        let path = dir.path().join("Acme");

        sink.ensure_dir(&path).await.unwrap();
        assert!(sink.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path().join("backup"));

        assert!(sink
            .write_blob(Path::new("../escape.txt"), b"x")
            .await
            .is_err());
        assert!(sink.ensure_dir(dir.path()).await.is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_exists_false_for_missing() {
        let dir = TempDir::new().unwrap();
        let sink = LocalWriteSink::new(dir.path());
        assert!(!sink.exists(Path::new("nothing/here")).await.unwrap());
    }
}
