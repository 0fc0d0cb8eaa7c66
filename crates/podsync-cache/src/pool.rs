//! The job database
//!
//! One SQLite file holds every scan job, its checkpoint, discovered
//! entities, failed units and the active quota limits. A running `podsync
//! scan` writes it while `podsync status`, `cancel` and `force-resume` open
//! it from other processes, so file databases run in WAL mode with a busy
//! timeout. The schema is applied on every open and is idempotent.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// How long a writer waits for a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections for a file database; one scan writes and a few readers poll
const FILE_CONNECTIONS: u32 = 5;

const SCHEMA: &str = include_str!("migrations/20260301_initial.sql");

/// Handle to the job database
///
/// An in-memory database lives on a single connection, since every
/// SQLite connection to `:memory:` opens a separate database.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens the job database at `db_path`, creating the file and its
    /// directory on first use
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` if the directory or database cannot be
    /// opened, `CacheError::MigrationFailed` if the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(dir) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create job database directory {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot open job database {}: {e}",
                    db_path.display()
                ))
            })?;

        apply_schema(&pool).await?;
        tracing::info!(path = %db_path.display(), "Job database opened");
        Ok(Self { pool })
    }

    /// Opens a throwaway job database for dry runs and tests
    ///
    /// # Errors
    ///
    /// Same as [`DatabasePool::new`].
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open in-memory job database: {e}"))
            })?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot open in-memory job database: {e}"))
            })?;

        apply_schema(&pool).await?;
        tracing::debug!("In-memory job database opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every connection, checkpointing the WAL
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), CacheError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| CacheError::MigrationFailed(format!("cannot apply job schema: {e}")))?;
    tracing::debug!("Job schema applied");
    Ok(())
}
