//! CLI subcommands and the wiring they share
//!
//! Every command receives a [`CliContext`] carrying the global flags. The
//! helpers below build the adapters (SQLite store, Podio remote, write
//! sink) the same way for each command so that `scan`, `resume` and the
//! operator controls all see the same database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use podsync_cache::{DatabasePool, SqliteCheckpointStore};
use podsync_core::config::Config;
use podsync_core::domain::JobId;
use podsync_core::ports::{ICheckpointStore, IProgressSink, IWritePathSink};
use podsync_engine::{
    HierarchyWalker, LocalWriteSink, MemoryWriteSink, ScanOutcome, StoreWatch, SystemClock,
    TracingProgressSink, WalkerDeps, WalkerOptions,
};
use podsync_remote::{PodioClient, PodioRemote};
use tracing::{info, warn};

use crate::output::{get_formatter, ConsoleProgressSink, OutputFormat, OutputFormatter};

pub mod config;
pub mod control;
pub mod resume;
pub mod scan;
pub mod status;

/// How often a running scan checks the store for out-of-process controls
const STORE_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Global flags shared by every command
#[derive(Debug, Clone)]
pub struct CliContext {
    pub format: OutputFormat,
    pub quiet: bool,
    pub config_path: PathBuf,
}

impl CliContext {
    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format, self.quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Loads the configuration file, falling back to defaults when absent
    pub fn load_config(&self) -> Config {
        let config = Config::load_or_default(&self.config_path);
        info!(config_path = %self.config_path.display(), "Loaded configuration");
        config
    }

    fn progress_sink(&self) -> Arc<dyn IProgressSink> {
        if self.quiet {
            Arc::new(TracingProgressSink)
        } else {
            Arc::new(ConsoleProgressSink::new(self.format))
        }
    }
}

// ============================================================================
// Adapter wiring
// ============================================================================

/// Opens the job database named in the configuration
pub async fn open_store(config: &Config) -> Result<(DatabasePool, Arc<SqliteCheckpointStore>)> {
    let pool = DatabasePool::new(&config.storage.database)
        .await
        .with_context(|| {
            format!(
                "Failed to open database at {}",
                config.storage.database.display()
            )
        })?;
    let store = Arc::new(SqliteCheckpointStore::new(pool.pool().clone()));
    Ok((pool, store))
}

/// Reads the access token from the environment variable named in the configuration
pub fn access_token(config: &Config) -> Result<String> {
    let var = &config.remote.access_token_env;
    match std::env::var(var) {
        Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
        _ => bail!("No access token found. Export {var} with a valid Podio OAuth token."),
    }
}

/// Where discovered files and exports are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// Write under `storage.backup_root`
    Local,
    /// Keep everything in memory (dry run)
    Discard,
}

/// Builds a walker wired to Podio, the given store and the console
pub fn build_walker(
    ctx: &CliContext,
    config: &Config,
    store: Arc<dyn ICheckpointStore>,
    sink: SinkKind,
    options: WalkerOptions,
) -> Result<HierarchyWalker> {
    let token = access_token(config)?;
    let client = PodioClient::from_config(&config.remote, token)?;
    let remote = Arc::new(PodioRemote::new(client));

    let sink: Arc<dyn IWritePathSink> = match sink {
        SinkKind::Local => Arc::new(LocalWriteSink::new(config.storage.backup_root.clone())),
        SinkKind::Discard => Arc::new(MemoryWriteSink::new()),
    };

    let deps = WalkerDeps {
        remote,
        store,
        sink,
        progress: ctx.progress_sink(),
        clock: Arc::new(SystemClock),
    };
    Ok(HierarchyWalker::new(deps, options))
}

/// Runs a job from its checkpoint with operator controls attached
///
/// The first Ctrl-C pauses the scan at the next safe point; a second one
/// cancels it. Cancellation or a cleared limit recorded by another
/// `podsync` process is picked up through [`StoreWatch`].
pub async fn drive_job(
    walker: &HierarchyWalker,
    store: Arc<dyn ICheckpointStore>,
    job_id: JobId,
) -> Result<ScanOutcome> {
    let control = walker.control().clone();
    let watch = StoreWatch::spawn(store, job_id, control.clone(), STORE_WATCH_INTERVAL);

    let interrupt = tokio::spawn(async move {
        let mut presses = 0u32;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            if presses == 1 {
                warn!(job_id = %job_id, "Interrupt received, pausing at the next safe point (press Ctrl-C again to cancel)");
                control.pause();
            } else {
                warn!(job_id = %job_id, "Second interrupt received, cancelling");
                control.cancel();
                break;
            }
        }
    });

    let result = walker.resume_from_checkpoint(job_id).await;

    interrupt.abort();
    watch.shutdown().await;

    Ok(result?)
}

/// Reports how a run ended
pub fn report_outcome(ctx: &CliContext, outcome: &ScanOutcome) {
    let formatter = ctx.formatter();

    if ctx.is_json() {
        formatter.print_json(&outcome_json(outcome));
        return;
    }

    match outcome {
        ScanOutcome::Completed { job_id, summary } => {
            formatter.success(&format!("Scan {job_id} completed"));
            formatter.info(&format!("Organizations: {}", summary.organizations));
            formatter.info(&format!("Workspaces:    {}", summary.workspaces));
            formatter.info(&format!("Apps:          {}", summary.apps));
            formatter.info(&format!("Items:         {}", summary.items));
            formatter.info(&format!("Files:         {}", summary.files));
            formatter.info(&format!(
                "Estimated size: {}",
                format_bytes(summary.total_bytes)
            ));
        }
        ScanOutcome::Reused(job) => {
            formatter.success(&format!(
                "Reusing scan {} from {}",
                job.id(),
                job.created_at().format("%Y-%m-%d %H:%M:%S UTC")
            ));
            if let Some(summary) = job.summary() {
                formatter.info(&format!(
                    "{} apps, {} items, {} files, {}",
                    summary.apps,
                    summary.items,
                    summary.files,
                    format_bytes(summary.total_bytes)
                ));
            }
        }
        ScanOutcome::Incomplete {
            job_id,
            failed_units,
        } => {
            formatter.warn(&format!(
                "Scan {job_id} finished with {} failed unit{}",
                failed_units.len(),
                if failed_units.len() == 1 { "" } else { "s" }
            ));
            for unit in failed_units {
                formatter.info(&format!("- {unit}"));
            }
            formatter.info(&format!("Run 'podsync resume {job_id}' to retry them."));
        }
        ScanOutcome::Suspended { job_id, limit } => {
            formatter.warn(&format!(
                "Scan {job_id} stopped: {} quota exhausted until {}",
                limit.category(),
                limit.resume_at().format("%Y-%m-%d %H:%M:%S UTC")
            ));
            formatter.info(&format!(
                "Run 'podsync resume {job_id}' after that time, or 'podsync force-resume' to retry now."
            ));
        }
        ScanOutcome::Paused { job_id } => {
            formatter.warn(&format!("Scan {job_id} paused"));
            formatter.info(&format!("Run 'podsync resume {job_id}' to continue."));
        }
        ScanOutcome::Cancelled { job_id } => {
            formatter.warn(&format!("Scan {job_id} cancelled"));
        }
    }
}

fn outcome_json(outcome: &ScanOutcome) -> serde_json::Value {
    let job_id = outcome.job_id().to_string();
    match outcome {
        ScanOutcome::Completed { summary, .. } => serde_json::json!({
            "job_id": job_id,
            "outcome": "completed",
            "summary": summary,
        }),
        ScanOutcome::Reused(job) => serde_json::json!({
            "job_id": job_id,
            "outcome": "reused",
            "created_at": job.created_at().to_rfc3339(),
            "summary": job.summary(),
        }),
        ScanOutcome::Incomplete { failed_units, .. } => serde_json::json!({
            "job_id": job_id,
            "outcome": "incomplete",
            "failed_units": failed_units,
        }),
        ScanOutcome::Suspended { limit, .. } => serde_json::json!({
            "job_id": job_id,
            "outcome": "suspended",
            "category": limit.category().as_str(),
            "resume_at": limit.resume_at().to_rfc3339(),
        }),
        ScanOutcome::Paused { .. } => serde_json::json!({
            "job_id": job_id,
            "outcome": "paused",
        }),
        ScanOutcome::Cancelled { .. } => serde_json::json!({
            "job_id": job_id,
            "outcome": "cancelled",
        }),
    }
}

/// Formats a byte count with a binary unit suffix
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
