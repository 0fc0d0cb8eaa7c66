//! Scan command - Walk the Podio hierarchy and record what a backup needs
//!
//! Provides the `podsync scan` CLI command which:
//! 1. Loads and validates configuration
//! 2. Opens the job database (or an in-memory store for `--dry-run`)
//! 3. Reuses a recent completed scan when asked and one is young enough
//! 4. Resumes the latest incomplete job, or begins a new one
//! 5. Runs the walker with Ctrl-C and out-of-process controls attached

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use podsync_core::ports::ICheckpointStore;
use podsync_engine::{MemoryCheckpointStore, ScanMode, WalkerOptions};
use tracing::info;

use super::{build_walker, drive_job, open_store, report_outcome, CliContext, SinkKind};

#[derive(Debug, Args)]
pub struct ScanCommand {
    /// Begin a new job even if an incomplete one exists
    #[arg(long)]
    pub fresh: bool,

    /// Export every app to a spreadsheet while scanning
    #[arg(long)]
    pub export: bool,

    /// Keep all state in memory and write nothing to disk
    #[arg(long)]
    pub dry_run: bool,

    /// Stop instead of waiting when a quota is exhausted
    #[arg(long)]
    pub no_wait: bool,

    /// Report a completed scan younger than `traversal.reuse_recent_minutes`
    /// instead of scanning again
    #[arg(long)]
    pub reuse_recent: bool,

    /// Title recorded on a new job
    #[arg(long)]
    pub title: Option<String>,
}

impl ScanCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();

        // Step 1: Load and validate config
        let config = ctx.load_config();
        let errors = config.validate();
        if !errors.is_empty() {
            for e in &errors {
                formatter.error(&format!("{}: {}", e.field, e.message));
            }
            bail!("Configuration is invalid; run 'podsync config validate' for details");
        }

        // Step 2: Open the store
        let (pool, store) = if self.dry_run {
            formatter.info("Dry run mode - nothing will be written to disk");
            let store: Arc<dyn ICheckpointStore> = Arc::new(MemoryCheckpointStore::new());
            (None, store)
        } else {
            let (pool, store) = open_store(&config).await?;
            let store: Arc<dyn ICheckpointStore> = store;
            (Some(pool), store)
        };

        // Step 3: Build the walker
        let mut options = WalkerOptions::from(&config);
        if self.export {
            options.mode = ScanMode::Export;
        }
        if self.no_wait {
            options.auto_wait = false;
        }
        let sink = if self.dry_run {
            SinkKind::Discard
        } else {
            SinkKind::Local
        };
        let walker = build_walker(ctx, &config, Arc::clone(&store), sink, options)?;

        // Step 4: Reuse a recent scan
        let reuse_window = config.traversal.reuse_recent();
        if self.reuse_recent && !self.fresh && !reuse_window.is_zero() {
            if let Some(outcome) = walker.reuse_recent(reuse_window).await? {
                report_outcome(ctx, &outcome);
                return Ok(());
            }
        }

        // Step 5: Pick the job
        let incomplete = if self.fresh {
            None
        } else {
            store.find_incomplete_job().await?
        };
        let job_id = match incomplete {
            Some(job) => {
                formatter.info(&format!(
                    "Resuming incomplete scan {} (use --fresh to start over)",
                    job.id()
                ));
                *job.id()
            }
            None => {
                let job_id = store.begin_job(self.title.as_deref()).await?;
                formatter.info(&format!("Starting scan {job_id}"));
                job_id
            }
        };
        info!(job_id = %job_id, dry_run = self.dry_run, "Running scan");

        // Step 6: Run and report
        let outcome = drive_job(&walker, store, job_id).await;
        if let Some(pool) = pool {
            pool.close().await;
        }
        report_outcome(ctx, &outcome?);
        Ok(())
    }
}
