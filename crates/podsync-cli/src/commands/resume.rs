//! Resume command - Continue a scan from its stored checkpoint

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use podsync_core::domain::JobId;
use podsync_core::ports::ICheckpointStore;
use podsync_engine::WalkerOptions;

use super::{build_walker, drive_job, open_store, report_outcome, CliContext, SinkKind};

#[derive(Debug, Args)]
pub struct ResumeCommand {
    /// Job to resume (defaults to the latest incomplete job)
    pub job_id: Option<JobId>,

    /// Stop instead of waiting when a quota is exhausted
    #[arg(long)]
    pub no_wait: bool,
}

impl ResumeCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config();
        let (pool, store) = open_store(&config).await?;
        let store: Arc<dyn ICheckpointStore> = store;

        let job_id = match self.job_id {
            Some(id) => id,
            None => match store
                .find_incomplete_job()
                .await
                .context("Failed to look up incomplete jobs")?
            {
                Some(job) => *job.id(),
                None => {
                    formatter.error("No incomplete scan to resume. Run 'podsync scan' first.");
                    return Ok(());
                }
            },
        };

        if store.get_job(&job_id).await?.is_none() {
            formatter.error(&format!("Scan {job_id} not found"));
            return Ok(());
        }

        let mut options = WalkerOptions::from(&config);
        if self.no_wait {
            options.auto_wait = false;
        }
        let walker = build_walker(ctx, &config, Arc::clone(&store), SinkKind::Local, options)?;

        formatter.info(&format!("Resuming scan {job_id}"));
        let outcome = drive_job(&walker, store, job_id).await;
        pool.close().await;
        report_outcome(ctx, &outcome?);
        Ok(())
    }
}
