//! Operator controls - cancel a job or clear an active quota suspension
//!
//! Both commands only touch the job database. A scan running in another
//! `podsync` process notices the change through its store watch and
//! stops, or retries, at the next safe point.

use anyhow::{Context, Result};
use clap::Args;
use podsync_core::domain::JobId;
use podsync_core::ports::ICheckpointStore;
use tracing::info;

use super::{open_store, CliContext};

#[derive(Debug, Args)]
pub struct CancelCommand {
    /// Job to cancel (defaults to the latest incomplete job)
    pub job_id: Option<JobId>,
}

impl CancelCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config();
        let (pool, store) = open_store(&config).await?;

        let job = match self.job_id {
            Some(id) => store.get_job(&id).await?,
            None => store.find_incomplete_job().await?,
        };
        let Some(job) = job else {
            formatter.error("No matching scan to cancel");
            return Ok(());
        };
        let job_id = *job.id();

        if job.is_completed() {
            formatter.error(&format!("Scan {job_id} already completed"));
            return Ok(());
        }
        if job.is_cancelled() {
            formatter.success(&format!("Scan {job_id} was already cancelled"));
            return Ok(());
        }

        store
            .mark_cancelled(&job_id)
            .await
            .with_context(|| format!("Failed to cancel scan {job_id}"))?;
        pool.close().await;
        info!(job_id = %job_id, "Job cancelled by operator");

        if ctx.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "job_id": job_id.to_string(),
                "cancelled": true,
            }));
        } else {
            formatter.success(&format!("Scan {job_id} cancelled"));
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ForceResumeCommand {
    /// Job the operator expects to continue; limits are cleared for every job
    pub job_id: Option<JobId>,
}

impl ForceResumeCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config();
        let (pool, store) = open_store(&config).await?;

        if let Some(job_id) = self.job_id {
            match store.get_job(&job_id).await? {
                Some(job) if job.is_resumable() => {}
                Some(_) => {
                    formatter.error(&format!("Scan {job_id} is not resumable"));
                    return Ok(());
                }
                None => {
                    formatter.error(&format!("Scan {job_id} not found"));
                    return Ok(());
                }
            }
        }

        let limits = store.load_active_limits().await?;
        for limit in &limits {
            store.clear_active_limit(limit.category()).await?;
            info!(category = %limit.category(), resume_at = %limit.resume_at(), "Active limit cleared by operator");
        }
        pool.close().await;

        if ctx.is_json() {
            let cleared: Vec<&str> = limits.iter().map(|l| l.category().as_str()).collect();
            formatter.print_json(&serde_json::json!({
                "success": true,
                "cleared": cleared,
            }));
        } else if limits.is_empty() {
            formatter.success("No active quota limits");
        } else {
            formatter.success(&format!(
                "Cleared {} active limit{}",
                limits.len(),
                if limits.len() == 1 { "" } else { "s" }
            ));
            formatter.warn("Requests may be rejected again if the server quota has not reset");
        }
        if let Some(job_id) = self.job_id {
            formatter.info(&format!(
                "A running scan picks this up automatically; otherwise run 'podsync resume {job_id}'."
            ));
        }
        Ok(())
    }
}
