//! Status command - Display the state of a scan job
//!
//! Provides the `podsync status` CLI command which:
//! 1. Shows the job (latest by default) and whether it is resumable
//! 2. Shows the checkpoint cursor and running counters
//! 3. Counts discovered entities per kind
//! 4. Lists active quota suspensions and failed units

use anyhow::{Context, Result};
use clap::Args;
use podsync_core::domain::{EntityKind, EntityStatus, JobId, ScanJob};
use podsync_core::ports::ICheckpointStore;
use podsync_engine::ProgressReporter;

use super::{format_bytes, open_store, CliContext};

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Job to inspect (defaults to the latest job)
    pub job_id: Option<JobId>,
}

/// Discovered and failed entity counts of one kind
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct KindTally {
    discovered: usize,
    failed: usize,
}

const KINDS: [EntityKind; 4] = [
    EntityKind::Organization,
    EntityKind::Workspace,
    EntityKind::App,
    EntityKind::File,
];

fn job_status(job: &ScanJob) -> &'static str {
    if job.is_completed() {
        "completed"
    } else if job.is_cancelled() {
        "cancelled"
    } else {
        "incomplete"
    }
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config();

        if !config.storage.database.exists() {
            formatter.error("No database found. Run 'podsync scan' first.");
            return Ok(());
        }
        let (pool, store) = open_store(&config).await?;

        let job = match self.job_id {
            Some(id) => store.get_job(&id).await?,
            None => store.latest_job().await?,
        };
        let Some(job) = job else {
            formatter.error("No scan found");
            return Ok(());
        };
        let job_id = *job.id();

        let checkpoint = store
            .load_checkpoint(&job_id)
            .await
            .context("Failed to load checkpoint")?;
        let failed_units = store.list_failed_units(&job_id).await?;
        let limits = store.load_active_limits().await?;

        let mut tallies = Vec::with_capacity(KINDS.len());
        for kind in KINDS {
            let entities = store.list_entities(&job_id, Some(kind)).await?;
            let failed = entities
                .iter()
                .filter(|e| matches!(e.status(), EntityStatus::Failed(_)))
                .count();
            tallies.push((
                kind,
                KindTally {
                    discovered: entities.len(),
                    failed,
                },
            ));
        }
        pool.close().await;

        let percent = checkpoint.as_ref().map(ProgressReporter::percent_for);

        if ctx.is_json() {
            let entities: serde_json::Map<String, serde_json::Value> = tallies
                .iter()
                .map(|(kind, t)| {
                    (
                        kind.to_string(),
                        serde_json::json!({"discovered": t.discovered, "failed": t.failed}),
                    )
                })
                .collect();
            let json = serde_json::json!({
                "job_id": job_id.to_string(),
                "title": job.title(),
                "status": job_status(&job),
                "created_at": job.created_at().to_rfc3339(),
                "resumable": job.is_resumable(),
                "percent": percent,
                "checkpoint": checkpoint.as_ref().map(|c| serde_json::json!({
                    "organization": [c.org_index(), c.org_total()],
                    "workspace": [c.workspace_index(), c.workspace_total()],
                    "app": [c.app_index(), c.app_total()],
                    "counters": c.counters(),
                    "updated_at": c.updated_at().to_rfc3339(),
                })),
                "summary": job.summary(),
                "entities": entities,
                "active_limits": limits,
                "failed_units": failed_units,
            });
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success(&format!(
            "Scan {job_id}{} ({})",
            job.title().map(|t| format!(" \"{t}\"")).unwrap_or_default(),
            job_status(&job)
        ));
        formatter.info(&format!(
            "Started: {}",
            job.created_at().format("%Y-%m-%d %H:%M:%S UTC")
        ));

        match &checkpoint {
            Some(c) => {
                formatter.info(&format!(
                    "Progress: {:.1}% (organization {}/{}, workspace {}/{}, app {}/{})",
                    percent.unwrap_or_default(),
                    c.org_index(),
                    c.org_total(),
                    c.workspace_index(),
                    c.workspace_total(),
                    c.app_index(),
                    c.app_total()
                ));
                formatter.info(&format!("Counters: {}", c.counters()));
                formatter.info(&format!(
                    "Checkpoint saved: {}",
                    c.updated_at().format("%Y-%m-%d %H:%M:%S UTC")
                ));
            }
            None => formatter.info("Progress: not started"),
        }

        if let Some(summary) = job.summary() {
            formatter.info(&format!(
                "Estimated backup size: {}",
                format_bytes(summary.total_bytes)
            ));
        }

        formatter.info("");
        formatter.info("Discovered:");
        for (kind, tally) in &tallies {
            let failed = if tally.failed > 0 {
                format!(" ({} failed)", tally.failed)
            } else {
                String::new()
            };
            formatter.info(&format!("  {:<13} {}{}", kind, tally.discovered, failed));
        }

        for limit in &limits {
            formatter.warn(&format!(
                "{} quota exhausted until {}",
                limit.category(),
                limit.resume_at().format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }

        if !failed_units.is_empty() {
            formatter.info("");
            formatter.error(&format!(
                "{} failed unit{}:",
                failed_units.len(),
                if failed_units.len() == 1 { "" } else { "s" }
            ));
            for unit in &failed_units {
                formatter.info(&format!("- {unit}"));
            }
        }

        if job.is_resumable() {
            formatter.info("");
            formatter.info(&format!("Run 'podsync resume {job_id}' to continue."));
        }

        Ok(())
    }
}
