//! Config command - View and check podsync configuration
//!
//! Provides the `podsync config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Validates the configuration file and reports errors
//! 3. Prints the configuration file path

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use podsync_core::config::Config;
use tracing::info;

use super::CliContext;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        match self {
            ConfigCommand::Show => self.execute_show(ctx),
            ConfigCommand::Validate => self.execute_validate(ctx),
            ConfigCommand::Path => self.execute_path(ctx),
        }
    }

    fn execute_show(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config();

        if ctx.is_json() {
            let json = serde_json::to_value(&config)
                .context("Failed to serialize configuration to JSON")?;
            formatter.print_json(&json);
        } else {
            formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
            formatter.info("");

            let yaml = serde_yaml::to_string(&config)
                .context("Failed to serialize configuration to YAML")?;
            for line in yaml.lines() {
                formatter.info(line);
            }
        }
        Ok(())
    }

    fn execute_validate(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();

        // A missing file means defaults, which must validate on their own
        let config = if ctx.config_path.exists() {
            Config::load(&ctx.config_path).with_context(|| {
                format!(
                    "Failed to parse configuration file {}",
                    ctx.config_path.display()
                )
            })?
        } else {
            formatter.info("No configuration file found, validating defaults");
            Config::default()
        };

        let errors = config.validate();
        info!(
            config_path = %ctx.config_path.display(),
            errors = errors.len(),
            "Validated configuration"
        );

        if ctx.is_json() {
            let json = serde_json::json!({
                "valid": errors.is_empty(),
                "config_path": ctx.config_path.display().to_string(),
                "errors": errors
                    .iter()
                    .map(|e| serde_json::json!({"field": e.field, "message": e.message}))
                    .collect::<Vec<_>>(),
            });
            formatter.print_json(&json);
        } else if errors.is_empty() {
            formatter.success("Configuration is valid");
        } else {
            for e in &errors {
                formatter.error(&format!("{}: {}", e.field, e.message));
            }
        }

        if !errors.is_empty() {
            bail!(
                "{} configuration error{}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" }
            );
        }
        Ok(())
    }

    fn execute_path(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        if ctx.is_json() {
            formatter.print_json(&serde_json::json!({
                "config_path": ctx.config_path.display().to_string(),
                "exists": ctx.config_path.exists(),
            }));
        } else {
            println!("{}", ctx.config_path.display());
        }
        Ok(())
    }
}
