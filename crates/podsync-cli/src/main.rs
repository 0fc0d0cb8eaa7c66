//! podsync CLI - Command-line interface for podsync
//!
//! Provides commands for:
//! - Scanning the Podio hierarchy and exporting apps
//! - Resuming a scan from its checkpoint
//! - Cancelling a scan and clearing quota suspensions
//! - Viewing scan status
//! - Inspecting configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use podsync_core::config::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    config::ConfigCommand,
    control::{CancelCommand, ForceResumeCommand},
    resume::ResumeCommand,
    scan::ScanCommand,
    status::StatusCommand,
    CliContext,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "podsync", version, about = "Rate-aware Podio backup scanner")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan organizations, workspaces and apps
    Scan(ScanCommand),
    /// Resume a scan from its checkpoint
    Resume(ResumeCommand),
    /// Cancel a scan
    Cancel(CancelCommand),
    /// Clear active quota limits so a suspended scan retries now
    ForceResume(ForceResumeCommand),
    /// Show scan status
    Status(StatusCommand),
    /// View and check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Log filter for the given flags; `RUST_LOG` still overrides it
fn log_filter(verbose: u8, quiet: bool, configured: &str) -> String {
    match (quiet, verbose) {
        (true, _) => "warn".to_string(),
        (false, 0) => configured.to_string(),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let logging = Config::load_or_default(&config_path).logging;

    // Setup tracing
    let filter = log_filter(cli.verbose, cli.quiet, &logging.level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let ctx = CliContext {
        format,
        quiet: cli.quiet,
        config_path,
    };

    match cli.command {
        Commands::Scan(cmd) => cmd.execute(&ctx).await,
        Commands::Resume(cmd) => cmd.execute(&ctx).await,
        Commands::Cancel(cmd) => cmd.execute(&ctx).await,
        Commands::ForceResume(cmd) => cmd.execute(&ctx).await,
        Commands::Status(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    }
}
