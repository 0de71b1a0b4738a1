//! CLI argument parsing for the stock sync pipeline.
//!
//! The CLI is intentionally thin: it wires the sequential run without
//! embedding policy, so the reconciliation core stays reusable and
//! testable on its own.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default retention window for the logs directory, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 60;

/// Root CLI entrypoint for the sync pipeline.
#[derive(Parser, Debug)]
#[command(
    name = "stock-sync",
    version,
    about = "Reconcile CLF Distribution stock into Shopify inventory",
    after_help = "Commands:\n  sync --credentials <FILE>  Fetch both snapshots, dispatch the diff, email the summary\n  clean-logs                 Delete run logs older than the retention window\n\nExamples:\n  stock-sync sync --credentials data/credentials.json\n  stock-sync sync --credentials data/credentials.json --dry-run\n  stock-sync clean-logs --logs-dir logs --retention-days 60",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Sync(SyncArgs),
    CleanLogs(CleanLogsArgs),
}

/// Sync command inputs for one reconciliation run.
#[derive(Parser, Debug)]
#[command(about = "Run one stock reconciliation against Shopify")]
pub struct SyncArgs {
    /// Path to the JSON credentials file
    #[arg(long, value_name = "FILE")]
    pub credentials: PathBuf,

    /// Directory for run logs
    #[arg(long, value_name = "DIR", default_value = "logs")]
    pub logs_dir: PathBuf,

    /// Build and print the update plan without dispatching anything
    #[arg(long)]
    pub dry_run: bool,
}

/// Clean-logs command inputs.
#[derive(Parser, Debug)]
#[command(about = "Delete run logs older than the retention window")]
pub struct CleanLogsArgs {
    /// Directory holding run logs
    #[arg(long, value_name = "DIR", default_value = "logs")]
    pub logs_dir: PathBuf,

    /// Retention window in days
    #[arg(long, value_name = "DAYS", default_value_t = DEFAULT_RETENTION_DAYS)]
    pub retention_days: i64,
}
