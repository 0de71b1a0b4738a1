//! Stock sync entrypoint: one strictly sequential run per invocation.
//!
//! Order of operations: init logging, load credentials, fetch the CLF
//! stock snapshot, fetch the Shopify inventory snapshot, build the
//! update plan, dispatch it, email the summary, exit. Exit code 0 means
//! the run completed, even with per-item failures; config errors,
//! pre-run auth failures, and a token-limit halt exit non-zero.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::Duration;

mod clf;
mod cli;
mod config;
mod error;
mod logging;
mod notify;
mod shopify;
mod sync;

use clf::ClfClient;
use cli::{CleanLogsArgs, Command, RootArgs, SyncArgs};
use config::Credentials;
use error::ApiError;
use notify::Notifier;
use shopify::ShopifyClient;
use sync::RunSummary;

fn main() -> Result<()> {
    let args = RootArgs::parse();
    match args.command {
        Command::Sync(args) => cmd_sync(args),
        Command::CleanLogs(args) => cmd_clean_logs(args),
    }
}

fn cmd_sync(args: SyncArgs) -> Result<()> {
    let logs = logging::init(&args.logs_dir).context("initialize run logs")?;
    tracing::info!("starting stock update run");

    let credentials = Credentials::load(&args.credentials).map_err(|err| {
        tracing::error!(error = %err, "credentials rejected");
        anyhow!(err)
    })?;

    let agent = build_agent();
    let mut clf = ClfClient::new(&agent, &credentials.clf);
    let mut shopify = ShopifyClient::new(&agent, &credentials.shopify);
    let notifier = Notifier::new(&agent, &credentials.sendgrid);

    let stock = match clf.fetch_stock() {
        Ok(stock) => stock,
        Err(err) => {
            tracing::error!(error = %err, "stock snapshot failed");
            // Nothing was dispatched, but the run still ends with its
            // one email carrying the failure.
            deliver(&notifier, &failure_summary(&err), &args, &logs);
            return Err(anyhow!(err).context("fetch CLF stock"));
        }
    };
    tracing::info!(records = stock.len(), "stock snapshot fetched");

    let inventory = match shopify.fetch_inventory_levels() {
        Ok(inventory) => inventory,
        Err(err) => {
            tracing::error!(error = %err, "inventory snapshot failed");
            deliver(&notifier, &failure_summary(&err), &args, &logs);
            return Err(anyhow!(err).context("fetch Shopify inventory"));
        }
    };

    let plan = sync::build_plan(&stock, &inventory);
    tracing::info!(
        items = plan.items.len(),
        skipped = plan.skipped.len(),
        considered = plan.total_considered,
        "update plan built"
    );

    if args.dry_run {
        for item in &plan.items {
            println!(
                "{}: {} -> {} (variant {})",
                item.sku, item.from_quantity, item.to_quantity, item.variant_id
            );
        }
        println!(
            "{} updates planned, {} skipped, {} considered",
            plan.items.len(),
            plan.skipped.len(),
            plan.total_considered
        );
        return Ok(());
    }

    let summary = sync::dispatch(&plan, &mut shopify);
    tracing::info!(
        updated = summary.updated,
        skipped = summary.skipped,
        failed = summary.failed,
        halted = summary.halted,
        "dispatch finished"
    );

    deliver(&notifier, &summary, &args, &logs);

    if summary.halted {
        return Err(anyhow!("run halted: token generation limit exceeded"));
    }
    tracing::info!("stock update run completed");
    Ok(())
}

/// Summary for a run that died before dispatch. The error rides in the
/// error list so the email body shows it.
fn failure_summary(err: &ApiError) -> RunSummary {
    RunSummary {
        halted: matches!(err, ApiError::TokenLimitExceeded),
        errors: vec![("run".to_string(), err.to_string())],
        ..RunSummary::default()
    }
}

/// Send the one summary email for this run. Delivery failure is logged
/// and never changes the exit code.
fn deliver(notifier: &Notifier, summary: &RunSummary, args: &SyncArgs, logs: &logging::RunLogs) {
    let crash_errors = logging::count_crash_errors(&logs.crash_path);
    let attachments = logging::current_log_files(&args.logs_dir);
    let delivery = if summary.halted {
        notifier.send_token_limit_alert(summary, crash_errors, &attachments)
    } else {
        notifier.send_success_summary(summary, crash_errors, &attachments)
    };
    if let Err(err) = delivery {
        tracing::error!(error = %err, "summary email failed");
    }
}

fn cmd_clean_logs(args: CleanLogsArgs) -> Result<()> {
    let report = logging::clean_old_logs(&args.logs_dir, args.retention_days)
        .context("clean old logs")?;
    println!(
        "{} log files deleted, {} KiB freed",
        report.files_deleted,
        report.bytes_freed / 1024
    );
    Ok(())
}

fn build_agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(30)))
        .build();
    ureq::Agent::new_with_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_summary_carries_the_error() {
        let summary = failure_summary(&ApiError::Authentication("status 401".to_string()));
        assert!(!summary.halted);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].0, "run");
        assert!(summary.errors[0].1.contains("authentication failed"));
    }

    #[test]
    fn token_limit_failure_summary_is_halted() {
        let summary = failure_summary(&ApiError::TokenLimitExceeded);
        assert!(summary.halted);
        assert!(summary.errors[0].1.contains("token generation limit"));
    }

    #[test]
    fn network_failure_summary_is_not_halted() {
        let summary = failure_summary(&ApiError::Network("connection reset".to_string()));
        assert!(!summary.halted);
    }
}
