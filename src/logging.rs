//! Run logging: dated, categorized log files plus retention cleanup.
//!
//! Each run writes three files into the logs directory, named with the
//! run date and a short per-run suffix:
//!
//! - `LOGS_<date>_<suffix>.txt` - everything at INFO and up (general)
//! - `CRASH_LOGS_<date>_<suffix>.txt` - errors only (crash)
//! - `UPDATED_PRODUCTS_LOGS_<date>_<suffix>.txt` - events with target
//!   `update` (one line per successful inventory mutation)
//!
//! A stderr layer honoring `RUST_LOG` is installed alongside for
//! interactive use. Rotation is by run; `clean_old_logs` enforces the
//! retention window.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::Level;
use tracing_subscriber::filter::{filter_fn, EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

const DATE_FORMAT: &str = "%Y%m%d";

/// Paths of the three files backing the current run.
#[derive(Debug, Clone)]
pub struct RunLogs {
    pub general_path: PathBuf,
    pub crash_path: PathBuf,
    pub update_path: PathBuf,
}

/// What `clean_old_logs` removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

/// Create the log files for this run and install the global subscriber.
pub fn init(logs_dir: &Path) -> Result<RunLogs> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("create logs directory {}", logs_dir.display()))?;

    let date = Local::now().format(DATE_FORMAT).to_string();
    let suffix = run_suffix();
    let logs = RunLogs {
        general_path: logs_dir.join(format!("LOGS_{date}_{suffix}.txt")),
        crash_path: logs_dir.join(format!("CRASH_LOGS_{date}_{suffix}.txt")),
        update_path: logs_dir.join(format!("UPDATED_PRODUCTS_LOGS_{date}_{suffix}.txt")),
    };

    let general_file = create_log_file(&logs.general_path)?;
    let crash_file = create_log_file(&logs.crash_path)?;
    let update_file = create_log_file(&logs.update_path)?;

    let general = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(general_file))
        .with_filter(filter_fn(|metadata| {
            metadata.target() != "update" && *metadata.level() <= Level::INFO
        }));
    let crash = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(crash_file))
        .with_filter(LevelFilter::ERROR);
    let update = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(update_file))
        .with_filter(filter_fn(|metadata| metadata.target() == "update"));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_default_env());

    tracing_subscriber::registry()
        .with(general)
        .with(crash)
        .with(update)
        .with(console)
        .try_init()
        .context("install tracing subscriber")?;

    tracing::info!(
        general = %logs.general_path.display(),
        crash = %logs.crash_path.display(),
        update = %logs.update_path.display(),
        "run logs created"
    );
    Ok(logs)
}

fn create_log_file(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("create log file {}", path.display()))
}

/// Short per-run suffix so two runs on the same day write distinct files.
fn run_suffix() -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string();
    let mut hasher = Sha256::new();
    hasher.update(stamp.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..4].to_string()
}

/// Count ERROR lines in a log file, for the notification stats. A
/// missing file counts as zero.
pub fn count_crash_errors(path: &Path) -> usize {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents.lines().filter(|line| line.contains("ERROR")).count(),
        Err(_) => 0,
    }
}

/// Log files written today, for email attachment.
pub fn current_log_files(logs_dir: &Path) -> Vec<PathBuf> {
    let date = Local::now().format(DATE_FORMAT).to_string();
    let mut files = files_matching(logs_dir, |name| name.contains(&date));
    files.sort();
    files
}

/// Delete `.txt` log files whose embedded `YYYYMMDD` date is older than
/// the retention window. Files without a recognizable date are left
/// alone.
pub fn clean_old_logs(logs_dir: &Path, retention_days: i64) -> Result<CleanupReport> {
    let date_pattern = Regex::new(r"\d{8}").expect("static regex");
    let today = Local::now().date_naive();
    let mut report = CleanupReport::default();

    for path in files_matching(logs_dir, |_| true) {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(date) = date_pattern
            .find(name)
            .and_then(|m| NaiveDate::parse_from_str(m.as_str(), DATE_FORMAT).ok())
        else {
            tracing::warn!(file = name, "log file has no recognizable date");
            continue;
        };
        let age_days = (today - date).num_days();
        if age_days <= retention_days {
            continue;
        }
        let size = std::fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        std::fs::remove_file(&path)
            .with_context(|| format!("delete expired log {}", path.display()))?;
        tracing::info!(file = name, age_days, size, "deleted expired log file");
        report.files_deleted += 1;
        report.bytes_freed += size;
    }
    Ok(report)
}

fn files_matching(logs_dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "txt")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(&keep)
        })
        .collect()
}
