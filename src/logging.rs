//! Structured logging module for Ghost Twin
//!
//! Writes logs to a daily file in the configured log directory with categories:
//! - CALIBRATION: Challenge generation and answer analysis
//! - PROFILING: Report generation rounds and retries
//! - STORE: Persistence of profile, records and corpus
//! - RECOVERY: Flow-state snapshots and the startup recovery pass
//! - ERROR: Failures of any kind
//!
//! Every line is mirrored as a `tracing` event so the host can attach its own subscriber.

use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Log categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Calibration, // Challenge + analysis rounds
    Profiling,   // Report generation, retry bookkeeping
    Store,       // Document reads/writes
    Recovery,    // Flow-state persistence and the startup pass
    Error,       // Errors and crashes
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Calibration => "CALIBRATION",
            LogCategory::Profiling => "PROFILING",
            LogCategory::Store => "STORE",
            LogCategory::Recovery => "RECOVERY",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Log directory; `None` until `init_logging` runs, in which case only tracing sees the lines
static LOG_DIR: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

/// Default log directory: ~/Library/Logs/GhostTwin
pub fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join("Library/Logs/GhostTwin")
}

const LOG_FILE_PREFIX: &str = "ghost-twin-";
const LOG_FILE_SUFFIX: &str = ".log";

fn log_file_path(dir: &Path) -> PathBuf {
    let today = Local::now().format("%Y-%m-%d").to_string();
    dir.join(format!("{}{}{}", LOG_FILE_PREFIX, today, LOG_FILE_SUFFIX))
}

/// Only our own daily files; the directory may be shared with other data
fn is_log_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX))
}

fn current_log_dir() -> Option<PathBuf> {
    LOG_DIR.lock().ok().and_then(|guard| guard.clone())
}

/// Initialize the logging system - creates the log directory if needed
pub fn init_logging(log_dir: &Path) -> std::io::Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    if let Ok(mut guard) = LOG_DIR.lock() {
        *guard = Some(log_dir.to_path_buf());
    }

    log(LogCategory::Recovery, None, "Ghost Twin logging initialized");
    Ok(())
}

/// Format one log line; `context` is a short identifier (record id, level, ...)
pub fn format_line(category: LogCategory, context: Option<&str>, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let ctx = context
        .map(|c| format!("{} | ", c.chars().take(8).collect::<String>()))
        .unwrap_or_default();

    format!("[{}] [{}] {}{}\n", timestamp, category.as_str(), ctx, message)
}

/// Log a message with category and optional context
pub fn log(category: LogCategory, context: Option<&str>, message: &str) {
    match category {
        LogCategory::Error => {
            tracing::warn!(target: "ghost_twin", category = category.as_str(), context, "{}", message)
        }
        _ => tracing::info!(target: "ghost_twin", category = category.as_str(), context, "{}", message),
    }

    let Some(dir) = current_log_dir() else {
        return;
    };

    let line = format_line(category, context, message);
    if let Ok(mut file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(&dir))
    {
        let _ = file.write_all(line.as_bytes());
    }
}

pub fn log_calibration(context: Option<&str>, message: &str) {
    log(LogCategory::Calibration, context, message);
}

pub fn log_profiling(context: Option<&str>, message: &str) {
    log(LogCategory::Profiling, context, message);
}

pub fn log_store(context: Option<&str>, message: &str) {
    log(LogCategory::Store, context, message);
}

pub fn log_recovery(context: Option<&str>, message: &str) {
    log(LogCategory::Recovery, context, message);
}

pub fn log_error(context: Option<&str>, message: &str) {
    log(LogCategory::Error, context, message);
}

/// Clean up old log files (keep last 7 days)
pub fn cleanup_old_logs() -> std::io::Result<usize> {
    let Some(log_dir) = current_log_dir() else {
        return Ok(0);
    };
    prune_logs_in(&log_dir, Utc::now() - chrono::Duration::days(7))
}

/// Delete `ghost-twin-*.log` files in `log_dir` last modified before `cutoff`
fn prune_logs_in(log_dir: &Path, cutoff: chrono::DateTime<Utc>) -> std::io::Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut deleted = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !is_log_file(&path) {
            continue;
        }

        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified_time: chrono::DateTime<Utc> = modified.into();
            if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}
