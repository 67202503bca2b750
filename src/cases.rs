//! Case-directory collaborators: output directory lookup, the alert-file
//! marker, and the per-case auto ingest log.
//!
//! Everything here is a best-effort side channel. Callers log failures and
//! move on; job state durability never depends on these writes succeeding.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::coordination::{Category, CoordinationService};
use crate::error::{AutoIngestError, Result};

/// Name of the alert marker written into a case directory when something
/// about one of its jobs needs operator attention.
pub const ALERT_FILE_NAME: &str = "autoingest_alert.txt";

/// Name of the per-case auto ingest log file.
pub const LOG_FILE_NAME: &str = "auto_ingest_log.txt";

/// Finds the output directory for a case under the results root.
///
/// Case directories are named `<case_name>_<timestamp>`; when several
/// exist, the newest (lexicographically greatest suffix) wins. `None` if
/// the case directory has not been created yet.
pub fn find_case_directory(output_root: &Path, case_name: &str) -> Option<PathBuf> {
    let prefix = format!("{case_name}_");
    let mut best: Option<PathBuf> = None;
    let entries = std::fs::read_dir(output_root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == case_name || name.starts_with(&prefix) {
            match &best {
                Some(current) if current.as_path() >= path.as_path() => {}
                _ => best = Some(path),
            }
        }
    }
    best
}

/// Touches the alert file in a case directory. Idempotent.
pub fn create_alert_file(case_directory: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(case_directory.join(ALERT_FILE_NAME))?;
    Ok(())
}

/// Severity tag for case log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCategory::Info => write!(f, "INFO"),
            LogCategory::Warning => write!(f, "WARNING"),
            LogCategory::Error => write!(f, "ERROR"),
        }
    }
}

/// Appends entries to a case's auto ingest log.
///
/// Multiple hosts append to the same file, so each append runs under an
/// exclusive coordination lock on the log path (Cases category). The lock
/// wait is bounded by a generous timeout; log contention is rare but a
/// crashed holder's session must be allowed to expire.
pub struct JobLogger {
    coordination: Arc<dyn CoordinationService>,
    host_name: String,
    lock_timeout: Duration,
}

impl JobLogger {
    pub fn new(
        coordination: Arc<dyn CoordinationService>,
        host_name: &str,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            coordination,
            host_name: host_name.to_string(),
            lock_timeout,
        }
    }

    /// Appends one entry to the case log for a manifest's job.
    pub async fn log(
        &self,
        manifest_path: &Path,
        data_source_file_name: &str,
        case_directory: &Path,
        category: LogCategory,
        message: &str,
    ) -> Result<()> {
        let log_path = case_directory.join(LOG_FILE_NAME);
        let lock_path = log_path.display().to_string();

        let lock = self
            .coordination
            .try_exclusive_lock(Category::Cases, &lock_path, self.lock_timeout)
            .await?
            .ok_or_else(|| {
                AutoIngestError::Internal(format!(
                    "timed out waiting for case log lock on {lock_path}"
                ))
            })?;

        let result = self.append_entry(
            &log_path,
            manifest_path,
            data_source_file_name,
            category,
            message,
        );
        lock.release();
        result
    }

    /// Records that a crashed job is being returned to the pending queue.
    pub async fn log_crash_recovery_with_retry(
        &self,
        manifest_path: &Path,
        data_source_file_name: &str,
        case_directory: &Path,
    ) -> Result<()> {
        self.log(
            manifest_path,
            data_source_file_name,
            case_directory,
            LogCategory::Error,
            "Detected crash while processing, retrying",
        )
        .await
    }

    /// Records that a crashed job has exhausted its retries.
    pub async fn log_crash_recovery_no_retry(
        &self,
        manifest_path: &Path,
        data_source_file_name: &str,
        case_directory: &Path,
    ) -> Result<()> {
        self.log(
            manifest_path,
            data_source_file_name,
            case_directory,
            LogCategory::Error,
            "Detected crash while processing, giving up after too many retries",
        )
        .await
    }

    fn append_entry(
        &self,
        log_path: &Path,
        manifest_path: &Path,
        data_source_file_name: &str,
        category: LogCategory,
        message: &str,
    ) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{}: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.host_name,
            manifest_path.display(),
            data_source_file_name,
            category,
            message,
        )?;
        Ok(())
    }
}
