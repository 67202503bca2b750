//! The input scan: the periodic pass that turns manifest records in the
//! coordination store into the pending and completed job views, and that
//! recovers jobs abandoned by crashed hosts.
//!
//! A scan is read-mostly. It writes a manifest node only in two places,
//! both under the node's exclusive lock: claiming a never-recorded manifest
//! as PENDING, and crash recovery of an unlocked PROCESSING record. Every
//! per-manifest failure is logged and skipped so one bad record never
//! starves the rest of the queue.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cases::{create_alert_file, find_case_directory, JobLogger};
use crate::config::MonitorConfig;
use crate::coordination::{Category, CoordinationService};
use crate::error::Result;
use crate::job::{sort_pending_queue, AutoIngestJob};
use crate::manifest::{Manifest, ManifestParser};
use crate::node_data::{JobNodeData, ProcessingStage, ProcessingStatus};

/// What one scan pass found.
#[derive(Default)]
pub struct ScanResults {
    /// Jobs waiting to run, sorted by descending priority.
    pub pending: Vec<AutoIngestJob>,
    /// Jobs that have finished, in scan order.
    pub completed: Vec<AutoIngestJob>,
    /// Every manifest seen this pass, grouped by case name. Drives case
    /// deletion and the per-case views.
    pub cases_to_manifests: HashMap<String, HashSet<PathBuf>>,
}

pub struct InputScanner {
    coordination: Arc<dyn CoordinationService>,
    parsers: Arc<Vec<Box<dyn ManifestParser>>>,
    config: MonitorConfig,
    job_logger: JobLogger,
}

impl InputScanner {
    pub fn new(
        coordination: Arc<dyn CoordinationService>,
        parsers: Vec<Box<dyn ManifestParser>>,
        config: MonitorConfig,
    ) -> Self {
        let job_logger = JobLogger::new(
            Arc::clone(&coordination),
            &config.host_name,
            config.log_lock_timeout,
        );
        Self {
            coordination,
            parsers: Arc::new(parsers),
            config,
            job_logger,
        }
    }

    /// Runs one scan pass. Returns `None` if cancellation was requested
    /// part-way through, in which case the partial results are discarded.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<Option<ScanResults>> {
        if let Some(input_root) = self.config.input_root.clone() {
            self.register_new_manifests(&input_root).await;
        }

        let mut results = ScanResults::default();
        let node_paths = self.coordination.list_nodes(Category::Manifests).await?;
        for node_path in node_paths {
            if cancel.is_cancelled() {
                info!("input scan cancelled");
                return Ok(None);
            }
            if let Err(err) = self.visit_manifest(&node_path, &mut results).await {
                warn!(manifest = %node_path, %err, "skipping manifest after scan error");
            }
        }

        sort_pending_queue(&mut results.pending);
        info!(
            pending = results.pending.len(),
            completed = results.completed.len(),
            cases = results.cases_to_manifests.len(),
            "input scan completed"
        );
        Ok(Some(results))
    }

    /// Walks the input root and registers any manifest file that has no
    /// coordination node yet, so this and every other host will visit it.
    async fn register_new_manifests(&self, input_root: &Path) {
        // The walk is synchronous filesystem work over a possibly large
        // network share; run it on the blocking pool.
        let parsers = Arc::clone(&self.parsers);
        let root = input_root.to_path_buf();
        let walk = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            collect_manifest_files(&root, &parsers, &mut found);
            found
        })
        .await;
        let found = match walk {
            Ok(found) => found,
            Err(err) => {
                error!(%err, "input directory walk task failed");
                return;
            }
        };
        for path in found {
            let node_path = path.display().to_string();
            match self
                .coordination
                .get_node_data(Category::Manifests, &node_path)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(manifest = %node_path, "registering newly discovered manifest");
                    if let Err(err) = self
                        .coordination
                        .set_node_data(Category::Manifests, &node_path, Vec::new())
                        .await
                    {
                        warn!(manifest = %node_path, %err, "failed to register manifest");
                    }
                }
                Err(err) => {
                    warn!(manifest = %node_path, %err, "failed to check manifest registration");
                }
            }
        }
    }

    /// Resolves the case output directory without blocking a runtime worker.
    async fn case_directory(&self, case_name: &str) -> Option<PathBuf> {
        let root = self.config.output_root.clone();
        let case = case_name.to_string();
        tokio::task::spawn_blocking(move || find_case_directory(&root, &case))
            .await
            .ok()
            .flatten()
    }

    async fn visit_manifest(&self, node_path: &str, results: &mut ScanResults) -> Result<()> {
        let manifest_path = PathBuf::from(node_path);
        let Some(parser) = self
            .parsers
            .iter()
            .find(|p| p.file_is_manifest(&manifest_path))
        else {
            debug!(node = %node_path, "node is not a recognized manifest, ignoring");
            return Ok(());
        };
        let manifest = match parser.parse(&manifest_path) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(manifest = %node_path, %err, "manifest failed to parse, skipping");
                return Ok(());
            }
        };

        results
            .cases_to_manifests
            .entry(manifest.case_name.clone())
            .or_default()
            .insert(manifest.file_path.clone());

        let raw = self
            .coordination
            .get_node_data(Category::Manifests, node_path)
            .await?
            .unwrap_or_default();
        let node_data = JobNodeData::decode(&raw)?;

        if !node_data.was_set() {
            self.claim_new_manifest(&manifest, results).await?;
            return Ok(());
        }

        match node_data.status {
            ProcessingStatus::Pending => {
                self.add_pending_job(&manifest, &node_data, results).await;
            }
            ProcessingStatus::Processing => {
                self.recover_if_crashed(&manifest, results).await?;
            }
            ProcessingStatus::Completed => {
                self.add_completed_job(&manifest, &node_data, results).await;
            }
            ProcessingStatus::Deleted => {
                // Kept in the store so the manifest is never re-ingested,
                // but invisible everywhere else.
            }
        }
        Ok(())
    }

    /// Writes the initial PENDING record for a manifest nobody has claimed
    /// yet. Losing the lock race is not an error; whoever won writes the
    /// same record.
    async fn claim_new_manifest(
        &self,
        manifest: &Manifest,
        results: &mut ScanResults,
    ) -> Result<()> {
        let node_path = manifest.file_path.display().to_string();
        let Some(lock) = self
            .coordination
            .try_exclusive_lock(
                Category::Manifests,
                &node_path,
                self.config.manifest_lock_timeout,
            )
            .await?
        else {
            debug!(manifest = %node_path, "another host is claiming this manifest");
            return Ok(());
        };

        let mut node_data =
            JobNodeData::new(manifest, ProcessingStatus::Pending, 0, 0, None, false);
        node_data.processing_host = self.config.host_name.clone();
        let encoded = node_data.encode()?;
        let write = self
            .coordination
            .set_node_data(Category::Manifests, &node_path, encoded)
            .await;
        lock.release();
        write?;

        info!(manifest = %node_path, case = %manifest.case_name, "recorded new pending job");
        self.add_pending_job(manifest, &node_data, results).await;
        Ok(())
    }

    async fn add_pending_job(
        &self,
        manifest: &Manifest,
        node_data: &JobNodeData,
        results: &mut ScanResults,
    ) {
        let case_directory = self.case_directory(&manifest.case_name).await;
        results.pending.push(AutoIngestJob::from_node_data(
            manifest.clone(),
            node_data,
            case_directory,
            &self.config.host_name,
            ProcessingStage::Pending,
        ));
    }

    async fn add_completed_job(
        &self,
        manifest: &Manifest,
        node_data: &JobNodeData,
        results: &mut ScanResults,
    ) {
        // A completed job with no case directory has nothing to show; the
        // case was deleted out from under its record.
        let Some(case_directory) = self.case_directory(&manifest.case_name).await else {
            warn!(
                manifest = %manifest.file_path.display(),
                case = %manifest.case_name,
                "completed job has no case directory, omitting from completed list"
            );
            return;
        };
        results.completed.push(AutoIngestJob::from_node_data(
            manifest.clone(),
            node_data,
            Some(case_directory),
            &node_data.processing_host,
            ProcessingStage::Completed,
        ));
    }

    /// Crash detection and recovery for a PROCESSING record.
    ///
    /// A live processing host holds its manifest's exclusive lock for the
    /// whole run, so acquiring that lock here proves the host died. The
    /// record is then either returned to the pending queue or, once the
    /// retry ceiling is hit, marked completed with errors. The updated
    /// record is persisted before the lock is released.
    async fn recover_if_crashed(
        &self,
        manifest: &Manifest,
        results: &mut ScanResults,
    ) -> Result<()> {
        let node_path = manifest.file_path.display().to_string();
        let Some(lock) = self
            .coordination
            .try_exclusive_lock(Category::Manifests, &node_path, self.config.manifest_lock_timeout)
            .await?
        else {
            // Held: the job really is being processed somewhere.
            return Ok(());
        };

        let outcome = self.recover_locked(manifest, &node_path, results).await;
        lock.release();
        outcome
    }

    async fn recover_locked(
        &self,
        manifest: &Manifest,
        node_path: &str,
        results: &mut ScanResults,
    ) -> Result<()> {
        // Re-read under the lock; the state may have moved on since the
        // lock-free read that brought us here.
        let raw = self
            .coordination
            .get_node_data(Category::Manifests, node_path)
            .await?
            .unwrap_or_default();
        let mut node_data = JobNodeData::decode(&raw)?;
        match node_data.status {
            ProcessingStatus::Processing => {}
            ProcessingStatus::Pending => {
                self.add_pending_job(manifest, &node_data, results).await;
                return Ok(());
            }
            ProcessingStatus::Completed => {
                self.add_completed_job(manifest, &node_data, results).await;
                return Ok(());
            }
            ProcessingStatus::Deleted => return Ok(()),
        }

        node_data.number_of_crashes += 1;
        node_data.errors_occurred = true;
        node_data.completed_date = None;
        let retrying = node_data.number_of_crashes <= self.config.max_retries;
        if retrying {
            node_data.status = ProcessingStatus::Pending;
            node_data.processing_stage = ProcessingStage::Pending;
        } else {
            node_data.status = ProcessingStatus::Completed;
            node_data.completed_date = Some(chrono::Utc::now());
            node_data.processing_stage = ProcessingStage::Completed;
        }
        node_data.upgrade(manifest, &self.config.host_name, node_data.processing_stage);

        warn!(
            manifest = %node_path,
            case = %manifest.case_name,
            crashes = node_data.number_of_crashes,
            retrying,
            "recovered crashed job"
        );

        // The operator-facing breadcrumbs are best-effort; the record write
        // below is what actually recovers the job.
        if let Some(case_directory) = self.case_directory(&manifest.case_name).await {
            if let Err(err) = create_alert_file(&case_directory) {
                error!(case = %manifest.case_name, %err, "failed to write alert file");
            }
            let logged = if retrying {
                self.job_logger
                    .log_crash_recovery_with_retry(
                        &manifest.file_path,
                        &manifest.data_source_file_name(),
                        &case_directory,
                    )
                    .await
            } else {
                self.job_logger
                    .log_crash_recovery_no_retry(
                        &manifest.file_path,
                        &manifest.data_source_file_name(),
                        &case_directory,
                    )
                    .await
            };
            if let Err(err) = logged {
                error!(case = %manifest.case_name, %err, "failed to write case log entry");
            }
        }

        let encoded = node_data.encode()?;
        self.coordination
            .set_node_data(Category::Manifests, node_path, encoded)
            .await?;

        if retrying {
            self.add_pending_job(manifest, &node_data, results).await;
        } else {
            self.add_completed_job(manifest, &node_data, results).await;
        }
        Ok(())
    }
}

fn collect_manifest_files(dir: &Path, parsers: &[Box<dyn ManifestParser>], out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(directory = %dir.display(), %err, "cannot read input directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_manifest_files(&path, parsers, out);
        } else if parsers.iter().any(|p| p.file_is_manifest(&path)) {
            out.push(path);
        }
    }
}
