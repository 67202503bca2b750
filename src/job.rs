//! In-memory representation of an auto ingest job.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::manifest::Manifest;
use crate::node_data::{JobNodeData, ProcessingStage};

/// One job as seen by one process: a snapshot of the durable record plus
/// transient runtime state that is never persisted.
///
/// Two jobs are equal iff they reference the same manifest file. That is
/// deliberately coarser than full state equality; display layers that need
/// to detect visible changes must compare stage/priority/snapshot fields
/// themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoIngestJob {
    pub manifest: Manifest,
    /// Resolved case output directory, if it exists yet.
    pub case_directory: Option<PathBuf>,
    pub priority: i32,
    /// Host currently (or last) associated with the job.
    pub host_name: String,
    stage: ProcessingStage,
    stage_start_date: DateTime<Utc>,
    pub completed_date: Option<DateTime<Utc>>,
    pub errors_occurred: bool,
    canceled: bool,
    completed: bool,
    /// Cooperative cancellation handle for the live processing task. Only
    /// meaningful for the job running on the local process.
    #[serde(skip, default)]
    cancel_token: CancellationToken,
}

impl AutoIngestJob {
    pub fn new(
        manifest: Manifest,
        case_directory: Option<PathBuf>,
        priority: i32,
        host_name: &str,
        stage: ProcessingStage,
        completed_date: Option<DateTime<Utc>>,
        errors_occurred: bool,
    ) -> Self {
        Self {
            manifest,
            case_directory,
            priority,
            host_name: host_name.to_string(),
            stage,
            stage_start_date: Utc::now(),
            completed_date,
            errors_occurred,
            canceled: false,
            completed: false,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Builds a job from a decoded coordination record, as the scanner does.
    pub fn from_node_data(
        manifest: Manifest,
        node_data: &JobNodeData,
        case_directory: Option<PathBuf>,
        host_name: &str,
        stage: ProcessingStage,
    ) -> Self {
        Self::new(
            manifest,
            case_directory,
            node_data.priority,
            host_name,
            stage,
            node_data.completed_date,
            node_data.errors_occurred,
        )
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest.file_path
    }

    pub fn stage(&self) -> ProcessingStage {
        self.stage
    }

    pub fn stage_start_date(&self) -> DateTime<Utc> {
        self.stage_start_date
    }

    /// Advances the display stage. Once a job is canceling, only the
    /// terminal transition to COMPLETED may overwrite that stage.
    pub fn set_stage(&mut self, new_stage: ProcessingStage) {
        if self.stage == ProcessingStage::Canceling && new_stage != ProcessingStage::Completed {
            return;
        }
        self.stage = new_stage;
        self.stage_start_date = Utc::now();
    }

    /// Requests cooperative cancellation of the running job. Does not
    /// release any coordination lock; that happens on the normal completion
    /// path so the final state write and the lock release stay together.
    pub fn cancel(&mut self) {
        self.set_stage(ProcessingStage::Canceling);
        self.canceled = true;
        self.errors_occurred = true;
        self.cancel_token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Returns the job to the PENDING stage when its record is requeued for
    /// another attempt. Unlike [`set_stage`], this applies even from a
    /// sticky CANCELING stage: a requeued record must not persist a stage
    /// that belongs to the abandoned attempt.
    ///
    /// [`set_stage`]: AutoIngestJob::set_stage
    pub fn set_requeued(&mut self) {
        self.stage = ProcessingStage::Pending;
        self.stage_start_date = Utc::now();
        self.completed_date = None;
    }

    /// Marks the job finished on this process and stamps the completion date.
    pub fn set_completed(&mut self) {
        self.set_stage(ProcessingStage::Completed);
        self.completed = true;
        self.completed_date = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Token observed by the processing task and any active data source
    /// processor; cancelled when the user cancels the job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl PartialEq for AutoIngestJob {
    fn eq(&self, other: &Self) -> bool {
        self.manifest.file_path == other.manifest.file_path
    }
}

impl Eq for AutoIngestJob {}

impl std::hash::Hash for AutoIngestJob {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.manifest.file_path.hash(state);
    }
}

/// Stable-sorts the pending queue by descending priority. Equal priorities
/// keep their insertion order, which keeps scans deterministic.
pub fn sort_pending_queue(jobs: &mut [AutoIngestJob]) {
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Ordering for the running-jobs view: the local host's jobs float to the
/// top, everything else sorts by case name, case-insensitively.
pub fn compare_for_running_list(a: &AutoIngestJob, b: &AutoIngestJob, local_host: &str) -> Ordering {
    let a_local = a.host_name.eq_ignore_ascii_case(local_host);
    let b_local = b.host_name.eq_ignore_ascii_case(local_host);
    match (a_local, b_local) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .manifest
            .case_name
            .to_lowercase()
            .cmp(&b.manifest.case_name.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(case: &str, manifest_file: &str, priority: i32, host: &str) -> AutoIngestJob {
        AutoIngestJob::new(
            Manifest {
                device_id: "dev".to_string(),
                case_name: case.to_string(),
                file_path: PathBuf::from(manifest_file),
                data_source_path: PathBuf::from("/data/img.dd"),
                date_created: Utc::now(),
            },
            None,
            priority,
            host,
            ProcessingStage::Pending,
            None,
            false,
        )
    }

    #[test]
    fn test_equality_is_by_manifest_path_only() {
        let a = job("CaseA", "/in/m1.json", 0, "host-1");
        let mut b = job("CaseB", "/in/m1.json", 99, "host-2");
        b.set_stage(ProcessingStage::AnalyzingFiles);
        assert_eq!(a, b);

        let c = job("CaseA", "/in/m2.json", 0, "host-1");
        assert_ne!(a, c);
    }

    #[test]
    fn test_pending_sort_is_stable_descending() {
        let mut jobs = vec![
            job("A", "/m1", 1, "h"),
            job("B", "/m2", 3, "h"),
            job("C", "/m3", 1, "h"),
            job("D", "/m4", 2, "h"),
        ];
        sort_pending_queue(&mut jobs);
        let order: Vec<&str> = jobs.iter().map(|j| j.manifest.case_name.as_str()).collect();
        // Priorities 3, 2, then the two 1s in insertion order.
        assert_eq!(order, vec!["B", "D", "A", "C"]);
    }

    #[test]
    fn test_running_list_floats_local_host_first() {
        let mut jobs = vec![
            job("Zeta", "/m1", 0, "other-host"),
            job("Alpha", "/m2", 0, "other-host"),
            job("Mid", "/m3", 0, "LOCAL-HOST"),
        ];
        jobs.sort_by(|a, b| compare_for_running_list(a, b, "local-host"));
        let order: Vec<&str> = jobs.iter().map(|j| j.manifest.case_name.as_str()).collect();
        assert_eq!(order, vec!["Mid", "Alpha", "Zeta"]);
    }

    #[test]
    fn test_canceling_stage_is_sticky() {
        let mut j = job("A", "/m1", 0, "h");
        j.cancel();
        assert_eq!(j.stage(), ProcessingStage::Canceling);
        assert!(j.is_canceled());
        assert!(j.errors_occurred);
        assert!(j.cancel_token().is_cancelled());

        j.set_stage(ProcessingStage::AnalyzingFiles);
        assert_eq!(j.stage(), ProcessingStage::Canceling);

        j.set_completed();
        assert_eq!(j.stage(), ProcessingStage::Completed);
        assert!(j.is_completed());
        assert!(j.completed_date.is_some());
    }

    #[test]
    fn test_requeue_overrides_canceling_stage() {
        let mut j = job("A", "/m1", 0, "h");
        j.cancel();
        assert_eq!(j.stage(), ProcessingStage::Canceling);

        j.set_requeued();
        assert_eq!(j.stage(), ProcessingStage::Pending);
        assert!(j.completed_date.is_none());
        // Cancellation itself is not forgotten; errors stay recorded.
        assert!(j.is_canceled());
        assert!(j.errors_occurred);
    }
}
