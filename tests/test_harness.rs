//! Test harness for multi-monitor auto ingest integration tests.
//!
//! Several monitors in one process share a coordination store and an event
//! bus, which behaves like a fleet of hosts sharing one coordination
//! service and one network.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use autoingest::config::MonitorConfig;
use autoingest::coordination::{
    Category, CoordinationService, InMemoryCoordinationService,
};
use autoingest::events::LoopbackEventBus;
use autoingest::manifest::{JsonManifestParser, Manifest, ManifestParser};
use autoingest::monitor::AutoIngestMonitor;
use autoingest::node_data::JobNodeData;

/// Monitor configuration with short intervals for fast tests. The scan
/// interval stays long so tests drive scans explicitly.
pub fn test_config(host_name: &str, input_root: &Path, output_root: &Path) -> MonitorConfig {
    let mut config = MonitorConfig::new(host_name, output_root.to_path_buf())
        .with_input_root(input_root.to_path_buf())
        .with_scan_interval(Duration::from_secs(60))
        .with_job_status_interval(Duration::from_millis(50));
    config.max_missed_status_updates = 4;
    config.log_lock_timeout = Duration::from_secs(2);
    config
}

/// A cluster of monitors sharing one store, one event bus, and one pair of
/// input/output directories.
pub struct TestCluster {
    pub coordination: Arc<InMemoryCoordinationService>,
    pub event_bus: Arc<LoopbackEventBus>,
    pub monitors: Vec<AutoIngestMonitor>,
    pub input_root: TempDir,
    pub output_root: TempDir,
}

impl TestCluster {
    /// Starts `num_monitors` monitors named `node-1`, `node-2`, ...
    pub fn new(num_monitors: usize) -> Self {
        let coordination = Arc::new(InMemoryCoordinationService::new());
        let event_bus = Arc::new(LoopbackEventBus::default());
        let input_root = tempfile::tempdir().expect("create input dir");
        let output_root = tempfile::tempdir().expect("create output dir");

        let monitors = (1..=num_monitors)
            .map(|i| {
                let config = test_config(
                    &format!("node-{i}"),
                    input_root.path(),
                    output_root.path(),
                );
                let parsers: Vec<Box<dyn ManifestParser>> = vec![Box::new(JsonManifestParser)];
                AutoIngestMonitor::start_up(
                    config,
                    coordination.clone() as Arc<dyn CoordinationService>,
                    event_bus.clone(),
                    parsers,
                )
            })
            .collect();

        Self {
            coordination,
            event_bus,
            monitors,
            input_root,
            output_root,
        }
    }

    /// Writes a manifest file into the shared input directory and returns
    /// its path.
    pub fn write_manifest(&self, case_name: &str, data_source: &str) -> PathBuf {
        let path = self
            .input_root
            .path()
            .join(format!("{data_source}_manifest.json"));
        let body = serde_json::json!({
            "device_id": format!("device-{data_source}"),
            "case_name": case_name,
            "data_source_path": self.input_root.path().join(data_source),
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&body).expect("encode manifest"))
            .expect("write manifest");
        path
    }

    /// Parses a previously written manifest, as production code would.
    pub fn parse_manifest(&self, path: &Path) -> Manifest {
        JsonManifestParser.parse(path).expect("parse manifest")
    }

    /// Creates a timestamped case output directory and returns its path.
    pub fn create_case_directory(&self, case_name: &str) -> PathBuf {
        let dir = self
            .output_root
            .path()
            .join(format!("{case_name}_2024_01_01_01_01_01"));
        std::fs::create_dir(&dir).expect("create case dir");
        dir
    }

    /// Writes a job record directly into the store, bypassing the scanner.
    pub async fn write_record(&self, manifest_path: &Path, record: &JobNodeData) {
        let encoded = record.encode().expect("encode record");
        self.coordination
            .set_node_data(
                Category::Manifests,
                &manifest_path.display().to_string(),
                encoded,
            )
            .await
            .expect("write record");
    }

    /// Reads and decodes a job record from the store.
    pub async fn read_record(&self, manifest_path: &Path) -> JobNodeData {
        let raw = self
            .coordination
            .get_node_data(Category::Manifests, &manifest_path.display().to_string())
            .await
            .expect("read record")
            .unwrap_or_default();
        JobNodeData::decode(&raw).expect("decode record")
    }

    pub async fn shut_down(self) {
        for monitor in &self.monitors {
            monitor.shut_down().await;
        }
    }
}

/// Wait for a condition to become true, polling at intervals
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
