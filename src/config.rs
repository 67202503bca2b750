use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one auto ingest monitor process.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Name this host publishes in job records and events.
    pub host_name: String,

    /// Directory walked for new manifest files during a scan. When unset,
    /// the scan only visits manifests already registered in the
    /// coordination store (some other process is doing the discovery).
    pub input_root: Option<PathBuf>,

    /// Root under which case output directories are created.
    pub output_root: PathBuf,

    /// Interval between automatic input scans.
    pub scan_interval: Duration,

    /// Interval between status broadcasts for the running job, and between
    /// stale-host sweeps of the running-jobs view.
    pub job_status_interval: Duration,

    /// Number of consecutive missed status broadcasts after which a remote
    /// host's job is presumed dead and dropped from the running-jobs view.
    pub max_missed_status_updates: u32,

    /// Times a crashed job is returned to the pending queue before it is
    /// marked completed with errors.
    pub max_retries: i32,

    /// How long to wait for a manifest node's exclusive lock. Zero means a
    /// single attempt: scans never queue behind another host.
    pub manifest_lock_timeout: Duration,

    /// How long to wait for the case log lock before giving up on an entry.
    pub log_lock_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            input_root: None,
            output_root: PathBuf::from("."),
            scan_interval: Duration::from_secs(60),
            job_status_interval: Duration::from_secs(10),
            max_missed_status_updates: 10,
            max_retries: 2,
            manifest_lock_timeout: Duration::ZERO,
            log_lock_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl MonitorConfig {
    pub fn new(host_name: &str, output_root: PathBuf) -> Self {
        Self {
            host_name: host_name.to_string(),
            output_root,
            ..Default::default()
        }
    }

    pub fn with_input_root(mut self, input_root: PathBuf) -> Self {
        self.input_root = Some(input_root);
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_job_status_interval(mut self, interval: Duration) -> Self {
        self.job_status_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Cutoff after which a silent remote host's job is dropped from the
    /// running-jobs view.
    pub fn stale_host_cutoff(&self) -> Duration {
        self.job_status_interval * self.max_missed_status_updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_config_default() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.host_name, "localhost");
        assert!(cfg.input_root.is_none());
        assert_eq!(cfg.scan_interval, Duration::from_secs(60));
        assert_eq!(cfg.job_status_interval, Duration::from_secs(10));
        assert_eq!(cfg.max_missed_status_updates, 10);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.manifest_lock_timeout, Duration::ZERO);
        assert_eq!(cfg.log_lock_timeout, Duration::from_secs(900));
    }

    #[test]
    fn monitor_config_new() {
        let cfg = MonitorConfig::new("node-7", PathBuf::from("/cases"));
        assert_eq!(cfg.host_name, "node-7");
        assert_eq!(cfg.output_root, PathBuf::from("/cases"));
        assert_eq!(cfg.max_retries, 2);
    }

    #[test]
    fn monitor_config_builders() {
        let cfg = MonitorConfig::default()
            .with_input_root(PathBuf::from("/in"))
            .with_scan_interval(Duration::from_secs(5))
            .with_job_status_interval(Duration::from_millis(100))
            .with_max_retries(0);
        assert_eq!(cfg.input_root.as_deref(), Some(std::path::Path::new("/in")));
        assert_eq!(cfg.scan_interval, Duration::from_secs(5));
        assert_eq!(cfg.job_status_interval, Duration::from_millis(100));
        assert_eq!(cfg.max_retries, 0);
    }

    #[test]
    fn stale_host_cutoff_scales_with_interval() {
        let cfg = MonitorConfig::default()
            .with_job_status_interval(Duration::from_secs(2));
        assert_eq!(cfg.stale_host_cutoff(), Duration::from_secs(20));
    }
}
