//! The auto ingest monitor: one per host, owning that host's view of the
//! cluster's job queues and the seam the processing task drives.
//!
//! The monitor keeps three views. The pending and completed views are
//! rebuilt wholesale by each input scan from the coordination store. The
//! running view is maintained incrementally from remote events and aged out
//! by the stale-host sweep; it is advisory only and never written back to
//! the store.
//!
//! All background loops are exception firewalls: a failed scan or a bad
//! event is logged and the loop keeps going.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::coordination::{Category, CoordinationService, NodeLock};
use crate::error::{AutoIngestError, Result};
use crate::events::{EventBus, LocalEvent, RemoteEvent};
use crate::job::{compare_for_running_list, sort_pending_queue, AutoIngestJob};
use crate::manifest::ManifestParser;
use crate::node_data::{JobNodeData, ProcessingStage, ProcessingStatus};
use crate::scanner::InputScanner;

const LOCAL_EVENT_CAPACITY: usize = 256;
const SCAN_QUEUE_CAPACITY: usize = 8;

/// A point-in-time copy of the monitor's three job views.
#[derive(Debug, Clone, Default)]
pub struct JobsSnapshot {
    /// Sorted by descending priority.
    pub pending: Vec<AutoIngestJob>,
    /// This host's job first, then remote jobs by case name.
    pub running: Vec<AutoIngestJob>,
    pub completed: Vec<AutoIngestJob>,
}

/// The job this host is processing, together with the exclusive manifest
/// lock held for the duration of processing. Dropping the lock before the
/// final record write would let another host's scan treat the job as
/// crashed, so the two travel together.
struct CurrentJob {
    job: AutoIngestJob,
    lock: Option<NodeLock>,
}

struct RunningEntry {
    job: AutoIngestJob,
    last_seen: Instant,
}

#[derive(Default)]
struct MonitorState {
    pending: Vec<AutoIngestJob>,
    running: HashMap<PathBuf, RunningEntry>,
    completed: Vec<AutoIngestJob>,
    cases_to_manifests: HashMap<String, std::collections::HashSet<PathBuf>>,
    current: Option<CurrentJob>,
    paused: bool,
}

type ScanRequest = Option<oneshot::Sender<()>>;

struct MonitorInner {
    config: MonitorConfig,
    coordination: Arc<dyn CoordinationService>,
    event_bus: Arc<dyn EventBus>,
    scanner: InputScanner,
    state: Mutex<MonitorState>,
    local_events: broadcast::Sender<LocalEvent>,
    scan_tx: mpsc::Sender<ScanRequest>,
    cancel: CancellationToken,
}

pub struct AutoIngestMonitor {
    inner: Arc<MonitorInner>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AutoIngestMonitor {
    /// Starts a monitor and its background tasks: the scan scheduler, the
    /// remote event listener, and the periodic status broadcaster.
    pub fn start_up(
        config: MonitorConfig,
        coordination: Arc<dyn CoordinationService>,
        event_bus: Arc<dyn EventBus>,
        parsers: Vec<Box<dyn ManifestParser>>,
    ) -> Self {
        let scanner = InputScanner::new(Arc::clone(&coordination), parsers, config.clone());
        let (local_events, _) = broadcast::channel(LOCAL_EVENT_CAPACITY);
        let (scan_tx, scan_rx) = mpsc::channel(SCAN_QUEUE_CAPACITY);
        let inner = Arc::new(MonitorInner {
            config,
            coordination,
            event_bus,
            scanner,
            state: Mutex::new(MonitorState::default()),
            local_events,
            scan_tx,
            cancel: CancellationToken::new(),
        });

        info!(host = %inner.config.host_name, "auto ingest monitor starting");
        // Subscribe before spawning so events published as soon as start_up
        // returns are not lost to the broadcast channel.
        let remote_events = inner.event_bus.subscribe();
        let handles = vec![
            tokio::spawn(scan_loop(Arc::clone(&inner), scan_rx)),
            tokio::spawn(remote_event_loop(Arc::clone(&inner), remote_events)),
            tokio::spawn(status_loop(Arc::clone(&inner))),
        ];
        Self {
            inner,
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Stops the background tasks and waits for them to finish. The current
    /// job, if any, is cancelled cooperatively.
    pub async fn shut_down(&self) {
        info!(host = %self.inner.config.host_name, "auto ingest monitor shutting down");
        self.inner.cancel.cancel();
        {
            let mut state = self.inner.state.lock().await;
            if let Some(mut current) = state.current.take() {
                current.job.cancel();
                // Dropping the lock lets another host's scan recover the job.
                if let Some(lock) = current.lock.take() {
                    lock.release();
                }
            }
            state.pending.clear();
            state.running.clear();
            state.completed.clear();
            state.cases_to_manifests.clear();
        }
        let handles = {
            let mut guard = self.handles.lock().expect("task handle list poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            if let Err(err) = handle.await {
                error!(%err, "monitor task panicked");
            }
        }
    }

    /// Requests an input scan without waiting for it.
    pub fn scan_now(&self) {
        if self.inner.scan_tx.try_send(None).is_err() {
            // A scan is already queued; it will pick up the same state.
            debug!("scan request dropped, scans already queued");
        }
    }

    /// Requests an input scan and waits until it has been applied.
    pub async fn scan_and_wait(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .scan_tx
            .send(Some(tx))
            .await
            .map_err(|_| AutoIngestError::NotRunning)?;
        rx.await.map_err(|_| AutoIngestError::NotRunning)
    }

    /// Copies the current job views.
    pub async fn snapshot(&self) -> JobsSnapshot {
        let state = self.inner.state.lock().await;
        let mut running: Vec<AutoIngestJob> = state
            .running
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        if let Some(current) = &state.current {
            running.push(current.job.clone());
        }
        running.sort_by(|a, b| compare_for_running_list(a, b, &self.inner.config.host_name));
        JobsSnapshot {
            pending: state.pending.clone(),
            running,
            completed: state.completed.clone(),
        }
    }

    /// Subscribes to this monitor's local notifications.
    pub fn subscribe_local(&self) -> broadcast::Receiver<LocalEvent> {
        self.inner.local_events.subscribe()
    }

    /// Moves every pending job of a case ahead of everything else.
    pub async fn prioritize_case(&self, case_name: &str) -> Result<()> {
        let targets: Vec<PathBuf> = {
            let state = self.inner.state.lock().await;
            state
                .pending
                .iter()
                .filter(|job| job.manifest.case_name.eq_ignore_ascii_case(case_name))
                .map(|job| job.manifest.file_path.clone())
                .collect()
        };
        if targets.is_empty() {
            return Err(AutoIngestError::Internal(format!(
                "no pending jobs for case {case_name}"
            )));
        }
        self.prioritize(&targets, case_name).await
    }

    /// Moves one pending job ahead of everything else.
    pub async fn prioritize_job(&self, manifest_path: &Path) -> Result<()> {
        let case_name = {
            let state = self.inner.state.lock().await;
            state
                .pending
                .iter()
                .find(|job| job.manifest_path() == manifest_path)
                .map(|job| job.manifest.case_name.clone())
        };
        let Some(case_name) = case_name else {
            return Err(AutoIngestError::Internal(format!(
                "no pending job for manifest {}",
                manifest_path.display()
            )));
        };
        self.prioritize(&[manifest_path.to_path_buf()], &case_name)
            .await
    }

    /// Bumps the targets to one above the highest pending priority, writes
    /// the new priorities through to the store, and re-sorts the queue.
    async fn prioritize(&self, targets: &[PathBuf], case_name: &str) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let max_priority = state
            .pending
            .iter()
            .map(|job| job.priority)
            .max()
            .unwrap_or(0);
        let new_priority = max_priority + 1;

        for target in targets {
            let node_path = target.display().to_string();
            match write_priority(inner, &node_path, new_priority).await {
                Ok(true) => {
                    if let Some(job) = state
                        .pending
                        .iter_mut()
                        .find(|job| job.manifest_path() == target)
                    {
                        job.priority = new_priority;
                    }
                }
                Ok(false) => {
                    // Locked or no longer pending; the view is stale and the
                    // next scan will straighten it out.
                    warn!(manifest = %node_path, "could not prioritize, record busy or moved on");
                }
                Err(err) => return Err(err),
            }
        }
        sort_pending_queue(&mut state.pending);
        drop(state);

        info!(case = %case_name, priority = new_priority, "prioritized");
        inner.event_bus.publish_remotely(RemoteEvent::CasePrioritized {
            host_name: inner.config.host_name.clone(),
            case_name: case_name.to_string(),
        });
        let _ = inner.local_events.send(LocalEvent::CasePrioritized);
        Ok(())
    }

    /// Returns a completed job to the pending queue with a fresh record.
    pub async fn reprocess_job(&self, manifest_path: &Path) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let Some(index) = state
            .completed
            .iter()
            .position(|job| job.manifest_path() == manifest_path)
        else {
            return Err(AutoIngestError::Internal(format!(
                "no completed job for manifest {}",
                manifest_path.display()
            )));
        };
        let job = state.completed.remove(index);
        let node_path = manifest_path.display().to_string();

        let Some(lock) = inner
            .coordination
            .try_exclusive_lock(
                Category::Manifests,
                &node_path,
                inner.config.manifest_lock_timeout,
            )
            .await?
        else {
            state.completed.insert(index, job);
            return Err(AutoIngestError::Internal(format!(
                "manifest {node_path} is locked by another host"
            )));
        };
        let mut node_data = JobNodeData::new(
            &job.manifest,
            ProcessingStatus::Pending,
            0,
            0,
            None,
            false,
        );
        node_data.processing_host = inner.config.host_name.clone();
        let encoded = node_data.encode()?;
        let write = inner
            .coordination
            .set_node_data(Category::Manifests, &node_path, encoded)
            .await;
        lock.release();
        write?;
        drop(state);

        info!(manifest = %node_path, "job queued for reprocessing");
        self.scan_now();
        Ok(())
    }

    /// Pauses job intake at the operator's request. Scans keep running so
    /// the views stay fresh; only `claim_next_job` is gated.
    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.paused {
            state.paused = true;
            info!("paused by request");
            let _ = self.inner.local_events.send(LocalEvent::PausedByRequest);
        }
    }

    /// Resumes job intake.
    pub async fn resume(&self) {
        let mut state = self.inner.state.lock().await;
        if state.paused {
            state.paused = false;
            info!("resumed");
            let _ = self.inner.local_events.send(LocalEvent::Resumed);
        }
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.state.lock().await.paused
    }

    /// Claims the highest-priority pending job this host can lock, marks it
    /// PROCESSING in the store, and makes it the current job. `None` when
    /// paused, when the queue is empty, or when every candidate is locked
    /// elsewhere.
    pub async fn claim_next_job(&self) -> Result<Option<AutoIngestJob>> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.paused || state.current.is_some() {
            return Ok(None);
        }

        let mut index = 0;
        while index < state.pending.len() {
            let node_path = state.pending[index].manifest_path().display().to_string();
            let Some(lock) = inner
                .coordination
                .try_exclusive_lock(Category::Manifests, &node_path, std::time::Duration::ZERO)
                .await?
            else {
                // Another host got there first; leave it for their scan.
                index += 1;
                continue;
            };

            // Re-check under the lock; the record may have moved on since
            // the scan that queued it.
            let raw = inner
                .coordination
                .get_node_data(Category::Manifests, &node_path)
                .await?
                .unwrap_or_default();
            let node_data = JobNodeData::decode(&raw)?;
            if node_data.was_set() && node_data.status != ProcessingStatus::Pending {
                debug!(manifest = %node_path, status = %node_data.status, "job moved on, skipping");
                lock.release();
                state.pending.remove(index);
                continue;
            }

            let mut job = state.pending[index].clone();
            job.host_name = inner.config.host_name.clone();
            job.set_stage(ProcessingStage::Starting);
            // A failed write must leave the pending view intact, with the
            // lock released on drop, so the job stays claimable.
            write_job_record(inner, &job, ProcessingStatus::Processing, node_data).await?;
            state.pending.remove(index);
            info!(
                manifest = %node_path,
                case = %job.manifest.case_name,
                priority = job.priority,
                "claimed job"
            );

            state.current = Some(CurrentJob {
                job: job.clone(),
                lock: Some(lock),
            });
            drop(state);

            inner
                .event_bus
                .publish_remotely(RemoteEvent::JobStarted { job: job.clone() });
            let _ = inner.local_events.send(LocalEvent::JobStarted);
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Advances the current job's display stage.
    pub async fn set_current_job_stage(&self, stage: ProcessingStage) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let current = state.current.as_mut().ok_or(AutoIngestError::NoCurrentJob)?;
        current.job.set_stage(stage);
        let _ = self.inner.local_events.send(LocalEvent::JobStatusUpdated);
        Ok(())
    }

    /// Requests cooperative cancellation of the current job. The job keeps
    /// its lock until the processing task calls [`complete_current_job`];
    /// the store record is finalized there.
    ///
    /// [`complete_current_job`]: AutoIngestMonitor::complete_current_job
    pub async fn cancel_current_job(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let current = state.current.as_mut().ok_or(AutoIngestError::NoCurrentJob)?;
        current.job.cancel();
        info!(manifest = %current.job.manifest_path().display(), "job cancellation requested");
        let _ = self.inner.local_events.send(LocalEvent::JobStatusUpdated);
        Ok(())
    }

    /// Finalizes the current job: writes the terminal record, releases the
    /// manifest lock, and broadcasts the completion. With `should_retry`
    /// the record goes back to PENDING instead, so some host (possibly this
    /// one) will pick the job up again.
    pub async fn complete_current_job(
        &self,
        errors_occurred: bool,
        should_retry: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let mut current = state.current.take().ok_or(AutoIngestError::NoCurrentJob)?;

        current.job.errors_occurred |= errors_occurred;
        let node_path = current.job.manifest_path().display().to_string();
        let raw = inner
            .coordination
            .get_node_data(Category::Manifests, &node_path)
            .await?
            .unwrap_or_default();
        let node_data = JobNodeData::decode(&raw)?;

        let status = if should_retry {
            current.job.set_requeued();
            ProcessingStatus::Pending
        } else {
            current.job.set_completed();
            ProcessingStatus::Completed
        };
        let write = write_job_record(inner, &current.job, status, node_data).await;
        if let Some(lock) = current.lock.take() {
            lock.release();
        }
        write?;

        if !should_retry {
            state.completed.push(current.job.clone());
        }
        drop(state);

        info!(
            manifest = %node_path,
            errors = current.job.errors_occurred,
            should_retry,
            "job finished"
        );
        inner.event_bus.publish_remotely(RemoteEvent::JobCompleted {
            job: current.job,
            should_retry,
        });
        let _ = inner.local_events.send(LocalEvent::JobCompleted);
        self.scan_now();
        Ok(())
    }
}

/// Read-modify-write of one record's priority under its exclusive lock.
/// `Ok(false)` means the record could not be updated (locked elsewhere, or
/// no longer pending).
async fn write_priority(
    inner: &MonitorInner,
    node_path: &str,
    priority: i32,
) -> Result<bool> {
    let Some(lock) = inner
        .coordination
        .try_exclusive_lock(
            Category::Manifests,
            node_path,
            inner.config.manifest_lock_timeout,
        )
        .await?
    else {
        return Ok(false);
    };
    let result = async {
        let raw = inner
            .coordination
            .get_node_data(Category::Manifests, node_path)
            .await?
            .unwrap_or_default();
        let mut node_data = JobNodeData::decode(&raw)?;
        if !node_data.was_set() || node_data.status != ProcessingStatus::Pending {
            return Ok(false);
        }
        node_data.priority = priority;
        let encoded = node_data.encode()?;
        inner
            .coordination
            .set_node_data(Category::Manifests, node_path, encoded)
            .await?;
        Ok(true)
    }
    .await;
    lock.release();
    result
}

/// Writes a job's record with the given status, carrying the priority and
/// crash count forward from the previous record. Caller holds the lock.
async fn write_job_record(
    inner: &MonitorInner,
    job: &AutoIngestJob,
    status: ProcessingStatus,
    previous: JobNodeData,
) -> Result<()> {
    let mut node_data = JobNodeData::new(
        &job.manifest,
        status,
        job.priority,
        previous.number_of_crashes,
        job.completed_date,
        job.errors_occurred,
    );
    node_data.processing_stage = job.stage();
    node_data.processing_stage_start_date = Some(job.stage_start_date());
    node_data.processing_host = job.host_name.clone();
    if let Some(case_directory) = &job.case_directory {
        node_data.case_directory_path = case_directory.display().to_string();
    }
    let encoded = node_data.encode()?;
    let node_path = job.manifest_path().display().to_string();
    inner
        .coordination
        .set_node_data(Category::Manifests, &node_path, encoded)
        .await?;
    Ok(())
}

/// Runs scans one at a time: periodic ticks and explicit requests share one
/// queue so scans never overlap.
async fn scan_loop(inner: Arc<MonitorInner>, mut scan_rx: mpsc::Receiver<ScanRequest>) {
    let mut ticker = tokio::time::interval(inner.config.scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let request: ScanRequest = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => None,
            request = scan_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        run_scan(&inner).await;
        if let Some(done) = request {
            let _ = done.send(());
        }
    }
    debug!("scan loop stopped");
}

async fn run_scan(inner: &Arc<MonitorInner>) {
    match inner.scanner.scan(&inner.cancel).await {
        Ok(Some(results)) => {
            let mut state = inner.state.lock().await;
            state.pending = results.pending;
            state.completed = results.completed;
            state.cases_to_manifests = results.cases_to_manifests;
            // The current job's manifest is locked and PROCESSING, so the
            // scan never returns it as pending; nothing to reconcile here.
            drop(state);
            let _ = inner.local_events.send(LocalEvent::InputScanCompleted);
        }
        Ok(None) => {}
        Err(err) => {
            error!(%err, "input scan failed, pausing until the operator intervenes");
            let mut state = inner.state.lock().await;
            if !state.paused {
                state.paused = true;
                let _ = inner
                    .local_events
                    .send(LocalEvent::PausedForSystemError);
            }
        }
    }
}

/// Applies peers' events to the running-jobs view. Everything here is
/// advisory; a missed or reordered event is corrected by the next scan.
async fn remote_event_loop(
    inner: Arc<MonitorInner>,
    mut events: broadcast::Receiver<RemoteEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event listener lagged, next scan will reconcile");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if event
            .origin_host()
            .eq_ignore_ascii_case(&inner.config.host_name)
        {
            continue;
        }
        handle_remote_event(&inner, event).await;
    }
    debug!("remote event loop stopped");
}

async fn handle_remote_event(inner: &Arc<MonitorInner>, event: RemoteEvent) {
    match event {
        RemoteEvent::JobStarted { job } => {
            let mut state = inner.state.lock().await;
            state.pending.retain(|pending| pending != &job);
            state.running.insert(
                job.manifest_path().to_path_buf(),
                RunningEntry {
                    job,
                    last_seen: Instant::now(),
                },
            );
            drop(state);
            let _ = inner.local_events.send(LocalEvent::JobStarted);
        }
        RemoteEvent::JobStatus { job } => {
            let mut state = inner.state.lock().await;
            state.running.insert(
                job.manifest_path().to_path_buf(),
                RunningEntry {
                    job,
                    last_seen: Instant::now(),
                },
            );
            drop(state);
            let _ = inner.local_events.send(LocalEvent::JobStatusUpdated);
        }
        RemoteEvent::JobCompleted { job, should_retry } => {
            let mut state = inner.state.lock().await;
            state.running.remove(job.manifest_path());
            if !should_retry {
                state.completed.push(job);
            }
            drop(state);
            let _ = inner.local_events.send(LocalEvent::JobCompleted);
        }
        RemoteEvent::CasePrioritized { case_name, .. } => {
            debug!(case = %case_name, "case prioritized remotely, rescanning");
            let _ = inner.scan_tx.try_send(None);
            let _ = inner.local_events.send(LocalEvent::CasePrioritized);
        }
        RemoteEvent::CaseDeleted { case_name, .. } => {
            debug!(case = %case_name, "case deleted remotely, rescanning");
            let _ = inner.scan_tx.try_send(None);
            let _ = inner.local_events.send(LocalEvent::CaseDeleted);
        }
    }
}

/// Broadcasts the current job's status on a fixed cadence and ages out
/// remote jobs whose hosts have gone silent.
async fn status_loop(inner: Arc<MonitorInner>) {
    let mut ticker = tokio::time::interval(inner.config.job_status_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh monitor does not
    // sweep before anyone has had a chance to report.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = inner.config.stale_host_cutoff();
        let mut state = inner.state.lock().await;
        let current = state.current.as_ref().map(|current| current.job.clone());

        let mut dropped = 0usize;
        state.running.retain(|manifest_path, entry| {
            if entry.last_seen.elapsed() > cutoff {
                warn!(
                    manifest = %manifest_path.display(),
                    host = %entry.job.host_name,
                    "host went silent, dropping its job from the running view"
                );
                dropped += 1;
                false
            } else {
                true
            }
        });
        drop(state);

        if let Some(job) = current {
            inner
                .event_bus
                .publish_remotely(RemoteEvent::JobStatus { job });
            let _ = inner.local_events.send(LocalEvent::JobStatusUpdated);
        }
        for _ in 0..dropped {
            // The record in the store is untouched; if the host really
            // crashed, a scan's recovery path will requeue the job.
            let _ = inner.local_events.send(LocalEvent::JobCompleted);
        }
    }
    debug!("status loop stopped");
}
