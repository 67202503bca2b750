//! Local and cluster-wide event fan-out.
//!
//! Remote events let peers update their running-jobs view without a full
//! rescan; local events drive dashboards and tests. Publishing is
//! fire-and-forget: it must never block a scan or the processing task.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::AutoIngestJob;

/// Events broadcast between auto ingest nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemoteEvent {
    JobStarted {
        job: AutoIngestJob,
    },
    JobStatus {
        job: AutoIngestJob,
    },
    JobCompleted {
        job: AutoIngestJob,
        /// True when the job is going back to the pending queue rather than
        /// finishing, e.g. after a cancellation that should be retried.
        should_retry: bool,
    },
    CasePrioritized {
        host_name: String,
        case_name: String,
    },
    CaseDeleted {
        host_name: String,
        case_name: String,
    },
}

impl RemoteEvent {
    /// Host that published the event; used to ignore loopback deliveries.
    pub fn origin_host(&self) -> &str {
        match self {
            RemoteEvent::JobStarted { job }
            | RemoteEvent::JobStatus { job }
            | RemoteEvent::JobCompleted { job, .. } => &job.host_name,
            RemoteEvent::CasePrioritized { host_name, .. }
            | RemoteEvent::CaseDeleted { host_name, .. } => host_name,
        }
    }
}

/// Notifications delivered to local observers of one monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    InputScanCompleted,
    JobStarted,
    JobStatusUpdated,
    JobCompleted,
    CasePrioritized,
    CaseDeleted,
    PausedByRequest,
    PausedForSystemError,
    Resumed,
}

/// The cluster event channel.
///
/// `publish_remotely` is non-blocking; delivery is best-effort and
/// unordered with respect to coordination-store writes. Correctness never
/// depends on an event arriving: periodic rescans converge regardless.
pub trait EventBus: Send + Sync {
    fn publish_remotely(&self, event: RemoteEvent);

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent>;
}

/// An event bus for nodes sharing one process: every publish is delivered
/// to every subscriber, including the publisher, which filters loopback
/// deliveries by origin host.
#[derive(Clone)]
pub struct LoopbackEventBus {
    sender: broadcast::Sender<RemoteEvent>,
}

impl LoopbackEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LoopbackEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for LoopbackEventBus {
    fn publish_remotely(&self, event: RemoteEvent) {
        // Err means no subscriber is listening, which is fine.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_bus_delivers_to_all_subscribers() {
        let bus = LoopbackEventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish_remotely(RemoteEvent::CasePrioritized {
            host_name: "node-1".to_string(),
            case_name: "CaseA".to_string(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                RemoteEvent::CasePrioritized {
                    host_name,
                    case_name,
                } => {
                    assert_eq!(host_name, "node-1");
                    assert_eq!(case_name, "CaseA");
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let bus = LoopbackEventBus::default();
        bus.publish_remotely(RemoteEvent::CaseDeleted {
            host_name: "node-1".to_string(),
            case_name: "CaseA".to_string(),
        });
    }
}
