//! Notifications emitted by the queue after state changes.
//!
//! The queue owns only the facts: what happened and the freshly projected
//! counters. How a notification is presented (toast, banner, log line) is
//! the [`Notifier`]'s business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use crate::model::WorkId;
use crate::projection::Counts;

/// A notification delivered to the [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub event: QueueEvent,
    /// Counters projected right after the change.
    pub counts: Counts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A scan was stored for later submission.
    ScanQueued { id: WorkId, code: String },
    /// An online scan went straight through to the endpoint.
    ScanDone { id: WorkId, code: String },
    /// One worker pass over the queue finished.
    BatchResult(BatchReport),
    /// Startup repair released leases left behind by a previous run.
    Reconciled { released: usize, failed: usize },
    /// A watchdog took an item back from a lease that ran too long.
    LeaseExpired { id: WorkId, retry_count: u32 },
    /// Unfinished items were removed by the operator.
    Cleared { removed: usize },
}

/// Aggregate outcome of one batch. Counts only; wording belongs to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Retry round this batch ran in; 0 for the first pass.
    pub round: u32,
    pub succeeded: usize,
    /// Permanently rejected, plus transient failures that ran out of retries.
    pub failed: usize,
    /// Put back for another round after a transient failure.
    pub requeued: usize,
    /// Resolutions dropped because a watchdog had already taken the item back.
    pub superseded: usize,
    /// Items still queued when the batch ended.
    pub still_queued: usize,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.requeued + self.superseded
    }
}

/// Receives queue notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes each notification to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        let c = n.counts;
        match &n.event {
            QueueEvent::ScanQueued { id, code } => {
                info!(%id, code = %code, queued = c.queued, "scan queued");
            }
            QueueEvent::ScanDone { id, code } => {
                info!(%id, code = %code, done_today = c.done_today, "scan submitted");
            }
            QueueEvent::BatchResult(r) => {
                info!(
                    round = r.round,
                    succeeded = r.succeeded,
                    failed = r.failed,
                    requeued = r.requeued,
                    still_queued = r.still_queued,
                    "batch finished"
                );
            }
            QueueEvent::Reconciled { released, failed } => {
                info!(released, failed, queued = c.queued, "stale leases reconciled");
            }
            QueueEvent::LeaseExpired { id, retry_count } => {
                info!(%id, retry_count, "lease expired");
            }
            QueueEvent::Cleared { removed } => {
                info!(removed, "queue cleared");
            }
        }
    }
}

/// Forwards notifications into an unbounded channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(notification);
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.seen
            .lock()
            .map(|seen| seen.iter().map(|n| n.event.clone()).collect())
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(notification);
        }
    }
}
