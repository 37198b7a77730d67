//! The queue engine: one handle over the ledger, lease watchdogs, the
//! worker and the action gate.
//!
//! Every user action goes through the gate first. Admitted actions mutate
//! the store through the ledger, and every change ends in a notification
//! carrying freshly projected counters.

pub mod gate;
pub mod reconcile;
pub(crate) mod worker;

pub use gate::{Action, Rejection};
pub use reconcile::ReconcileReport;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Tuning;
use crate::connectivity::{AlwaysOnline, OfflineSignal};
use crate::error::{Error, Result};
use crate::event::{BatchReport, Notification, Notifier, QueueEvent, TracingNotifier};
use crate::ledger::Ledger;
use crate::model::{LeaseId, ScanMode, State, WorkId, WorkItem};
use crate::projection::Counts;
use crate::storage::Store;
use crate::telemetry::metrics;
use crate::transport::Transport;
use crate::watchdog::Watchdog;
use gate::{ActionGate, Call, Conditions};
use worker::RunGuard;

/// Whether the worker is currently draining the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
}

/// Result of a gated action.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Gated<T> {
    Accepted(T),
    Rejected(Rejection),
}

impl<T> Gated<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Gated::Accepted(_))
    }

    pub fn accepted(self) -> Option<T> {
        match self {
            Gated::Accepted(v) => Some(v),
            Gated::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Gated::Accepted(_) => None,
            Gated::Rejected(r) => Some(r),
        }
    }
}

/// Where a new scan ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Scanned {
    pub id: WorkId,
    pub state: State,
}

/// Collaborators of the queue besides the store.
pub struct QueueDeps {
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub offline: Arc<dyn OfflineSignal>,
}

impl QueueDeps {
    /// System clock, log notifications, always online.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
            offline: Arc::new(AlwaysOnline),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn offline(mut self, offline: Arc<dyn OfflineSignal>) -> Self {
        self.offline = offline;
        self
    }
}

pub(crate) struct Inner {
    ledger: Arc<Ledger>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    offline: Arc<dyn OfflineSignal>,
    /// Operator override on top of the connectivity signal.
    forced_offline: AtomicBool,
    tuning: Tuning,
    gate: Mutex<ActionGate>,
    watchdog: Watchdog,
    run_state: watch::Sender<RunState>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn is_offline(&self) -> bool {
        self.forced_offline.load(Ordering::SeqCst) || self.offline.is_offline()
    }

    fn run_state(&self) -> RunState {
        *self.run_state.borrow()
    }

    fn notify(&self, event: QueueEvent) {
        self.notifier.notify(Notification {
            timestamp: self.ledger.clock().now(),
            event,
            counts: self.ledger.counts(),
        });
    }

    /// Run `call` past the gate. Returns the admission time on success.
    fn admit(&self, call: Call<'_>) -> std::result::Result<DateTime<Utc>, Rejection> {
        let conditions = Conditions {
            counts: self.ledger.counts(),
            run_state: self.run_state(),
            offline: self.is_offline(),
        };
        let now = self.ledger.clock().now();
        let verdict = self
            .gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(call, &conditions, now);

        match verdict {
            Ok(()) => Ok(now),
            Err(rejection) => {
                info!(action = %call.action(), reason = rejection.reason(), "action rejected");
                metrics::gate_rejections().add(
                    1,
                    &[
                        KeyValue::new("action", call.action().to_string()),
                        KeyValue::new("reason", rejection.reason()),
                    ],
                );
                Err(rejection)
            }
        }
    }

    /// Close the windows of an admitted call whose mutation never landed.
    fn revoke(&self, call: Call<'_>, at: DateTime<Utc>) {
        self.gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .revoke(call, at);
    }

    /// Release expired leases from a previous run and guard the live ones.
    fn reconcile(self: &Arc<Self>) -> Result<ReconcileReport> {
        let now = self.ledger.clock().now();
        let timeout = self.watchdog.timeout();
        let max = self.tuning.max_retries;
        let (report, live) = self
            .ledger
            .update(|items| reconcile::release_expired(items, now, timeout, max))?;

        for (lease, left) in live {
            self.watchdog.arm_after(lease, left, self.expiry_handler());
        }
        if report.changed() {
            warn!(
                released = report.released,
                failed = report.failed,
                "released leases left over from a previous run"
            );
            metrics::leases_expired().add(
                (report.released + report.failed) as u64,
                &[KeyValue::new("source", "reconciler")],
            );
        }
        self.notify(QueueEvent::Reconciled {
            released: report.released,
            failed: report.failed,
        });
        Ok(report)
    }
}

/// Handle to a running queue. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Open the queue over `store`, reconciling whatever a previous process
    /// left in `Processing`. Must be called inside a tokio runtime.
    pub fn start(
        store: Box<dyn Store>,
        deps: QueueDeps,
        tuning: Tuning,
    ) -> Result<(Self, ReconcileReport)> {
        let ledger = Arc::new(Ledger::new(store, deps.clock)?);
        let (run_state, _) = watch::channel(RunState::Idle);

        let inner = Arc::new(Inner {
            ledger,
            transport: deps.transport,
            notifier: deps.notifier,
            offline: deps.offline,
            forced_offline: AtomicBool::new(false),
            gate: Mutex::new(ActionGate::new(&tuning)),
            watchdog: Watchdog::new(tuning.watchdog_timeout),
            tuning,
            run_state,
            retry_task: Mutex::new(None),
        });

        let report = inner.reconcile()?;
        info!(
            counts = %inner.ledger.counts(),
            rearmed = report.rearmed,
            "queue started"
        );
        Ok((Self { inner }, report))
    }

    /// Record a scan.
    ///
    /// The item is durable before anything else happens. Offline, it simply
    /// waits in the queue. Online with an idle worker it is submitted right
    /// away; if that does not succeed it stays queued for the next run.
    pub async fn scan(&self, code: &str) -> Result<Gated<Scanned>> {
        let code = code.trim();
        let admitted = match self.inner.admit(Call::Scan(code)) {
            Ok(at) => at,
            Err(rejection) => return Ok(Gated::Rejected(rejection)),
        };

        let offline = self.inner.is_offline();
        let mode = if offline { ScanMode::Offline } else { ScanMode::Online };
        let item = WorkItem::scanned(code, mode, self.inner.ledger.clock().now());
        let id = item.id;
        let stored = self.inner.ledger.update(|items| {
            items.push(item);
            Ok(())
        });
        if let Err(e) = stored {
            // Nothing was stored, so the code has not been seen.
            self.inner.revoke(Call::Scan(code), admitted);
            return Err(e);
        }
        metrics::scans().add(1, &[KeyValue::new("mode", mode.to_string())]);

        let queued = Gated::Accepted(Scanned {
            id,
            state: State::Queued,
        });
        let fast_path = if offline {
            None
        } else {
            RunGuard::claim(&self.inner)
        };
        let Some(guard) = fast_path else {
            self.inner.notify(QueueEvent::ScanQueued {
                id,
                code: code.to_string(),
            });
            return Ok(queued);
        };

        let resolution = self.inner.submit_one(id, 0).await;
        drop(guard);
        let state = self.get(id).map(|item| item.state).unwrap_or(State::Queued);
        resolution?;

        let event = match state {
            State::Done => QueueEvent::ScanDone {
                id,
                code: code.to_string(),
            },
            State::Failed => QueueEvent::BatchResult(BatchReport {
                failed: 1,
                ..BatchReport::default()
            }),
            _ => QueueEvent::ScanQueued {
                id,
                code: code.to_string(),
            },
        };
        self.inner.notify(event);
        Ok(Gated::Accepted(Scanned { id, state }))
    }

    /// Run one batch over the queue now and schedule retry rounds for what is left.
    ///
    /// Returns the report of the first batch; later rounds run in the background
    /// and report through the notifier. Use [`Queue::wait_idle`] to wait for them.
    pub async fn process_queue(&self) -> Result<Gated<BatchReport>> {
        if let Err(rejection) = self.inner.admit(Call::ProcessQueue) {
            return Ok(Gated::Rejected(rejection));
        }
        let Some(guard) = RunGuard::claim(&self.inner) else {
            return Ok(Gated::Rejected(Rejection::WorkerBusy));
        };

        let report = self.inner.run_batch(0).await?;

        if report.still_queued > 0 && self.inner.tuning.retry_rounds() > 0 {
            let inner = Arc::clone(&self.inner);
            let task = tokio::spawn(inner.retry_rounds(guard));
            let previous = self
                .inner
                .retry_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .replace(task);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        Ok(Gated::Accepted(report))
    }

    /// Remove every queued and processing item. Finished items stay.
    pub fn clear_queue(&self) -> Result<Gated<usize>> {
        let admitted = match self.inner.admit(Call::ClearQueue) {
            Ok(at) => at,
            Err(rejection) => return Ok(Gated::Rejected(rejection)),
        };

        let removed: Vec<WorkId> = self
            .inner
            .ledger
            .update(|items| {
                let (gone, keep): (Vec<WorkItem>, Vec<WorkItem>) =
                    std::mem::take(items).into_iter().partition(WorkItem::is_clearable);
                *items = keep;
                Ok(gone.into_iter().map(|i| i.id).collect())
            })
            .inspect_err(|_| self.inner.revoke(Call::ClearQueue, admitted))?;

        for id in &removed {
            self.inner.watchdog.disarm_item(*id);
        }
        info!(removed = removed.len(), "queue cleared");
        self.inner.notify(QueueEvent::Cleared {
            removed: removed.len(),
        });
        Ok(Gated::Accepted(removed.len()))
    }

    /// Force the device offline, or lift that override. Returns the effective state.
    ///
    /// Going offline does not interrupt an in-flight submission; the worker
    /// stops before the next item.
    pub fn set_offline(&self, offline: bool) -> Result<Gated<bool>> {
        if let Err(rejection) = self.inner.admit(Call::ToggleOffline) {
            return Ok(Gated::Rejected(rejection));
        }
        self.inner.forced_offline.store(offline, Ordering::SeqCst);
        let effective = self.inner.is_offline();
        info!(forced = offline, offline = effective, "offline mode changed");
        Ok(Gated::Accepted(effective))
    }

    pub fn is_offline(&self) -> bool {
        self.inner.is_offline()
    }

    pub fn counts(&self) -> Counts {
        self.inner.ledger.counts()
    }

    /// Recompute counters, e.g. after the day rolled over.
    pub fn refresh_counts(&self) -> Result<Counts> {
        self.inner.ledger.refresh()
    }

    /// Receive every counter change.
    pub fn subscribe(&self) -> watch::Receiver<Counts> {
        self.inner.ledger.subscribe()
    }

    pub fn get(&self, id: WorkId) -> Result<WorkItem> {
        self.inner
            .ledger
            .read(|items| items.iter().find(|i| i.id == id).cloned())?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Items in creation order, optionally filtered by state.
    pub fn list(&self, state: Option<State>) -> Result<Vec<WorkItem>> {
        let mut items = self.inner.ledger.read(|items| {
            items
                .iter()
                .filter(|i| state.is_none_or(|s| i.state == s))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    pub fn run_state(&self) -> RunState {
        self.inner.run_state()
    }

    /// Leases currently guarded by a watchdog.
    pub fn armed_leases(&self) -> Vec<(WorkId, LeaseId)> {
        self.inner.watchdog.armed()
    }

    pub fn tuning(&self) -> &Tuning {
        &self.inner.tuning
    }

    /// Wait until the worker, including any pending retry rounds, is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.run_state.subscribe();
        // The sender lives in `inner`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state == RunState::Idle).await;
    }

    /// Cancel pending retry rounds and every watchdog.
    ///
    /// Leases still held stay in `Processing` and are picked up by the
    /// reconciler on the next start.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .inner
            .retry_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.inner.watchdog.disarm_all();
        info!("queue shut down");
    }
}
