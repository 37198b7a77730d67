//! Worker: drains the queue in FIFO batches and schedules retry rounds.
//!
//! Only the holder of the [`RunGuard`] leases items. The guard is claimed
//! by `process_queue` (or the online fast path of `scan`), moves into the
//! retry task when another round is due, and flips the run state back to
//! idle when dropped, including when that task is aborted.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use super::{Inner, RunState};
use crate::error::Result;
use crate::event::{BatchReport, QueueEvent};
use crate::lease::{self, Lease, Resolution};
use crate::model::{State, WorkId, WorkItem};
use crate::telemetry::lease::{record_resolution, start_lease_span};
use crate::telemetry::metrics;
use crate::transport::{Submission, TransientKind};

/// Exclusive right to run the worker.
pub(crate) struct RunGuard {
    inner: Arc<Inner>,
}

impl RunGuard {
    /// Flip Idle to Running. `None` if the worker is already running.
    pub(crate) fn claim(inner: &Arc<Inner>) -> Option<Self> {
        let claimed = inner.run_state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        claimed.then(|| RunGuard {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.run_state.send_replace(RunState::Idle);
        debug!("worker idle");
    }
}

/// Queued items in submission order.
pub(crate) fn fifo(items: &[WorkItem]) -> Vec<WorkId> {
    let mut queued: Vec<&WorkItem> = items.iter().filter(|i| i.state == State::Queued).collect();
    queued.sort_by_key(|i| i.created_at);
    queued.into_iter().map(|i| i.id).collect()
}

impl Inner {
    /// One pass over everything queued right now.
    ///
    /// Stops early if the device goes offline; whatever was not reached stays queued.
    pub(crate) async fn run_batch(self: &Arc<Self>, round: u32) -> Result<BatchReport> {
        let pending = self.ledger.read(fifo)?;
        let mut report = BatchReport {
            round,
            ..BatchReport::default()
        };
        info!(round, pending = pending.len(), "batch started");

        for id in pending {
            if self.is_offline() {
                info!(round, "device went offline, batch stopped");
                break;
            }
            match self.submit_one(id, round).await? {
                Some(Resolution::Applied(State::Done)) => report.succeeded += 1,
                Some(Resolution::Applied(State::Failed)) => report.failed += 1,
                Some(Resolution::Applied(_)) => report.requeued += 1,
                Some(Resolution::Stale) => report.superseded += 1,
                // Cleared or re-leased since the snapshot.
                None => {}
            }
        }

        report.still_queued = self.ledger.counts().queued;
        self.notify(QueueEvent::BatchResult(report));
        Ok(report)
    }

    /// Lease, submit and resolve one item. `None` if it was no longer queued.
    pub(crate) async fn submit_one(
        self: &Arc<Self>,
        id: WorkId,
        round: u32,
    ) -> Result<Option<Resolution>> {
        let now = self.ledger.clock().now();
        let Some((lease, item)) = self.ledger.update(|items| lease::acquire(items, id, now))?
        else {
            return Ok(None);
        };
        metrics::state_transitions().add(
            1,
            &[KeyValue::new("from", "queued"), KeyValue::new("to", "processing")],
        );
        self.watchdog.arm(lease, self.expiry_handler());

        let span = start_lease_span(&lease, &item.code, round);
        let started = Instant::now();
        let submission = match tokio::time::timeout(
            self.tuning.submit_timeout,
            self.transport.submit(&item),
        )
        .instrument(span.clone())
        .await
        {
            Ok(submission) => submission,
            Err(_) => Submission::Transient {
                kind: TransientKind::Timeout,
            },
        };
        let outcome = [KeyValue::new("outcome", submission.label())];
        metrics::submissions().add(1, &outcome);
        metrics::submit_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &outcome);

        let reason = submission.classification();
        let finished_at = self.ledger.clock().now();
        let resolution = self.ledger.update(|items| match &submission {
            Submission::Success => lease::commit(items, &lease, finished_at),
            Submission::Permanent { .. } => lease::reject(items, &lease, &reason),
            Submission::Transient { .. } => {
                lease::abandon(items, &lease, &reason, self.tuning.max_retries)
            }
        })?;
        // Only after the resolution is durable; if the write failed the
        // watchdog is still there to take the lease back.
        self.watchdog.disarm(lease.id);

        match resolution {
            Resolution::Applied(to) => {
                record_resolution(&span, "processing", &to.to_string());
                metrics::state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", "processing"),
                        KeyValue::new("to", to.to_string()),
                    ],
                );
                if to != State::Done {
                    warn!(parent: &span, id = %id, error = %reason, state = %to, "submission failed");
                }
            }
            Resolution::Stale => {
                warn!(parent: &span, id = %id, "lease superseded before resolution, result dropped");
            }
        }
        Ok(Some(resolution))
    }

    /// Callback handed to the watchdog for a lease this worker holds.
    pub(crate) fn expiry_handler(self: &Arc<Self>) -> impl FnOnce(Lease) + Send + 'static {
        let inner = Arc::downgrade(self);
        move |lease| {
            if let Some(inner) = inner.upgrade() {
                inner.expire(&lease);
            }
        }
    }

    /// Take an overdue lease back. Fenced by the lease id.
    pub(crate) fn expire(&self, lease: &Lease) {
        let max = self.tuning.max_retries;
        let result = self.ledger.update(|items| {
            let resolution = lease::abandon(items, lease, super::reconcile::LEASE_EXPIRED, max)?;
            let retry_count = items
                .iter()
                .find(|i| i.id == lease.item_id)
                .map_or(0, |i| i.retry_count);
            Ok((resolution, retry_count))
        });

        match result {
            Ok((Resolution::Applied(to), retry_count)) => {
                warn!(id = %lease.item_id, lease = %lease.id, state = %to, "lease expired");
                metrics::leases_expired().add(1, &[KeyValue::new("source", "watchdog")]);
                self.notify(QueueEvent::LeaseExpired {
                    id: lease.item_id,
                    retry_count,
                });
            }
            Ok((Resolution::Stale, _)) => {
                debug!(id = %lease.item_id, lease = %lease.id, "expired lease already resolved");
            }
            Err(e) => {
                error!(id = %lease.item_id, error = %e, "failed to release expired lease");
            }
        }
    }

    /// Further rounds with backoff while anything is still queued.
    ///
    /// Owns the run guard; the worker goes idle when this returns or is aborted.
    pub(crate) async fn retry_rounds(self: Arc<Self>, guard: RunGuard) {
        for round in 1..=self.tuning.retry_rounds() {
            let delay = self.tuning.backoff_for(round);
            info!(round, delay_ms = delay.as_millis() as u64, "retry round scheduled");
            tokio::time::sleep(delay).await;

            if self.is_offline() {
                info!(round, "offline, retries stopped");
                break;
            }
            match self.run_batch(round).await {
                Ok(report) if report.still_queued > 0 => continue,
                Ok(_) => break,
                Err(e) => {
                    error!(round, error = %e, "retry round failed");
                    break;
                }
            }
        }
        drop(guard);
    }
}
