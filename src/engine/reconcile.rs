//! Startup reconciliation of leases left behind by a previous process.
//!
//! Timers do not survive a restart, so anything found in `Processing` at
//! startup is checked against the lease timeout. Expired leases are released
//! with a retry charge; younger ones get a watchdog for the time they have left.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::lease::{self, Lease, Resolution};
use crate::model::{LeaseId, State, WorkItem};

/// Reason recorded on items released at startup.
pub const LEASE_EXPIRED: &str = "lease_expired";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Expired leases put back in the queue.
    pub released: usize,
    /// Expired leases whose retry charge exhausted the budget.
    pub failed: usize,
    /// Live leases given a watchdog for their remaining time.
    pub rearmed: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.released + self.failed > 0
    }
}

/// Release every lease older than `timeout` as of `now`.
///
/// Returns the report and the live leases with their residual time. A
/// `Processing` item missing its lease fields is treated as expired.
pub fn release_expired(
    items: &mut [WorkItem],
    now: DateTime<Utc>,
    timeout: Duration,
    max_retries: u32,
) -> Result<(ReconcileReport, Vec<(Lease, Duration)>)> {
    let mut report = ReconcileReport::default();
    let mut live = Vec::new();

    let processing: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.state == State::Processing)
        .map(|(idx, _)| idx)
        .collect();

    for idx in processing {
        let lease = match Lease::of(&items[idx]) {
            Some(lease) => lease,
            None => {
                warn!(id = %items[idx].id, "processing item without lease, releasing");
                let item = &mut items[idx];
                let lease = Lease {
                    id: item.lease_id.unwrap_or_else(LeaseId::new),
                    item_id: item.id,
                    started_at: DateTime::<Utc>::UNIX_EPOCH,
                };
                item.lease_id = Some(lease.id);
                item.lease_started_at = Some(lease.started_at);
                lease
            }
        };

        match remaining(&lease, now, timeout) {
            Some(left) => live.push((lease, left)),
            None => match lease::abandon(items, &lease, LEASE_EXPIRED, max_retries)? {
                Resolution::Applied(State::Failed) => report.failed += 1,
                Resolution::Applied(_) => report.released += 1,
                Resolution::Stale => {}
            },
        }
    }

    report.rearmed = live.len();
    Ok((report, live))
}

/// Time left on `lease`, or `None` once it has run for `timeout` or longer.
/// A lease stamped in the future gets the full timeout.
fn remaining(lease: &Lease, now: DateTime<Utc>, timeout: Duration) -> Option<Duration> {
    let age = (now - lease.started_at).to_std().unwrap_or(Duration::ZERO);
    timeout.checked_sub(age).filter(|left| !left.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScanMode;

    const TIMEOUT: Duration = Duration::from_secs(20);

    fn leased(now: DateTime<Utc>, age_secs: i64, retry_count: u32) -> WorkItem {
        let mut item = WorkItem::scanned("AWB-1", ScanMode::Offline, now);
        item.state = State::Processing;
        item.lease_id = Some(LeaseId::new());
        item.lease_started_at = Some(now - chrono::Duration::seconds(age_secs));
        item.retry_count = retry_count;
        item
    }

    #[test]
    fn expired_lease_is_released_with_retry_charge() {
        let now = Utc::now();
        let mut items = vec![leased(now, 25, 0)];

        let (report, live) = release_expired(&mut items, now, TIMEOUT, 3).unwrap();

        assert_eq!(
            report,
            ReconcileReport {
                released: 1,
                failed: 0,
                rearmed: 0
            }
        );
        assert!(live.is_empty());
        assert_eq!(items[0].state, State::Queued);
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].last_error.as_deref(), Some(LEASE_EXPIRED));
        assert!(items[0].lease_consistent());
    }

    #[test]
    fn young_lease_keeps_its_residual_time() {
        let now = Utc::now();
        let mut items = vec![leased(now, 5, 0)];
        let before = items.clone();

        let (report, live) = release_expired(&mut items, now, TIMEOUT, 3).unwrap();

        assert_eq!(report.rearmed, 1);
        assert_eq!(live[0].1, Duration::from_secs(15));
        assert_eq!(items, before);
    }

    #[test]
    fn last_retry_fails_the_item() {
        let now = Utc::now();
        let mut items = vec![leased(now, 60, 2)];

        let (report, _) = release_expired(&mut items, now, TIMEOUT, 3).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(items[0].state, State::Failed);
    }

    #[test]
    fn orphaned_processing_item_is_released() {
        let now = Utc::now();
        let mut item = leased(now, 0, 0);
        item.lease_id = None;
        item.lease_started_at = None;
        let mut items = vec![item];

        let (report, _) = release_expired(&mut items, now, TIMEOUT, 3).unwrap();

        assert_eq!(report.released, 1);
        assert_eq!(items[0].state, State::Queued);
        assert!(items[0].lease_consistent());
    }

    #[test]
    fn other_states_are_left_alone() {
        let now = Utc::now();
        let mut items = vec![
            WorkItem::scanned("AWB-1", ScanMode::Offline, now),
            WorkItem::scanned("AWB-2", ScanMode::Online, now),
        ];
        let before = items.clone();

        let (report, _) = release_expired(&mut items, now, TIMEOUT, 3).unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(items, before);
    }
}
