//! Per-lease watchdog timers.
//!
//! Each armed lease owns one tokio task that sleeps for the lease timeout and
//! then hands the lease to an expiry callback. Timers are keyed by lease id;
//! whoever resolves a lease by another path must [`Watchdog::disarm`] it.
//! A timer that loses the race with a disarm finds its entry gone and does
//! nothing; the callback itself is fenced by the lease id as well.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lease::Lease;
use crate::model::{LeaseId, WorkId};

struct Armed {
    item_id: WorkId,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<LeaseId, Armed>>>;

pub struct Watchdog {
    timeout: Duration,
    armed: Registry,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            armed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm a full-length timer for a freshly acquired lease.
    pub fn arm<F>(&self, lease: Lease, on_expire: F)
    where
        F: FnOnce(Lease) + Send + 'static,
    {
        self.arm_after(lease, self.timeout, on_expire);
    }

    /// Arm a timer that fires after `after`. Must be called inside a tokio runtime.
    ///
    /// Any other lease still armed for the same item is disarmed first, so at
    /// most one armed lease references an item at a time.
    pub fn arm_after<F>(&self, lease: Lease, after: Duration, on_expire: F)
    where
        F: FnOnce(Lease) + Send + 'static,
    {
        let mut armed = lock(&self.armed);

        let superseded: Vec<LeaseId> = armed
            .iter()
            .filter(|(_, a)| a.item_id == lease.item_id)
            .map(|(id, _)| *id)
            .collect();
        for id in superseded {
            if let Some(old) = armed.remove(&id) {
                warn!(id = %lease.item_id, lease = %id, "disarming superseded watchdog");
                old.handle.abort();
            }
        }

        // The registry lock is held until the entry is inserted, so even a
        // zero-length timer finds itself registered when it wakes.
        let registry = Arc::clone(&self.armed);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let still_armed = lock(&registry).remove(&lease.id).is_some();
            if still_armed {
                debug!(id = %lease.item_id, lease = %lease.id, "watchdog fired");
                on_expire(lease);
            }
        });

        armed.insert(
            lease.id,
            Armed {
                item_id: lease.item_id,
                handle,
            },
        );
    }

    /// Cancel the timer for a lease. Returns whether one was armed.
    pub fn disarm(&self, lease_id: LeaseId) -> bool {
        match lock(&self.armed).remove(&lease_id) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer guarding `item_id`.
    pub fn disarm_item(&self, item_id: WorkId) -> usize {
        let mut armed = lock(&self.armed);
        let ids: Vec<LeaseId> = armed
            .iter()
            .filter(|(_, a)| a.item_id == item_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(a) = armed.remove(id) {
                a.handle.abort();
            }
        }
        ids.len()
    }

    pub fn disarm_all(&self) {
        for (_, armed) in lock(&self.armed).drain() {
            armed.handle.abort();
        }
    }

    pub fn is_armed(&self, lease_id: LeaseId) -> bool {
        lock(&self.armed).contains_key(&lease_id)
    }

    /// Snapshot of armed `(item, lease)` pairs.
    pub fn armed(&self) -> Vec<(WorkId, LeaseId)> {
        lock(&self.armed)
            .iter()
            .map(|(lease, a)| (a.item_id, *lease))
            .collect()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.disarm_all();
    }
}

fn lock(registry: &Mutex<HashMap<LeaseId, Armed>>) -> MutexGuard<'_, HashMap<LeaseId, Armed>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lease_for(item_id: WorkId) -> Lease {
        Lease {
            id: LeaseId::new(),
            item_id,
            started_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_timeout() {
        let watchdog = Watchdog::new(Duration::from_secs(20));
        let fired = Arc::new(AtomicUsize::new(0));
        let lease = lease_for(WorkId::new());

        let counter = Arc::clone(&fired);
        watchdog.arm(lease, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(watchdog.is_armed(lease.id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed(lease.id));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_timer_never_fires() {
        let watchdog = Watchdog::new(Duration::from_secs(20));
        let fired = Arc::new(AtomicUsize::new(0));
        let lease = lease_for(WorkId::new());

        let counter = Arc::clone(&fired);
        watchdog.arm(lease, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(watchdog.disarm(lease.id));
        assert!(!watchdog.disarm(lease.id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_an_item_supersedes_its_old_lease() {
        let watchdog = Watchdog::new(Duration::from_secs(20));
        let item = WorkId::new();
        let first = lease_for(item);
        let second = lease_for(item);

        watchdog.arm(first, |_| {});
        watchdog.arm(second, |_| {});

        assert_eq!(watchdog.armed(), vec![(item, second.id)]);
        assert_eq!(watchdog.disarm_item(item), 1);
        assert!(watchdog.armed().is_empty());
    }
}
