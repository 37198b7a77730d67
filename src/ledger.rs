//! Serialised read-modify-write over a [`Store`].
//!
//! Every mutation in the crate goes through [`Ledger::update`]: load the
//! latest collection, apply a closure, save it back, reproject the counters.
//! The mutex makes the whole cycle one step, so a watchdog firing in the
//! middle of a worker batch can never observe or clobber half an update.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::projection::{Counts, project};
use crate::storage::Store;

pub struct Ledger {
    store: Mutex<Box<dyn Store>>,
    clock: Arc<dyn Clock>,
    counts: watch::Sender<Counts>,
}

impl Ledger {
    /// Wrap a store and compute the initial projection from what it holds.
    pub fn new(store: Box<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        let initial = project(&store.load()?, clock.now());
        let (counts, _) = watch::channel(initial);
        Ok(Self {
            store: Mutex::new(store),
            clock,
            counts,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Read the current collection.
    pub fn read<T>(&self, f: impl FnOnce(&[WorkItem]) -> T) -> Result<T> {
        let store = self.lock()?;
        let items = store.load()?;
        Ok(f(&items))
    }

    /// Apply `f` to the latest collection and persist the result.
    ///
    /// If `f` fails nothing is written. The collection is only saved when `f`
    /// actually changed it; the counters are reprojected either way.
    pub fn update<T>(&self, f: impl FnOnce(&mut Vec<WorkItem>) -> Result<T>) -> Result<T> {
        let mut store = self.lock()?;
        let mut items = store.load()?;
        let before = items.clone();

        let out = f(&mut items)?;

        debug_assert!(
            items.iter().all(WorkItem::lease_consistent),
            "lease fields out of step with state"
        );

        if items != before {
            store.save(&items)?;
        }
        self.publish(&items);
        Ok(out)
    }

    /// Recompute the counters from storage, e.g. after midnight rolls `doneToday` over.
    pub fn refresh(&self) -> Result<Counts> {
        let store = self.lock()?;
        let items = store.load()?;
        Ok(self.publish(&items))
    }

    /// Latest projected counters.
    pub fn counts(&self) -> Counts {
        *self.counts.borrow()
    }

    /// Receive every new projection.
    pub fn subscribe(&self) -> watch::Receiver<Counts> {
        self.counts.subscribe()
    }

    fn publish(&self, items: &[WorkItem]) -> Counts {
        let next = project(items, self.clock.now());
        self.counts.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        next
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Store>>> {
        self.store
            .lock()
            .map_err(|_| Error::Other("store lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::model::{ScanMode, State};
    use crate::storage::MemoryStore;

    struct BrokenStore;

    impl Store for BrokenStore {
        fn load(&self) -> Result<Vec<WorkItem>> {
            Ok(Vec::new())
        }

        fn save(&mut self, _items: &[WorkItem]) -> Result<()> {
            Err(Error::Io(std::io::Error::other("disk full")))
        }
    }

    fn ledger() -> Ledger {
        Ledger::new(Box::new(MemoryStore::new()), Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn update_persists_and_reprojects() {
        let ledger = ledger();
        let mut counts = ledger.subscribe();

        ledger
            .update(|items| {
                items.push(WorkItem::scanned("AWB-1", ScanMode::Offline, chrono::Utc::now()));
                Ok(())
            })
            .unwrap();

        assert!(counts.has_changed().unwrap());
        assert_eq!(ledger.counts().queued, 1);
        assert_eq!(ledger.read(|items| items.len()).unwrap(), 1);
    }

    #[test]
    fn failed_closure_writes_nothing() {
        let ledger = ledger();
        let result: Result<()> = ledger.update(|items| {
            items.push(WorkItem::scanned("AWB-1", ScanMode::Offline, chrono::Utc::now()));
            Err(Error::Other("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(ledger.read(|items| items.len()).unwrap(), 0);
        assert_eq!(ledger.counts().queued, 0);
    }

    #[test]
    fn persistence_failure_is_loud() {
        let ledger = Ledger::new(Box::new(BrokenStore), Arc::new(SystemClock)).unwrap();
        let err = ledger
            .update(|items| {
                items.push(WorkItem::scanned("AWB-1", ScanMode::Offline, chrono::Utc::now()));
                Ok(())
            })
            .unwrap_err();

        assert!(err.is_persistence());
        assert_eq!(ledger.counts().queued, 0);
    }

    #[test]
    fn unchanged_collection_is_not_rewritten() {
        let ledger = Ledger::new(Box::new(BrokenStore), Arc::new(SystemClock)).unwrap();
        // BrokenStore fails every save, so success proves no save happened.
        ledger
            .update(|items| Ok(items.iter().filter(|i| i.state == State::Queued).count()))
            .unwrap();
    }
}
