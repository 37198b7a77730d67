//! Shared fixtures: a scripted transport and a queue wired to a manual clock.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scanq::clock::ManualClock;
use scanq::config::Tuning;
use scanq::connectivity::OfflineFlag;
use scanq::engine::{Queue, QueueDeps, ReconcileReport, Scanned};
use scanq::event::{QueueEvent, RecordingNotifier};
use scanq::model::{LeaseId, State, WorkItem};
use scanq::error::{Error, Result};
use scanq::storage::{MemoryStore, Store};
use scanq::transport::{Submission, Transport, TransientKind};

pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

pub fn network_error() -> Submission {
    Submission::Transient {
        kind: TransientKind::Network,
    }
}

/// One scripted reply.
pub enum Step {
    Reply(Submission),
    /// Sleep (tokio time) before replying.
    Hang(Duration, Submission),
    /// Make the next store save fail, then reply.
    BreakStore(SaveFaults, Submission),
}

pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    fallback: Submission,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn always(reply: Submission) -> Self {
        Self::script(Vec::new(), reply)
    }

    pub fn script(steps: Vec<Step>, fallback: Submission) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Codes submitted so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn submit(&self, item: &WorkItem) -> Submission {
        self.calls.lock().unwrap().push(item.code.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(reply)) => reply,
            Some(Step::Hang(delay, reply)) => {
                tokio::time::sleep(delay).await;
                reply
            }
            Some(Step::BreakStore(faults, reply)) => {
                faults.fail_next(1);
                reply
            }
            None => self.fallback.clone(),
        }
    }
}

/// Shared switch telling a [`FlakyStore`] how many saves to fail.
#[derive(Debug, Clone, Default)]
pub struct SaveFaults(Arc<AtomicUsize>);

impl SaveFaults {
    pub fn fail_next(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Memory store whose saves fail on demand, like a full disk.
pub struct FlakyStore {
    inner: MemoryStore,
    faults: SaveFaults,
}

impl FlakyStore {
    pub fn new(faults: SaveFaults) -> Self {
        Self {
            inner: MemoryStore::new(),
            faults,
        }
    }
}

impl Store for FlakyStore {
    fn load(&self) -> Result<Vec<WorkItem>> {
        self.inner.load()
    }

    fn save(&mut self, items: &[WorkItem]) -> Result<()> {
        if self.faults.take() {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(items)
    }
}

pub struct Harness {
    pub queue: Queue,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub transport: Arc<ScriptedTransport>,
    pub offline: Arc<OfflineFlag>,
    pub reconciled: ReconcileReport,
}

impl Harness {
    pub fn start(transport: ScriptedTransport) -> Self {
        Self::with_items(Vec::new(), Tuning::default(), transport)
    }

    pub fn with_items(items: Vec<WorkItem>, tuning: Tuning, transport: ScriptedTransport) -> Self {
        Self::with_store(Box::new(MemoryStore::with_items(items)), tuning, transport)
    }

    pub fn with_store(store: Box<dyn Store>, tuning: Tuning, transport: ScriptedTransport) -> Self {
        let clock = Arc::new(ManualClock::new(noon()));
        let notifier = Arc::new(RecordingNotifier::new());
        let transport = Arc::new(transport);
        let offline = Arc::new(OfflineFlag::new(false));

        let deps = QueueDeps::new(transport.clone())
            .clock(clock.clone())
            .notifier(notifier.clone())
            .offline(offline.clone());
        let (queue, reconciled) =
            Queue::start(store, deps, tuning).unwrap();

        Self {
            queue,
            clock,
            notifier,
            transport,
            offline,
            reconciled,
        }
    }

    /// Move the wall clock past every debounce window.
    pub fn tick(&self) {
        self.clock.advance(Duration::from_secs(1));
    }

    pub async fn scan(&self, code: &str) -> Scanned {
        self.tick();
        self.queue
            .scan(code)
            .await
            .unwrap()
            .accepted()
            .expect("scan should be accepted")
    }

    /// Scan each code while offline, then come back online.
    pub async fn scan_offline(&self, codes: &[&str]) {
        self.offline.set(true);
        for code in codes {
            self.scan(code).await;
        }
        self.offline.set(false);
    }

    pub fn item(&self, code: &str) -> WorkItem {
        self.queue
            .list(None)
            .unwrap()
            .into_iter()
            .find(|i| i.code == code)
            .expect("item should exist")
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.notifier.events()
    }
}

/// A `Processing` item whose lease started `age` before `now`.
pub fn leased_item(code: &str, now: DateTime<Utc>, age: Duration) -> WorkItem {
    let mut item = WorkItem::scanned(code, scanq::model::ScanMode::Offline, now - chrono::Duration::minutes(1));
    item.state = State::Processing;
    item.lease_id = Some(LeaseId::new());
    item.lease_started_at = Some(now - chrono::Duration::from_std(age).unwrap());
    item
}

pub fn done_item(code: &str, now: DateTime<Utc>) -> WorkItem {
    let mut item = WorkItem::scanned(code, scanq::model::ScanMode::Online, now - chrono::Duration::minutes(5));
    item.state = State::Done;
    item.completed_at = Some(now - chrono::Duration::minutes(4));
    item
}
