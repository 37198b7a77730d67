//! Core data model.
//!
//! A work item is one scanned barcode waiting to reach the remote endpoint.
//! It has identity, an immutable payload (code + scan mode), lifecycle state,
//! and lease fields that are only populated while it is being processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier, assigned at creation.
    pub id: WorkId,

    /// The scanned barcode. Opaque to the queue.
    pub code: String,

    /// Whether the device considered itself online when the code was scanned.
    pub mode: ScanMode,

    /// Current lifecycle state.
    pub state: State,

    /// Fencing token of the lease currently holding this item.
    /// Present if and only if `state == Processing`.
    pub lease_id: Option<LeaseId>,

    /// When the current lease was taken. Present if and only if `lease_id` is.
    pub lease_started_at: Option<DateTime<Utc>>,

    /// Number of times the item went back from `Processing` to `Queued`
    /// (or was failed for running out of retries).
    pub retry_count: u32,

    /// Classification of the last failure. Advisory only.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// A freshly scanned item, queued.
    pub fn scanned(code: impl Into<String>, mode: ScanMode, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkId::new(),
            code: code.into(),
            mode,
            state: State::Queued,
            lease_id: None,
            lease_started_at: None,
            retry_count: 0,
            last_error: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Does `lease` currently fence this item?
    pub fn is_held_by(&self, lease: LeaseId) -> bool {
        self.state == State::Processing && self.lease_id == Some(lease)
    }

    /// Only unfinished work may be cleared.
    pub fn is_clearable(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Lease fields agree with the state.
    pub fn lease_consistent(&self) -> bool {
        let leased = self.lease_id.is_some() && self.lease_started_at.is_some();
        let unleased = self.lease_id.is_none() && self.lease_started_at.is_none();
        if self.state == State::Processing {
            leased
        } else {
            unleased
        }
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

/// Fencing token for a lease. A fresh one is minted on every acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Scan mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Online,
    Offline,
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScanMode::Online => "online",
            ScanMode::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScanMode {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ScanMode::Online),
            "offline" => Ok(ScanMode::Offline),
            _ => Err(crate::error::Error::Other(format!("unknown scan mode: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for the worker.
    Queued,
    /// Leased by the worker, submission in flight.
    Processing,
    /// Accepted by the endpoint. Terminal.
    Done,
    /// Rejected, or out of retries. Terminal.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Queued, Processing)        // acquire
                | (Processing, Done)    // commit
                | (Processing, Queued)  // abandon
                | (Processing, Failed) // reject, or abandon with no retries left
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Queued => "queued",
            State::Processing => "processing",
            State::Done => "done",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(State::Queued),
            "processing" => Ok(State::Processing),
            "done" => Ok(State::Done),
            "failed" => Ok(State::Failed),
            _ => Err(crate::error::Error::Other(format!("unknown state: {s}"))),
        }
    }
}
