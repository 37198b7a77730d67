//! Action Gate: debounce, duplicate suppression and preconditions in front of
//! every user-triggered mutation.
//!
//! A rejection is an advisory outcome reported back to the caller. It never
//! touches the store and is never an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use super::RunState;
use crate::config::Tuning;
use crate::projection::Counts;

/// User-triggered actions the gate knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Scan,
    ProcessQueue,
    ClearQueue,
    ToggleOffline,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::Scan => "scan",
            Action::ProcessQueue => "process_queue",
            Action::ClearQueue => "clear_queue",
            Action::ToggleOffline => "toggle_offline",
        };
        write!(f, "{s}")
    }
}

/// One call presented to the gate.
#[derive(Debug, Clone, Copy)]
pub enum Call<'a> {
    Scan(&'a str),
    ProcessQueue,
    ClearQueue,
    ToggleOffline,
}

impl Call<'_> {
    pub fn action(&self) -> Action {
        match self {
            Call::Scan(_) => Action::Scan,
            Call::ProcessQueue => Action::ProcessQueue,
            Call::ClearQueue => Action::ClearQueue,
            Call::ToggleOffline => Action::ToggleOffline,
        }
    }
}

/// Why a call was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// Same action again inside the debounce window.
    Debounced { action: Action },
    /// Same code scanned again inside the duplicate window.
    AlreadySeen { code: String },
    /// Blank scan.
    EmptyCode,
    /// Nothing queued to process.
    NothingQueued,
    /// Nothing unfinished to clear.
    NothingToClear,
    /// The device is offline.
    Offline,
    /// The worker is already running.
    WorkerBusy,
}

impl Rejection {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::Debounced { .. } => "debounced",
            Rejection::AlreadySeen { .. } => "already_seen",
            Rejection::EmptyCode => "empty_code",
            Rejection::NothingQueued => "nothing_queued",
            Rejection::NothingToClear => "nothing_to_clear",
            Rejection::Offline => "offline",
            Rejection::WorkerBusy => "worker_busy",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Debounced { action } => write!(f, "{action} ignored: pressed again too soon"),
            Rejection::AlreadySeen { code } => write!(f, "{code} already scanned"),
            Rejection::EmptyCode => write!(f, "empty code"),
            Rejection::NothingQueued => write!(f, "nothing queued"),
            Rejection::NothingToClear => write!(f, "nothing to clear"),
            Rejection::Offline => write!(f, "device is offline"),
            Rejection::WorkerBusy => write!(f, "queue is already being processed"),
        }
    }
}

/// Queue facts the preconditions are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct Conditions {
    pub counts: Counts,
    pub run_state: RunState,
    pub offline: bool,
}

#[derive(Debug)]
pub struct ActionGate {
    debounce: Duration,
    duplicate_window: Duration,
    last_call: HashMap<Action, DateTime<Utc>>,
    last_scan: HashMap<String, DateTime<Utc>>,
}

impl ActionGate {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            debounce: tuning.debounce,
            duplicate_window: tuning.duplicate_window,
            last_call: HashMap::new(),
            last_scan: HashMap::new(),
        }
    }

    /// Admit or reject `call`. Only admitted calls open new windows.
    pub fn admit(
        &mut self,
        call: Call<'_>,
        conditions: &Conditions,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let action = call.action();

        if let Call::Scan(code) = call {
            if code.is_empty() {
                return Err(Rejection::EmptyCode);
            }
            self.last_scan
                .retain(|_, at| within(*at, now, self.duplicate_window));
            if self.last_scan.contains_key(code) {
                return Err(Rejection::AlreadySeen {
                    code: code.to_string(),
                });
            }
        }

        if self
            .last_call
            .get(&action)
            .is_some_and(|at| within(*at, now, self.debounce))
        {
            return Err(Rejection::Debounced { action });
        }

        check_preconditions(call, conditions)?;

        self.last_call.insert(action, now);
        if let Call::Scan(code) = call {
            self.last_scan.insert(code.to_string(), now);
        }
        Ok(())
    }

    /// Undo the windows `admit` opened for `call` at `at`, when the admitted
    /// action then failed to take effect. Windows since reopened by a later
    /// call are left alone.
    pub fn revoke(&mut self, call: Call<'_>, at: DateTime<Utc>) {
        let action = call.action();
        if self.last_call.get(&action) == Some(&at) {
            self.last_call.remove(&action);
        }
        if let Call::Scan(code) = call {
            if self.last_scan.get(code) == Some(&at) {
                self.last_scan.remove(code);
            }
        }
    }
}

fn check_preconditions(call: Call<'_>, c: &Conditions) -> Result<(), Rejection> {
    match call {
        Call::ProcessQueue => {
            if c.offline {
                Err(Rejection::Offline)
            } else if c.run_state != RunState::Idle {
                Err(Rejection::WorkerBusy)
            } else if c.counts.queued == 0 {
                Err(Rejection::NothingQueued)
            } else {
                Ok(())
            }
        }
        Call::ClearQueue if c.counts.outstanding() == 0 => Err(Rejection::NothingToClear),
        Call::Scan(_) | Call::ClearQueue | Call::ToggleOffline => Ok(()),
    }
}

/// Is `now` less than `window` after `at`? A clock that moved backwards counts as outside.
fn within(at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    (now - at)
        .to_std()
        .is_ok_and(|elapsed| elapsed < window)
}
