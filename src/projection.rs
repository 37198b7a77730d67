//! Counter projection.
//!
//! The visible counters are never incremented by hand. They are recomputed
//! from the full item collection after every store mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{State, WorkItem};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub queued: usize,
    pub processing: usize,
    pub done_today: usize,
}

impl Counts {
    /// Items the worker still owes the endpoint.
    pub fn outstanding(&self) -> usize {
        self.queued + self.processing
    }
}

impl std::fmt::Display for Counts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queued={} processing={} done_today={}",
            self.queued, self.processing, self.done_today
        )
    }
}

/// Project the counters for `items` as of `now`. "Today" is the UTC day of `now`.
pub fn project(items: &[WorkItem], now: DateTime<Utc>) -> Counts {
    let today = now.date_naive();
    items.iter().fold(Counts::default(), |mut counts, item| {
        match item.state {
            State::Queued => counts.queued += 1,
            State::Processing => counts.processing += 1,
            State::Done if item.completed_at.is_some_and(|at| at.date_naive() == today) => {
                counts.done_today += 1;
            }
            State::Done | State::Failed => {}
        }
        counts
    })
}
