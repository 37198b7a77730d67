//! Lease manager: the only code that moves items in and out of `Processing`.
//!
//! ```text
//! Queued --acquire--> Processing --commit--> Done
//!                         |      --reject--> Failed
//!                         +----abandon-----> Queued (retry_count + 1)
//!                                            Failed (retries exhausted)
//! ```
//!
//! Every resolution is fenced by the lease id. A commit, reject or abandon
//! carrying a lease that no longer holds the item resolves to
//! [`Resolution::Stale`] and leaves the collection untouched.
//!
//! These are plain functions over the collection; callers run them inside
//! [`crate::ledger::Ledger::update`] so each transition is one atomic step.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{LeaseId, State, WorkId, WorkItem};

/// A time-bounded claim on one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub item_id: WorkId,
    pub started_at: DateTime<Utc>,
}

impl Lease {
    /// The lease currently recorded on `item`, if any.
    pub fn of(item: &WorkItem) -> Option<Lease> {
        Some(Lease {
            id: item.lease_id?,
            item_id: item.id,
            started_at: item.lease_started_at?,
        })
    }
}

/// What a resolution did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The lease still held the item; it is now in this state.
    Applied(State),
    /// The lease was superseded or the item is gone. Nothing changed.
    Stale,
}

/// Lease a queued item. Returns `None` if the item is missing or not queued.
pub fn acquire(
    items: &mut [WorkItem],
    item_id: WorkId,
    now: DateTime<Utc>,
) -> Result<Option<(Lease, WorkItem)>> {
    let Some(item) = items.iter_mut().find(|i| i.id == item_id) else {
        return Ok(None);
    };
    if item.state != State::Queued {
        return Ok(None);
    }
    transition(item, State::Processing)?;

    let lease = Lease {
        id: LeaseId::new(),
        item_id,
        started_at: now,
    };
    item.lease_id = Some(lease.id);
    item.lease_started_at = Some(now);
    Ok(Some((lease, item.clone())))
}

/// Finalise a successful submission.
pub fn commit(items: &mut [WorkItem], lease: &Lease, now: DateTime<Utc>) -> Result<Resolution> {
    let Some(item) = held(items, lease)? else {
        return Ok(Resolution::Stale);
    };
    transition(item, State::Done)?;
    release(item);
    item.completed_at = Some(now);
    item.last_error = None;
    Ok(Resolution::Applied(State::Done))
}

/// Finalise a permanent failure. Never retried.
pub fn reject(items: &mut [WorkItem], lease: &Lease, reason: &str) -> Result<Resolution> {
    let Some(item) = held(items, lease)? else {
        return Ok(Resolution::Stale);
    };
    transition(item, State::Failed)?;
    release(item);
    item.last_error = Some(reason.to_string());
    Ok(Resolution::Applied(State::Failed))
}

/// Give the item back to the queue and charge one retry.
///
/// When the charge uses up the retry budget the item fails instead, so a
/// queued item always has `retry_count < max_retries`.
pub fn abandon(
    items: &mut [WorkItem],
    lease: &Lease,
    reason: &str,
    max_retries: u32,
) -> Result<Resolution> {
    let Some(item) = held(items, lease)? else {
        return Ok(Resolution::Stale);
    };
    let to = if item.retry_count.saturating_add(1) >= max_retries {
        State::Failed
    } else {
        State::Queued
    };
    transition(item, to)?;
    release(item);
    item.retry_count = item.retry_count.saturating_add(1);
    item.last_error = Some(reason.to_string());
    Ok(Resolution::Applied(to))
}

fn held<'a>(items: &'a mut [WorkItem], lease: &Lease) -> Result<Option<&'a mut WorkItem>> {
    let Some(item) = items.iter_mut().find(|i| i.id == lease.item_id) else {
        return Ok(None);
    };
    if item.lease_id != Some(lease.id) {
        return Ok(None);
    }
    if item.state != State::Processing {
        // Lease id recorded on a non-processing item: storage was tampered with.
        return Err(Error::InvalidTransition {
            from: item.state,
            to: State::Processing,
        });
    }
    Ok(Some(item))
}

fn transition(item: &mut WorkItem, to: State) -> Result<()> {
    if !item.state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: item.state,
            to,
        });
    }
    item.state = to;
    Ok(())
}

fn release(item: &mut WorkItem) {
    item.lease_id = None;
    item.lease_started_at = None;
}
