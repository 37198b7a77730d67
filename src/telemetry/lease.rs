//! Lease span helpers.
//!
//! One span per lease, covering acquire through resolution, so a slow
//! submission and the watchdog that expired it show up in the same trace.

use tracing::Span;

use crate::lease::Lease;

/// Start a span for one leased submission.
///
/// The `lease.resolution` field is declared empty and filled in by
/// [`record_resolution`].
pub fn start_lease_span(lease: &Lease, code: &str, round: u32) -> Span {
    tracing::info_span!(
        "lease.submit",
        "work.id" = %lease.item_id,
        "lease.id" = %lease.id,
        "scan.code" = code,
        "batch.round" = round,
        "lease.resolution" = tracing::field::Empty,
    )
}

/// Record how the lease ended, as a field and as an event on the span.
pub fn record_resolution(span: &Span, from: &str, to: &str) {
    span.record("lease.resolution", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
