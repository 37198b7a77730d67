//! Metric instrument factories for scanq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"scanq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for scanq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("scanq")
}

/// Counter: scans accepted by the gate.
/// Labels: `mode` ("online" | "offline").
pub fn scans() -> Counter<u64> {
    meter()
        .u64_counter("scanq.scans")
        .with_description("Number of scans stored")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("scanq.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: submissions by classified outcome.
/// Labels: `outcome` ("success" | "permanent" | "transient").
pub fn submissions() -> Counter<u64> {
    meter()
        .u64_counter("scanq.submissions")
        .with_description("Number of submissions to the remote endpoint")
        .build()
}

/// Counter: leases taken back by a watchdog or the startup reconciler.
/// Labels: `source` ("watchdog" | "reconciler").
pub fn leases_expired() -> Counter<u64> {
    meter()
        .u64_counter("scanq.leases_expired")
        .with_description("Number of leases released after their timeout")
        .build()
}

/// Counter: calls rejected by the action gate.
/// Labels: `action`, `reason`.
pub fn gate_rejections() -> Counter<u64> {
    meter()
        .u64_counter("scanq.gate_rejections")
        .with_description("Number of user actions rejected by the gate")
        .build()
}

/// Histogram: submission duration in milliseconds.
/// Labels: `outcome`.
pub fn submit_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("scanq.submit.duration_ms")
        .with_description("Submission duration in milliseconds")
        .with_unit("ms")
        .build()
}
