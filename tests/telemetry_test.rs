//! Integration tests for telemetry initialization and span helpers.

use chrono::Utc;
use scanq::lease::Lease;
use scanq::model::{LeaseId, WorkId};

fn local_only() -> scanq::telemetry::TelemetryConfig {
    scanq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "scanq-test".to_string(),
        log_level: "debug".to_string(),
    }
}

#[test]
fn telemetry_initializes_once_without_endpoint() {
    // The only test in this binary that installs a subscriber.
    let guard = scanq::telemetry::init_telemetry(local_only()).unwrap();
    guard.force_flush();
    tracing::info!("logged to stderr");

    assert!(scanq::telemetry::init_telemetry(local_only()).is_err());
}

#[test]
fn lease_span_creates_and_records_resolution() {
    let lease = Lease {
        id: LeaseId::new(),
        item_id: WorkId::new(),
        started_at: Utc::now(),
    };
    let span = scanq::telemetry::lease::start_lease_span(&lease, "AWB-1", 0);
    scanq::telemetry::lease::record_resolution(&span, "processing", "done");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;

    scanq::telemetry::metrics::scans().add(1, &[KeyValue::new("mode", "offline")]);
    scanq::telemetry::metrics::submit_duration_ms()
        .record(12.5, &[KeyValue::new("outcome", "success")]);
}
