//! # scanq
//!
//! Durable local work queue for barcode scans.
//!
//! Scans are stored before anything else happens, submitted to a remote
//! endpoint by a single worker under time-bounded leases, retried with
//! backoff, and reconciled on startup if a previous process died mid-flight.
//! Storage is SQLite (rusqlite), observability is tracing + OpenTelemetry.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod event;
pub mod lease;
pub mod ledger;
pub mod model;
pub mod projection;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod watchdog;

pub use engine::{Gated, Queue, QueueDeps, RunState};
pub use error::{Error, Result};
