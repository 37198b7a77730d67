//! Connectivity signal consulted before any submission.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the device currently considers itself offline.
pub trait OfflineSignal: Send + Sync {
    fn is_offline(&self) -> bool;
}

/// A flag flipped by the platform's connectivity detection, or by hand.
#[derive(Debug, Default)]
pub struct OfflineFlag(AtomicBool);

impl OfflineFlag {
    pub fn new(offline: bool) -> Self {
        Self(AtomicBool::new(offline))
    }

    pub fn set(&self, offline: bool) {
        self.0.store(offline, Ordering::SeqCst);
    }
}

impl OfflineSignal for OfflineFlag {
    fn is_offline(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Never offline. For devices without connectivity detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

impl OfflineSignal for AlwaysOnline {
    fn is_offline(&self) -> bool {
        false
    }
}
