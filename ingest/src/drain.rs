//! The process-wide drain flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set once when shutdown begins, never cleared. While set, health checks
/// fail (pulling the instance out of load-balancer rotation) and data
/// responses carry `Connection: close`.
#[derive(Debug, Default)]
pub struct DrainFlag(AtomicBool);

impl DrainFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
