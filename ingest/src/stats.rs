//! Request statistics shared between the ingress service and the
//! lifecycle controller.
//!
//! The graceful-shutdown poller watches `total_connections` to decide
//! when traffic has gone quiet, so these counters must track data
//! requests only (health checks and 404s have their own counters).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Stats {
    pub total_connections: AtomicI64,
    pub active_connections: AtomicI64,
    pub total_processing_ns: AtomicI64,
    pub decode_errors: AtomicI64,
    pub health_checks: AtomicI64,
    pub not_found: AtomicI64,
    pub backpressure_errors: AtomicI64,
    pub latency: RollingBucket,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicI64::new(0),
            active_connections: AtomicI64::new(0),
            total_processing_ns: AtomicI64::new(0),
            decode_errors: AtomicI64::new(0),
            health_checks: AtomicI64::new(0),
            not_found: AtomicI64::new(0),
            backpressure_errors: AtomicI64::new(0),
            latency: RollingBucket::new(),
        }
    }

    pub fn total_connections(&self) -> i64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed latency aggregate. `observe` folds a sample into the open
/// window; `snapshot` closes it and opens a fresh one.
#[derive(Debug)]
pub struct RollingBucket {
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    count: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
    opened_at: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            count: 0,
            sum: Duration::ZERO,
            min: Duration::MAX,
            max: Duration::ZERO,
            opened_at: Instant::now(),
        }
    }
}

/// One closed latency window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub sum: Duration,
    /// Zero when the window saw no samples.
    pub min: Duration,
    pub max: Duration,
    pub window: Duration,
}

impl RollingBucket {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window::new()),
        }
    }

    pub fn observe(&self, sample: Duration) {
        let mut window = self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        window.count += 1;
        window.sum += sample;
        window.min = window.min.min(sample);
        window.max = window.max.max(sample);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let mut window = self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let closed = std::mem::replace(&mut *window, Window::new());
        LatencySnapshot {
            count: closed.count,
            sum: closed.sum,
            min: if closed.count == 0 {
                Duration::ZERO
            } else {
                closed.min
            },
            max: closed.max,
            window: closed.opened_at.elapsed(),
        }
    }
}

impl Default for RollingBucket {
    fn default() -> Self {
        Self::new()
    }
}
