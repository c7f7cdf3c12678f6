//! Wall-clock abstraction so sync timing can be tested without real time passing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock. Clones share the same time.
#[derive(Debug, Clone)]
pub struct FakeClock {
    time: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(initial_ms: i64) -> Self {
        Self {
            time: Arc::new(AtomicI64::new(initial_ms)),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.time.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: i64) {
        self.time.store(time_ms, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}
