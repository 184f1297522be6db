// src/clock.rs
use std::time::Instant;

/// Monotonic runtime clock. One tick is one millisecond since construction;
/// the runtime never reads wall-clock time.
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self { start: Instant::now() }
    }

    #[inline]
    pub(crate) fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[inline]
    pub(crate) fn deadline_after(&self, timeout_ms: u64) -> u64 {
        self.now().saturating_add(timeout_ms)
    }
}
