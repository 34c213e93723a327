//! Monotonic milliseconds since process start, distinct from wall clock
//! (used only for log timestamps) per spec.md §3.

use std::time::Instant;

#[derive(Clone)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { start: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
