//! Per-node monotonic clock.
//!
//! Each node measures time in milliseconds since its own origin. Values from
//! two nodes are never compared directly; a TRIG only transfers the
//! difference between its send time and its start time.

use tokio::time::Instant;

/// Millisecond clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct NodeClock {
    origin: Instant,
}

impl Default for NodeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClock {
    /// Start the clock at zero now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since the origin.
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// The instant `ms` milliseconds after the origin.
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + std::time::Duration::from_millis(ms)
    }
}
