//! Acquisition scheduling.
//!
//! An acquisition scheduler turns a device into a stream of [`SamplePoint`]s
//! for the duration of one armed window. Two variants share the
//! [`AcquisitionScheduler`] lifecycle:
//!
//! - [`IntervalScheduler`] polls a [`ScalarSource`](crate::hardware::ScalarSource)
//!   at a fixed period on its own tokio task.
//! - [`EventDrivenScheduler`] registers a closure with a
//!   [`CallbackSource`](crate::hardware::CallbackSource) and lets the device
//!   push samples.
//!
//! Callers only ever see the [`SampleQueue`]; which mechanism filled it is
//! invisible to the handshake driver.
//!
//! ```text
//!   start()                        stop()
//!     │  fresh SampleQueue           │  join task / unregister callback
//!     ▼                              ▼
//!   ─────── push push push ───────── closed ── drain() by the caller
//! ```

pub mod event;
pub mod interval;
pub mod simulated;
pub mod strategy;

pub use event::EventDrivenScheduler;
pub use interval::IntervalScheduler;
pub use strategy::{
    CallbackStrategy, FrequencyEvents, IntensityEvents, PollingStrategy, ReadScalar,
    WavelengthEvents, WavelengthToFrequency, SPEED_OF_LIGHT,
};

use crate::error::AppResult;
use crate::measurement::SamplePoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

// =============================================================================
// Sample queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<SamplePoint>,
    closed: bool,
}

/// Thread-safe, unbounded FIFO of samples for one acquisition window.
///
/// Cloning yields another handle to the same queue. Pushes and the
/// `closed` flag share one lock, so once [`SampleQueue::close`] returns no
/// push can succeed.
#[derive(Debug, Clone, Default)]
pub struct SampleQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl SampleQueue {
    /// Create an open, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Returns `false` if the queue was already closed.
    pub fn push(&self, point: SamplePoint) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.items.push_back(point);
        true
    }

    /// Refuse all further pushes.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no samples are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Copy of the current contents in acquisition order.
    pub fn snapshot(&self) -> Vec<SamplePoint> {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Remove and return everything queued, in acquisition order.
    pub fn drain(&self) -> Vec<SamplePoint> {
        self.inner.lock().items.drain(..).collect()
    }
}

// =============================================================================
// Scheduler lifecycle
// =============================================================================

/// Lifecycle shared by every acquisition scheduler.
///
/// # Contract
/// - `start` opens a fresh [`SampleQueue`] and begins filling it; calling it
///   while running is a no-op
/// - `stop` may be called any number of times; after it returns the queue
///   returned by `data` no longer grows
/// - Device-level failures are logged and skipped, never returned
#[async_trait]
pub trait AcquisitionScheduler: Send {
    /// Begin acquiring into a fresh queue.
    async fn start(&mut self) -> AppResult<()>;

    /// Stop acquiring and freeze the current queue.
    async fn stop(&mut self);

    /// Handle to the queue of the current (or most recent) window.
    fn data(&self) -> SampleQueue;

    /// Whether the scheduler is acquiring.
    fn is_running(&self) -> bool;
}

#[async_trait]
impl<T: AcquisitionScheduler + ?Sized> AcquisitionScheduler for Box<T> {
    async fn start(&mut self) -> AppResult<()> {
        (**self).start().await
    }

    async fn stop(&mut self) {
        (**self).stop().await
    }

    fn data(&self) -> SampleQueue {
        (**self).data()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}
