//! Device-pushed (callback) scheduler.
//!
//! `start` hands the device a closure that converts each event with the
//! [`CallbackStrategy`] and pushes the result, then returns without
//! blocking. The closure runs on whatever thread the device delivers
//! events from.
//!
//! A delivery already in flight when `stop` unregisters the closure can still
//! complete. `stop` therefore waits a short quiescence period after
//! unregistering and only then closes the queue; from that point the queue
//! refuses pushes, so its contents are final.

use super::{AcquisitionScheduler, CallbackStrategy, SampleQueue};
use crate::error::{AppResult, ScanError};
use crate::hardware::{CallbackSource, DeviceClaim, DeviceEvent, EventHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default wait between unregistering and freezing the queue.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(20);

/// Collects samples pushed by a [`CallbackSource`].
pub struct EventDrivenScheduler {
    device: Arc<dyn CallbackSource>,
    strategy: Arc<dyn CallbackStrategy>,
    quiescence: Duration,
    queue: SampleQueue,
    ignored: Arc<AtomicU64>,
    running: bool,
    _claim: DeviceClaim,
}

impl EventDrivenScheduler {
    /// Claim `device` for event-driven acquisition.
    ///
    /// # Errors
    /// - `ScanError::InvalidDevice` if the device is not open
    /// - `ScanError::DeviceBusy` if another component owns the device
    pub fn new(
        device: Arc<dyn CallbackSource>,
        strategy: Arc<dyn CallbackStrategy>,
    ) -> AppResult<Self> {
        let claim = device.claim()?;
        Ok(Self {
            device,
            strategy,
            quiescence: DEFAULT_QUIESCENCE,
            queue: SampleQueue::new(),
            ignored: Arc::new(AtomicU64::new(0)),
            running: false,
            _claim: claim,
        })
    }

    /// Override the post-unregister quiescence period.
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    /// Events dropped because the strategy did not recognise them, since
    /// the last `start`.
    pub fn ignored_events(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    fn handler(&self, queue: SampleQueue) -> EventHandler {
        let strategy = Arc::clone(&self.strategy);
        let ignored = Arc::clone(&self.ignored);
        Arc::new(move |event: DeviceEvent| match strategy.convert(&event) {
            Some(point) => {
                queue.push(point);
            }
            None => {
                ignored.fetch_add(1, Ordering::Relaxed);
            }
        })
    }
}

#[async_trait]
impl AcquisitionScheduler for EventDrivenScheduler {
    async fn start(&mut self) -> AppResult<()> {
        if self.running {
            warn!(device = %self.device.device_id(), "start ignored, scheduler already running");
            return Ok(());
        }

        let queue = SampleQueue::new();
        self.ignored.store(0, Ordering::Relaxed);
        self.device
            .register_callback(self.handler(queue.clone()))
            .map_err(ScanError::Device)?;

        debug!(device = %self.device.device_id(), "callback registered");
        self.queue = queue;
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.running {
            self.device.unregister_callback();
            self.running = false;
            tokio::time::sleep(self.quiescence).await;
            debug!(
                device = %self.device.device_id(),
                samples = self.queue.len(),
                ignored = self.ignored_events(),
                "callback unregistered"
            );
        }
        self.queue.close();
    }

    fn data(&self) -> SampleQueue {
        self.queue.clone()
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for EventDrivenScheduler {
    fn drop(&mut self) {
        if self.running {
            self.device.unregister_callback();
            self.queue.close();
        }
    }
}
