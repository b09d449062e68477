//! Fixed-period polling scheduler.
//!
//! The sampling loop runs on its own tokio task. Each iteration waits for the
//! next interval tick, runs the [`PollingStrategy`] against the device and
//! enqueues the result. Both waits are raced against a `watch` stop signal,
//! so a stop request takes effect within one period even if the device read
//! itself hangs.
//!
//! A failed read is logged and skipped; the loop only ends on stop.

use super::{AcquisitionScheduler, PollingStrategy, SampleQueue};
use crate::error::{AppResult, ScanError};
use crate::hardware::{DeviceClaim, ScalarSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info_span, warn, Instrument};

/// Polls a [`ScalarSource`] at a fixed period.
pub struct IntervalScheduler {
    device: Arc<dyn ScalarSource>,
    strategy: Arc<dyn PollingStrategy>,
    period: Duration,
    queue: SampleQueue,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
    _claim: DeviceClaim,
}

impl IntervalScheduler {
    /// Claim `device` and prepare to poll it every `period`.
    ///
    /// # Errors
    /// - `ScanError::InvalidDevice` if the device is not open
    /// - `ScanError::DeviceBusy` if another component owns the device
    /// - `ScanError::Configuration` for a zero period
    pub fn new(
        device: Arc<dyn ScalarSource>,
        strategy: Arc<dyn PollingStrategy>,
        period: Duration,
    ) -> AppResult<Self> {
        if period.is_zero() {
            return Err(ScanError::Configuration(
                "polling period must be positive".to_string(),
            ));
        }
        let claim = device.claim()?;
        Ok(Self {
            device,
            strategy,
            period,
            queue: SampleQueue::new(),
            stop_tx: None,
            task: None,
            _claim: claim,
        })
    }

    /// Polling period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

async fn poll_loop(
    device: Arc<dyn ScalarSource>,
    strategy: Arc<dyn PollingStrategy>,
    period: Duration,
    queue: SampleQueue,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let attempt = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            result = strategy.acquire(device.as_ref()) => result,
        };

        match attempt {
            Ok(point) => {
                if !queue.push(point) {
                    break;
                }
            }
            Err(err) => {
                failures += 1;
                if err.is_signal_state() {
                    warn!(error = %err, failures, "acquisition failed, sample skipped");
                } else {
                    warn!(error = %err, failures, "acquisition failed, device problem");
                }
            }
        }
    }

    debug!(samples = queue.len(), failures, "polling loop exited");
}

#[async_trait]
impl AcquisitionScheduler for IntervalScheduler {
    async fn start(&mut self) -> AppResult<()> {
        if self.is_running() {
            warn!(device = %self.device.device_id(), "start ignored, scheduler already running");
            return Ok(());
        }

        let queue = SampleQueue::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let span = info_span!(
            "interval_scheduler",
            device = %self.device.device_id(),
            period_ms = self.period.as_millis() as u64
        );
        let task = tokio::spawn(
            poll_loop(
                Arc::clone(&self.device),
                Arc::clone(&self.strategy),
                self.period,
                queue.clone(),
                stop_rx,
            )
            .instrument(span),
        );

        self.queue = queue;
        self.stop_tx = Some(stop_tx);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "polling task did not exit cleanly");
            }
        }
        self.queue.close();
    }

    fn data(&self) -> SampleQueue {
        self.queue.clone()
    }

    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
