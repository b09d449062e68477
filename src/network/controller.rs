//! Controller side of the per-step handshake.
//!
//! The controller drives every exchange. For one step it runs:
//!
//! ```text
//!   (await READY) → STEP/ACK → ramp output + settle → ARM/ACK → TRIG/ACK
//!   → sleep to t_start → sample frequency for the window → await FIN
//!   → ACK(FIN) → (RAW/ACK) → done
//! ```
//!
//! Each controller request is re-sent after `reply_timeout` up to
//! `max_retries` times. Exhausting the retries does not end the session; the
//! step is reported as [`StepOutcome::TimedOut`] and the next step starts
//! with STEP directly, since the analyzer abandons its step when a new STEP
//! arrives.
//!
//! While waiting for a reply, stale traffic is discarded: READY
//! notifications, acknowledgements for something else, and reports for an
//! abandoned step. A repeated FIN or RAW is answered from the replay cache.
//! Anything else is a protocol violation and ends the session.

use super::clock::NodeClock;
use super::link::MessageLink;
use super::protocol::{
    FinReport, Message, MessageKind, RawSample, StepCommand, TriggerCommand,
};
use super::session::{ReplayCache, StepSession};
use crate::acquisition::AcquisitionScheduler;
use crate::config::ScanConfig;
use crate::error::{AppResult, ProtocolViolation};
use crate::hardware::{DeviceClaim, VoltageOutput};
use crate::measurement::{ChannelSummary, Quantity, SampleStats};
use crate::scan::step_queue::ScanStep;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Timing and retry parameters for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Wait for each ACK before resending.
    pub reply_timeout: Duration,
    /// Resends before a step times out.
    pub max_retries: u32,
    /// Wait for the analyzer's READY.
    pub ready_timeout: Duration,
    /// How far ahead of TRIG the acquisition start is scheduled.
    pub trigger_lead: Duration,
    /// Acquisition window length.
    pub window: Duration,
    /// Pause after the output reaches its setpoint.
    pub settle: Duration,
    /// Ramp rate for voltage moves, in V/s.
    pub max_ramp_rate: f64,
    /// Ask the analyzer for a RAW frame after each FIN.
    pub request_raw: bool,
}

impl ControllerSettings {
    /// Settings from the loaded configuration.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            reply_timeout: config.network.reply_timeout(),
            max_retries: config.network.max_retries,
            ready_timeout: config.network.ready_timeout(),
            trigger_lead: config.timing.trigger_lead(),
            window: config.timing.window(),
            settle: config.timing.settle(),
            max_ramp_rate: config.actuation.max_ramp_rate,
            request_raw: config.network.request_raw,
        }
    }
}

/// Both channel summaries of one completed handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMeasurement {
    /// Frequency measured on this node.
    pub local: ChannelSummary,
    /// Intensity report from the analyzer.
    pub remote: FinReport,
    /// Analyzer samples, when requested.
    pub raw: Option<Vec<RawSample>>,
}

/// How one step ended, short of a session-ending error.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The handshake completed.
    Measured(StepMeasurement),
    /// No reply to `phase` after every retry.
    TimedOut {
        /// Message that went unanswered.
        phase: MessageKind,
    },
    /// The output refused the setpoint. Carries the ledger reason.
    ActuationFailed(String),
}

/// Controller end of one handshake session.
pub struct ControllerSession<S> {
    link: MessageLink<S>,
    output: Arc<dyn VoltageOutput>,
    scheduler: Box<dyn AcquisitionScheduler>,
    settings: ControllerSettings,
    clock: NodeClock,
    session: StepSession,
    replay: ReplayCache,
    awaiting_ready: bool,
    session_id: Uuid,
    _output_claim: DeviceClaim,
}

impl<S> ControllerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Claim `output` and prepare to drive steps over `link`.
    ///
    /// The frequency `scheduler` must already own its device.
    pub fn new(
        link: MessageLink<S>,
        output: Arc<dyn VoltageOutput>,
        scheduler: Box<dyn AcquisitionScheduler>,
        settings: ControllerSettings,
    ) -> AppResult<Self> {
        let claim = output.claim()?;
        Ok(Self {
            link,
            output,
            scheduler,
            settings,
            clock: NodeClock::new(),
            session: StepSession::new(),
            replay: ReplayCache::new(),
            awaiting_ready: true,
            session_id: Uuid::new_v4(),
            _output_claim: claim,
        })
    }

    /// Identifier stamped on this session's report.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Timing and retry parameters in use.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Run the full handshake for `step`.
    ///
    /// # Errors
    /// Only session-ending failures: protocol violations and connection loss.
    pub async fn run_step(&mut self, step: ScanStep, retry: bool) -> AppResult<StepOutcome> {
        let span = info_span!(
            "step",
            session_id = %self.session_id,
            step_index = step.step_index,
            voltage = step.voltage,
            retry
        );
        async {
            let outcome = self.drive_step(step, retry).await;
            match &outcome {
                Ok(StepOutcome::Measured(_)) => {
                    self.session.finish()?;
                    self.awaiting_ready = true;
                }
                Ok(_) => {
                    self.session.reset();
                    self.awaiting_ready = false;
                }
                Err(_) => self.session.reset(),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive_step(&mut self, step: ScanStep, retry: bool) -> AppResult<StepOutcome> {
        let index = step.step_index;

        if self.awaiting_ready && !self.await_ready().await? {
            warn!(waited_ms = self.settings.ready_timeout.as_millis() as u64, "analyzer never signalled READY");
            return Ok(StepOutcome::TimedOut {
                phase: MessageKind::Ready,
            });
        }
        self.session.ready()?;

        let want_raw = self.settings.request_raw;
        let command = Message::Step(StepCommand {
            step_index: index,
            voltage: step.voltage,
            retry,
            want_raw,
        });
        if self.exchange(index, |_| command.clone()).await?.is_none() {
            return Ok(timed_out(MessageKind::Step));
        }
        self.session.step(index)?;

        if let Err(err) = self
            .output
            .set_output(step.voltage, self.settings.max_ramp_rate)
            .await
        {
            warn!(error = %err, "output refused setpoint");
            return Ok(StepOutcome::ActuationFailed(format!("actuation: {err}")));
        }
        sleep(self.settings.settle).await;

        if self.exchange(index, |_| Message::Arm).await?.is_none() {
            return Ok(timed_out(MessageKind::Arm));
        }
        self.session.arm()?;

        let lead_ms = self.settings.trigger_lead.as_millis() as u64;
        let window_ms = u32::try_from(self.settings.window.as_millis()).unwrap_or(u32::MAX);
        let trigger = self
            .exchange(index, |clock| {
                let sent_at_ms = clock.now_ms();
                Message::Trig(TriggerCommand {
                    sent_at_ms,
                    start_at_ms: sent_at_ms + lead_ms,
                    window_ms,
                })
            })
            .await?;
        let start_at_ms = match trigger {
            Some(Message::Trig(trig)) => trig.start_at_ms,
            _ => return Ok(timed_out(MessageKind::Trig)),
        };
        self.session.trigger()?;

        sleep_until(self.clock.instant_at(start_at_ms)).await;
        self.session.acquire()?;
        let local = self.acquire_window(index).await;

        let Some(remote) = self.await_fin(index).await? else {
            return Ok(timed_out(MessageKind::Fin));
        };
        self.session.report()?;
        let ack = Message::ack(MessageKind::Fin, index);
        self.link.send(&ack).await?;
        self.replay.remember(Message::Fin(remote), ack);

        let raw = if want_raw {
            self.await_raw(index).await?
        } else {
            None
        };

        info!(
            freq_mean = local.mean,
            freq_stddev = local.stddev,
            intensity_mean = remote.summary.mean,
            intensity_stddev = remote.summary.stddev,
            "step measured"
        );
        Ok(StepOutcome::Measured(StepMeasurement { local, remote, raw }))
    }

    /// Sample the frequency reference for one window.
    async fn acquire_window(&mut self, index: u32) -> ChannelSummary {
        if let Err(err) = self.scheduler.start().await {
            warn!(error = %err, "frequency acquisition could not start");
        }
        sleep(self.settings.window).await;
        self.scheduler.stop().await;
        let samples = self.scheduler.data().drain();
        let stats = SampleStats::from_samples(&samples);
        debug!(samples = stats.n, "frequency window closed");
        ChannelSummary::from_stats(index, Quantity::Frequency, stats)
    }

    /// Send a request built by `build` until it is acknowledged.
    ///
    /// Returns the request that was in flight when the ACK arrived, or
    /// `None` once every retry has timed out.
    async fn exchange<F>(&mut self, index: u32, mut build: F) -> AppResult<Option<Message>>
    where
        F: FnMut(&NodeClock) -> Message,
    {
        let attempts = self.settings.max_retries + 1;
        let mut kind = None;
        for attempt in 1..=attempts {
            let request = build(&self.clock);
            let of = request.kind();
            kind = Some(of);
            if attempt > 1 {
                warn!(phase = ?of, attempt, "no reply, re-sending");
            }
            self.link.send(&request).await?;

            let deadline = Instant::now() + self.settings.reply_timeout;
            while let Some(message) = self.recv_until(deadline).await? {
                match message {
                    Message::Ack { of: acked, step_index } if acked == of && step_index == index => {
                        return Ok(Some(request));
                    }
                    other => self.handle_stray(other, Some(index)).await?,
                }
            }
        }
        warn!(phase = ?kind, attempts, "no reply after all retries, escalating step");
        Ok(None)
    }

    async fn await_ready(&mut self) -> AppResult<bool> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        while let Some(message) = self.recv_until(deadline).await? {
            match message {
                Message::Ready => return Ok(true),
                other => self.handle_stray(other, None).await?,
            }
        }
        Ok(false)
    }

    fn report_deadline(&self) -> Instant {
        Instant::now() + self.settings.reply_timeout * (self.settings.max_retries + 1)
    }

    async fn await_fin(&mut self, index: u32) -> AppResult<Option<FinReport>> {
        let deadline = self.report_deadline();
        while let Some(message) = self.recv_until(deadline).await? {
            match message {
                Message::Fin(fin) if fin.summary.step_index == index => {
                    if fin.summary.quantity != Quantity::Intensity {
                        return Err(ProtocolViolation::QuantityMismatch.into());
                    }
                    return Ok(Some(fin));
                }
                other => self.handle_stray(other, Some(index)).await?,
            }
        }
        warn!("no FIN before the report deadline");
        Ok(None)
    }

    async fn await_raw(&mut self, index: u32) -> AppResult<Option<Vec<RawSample>>> {
        let deadline = self.report_deadline();
        while let Some(message) = self.recv_until(deadline).await? {
            match message {
                Message::Raw {
                    step_index,
                    samples,
                } if step_index == index => {
                    let ack = Message::ack(MessageKind::Raw, index);
                    self.link.send(&ack).await?;
                    debug!(samples = samples.len(), "raw samples received");
                    self.replay.remember(
                        Message::Raw {
                            step_index,
                            samples: samples.clone(),
                        },
                        ack,
                    );
                    return Ok(Some(samples));
                }
                other => self.handle_stray(other, Some(index)).await?,
            }
        }
        warn!("raw samples requested but never received");
        Ok(None)
    }

    async fn recv_until(&mut self, deadline: Instant) -> AppResult<Option<Message>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        self.link.recv_timeout(remaining).await
    }

    /// Deal with a message that is not the reply being waited for.
    async fn handle_stray(&mut self, message: Message, current: Option<u32>) -> AppResult<()> {
        if let Some(reply) = self.replay.reply_for(&message).cloned() {
            debug!(kind = ?message.kind(), "duplicate report, replaying acknowledgement");
            return self.link.send(&reply).await;
        }

        let report_step = match &message {
            Message::Ready => {
                debug!("stale READY discarded");
                return Ok(());
            }
            Message::Ack { of, step_index } => {
                debug!(acked = ?of, step_index, "stale ACK discarded");
                return Ok(());
            }
            Message::Fin(fin) => Some(fin.summary.step_index),
            Message::Raw { step_index, .. } => Some(*step_index),
            Message::Step(_) | Message::Arm | Message::Trig(_) => None,
        };

        match report_step {
            Some(step_index) if current != Some(step_index) => {
                warn!(kind = ?message.kind(), step_index, "report for an abandoned step discarded");
                Ok(())
            }
            _ => Err(ProtocolViolation::UnexpectedMessage {
                state: self.session.state(),
                kind: message.kind(),
            }
            .into()),
        }
    }
}

fn timed_out(phase: MessageKind) -> StepOutcome {
    StepOutcome::TimedOut { phase }
}
