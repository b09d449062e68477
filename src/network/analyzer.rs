//! Analyzer side of the per-step handshake.
//!
//! The analyzer only reacts. It announces READY, acknowledges STEP, ARM and
//! TRIG, samples intensity for the window named in TRIG, then pushes FIN
//! (and RAW when asked) until the controller acknowledges. After each step
//! it announces READY again.
//!
//! A STEP arriving while a previous step is armed, waiting for its trigger
//! or waiting for its FIN acknowledgement abandons that step. The controller
//! only sends STEP early after giving up on the previous one.
//!
//! End of stream while idle or ready is a clean shutdown. Anywhere else the
//! controller vanished mid-step and the session fails.

use super::clock::NodeClock;
use super::link::MessageLink;
use super::protocol::{FinReport, Message, MessageKind, StepCommand, TriggerCommand};
use super::session::{ReplayCache, SessionState, StepSession};
use crate::acquisition::AcquisitionScheduler;
use crate::config::ScanConfig;
use crate::error::{AppResult, ProtocolViolation, ScanError};
use crate::measurement::{ChannelSummary, Quantity, SampleStats};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Retry parameters and the local stability verdict for FIN.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    /// Wait for each ACK before resending.
    pub reply_timeout: Duration,
    /// Resends before giving up on a reply.
    pub max_retries: u32,
    /// Intensity stddev under which FIN reports the window as valid.
    pub intensity_threshold: f64,
}

impl AnalyzerSettings {
    /// Settings from the `[network]` and `[thresholds]` sections.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            reply_timeout: config.network.reply_timeout(),
            max_retries: config.network.max_retries,
            intensity_threshold: config.thresholds.intensity_stddev,
        }
    }
}

/// Counters returned when the controller closes the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerSummary {
    /// Steps whose FIN was acknowledged.
    pub steps_reported: u32,
    /// Steps dropped because the controller moved on or never acknowledged.
    pub steps_abandoned: u32,
}

enum Delivery {
    Acked,
    Exhausted,
    Preempted(StepCommand),
}

/// Analyzer end of one handshake session.
pub struct AnalyzerNode<S> {
    link: MessageLink<S>,
    scheduler: Box<dyn AcquisitionScheduler>,
    settings: AnalyzerSettings,
    clock: NodeClock,
    session: StepSession,
    replay: ReplayCache,
    want_raw: bool,
    summary: AnalyzerSummary,
}

impl<S> AnalyzerNode<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Serve `link` with intensity data from `scheduler`.
    pub fn new(
        link: MessageLink<S>,
        scheduler: Box<dyn AcquisitionScheduler>,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            link,
            scheduler,
            settings,
            clock: NodeClock::new(),
            session: StepSession::new(),
            replay: ReplayCache::new(),
            want_raw: false,
            summary: AnalyzerSummary::default(),
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Serve steps until the controller closes the connection.
    pub async fn run(&mut self) -> AppResult<AnalyzerSummary> {
        let span = info_span!("analyzer", peer = %self.link.peer());
        self.serve().instrument(span).await
    }

    async fn serve(&mut self) -> AppResult<AnalyzerSummary> {
        self.announce_ready().await?;
        loop {
            let Some(message) = self.link.next_message().await? else {
                return match self.session.state() {
                    SessionState::Idle | SessionState::Ready => {
                        info!(
                            reported = self.summary.steps_reported,
                            abandoned = self.summary.steps_abandoned,
                            "controller closed the session"
                        );
                        Ok(self.summary)
                    }
                    state => Err(ScanError::ConnectionLost(format!(
                        "controller disconnected in state {state}"
                    ))),
                };
            };
            self.dispatch(message).await?;
        }
    }

    async fn dispatch(&mut self, message: Message) -> AppResult<()> {
        if let Some(reply) = self.replay.reply_for(&message).cloned() {
            debug!(kind = ?message.kind(), "duplicate request, replaying acknowledgement");
            return self.link.send(&reply).await;
        }
        match message {
            Message::Step(command) => self.on_step(command).await,
            Message::Arm => self.on_arm().await,
            Message::Trig(trigger) => {
                let received_at_ms = self.clock.now_ms();
                self.on_trigger(trigger, received_at_ms).await
            }
            Message::Ack { of, step_index } => {
                debug!(acked = ?of, step_index, "stale ACK discarded");
                Ok(())
            }
            other => Err(self.unexpected(&other)),
        }
    }

    async fn on_step(&mut self, command: StepCommand) -> AppResult<()> {
        match self.session.state() {
            SessionState::Ready => {}
            SessionState::Armed | SessionState::TriggerPending => {
                warn!(
                    abandoned = ?self.session.step_index(),
                    next = command.step_index,
                    "new STEP before trigger, abandoning step"
                );
                self.summary.steps_abandoned += 1;
                self.session.reset();
                self.session.ready()?;
            }
            _ => return Err(self.unexpected(&Message::Step(command))),
        }

        self.session.step(command.step_index)?;
        self.want_raw = command.want_raw;
        debug!(
            step_index = command.step_index,
            voltage = command.voltage,
            retry = command.retry,
            "step announced"
        );
        let ack = Message::ack(MessageKind::Step, command.step_index);
        self.link.send(&ack).await?;
        self.replay.remember(Message::Step(command), ack);
        Ok(())
    }

    async fn on_arm(&mut self) -> AppResult<()> {
        self.session.arm()?;
        let index = self.current_step()?;
        let ack = Message::ack(MessageKind::Arm, index);
        self.link.send(&ack).await?;
        self.replay.remember(Message::Arm, ack);
        Ok(())
    }

    async fn on_trigger(&mut self, trigger: TriggerCommand, received_at_ms: u64) -> AppResult<()> {
        self.session.trigger()?;
        let index = self.current_step()?;
        let ack = Message::ack(MessageKind::Trig, index);
        self.link.send(&ack).await?;
        self.replay.remember(Message::Trig(trigger), ack);

        // Peer clocks are not synchronised; only the lead carries over.
        let start_at_ms = received_at_ms + trigger.lead_ms();
        let span = info_span!("step", step_index = index);
        async {
            sleep_until(self.clock.instant_at(start_at_ms)).await;
            self.session.acquire()?;
            let summary = self
                .acquire_window(index, Duration::from_millis(u64::from(trigger.window_ms)))
                .await;
            self.report(index, summary).await
        }
        .instrument(span)
        .await
    }

    async fn acquire_window(&mut self, index: u32, window: Duration) -> (ChannelSummary, Option<Message>) {
        if let Err(err) = self.scheduler.start().await {
            warn!(error = %err, "intensity acquisition could not start");
        }
        sleep(window).await;
        self.scheduler.stop().await;
        let samples = self.scheduler.data().drain();
        let stats = SampleStats::from_samples(&samples);
        debug!(samples = stats.n, "intensity window closed");
        let raw = self.want_raw.then(|| {
            let (raw, dropped) = Message::raw(index, &samples);
            if dropped > 0 {
                warn!(dropped, kept = samples.len() - dropped, "raw samples truncated to one frame");
            }
            raw
        });
        (ChannelSummary::from_stats(index, Quantity::Intensity, stats), raw)
    }

    async fn report(&mut self, index: u32, (summary, raw): (ChannelSummary, Option<Message>)) -> AppResult<()> {
        self.session.ensure_may_send_data()?;
        let valid = summary.is_stable(self.settings.intensity_threshold);
        info!(
            mean = summary.mean,
            stddev = summary.stddev,
            n_samples = summary.n_samples,
            valid,
            "reporting intensity"
        );

        let fin = Message::Fin(FinReport { summary, valid });
        match self.deliver(fin, index).await? {
            Delivery::Acked => self.session.report()?,
            Delivery::Exhausted => return self.give_up(index).await,
            Delivery::Preempted(command) => return self.preempt(command).await,
        }

        if let Some(raw) = raw {
            self.session.ensure_may_send_data()?;
            match self.deliver(raw, index).await? {
                Delivery::Acked => {}
                Delivery::Exhausted => warn!("raw samples never acknowledged"),
                Delivery::Preempted(command) => {
                    self.summary.steps_reported += 1;
                    return self.preempt(command).await;
                }
            }
        }

        self.session.finish()?;
        self.summary.steps_reported += 1;
        self.announce_ready().await
    }

    /// Push `message` until the controller acknowledges it.
    async fn deliver(&mut self, message: Message, index: u32) -> AppResult<Delivery> {
        let kind = message.kind();
        let attempts = self.settings.max_retries + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                warn!(kind = ?kind, attempt, "no acknowledgement, re-sending");
            }
            self.link.send(&message).await?;

            let deadline = Instant::now() + self.settings.reply_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let Some(reply) = self.link.recv_timeout(remaining).await? else {
                    break;
                };
                match reply {
                    Message::Ack { of, step_index } if of == kind && step_index == index => {
                        return Ok(Delivery::Acked);
                    }
                    Message::Ack { of, step_index } => {
                        debug!(acked = ?of, step_index, "stale ACK discarded");
                    }
                    Message::Trig(_) => {
                        // The original ACK was late and the controller re-sent TRIG.
                        debug!("repeated TRIG during report, re-acknowledging");
                        self.link.send(&Message::ack(MessageKind::Trig, index)).await?;
                    }
                    Message::Step(command) => return Ok(Delivery::Preempted(command)),
                    other => {
                        if let Some(ack) = self.replay.reply_for(&other).cloned() {
                            self.link.send(&ack).await?;
                        } else {
                            return Err(self.unexpected(&other));
                        }
                    }
                }
            }
        }
        warn!(kind = ?kind, attempts, "controller never acknowledged");
        Ok(Delivery::Exhausted)
    }

    async fn give_up(&mut self, index: u32) -> AppResult<()> {
        warn!(step_index = index, "report abandoned");
        self.summary.steps_abandoned += 1;
        self.session.reset();
        self.announce_ready().await
    }

    /// The controller moved on while this step was still reporting.
    async fn preempt(&mut self, command: StepCommand) -> AppResult<()> {
        if self.session.state() != SessionState::Reported {
            self.summary.steps_abandoned += 1;
        }
        warn!(
            abandoned = ?self.session.step_index(),
            next = command.step_index,
            "new STEP during report, abandoning step"
        );
        self.session.reset();
        self.session.ready()?;
        self.on_step(command).await
    }

    async fn announce_ready(&mut self) -> AppResult<()> {
        self.session.ready()?;
        self.link.send(&Message::Ready).await
    }

    fn current_step(&self) -> Result<u32, ProtocolViolation> {
        self.session.step_index().ok_or(ProtocolViolation::InvalidTransition {
            from: self.session.state(),
            event: "arm",
        })
    }

    fn unexpected(&self, message: &Message) -> ScanError {
        ProtocolViolation::UnexpectedMessage {
            state: self.session.state(),
            kind: message.kind(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{IntervalScheduler, ReadScalar};
    use crate::hardware::mock::MockPhotodiode;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};
    use tracing_test::traced_test;

    fn settings() -> AnalyzerSettings {
        AnalyzerSettings {
            reply_timeout: Duration::from_millis(30),
            max_retries: 2,
            intensity_threshold: 0.1,
        }
    }

    fn node(stream: DuplexStream) -> AnalyzerNode<DuplexStream> {
        let pd = Arc::new(MockPhotodiode::new(0.5, 0.0));
        let scheduler =
            IntervalScheduler::new(pd, Arc::new(ReadScalar::new("pd")), Duration::from_millis(2))
                .unwrap();
        AnalyzerNode::new(MessageLink::new(stream, "controller"), Box::new(scheduler), settings())
    }

    fn step(step_index: u32, want_raw: bool) -> Message {
        Message::Step(StepCommand {
            step_index,
            voltage: 0.0,
            retry: false,
            want_raw,
        })
    }

    fn trig(window_ms: u32) -> Message {
        Message::Trig(TriggerCommand {
            sent_at_ms: 1_000,
            start_at_ms: 1_005,
            window_ms,
        })
    }

    async fn expect(link: &mut MessageLink<DuplexStream>, expected: Message) {
        assert_eq!(link.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn clean_close_while_ready() {
        let (a, b) = duplex(4096);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await });

        expect(&mut controller, Message::Ready).await;
        drop(controller);
        assert_eq!(task.await.unwrap().unwrap(), AnalyzerSummary::default());
    }

    #[tokio::test]
    async fn full_step_with_raw_samples() {
        let (a, b) = duplex(1 << 16);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await });

        expect(&mut controller, Message::Ready).await;
        controller.send(&step(7, true)).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Step, 7)).await;
        controller.send(&Message::Arm).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Arm, 7)).await;
        controller.send(&trig(20)).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Trig, 7)).await;

        let Message::Fin(fin) = controller.recv().await.unwrap() else {
            panic!("expected FIN");
        };
        assert_eq!(fin.summary.step_index, 7);
        assert_eq!(fin.summary.quantity, Quantity::Intensity);
        assert!(fin.summary.n_samples > 0);
        assert!(fin.valid);
        controller.send(&Message::ack(MessageKind::Fin, 7)).await.unwrap();

        let Message::Raw { step_index, samples } = controller.recv().await.unwrap() else {
            panic!("expected RAW");
        };
        assert_eq!(step_index, 7);
        assert_eq!(samples.len() as u32, fin.summary.n_samples);
        controller.send(&Message::ack(MessageKind::Raw, 7)).await.unwrap();

        expect(&mut controller, Message::Ready).await;
        drop(controller);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.steps_reported, 1);
    }

    #[tokio::test]
    async fn duplicate_step_is_acknowledged_once_more() {
        let (a, b) = duplex(4096);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await });

        expect(&mut controller, Message::Ready).await;
        controller.send(&step(1, false)).await.unwrap();
        controller.send(&step(1, false)).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Step, 1)).await;
        expect(&mut controller, Message::ack(MessageKind::Step, 1)).await;
        controller.send(&Message::Arm).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Arm, 1)).await;

        // Controller gives up on step 1 before TRIG and moves on.
        controller.send(&step(2, false)).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Step, 2)).await;
        drop(controller);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.steps_abandoned, 1);
    }

    #[tokio::test]
    async fn arm_without_step_is_a_violation() {
        let (a, b) = duplex(4096);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await });

        expect(&mut controller, Message::Ready).await;
        controller.send(&Message::Arm).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ScanError::Protocol(_)));
    }

    #[tokio::test]
    async fn disconnect_mid_step_is_connection_lost() {
        let (a, b) = duplex(4096);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await });

        expect(&mut controller, Message::Ready).await;
        controller.send(&step(0, false)).await.unwrap();
        controller.send(&Message::Arm).await.unwrap();
        expect(&mut controller, Message::ack(MessageKind::Step, 0)).await;
        expect(&mut controller, Message::ack(MessageKind::Arm, 0)).await;
        drop(controller);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ScanError::ConnectionLost(_)));
    }

    #[tokio::test]
    #[traced_test]
    async fn unacknowledged_fin_is_retried_then_abandoned() {
        let (a, b) = duplex(4096);
        let mut analyzer = node(a);
        let mut controller = MessageLink::new(b, "analyzer");
        let task = tokio::spawn(async move { analyzer.run().await }.in_current_span());

        expect(&mut controller, Message::Ready).await;
        controller.send(&step(3, false)).await.unwrap();
        controller.send(&Message::Arm).await.unwrap();
        controller.send(&trig(10)).await.unwrap();
        for kind in [MessageKind::Step, MessageKind::Arm, MessageKind::Trig] {
            expect(&mut controller, Message::ack(kind, 3)).await;
        }

        let mut fins = 0;
        loop {
            match controller.recv().await.unwrap() {
                Message::Fin(_) => fins += 1,
                Message::Ready => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(fins, 3);
        drop(controller);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.steps_abandoned, 1);
        assert!(logs_contain("report abandoned"));
    }
}
