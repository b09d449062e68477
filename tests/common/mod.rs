//! Shared fixtures: a controller wired to simulated devices and a scripted
//! analyzer that plays its side of the handshake by hand.

#![allow(dead_code)]

use spectro_scan::acquisition::{
    AcquisitionScheduler, EventDrivenScheduler, IntensityEvents, IntervalScheduler, ReadScalar,
};
use spectro_scan::hardware::mock::{MockPhotodiode, MockVoltageSource, MockWavemeter};
use spectro_scan::measurement::{ChannelSummary, Quantity};
use spectro_scan::network::{
    AnalyzerNode, AnalyzerSettings, ControllerSession, ControllerSettings, FinReport, Message,
    MessageKind, MessageLink, StepCommand,
};
use spectro_scan::scan::{StabilityThresholds, ValidationGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, DuplexStream};

pub const POLL: Duration = Duration::from_millis(5);

pub fn controller_settings() -> ControllerSettings {
    ControllerSettings {
        reply_timeout: Duration::from_millis(50),
        max_retries: 3,
        ready_timeout: Duration::from_secs(2),
        trigger_lead: Duration::from_millis(20),
        window: Duration::from_millis(60),
        settle: Duration::from_millis(2),
        max_ramp_rate: 1000.0,
        request_raw: false,
    }
}

pub fn analyzer_settings() -> AnalyzerSettings {
    AnalyzerSettings {
        reply_timeout: Duration::from_millis(50),
        max_retries: 3,
        intensity_threshold: 0.1,
    }
}

pub fn gate() -> ValidationGate {
    ValidationGate::new(StabilityThresholds {
        freq_stddev: 0.1,
        intensity_stddev: 0.1,
    })
}

/// Frequency alternating 9.95 / 10.05, a stddev of at most 0.05.
pub fn steady_wavemeter() -> Arc<MockWavemeter> {
    Arc::new(MockWavemeter::with_sequence(vec![9.95, 10.05]))
}

pub fn polling(device: Arc<dyn spectro_scan::hardware::ScalarSource>, name: &str) -> Box<dyn AcquisitionScheduler> {
    Box::new(IntervalScheduler::new(device, Arc::new(ReadScalar::new(name)), POLL).unwrap())
}

pub fn controller(
    stream: DuplexStream,
    settings: ControllerSettings,
) -> ControllerSession<DuplexStream> {
    ControllerSession::new(
        MessageLink::new(stream, "analyzer"),
        Arc::new(MockVoltageSource::new(5.0, 1000.0)),
        polling(steady_wavemeter(), "wavemeter"),
        settings,
    )
    .unwrap()
}

pub fn analyzer(stream: DuplexStream, photodiode: Arc<MockPhotodiode>) -> AnalyzerNode<DuplexStream> {
    AnalyzerNode::new(
        MessageLink::new(stream, "controller"),
        polling(photodiode, "photodiode"),
        analyzer_settings(),
    )
}

/// Analyzer whose photodiode pushes an intensity event every [`POLL`].
pub fn event_analyzer(stream: DuplexStream, level: f64) -> AnalyzerNode<DuplexStream> {
    let photodiode = MockPhotodiode::new(level, 0.0).with_event_period(POLL);
    let scheduler = EventDrivenScheduler::new(
        Arc::new(photodiode),
        Arc::new(IntensityEvents::new(1, "photodiode")),
    )
    .unwrap()
    .with_quiescence(POLL);
    AnalyzerNode::new(
        MessageLink::new(stream, "controller"),
        Box::new(scheduler),
        analyzer_settings(),
    )
}

pub fn link_pair() -> (DuplexStream, DuplexStream) {
    duplex(1 << 16)
}

/// Analyzer side driven message by message from a test.
pub struct ScriptedAnalyzer {
    pub link: MessageLink<DuplexStream>,
}

impl ScriptedAnalyzer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            link: MessageLink::new(stream, "controller"),
        }
    }

    pub async fn ready(&mut self) {
        self.link.send(&Message::Ready).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        self.link.recv().await.unwrap()
    }

    pub async fn ack(&mut self, of: MessageKind, step_index: u32) {
        self.link.send(&Message::ack(of, step_index)).await.unwrap();
    }

    pub async fn expect_step(&mut self) -> StepCommand {
        match self.recv().await {
            Message::Step(command) => command,
            other => panic!("expected STEP, got {other:?}"),
        }
    }

    /// Acknowledge STEP, ARM and TRIG for the next step.
    pub async fn accept_through_trigger(&mut self) -> StepCommand {
        let command = self.expect_step().await;
        self.ack(MessageKind::Step, command.step_index).await;
        assert_eq!(self.recv().await, Message::Arm);
        self.ack(MessageKind::Arm, command.step_index).await;
        match self.recv().await {
            Message::Trig(trig) => assert!(trig.lead_ms() > 0),
            other => panic!("expected TRIG, got {other:?}"),
        }
        self.ack(MessageKind::Trig, command.step_index).await;
        command
    }

    /// Send FIN with the given intensity stddev and wait for its ACK.
    pub async fn report(&mut self, step_index: u32, stddev: f64) {
        let fin = Message::Fin(FinReport {
            summary: ChannelSummary {
                step_index,
                quantity: Quantity::Intensity,
                mean: 0.5,
                stddev,
                n_samples: 30,
            },
            valid: stddev < 0.1,
        });
        self.link.send(&fin).await.unwrap();
        assert_eq!(self.recv().await, Message::ack(MessageKind::Fin, step_index));
    }
}
