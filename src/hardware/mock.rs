//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for running both nodes without
//! physical instruments. All mock devices use async-safe waits
//! (tokio::time::sleep, not std::thread::sleep) on the async paths; event
//! pumps run on their own OS thread the way a vendor callback thread would.
//!
//! # Available Mocks
//!
//! - `MockVoltageSource` - Rate-limited analog output with a voltage limit
//! - `MockWavemeter` - Frequency (or wavelength) reference, polled or event-driven
//! - `MockPhotodiode` - Intensity reading, polled or event-driven
//!
//! The polled mocks support fault injection: queued `DeviceError`s are
//! returned before normal readings resume.

use crate::error::DeviceError;
use crate::hardware::capabilities::{
    CallbackSource, ClaimFlag, DeviceEvent, DeviceHandle, EventHandler, EventKind, Reading,
    ScalarSource, VoltageOutput,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

// =============================================================================
// Signal model shared by the acquisition mocks
// =============================================================================

/// How a simulated channel produces values.
#[derive(Clone)]
enum SignalModel {
    /// `base` plus uniform noise in `[-noise, noise]`.
    Noisy { base: f64, noise: f64 },
    /// Cycle through fixed values.
    Sequence { values: Vec<f64>, next: usize },
    /// Linear in the tracked output voltage, plus uniform noise.
    Tracking {
        output: Arc<MockVoltageSource>,
        offset: f64,
        slope: f64,
        noise: f64,
    },
}

impl SignalModel {
    fn next_value(&mut self) -> f64 {
        match self {
            SignalModel::Noisy { base, noise } => *base + jitter(*noise),
            SignalModel::Sequence { values, next } => {
                if values.is_empty() {
                    return 0.0;
                }
                let value = values[*next % values.len()];
                *next += 1;
                value
            }
            SignalModel::Tracking {
                output,
                offset,
                slope,
                noise,
            } => *offset + *slope * output.current() + jitter(*noise),
        }
    }
}

fn jitter(noise: f64) -> f64 {
    if noise > 0.0 {
        rand::thread_rng().gen_range(-noise..=noise)
    } else {
        0.0
    }
}

/// Common state for a simulated acquisition channel.
struct SimChannel {
    id: String,
    open: AtomicBool,
    claim: ClaimFlag,
    origin: Instant,
    model: Mutex<SignalModel>,
    faults: Mutex<VecDeque<DeviceError>>,
    reads: AtomicU64,
}

impl SimChannel {
    fn new(id: &str, model: SignalModel) -> Self {
        Self {
            id: id.to_string(),
            open: AtomicBool::new(true),
            claim: ClaimFlag::new(),
            origin: Instant::now(),
            model: Mutex::new(model),
            faults: Mutex::new(VecDeque::new()),
            reads: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sample(&self) -> Result<Reading, DeviceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if !self.open.load(Ordering::Acquire) {
            return Err(DeviceError::Unreachable(format!("{} is closed", self.id)));
        }
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }
        let value = self.model.lock().next_value();
        Ok(Reading {
            value,
            timestamp_ms: self.now_ms(),
        })
    }
}

/// Callback slot plus the optional device thread that feeds it.
///
/// Every register/unregister bumps `generation`; a pump thread exits as soon
/// as the generation it was started under is no longer current.
struct EventPump {
    handler: Arc<Mutex<Option<EventHandler>>>,
    generation: Arc<AtomicU64>,
    period: Option<Duration>,
    kind: EventKind,
}

impl EventPump {
    fn new(kind: EventKind) -> Self {
        Self {
            handler: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            period: None,
            kind,
        }
    }

    fn emit(&self, event: DeviceEvent) -> bool {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }

    fn has_callback(&self) -> bool {
        self.handler.lock().is_some()
    }

    fn register(&self, channel: &SimChannel, handler: EventHandler) -> Result<(), DeviceError> {
        if !channel.open.load(Ordering::Acquire) {
            return Err(DeviceError::Inactive);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock() = Some(handler);
        if let Some(period) = self.period {
            self.spawn(channel, period);
        }
        Ok(())
    }

    fn unregister(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock() = None;
    }

    fn spawn(&self, channel: &SimChannel, period: Duration) {
        let generation = self.generation.load(Ordering::SeqCst);
        let current_generation = Arc::clone(&self.generation);
        let handler = Arc::clone(&self.handler);
        let origin = channel.origin;
        let kind = self.kind;
        let model = Mutex::new(channel.model.lock().clone());
        debug!(device = %channel.id, ?kind, period_ms = period.as_millis() as u64, "event pump started");

        std::thread::spawn(move || loop {
            std::thread::sleep(period);
            if current_generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let event = DeviceEvent {
                kind,
                int_value: origin.elapsed().as_millis() as i64,
                dbl_value: model.lock().next_value(),
            };
            let registered = handler.lock().clone();
            match registered {
                Some(callback) => callback(event),
                None => break,
            }
        });
    }
}

// =============================================================================
// MockVoltageSource - Simulated analog output
// =============================================================================

/// Mock analog output with limit and ramp-rate enforcement.
///
/// The ramp takes `|Δv| / max_rate` seconds of simulated time.
pub struct MockVoltageSource {
    id: String,
    claim: ClaimFlag,
    limit: f64,
    max_rate_limit: f64,
    current: Mutex<f64>,
    writes: AtomicU64,
}

impl MockVoltageSource {
    /// Output clamped to ±`limit` volts accepting ramp rates up to
    /// `max_rate_limit` V/s, starting at 0 V.
    pub fn new(limit: f64, max_rate_limit: f64) -> Self {
        Self {
            id: "mock-ao0".to_string(),
            claim: ClaimFlag::new(),
            limit,
            max_rate_limit,
            current: Mutex::new(0.0),
            writes: AtomicU64::new(0),
        }
    }

    /// Current output without awaiting.
    pub fn current(&self) -> f64 {
        *self.current.lock()
    }

    /// Number of successful `set_output` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DeviceHandle for MockVoltageSource {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        true
    }

    fn claim_flag(&self) -> &ClaimFlag {
        &self.claim
    }
}

#[async_trait]
impl VoltageOutput for MockVoltageSource {
    async fn set_output(&self, voltage: f64, max_rate: f64) -> Result<(), DeviceError> {
        if !voltage.is_finite() || voltage.abs() > self.limit {
            return Err(DeviceError::OutOfRange {
                requested: voltage,
                limit: self.limit,
            });
        }
        if !(max_rate > 0.0 && max_rate <= self.max_rate_limit) {
            return Err(DeviceError::RateExceeded {
                requested: max_rate,
                max: self.max_rate_limit,
            });
        }

        let start = self.current();
        let ramp = Duration::from_secs_f64((voltage - start).abs() / max_rate);
        debug!(device = %self.id, from = start, to = voltage, ramp_ms = ramp.as_millis() as u64, "ramping output");
        sleep(ramp).await;

        *self.current.lock() = voltage;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn output(&self) -> f64 {
        self.current()
    }
}

// =============================================================================
// MockWavemeter - Simulated frequency reference
// =============================================================================

/// Mock wavemeter supporting both polled reads and pushed events.
///
/// When an event period is configured, registering a callback starts a
/// background thread that pushes a channel-1 event every period until the
/// callback is unregistered. The event is a frequency event unless the
/// meter was switched to [`MockWavemeter::reporting_wavelength`]. Tests can
/// also push events by hand with [`MockWavemeter::emit`].
pub struct MockWavemeter {
    channel: SimChannel,
    pump: EventPump,
}

impl MockWavemeter {
    /// Constant `base` Hz with uniform noise of `noise` Hz.
    pub fn new(base_hz: f64, noise_hz: f64) -> Self {
        Self::with_model(SignalModel::Noisy {
            base: base_hz,
            noise: noise_hz,
        })
    }

    /// Cycle through fixed values.
    pub fn with_sequence(values: Vec<f64>) -> Self {
        Self::with_model(SignalModel::Sequence { values, next: 0 })
    }

    /// Reading follows `offset + slope * V` of `output`.
    pub fn tracking(output: Arc<MockVoltageSource>, offset: f64, slope: f64, noise: f64) -> Self {
        Self::with_model(SignalModel::Tracking {
            output,
            offset,
            slope,
            noise,
        })
    }

    fn with_model(model: SignalModel) -> Self {
        Self {
            channel: SimChannel::new("mock-wavemeter", model),
            pump: EventPump::new(EventKind::Frequency { channel: 1 }),
        }
    }

    /// Push events from a device thread every `period` while registered.
    pub fn with_event_period(mut self, period: Duration) -> Self {
        self.pump.period = Some(period);
        self
    }

    /// Values are vacuum wavelengths in nm; pushed events are channel-1
    /// wavelength events.
    pub fn reporting_wavelength(mut self) -> Self {
        self.pump.kind = EventKind::Wavelength { channel: 1 };
        self
    }

    /// Queue faults returned by polled reads before normal readings.
    pub fn inject_faults(&self, faults: impl IntoIterator<Item = DeviceError>) {
        self.channel.faults.lock().extend(faults);
    }

    /// Mark the device session closed.
    pub fn close(&self) {
        self.channel.open.store(false, Ordering::Release);
    }

    /// Deliver `event` to the registered handler, as the vendor thread would.
    /// Returns whether a handler was registered.
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.pump.emit(event)
    }

    /// Whether a callback is currently registered.
    pub fn has_callback(&self) -> bool {
        self.pump.has_callback()
    }

    /// Polled read attempts so far.
    pub fn read_count(&self) -> u64 {
        self.channel.reads.load(Ordering::Relaxed)
    }
}

impl DeviceHandle for MockWavemeter {
    fn device_id(&self) -> &str {
        &self.channel.id
    }

    fn is_open(&self) -> bool {
        self.channel.open.load(Ordering::Acquire)
    }

    fn claim_flag(&self) -> &ClaimFlag {
        &self.channel.claim
    }
}

#[async_trait]
impl ScalarSource for MockWavemeter {
    async fn read_scalar(&self) -> Result<Reading, DeviceError> {
        self.channel.sample()
    }
}

impl CallbackSource for MockWavemeter {
    fn register_callback(&self, handler: EventHandler) -> Result<(), DeviceError> {
        self.pump.register(&self.channel, handler)
    }

    fn unregister_callback(&self) {
        self.pump.unregister();
    }
}

// =============================================================================
// MockPhotodiode - Simulated intensity channel
// =============================================================================

/// Mock photodiode returning a noisy or scripted intensity in volts.
///
/// Polled by default. With an event period it also behaves like a DAQ
/// buffer callback, pushing channel-1 intensity events while registered.
pub struct MockPhotodiode {
    channel: SimChannel,
    pump: EventPump,
}

impl MockPhotodiode {
    /// Constant `level` V with uniform noise of `noise` V.
    pub fn new(level: f64, noise: f64) -> Self {
        Self::with_model(SignalModel::Noisy { base: level, noise })
    }

    /// Cycle through fixed intensities.
    pub fn with_sequence(values: Vec<f64>) -> Self {
        Self::with_model(SignalModel::Sequence { values, next: 0 })
    }

    fn with_model(model: SignalModel) -> Self {
        Self {
            channel: SimChannel::new("mock-photodiode", model),
            pump: EventPump::new(EventKind::Intensity { channel: 1 }),
        }
    }

    /// Push intensity events every `period` while registered.
    pub fn with_event_period(mut self, period: Duration) -> Self {
        self.pump.period = Some(period);
        self
    }

    /// Queue faults returned before normal readings.
    pub fn inject_faults(&self, faults: impl IntoIterator<Item = DeviceError>) {
        self.channel.faults.lock().extend(faults);
    }

    /// Mark the device session closed.
    pub fn close(&self) {
        self.channel.open.store(false, Ordering::Release);
    }

    /// Read attempts so far, including failed ones.
    pub fn read_count(&self) -> u64 {
        self.channel.reads.load(Ordering::Relaxed)
    }

    /// Whether a callback is currently registered.
    pub fn has_callback(&self) -> bool {
        self.pump.has_callback()
    }
}

impl DeviceHandle for MockPhotodiode {
    fn device_id(&self) -> &str {
        &self.channel.id
    }

    fn is_open(&self) -> bool {
        self.channel.open.load(Ordering::Acquire)
    }

    fn claim_flag(&self) -> &ClaimFlag {
        &self.channel.claim
    }
}

#[async_trait]
impl ScalarSource for MockPhotodiode {
    async fn read_scalar(&self) -> Result<Reading, DeviceError> {
        self.channel.sample()
    }
}

impl CallbackSource for MockPhotodiode {
    fn register_callback(&self, handler: EventHandler) -> Result<(), DeviceError> {
        self.pump.register(&self.channel, handler)
    }

    fn unregister_callback(&self) {
        self.pump.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn voltage_source_enforces_limit_and_rate() {
        let ao = MockVoltageSource::new(5.0, 100.0);
        assert!(matches!(
            ao.set_output(6.0, 10.0).await,
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            ao.set_output(1.0, 0.0).await,
            Err(DeviceError::RateExceeded { .. })
        ));
        assert!(matches!(
            ao.set_output(1.0, 500.0).await,
            Err(DeviceError::RateExceeded { .. })
        ));
        ao.set_output(-2.5, 100.0).await.unwrap();
        assert_eq!(ao.output().await, -2.5);
        assert_eq!(ao.write_count(), 1);
    }

    #[tokio::test]
    async fn injected_faults_come_before_readings() {
        let pd = MockPhotodiode::with_sequence(vec![1.0, 2.0]);
        pd.inject_faults([DeviceError::LowSignal]);
        assert_eq!(pd.read_scalar().await, Err(DeviceError::LowSignal));
        assert_eq!(pd.read_scalar().await.unwrap().value, 1.0);
        assert_eq!(pd.read_scalar().await.unwrap().value, 2.0);
        assert_eq!(pd.read_scalar().await.unwrap().value, 1.0);
        assert_eq!(pd.read_count(), 4);
    }

    #[tokio::test]
    async fn wavemeter_tracks_output_voltage() {
        let ao = Arc::new(MockVoltageSource::new(5.0, 1000.0));
        let wm = MockWavemeter::tracking(Arc::clone(&ao), 100.0, 10.0, 0.0);
        ao.set_output(2.0, 1000.0).await.unwrap();
        assert_eq!(wm.read_scalar().await.unwrap().value, 120.0);
    }

    #[test]
    fn emit_reaches_registered_handler_only() {
        let wm = MockWavemeter::new(1.0, 0.0);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let event = DeviceEvent::from_raw(EventKind::FREQUENCY_1, 10, 1.0);

        assert!(!wm.emit(event));
        wm.register_callback(Arc::new(move |_: DeviceEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert!(wm.emit(event));
        wm.unregister_callback();
        assert!(!wm.emit(event));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn photodiode_pump_pushes_intensity_events_until_unregistered() {
        let pd = MockPhotodiode::with_sequence(vec![0.25]).with_event_period(Duration::from_millis(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        pd.register_callback(Arc::new(move |event: DeviceEvent| sink.lock().push(event)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));
        pd.unregister_callback();
        assert!(!pd.has_callback());
        std::thread::sleep(Duration::from_millis(10));
        let settled = seen.lock().len();
        std::thread::sleep(Duration::from_millis(20));

        let events = seen.lock();
        assert!(settled > 0);
        assert_eq!(events.len(), settled);
        assert!(events
            .iter()
            .all(|e| e.kind == EventKind::Intensity { channel: 1 } && e.dbl_value == 0.25));
    }

    #[test]
    fn wavelength_meter_pushes_wavelength_events() {
        let wm = MockWavemeter::with_sequence(vec![780.0])
            .reporting_wavelength()
            .with_event_period(Duration::from_millis(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        wm.register_callback(Arc::new(move |event: DeviceEvent| sink.lock().push(event)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        wm.unregister_callback();

        let events = seen.lock();
        assert!(!events.is_empty());
        assert_eq!(events[0].kind, EventKind::Wavelength { channel: 1 });
        assert_eq!(events[0].dbl_value, 780.0);
    }

    #[test]
    fn closed_wavemeter_refuses_registration() {
        let wm = MockWavemeter::new(1.0, 0.0);
        wm.close();
        assert_eq!(
            wm.register_callback(Arc::new(|_: DeviceEvent| {})),
            Err(DeviceError::Inactive)
        );
    }
}
