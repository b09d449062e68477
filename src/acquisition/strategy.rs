//! Acquisition strategies.
//!
//! A strategy is the pluggable conversion from a raw device read (or pushed
//! event) into a [`SamplePoint`]. Schedulers own the timing; strategies own
//! the meaning of the value.

use crate::error::DeviceError;
use crate::hardware::{DeviceEvent, EventKind, ScalarSource};
use crate::measurement::SamplePoint;
use async_trait::async_trait;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Turns one polled read into a sample.
#[async_trait]
pub trait PollingStrategy: Send + Sync {
    /// Perform one acquisition attempt against `device`.
    async fn acquire(&self, device: &dyn ScalarSource) -> Result<SamplePoint, DeviceError>;
}

/// Turns one pushed event into a sample, or drops it.
///
/// Called on the device's callback thread; must not block.
pub trait CallbackStrategy: Send + Sync {
    /// `None` for event kinds this strategy does not handle.
    fn convert(&self, event: &DeviceEvent) -> Option<SamplePoint>;
}

// =============================================================================
// Polling strategies
// =============================================================================

/// Pass the device value through unchanged.
#[derive(Debug, Clone)]
pub struct ReadScalar {
    source: String,
}

impl ReadScalar {
    /// Tag every sample with `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl PollingStrategy for ReadScalar {
    async fn acquire(&self, device: &dyn ScalarSource) -> Result<SamplePoint, DeviceError> {
        let reading = device.read_scalar().await?;
        Ok(SamplePoint::new(
            reading.timestamp_ms,
            reading.value,
            self.source.clone(),
        ))
    }
}

/// Read a vacuum wavelength in nanometres and report optical frequency in Hz.
#[derive(Debug, Clone)]
pub struct WavelengthToFrequency {
    source: String,
}

impl WavelengthToFrequency {
    /// Tag every sample with `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// `c / λ` for `λ` in nm. Non-positive wavelengths are a bad signal.
    pub fn nm_to_hz(wavelength_nm: f64) -> Result<f64, DeviceError> {
        if !(wavelength_nm.is_finite() && wavelength_nm > 0.0) {
            return Err(DeviceError::BadSignal);
        }
        Ok(SPEED_OF_LIGHT / (wavelength_nm * 1e-9))
    }
}

#[async_trait]
impl PollingStrategy for WavelengthToFrequency {
    async fn acquire(&self, device: &dyn ScalarSource) -> Result<SamplePoint, DeviceError> {
        let reading = device.read_scalar().await?;
        let hz = Self::nm_to_hz(reading.value)?;
        Ok(SamplePoint::new(reading.timestamp_ms, hz, self.source.clone()))
    }
}

// =============================================================================
// Callback strategies
// =============================================================================

/// Accept frequency events on selected channels.
///
/// The event's integer payload is the device timestamp and the floating
/// payload the frequency. Wavelength and unknown events are dropped.
#[derive(Debug, Clone)]
pub struct FrequencyEvents {
    channels: Vec<u8>,
    source: String,
}

impl FrequencyEvents {
    /// Accept frequency events from `channels`.
    pub fn new(channels: impl Into<Vec<u8>>, source: impl Into<String>) -> Self {
        Self {
            channels: channels.into(),
            source: source.into(),
        }
    }
}

impl CallbackStrategy for FrequencyEvents {
    fn convert(&self, event: &DeviceEvent) -> Option<SamplePoint> {
        match event.kind {
            EventKind::Frequency { channel } if self.channels.contains(&channel) => {
                Some(event_point(event, event.dbl_value, &self.source))
            }
            _ => None,
        }
    }
}

/// Accept wavelength events (nm) on one channel and report frequency in Hz.
///
/// A non-physical wavelength is dropped like an unrecognised event.
#[derive(Debug, Clone)]
pub struct WavelengthEvents {
    channel: u8,
    source: String,
}

impl WavelengthEvents {
    /// Accept wavelength events from `channel`.
    pub fn new(channel: u8, source: impl Into<String>) -> Self {
        Self {
            channel,
            source: source.into(),
        }
    }
}

impl CallbackStrategy for WavelengthEvents {
    fn convert(&self, event: &DeviceEvent) -> Option<SamplePoint> {
        match event.kind {
            EventKind::Wavelength { channel } if channel == self.channel => {
                let hz = WavelengthToFrequency::nm_to_hz(event.dbl_value).ok()?;
                Some(event_point(event, hz, &self.source))
            }
            _ => None,
        }
    }
}

/// Accept intensity events on one analog input channel.
#[derive(Debug, Clone)]
pub struct IntensityEvents {
    channel: u8,
    source: String,
}

impl IntensityEvents {
    /// Accept intensity events from `channel`.
    pub fn new(channel: u8, source: impl Into<String>) -> Self {
        Self {
            channel,
            source: source.into(),
        }
    }
}

impl CallbackStrategy for IntensityEvents {
    fn convert(&self, event: &DeviceEvent) -> Option<SamplePoint> {
        match event.kind {
            EventKind::Intensity { channel } if channel == self.channel => {
                Some(event_point(event, event.dbl_value, &self.source))
            }
            _ => None,
        }
    }
}

// Negative device timestamps are clamped to zero.
fn event_point(event: &DeviceEvent, value: f64, source: &str) -> SamplePoint {
    let timestamp_ms = u64::try_from(event.int_value).unwrap_or(0);
    SamplePoint::new(timestamp_ms, value, source)
}
