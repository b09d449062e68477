//! Measurement primitives shared by both nodes.
//!
//! A [`SamplePoint`] is one timestamped scalar reading. Timestamps come from
//! the producing device's own monotonic clock, so two points from different
//! nodes are never compared by timestamp; queue order is their identity.
//! [`SampleStats`] reduces an acquisition window to mean / stddev / count and
//! [`ChannelSummary`] tags that reduction with a step index and quantity so
//! it can travel in a `FIN` message and feed the validation gate.

use serde::{Deserialize, Serialize};

/// One timestamped scalar reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Milliseconds on the producing device's monotonic clock.
    pub timestamp_ms: u64,
    /// Measured value in the quantity's native unit.
    pub value: f64,
    /// Provenance tag (device or strategy name).
    pub source: String,
}

impl SamplePoint {
    /// Create a sample point.
    pub fn new(timestamp_ms: u64, value: f64, source: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            value,
            source: source.into(),
        }
    }
}

/// Physical quantity a channel measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Quantity {
    /// Optical frequency in Hz.
    Frequency = 0,
    /// Photodiode intensity in volts.
    Intensity = 1,
}

impl Quantity {
    /// Decode the wire representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Quantity::Frequency),
            1 => Some(Quantity::Intensity),
            _ => None,
        }
    }

    /// Lower-case name used in log fields and ledger reasons.
    pub fn label(self) -> &'static str {
        match self {
            Quantity::Frequency => "frequency",
            Quantity::Intensity => "intensity",
        }
    }
}

/// Mean, population standard deviation and count over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    /// Arithmetic mean, NaN when `n == 0`.
    pub mean: f64,
    /// Population standard deviation (ddof = 0), NaN when `n == 0`.
    pub stddev: f64,
    /// Number of samples.
    pub n: u32,
}

impl SampleStats {
    /// Statistics of an empty window. Both moments are undefined.
    pub fn empty() -> Self {
        Self {
            mean: f64::NAN,
            stddev: f64::NAN,
            n: 0,
        }
    }

    /// Reduce a window of samples.
    pub fn from_samples(samples: &[SamplePoint]) -> Self {
        Self::from_values(samples.iter().map(|p| p.value))
    }

    /// Reduce raw values with Welford's update.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut n: u32 = 0;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for value in values {
            n += 1;
            let delta = value - mean;
            mean += delta / f64::from(n);
            m2 += delta * (value - mean);
        }
        if n == 0 {
            return Self::empty();
        }
        Self {
            mean,
            stddev: (m2 / f64::from(n)).sqrt(),
            n,
        }
    }

    /// Whether at least one sample was taken.
    pub fn has_samples(&self) -> bool {
        self.n > 0
    }
}

/// Reduced measurement of one quantity for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// Step this window belongs to.
    pub step_index: u32,
    /// Which quantity was measured.
    pub quantity: Quantity,
    /// Window mean.
    pub mean: f64,
    /// Window population standard deviation.
    pub stddev: f64,
    /// Samples in the window.
    pub n_samples: u32,
}

impl ChannelSummary {
    /// Tag window statistics with their step and quantity.
    pub fn from_stats(step_index: u32, quantity: Quantity, stats: SampleStats) -> Self {
        Self {
            step_index,
            quantity,
            mean: stats.mean,
            stddev: stats.stddev,
            n_samples: stats.n,
        }
    }

    /// Whether the stddev is under `threshold` with at least one sample.
    pub fn is_stable(&self, threshold: f64) -> bool {
        self.n_samples > 0 && self.stddev < threshold
    }
}
