//! Merge and validation of one step's measurements.
//!
//! The gate pairs the analyzer's intensity summary with the controller's
//! frequency summary and decides whether the step is usable. A rejected step
//! is a normal outcome (`valid == false` plus a reason), not an error. Only a
//! pairing mistake, such as summaries from different steps, is an error.

use crate::error::ProtocolViolation;
use crate::measurement::{ChannelSummary, Quantity};
use serde::{Deserialize, Serialize};

/// Strict upper bounds on window standard deviation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityThresholds {
    /// Hz
    pub freq_stddev: f64,
    /// V
    pub intensity_stddev: f64,
}

/// Combined measurement of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step this result belongs to.
    pub step_index: u32,
    /// Mean frequency in Hz.
    pub avg_frequency: f64,
    /// Frequency standard deviation in Hz.
    pub freq_stddev: f64,
    /// Mean intensity in V.
    pub avg_intensity: f64,
    /// Intensity standard deviation in V.
    pub intensity_stddev: f64,
    /// Frequency samples in the window.
    pub n_freq_samples: u32,
    /// Intensity samples in the window.
    pub n_intensity_samples: u32,
    /// Both channels were stable and non-empty.
    pub valid: bool,
    /// Why the step was rejected; `None` when valid.
    pub reason: Option<String>,
}

/// Applies [`StabilityThresholds`] to paired channel summaries.
#[derive(Debug, Clone, Copy)]
pub struct ValidationGate {
    thresholds: StabilityThresholds,
}

impl ValidationGate {
    /// Gate with the given thresholds.
    pub fn new(thresholds: StabilityThresholds) -> Self {
        Self { thresholds }
    }

    /// Thresholds in use.
    pub fn thresholds(&self) -> StabilityThresholds {
        self.thresholds
    }

    /// Merge `intensity` and `frequency` for one step.
    ///
    /// A channel with zero samples is never stable, whatever its stddev
    /// field holds.
    ///
    /// # Errors
    /// - `ProtocolViolation::StepMismatch` if the summaries name different steps
    /// - `ProtocolViolation::QuantityMismatch` if either summary measures the
    ///   wrong quantity
    pub fn evaluate(
        &self,
        intensity: &ChannelSummary,
        frequency: &ChannelSummary,
    ) -> Result<StepResult, ProtocolViolation> {
        if intensity.quantity != Quantity::Intensity || frequency.quantity != Quantity::Frequency {
            return Err(ProtocolViolation::QuantityMismatch);
        }
        if intensity.step_index != frequency.step_index {
            return Err(ProtocolViolation::StepMismatch {
                expected: frequency.step_index,
                got: intensity.step_index,
            });
        }

        let reason = if frequency.n_samples == 0 {
            Some("no frequency samples".to_string())
        } else if intensity.n_samples == 0 {
            Some("no intensity samples".to_string())
        } else {
            let freq_ok = frequency.is_stable(self.thresholds.freq_stddev);
            let intensity_ok = intensity.is_stable(self.thresholds.intensity_stddev);
            match (freq_ok, intensity_ok) {
                (true, true) => None,
                (false, true) => Some("frequency unstable".to_string()),
                (true, false) => Some("intensity unstable".to_string()),
                (false, false) => Some("frequency and intensity unstable".to_string()),
            }
        };

        Ok(StepResult {
            step_index: frequency.step_index,
            avg_frequency: frequency.mean,
            freq_stddev: frequency.stddev,
            avg_intensity: intensity.mean,
            intensity_stddev: intensity.stddev,
            n_freq_samples: frequency.n_samples,
            n_intensity_samples: intensity.n_samples,
            valid: reason.is_none(),
            reason,
        })
    }
}
