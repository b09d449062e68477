//! Forward-only queue of scan steps.
//!
//! A `StepQueue` is consumed as it is iterated. Repeating a pass means
//! building a new queue, typically from the retry ledger.

use crate::error::{AppResult, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One voltage setpoint of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanStep {
    /// Unique within one queue.
    pub step_index: u32,
    /// Setpoint in volts.
    pub voltage: f64,
}

impl ScanStep {
    /// Step `step_index` at `voltage` volts.
    pub fn new(step_index: u32, voltage: f64) -> Self {
        Self {
            step_index,
            voltage,
        }
    }
}

/// Ordered, finite, single-pass sequence of [`ScanStep`]s.
///
/// Iteration order is insertion order, never voltage order.
#[derive(Debug)]
pub struct StepQueue {
    steps: std::vec::IntoIter<ScanStep>,
}

impl StepQueue {
    /// Build a queue, rejecting duplicate indices and non-finite voltages.
    pub fn new(steps: Vec<ScanStep>) -> AppResult<Self> {
        let mut seen = HashSet::with_capacity(steps.len());
        for step in &steps {
            if !seen.insert(step.step_index) {
                return Err(ScanError::Configuration(format!(
                    "duplicate step index {}",
                    step.step_index
                )));
            }
            if !step.voltage.is_finite() {
                return Err(ScanError::Configuration(format!(
                    "step {} has non-finite voltage",
                    step.step_index
                )));
            }
        }
        Ok(Self {
            steps: steps.into_iter(),
        })
    }

    /// `n` evenly spaced setpoints from `start` to `stop` inclusive,
    /// indexed from zero.
    pub fn linear(start: f64, stop: f64, n: u32) -> AppResult<Self> {
        if !(start.is_finite() && stop.is_finite()) {
            return Err(ScanError::Configuration(
                "ramp bounds must be finite".to_string(),
            ));
        }
        let steps = (0..n)
            .map(|i| {
                let voltage = if n == 1 {
                    start
                } else {
                    start + (stop - start) * f64::from(i) / f64::from(n - 1)
                };
                ScanStep::new(i, voltage)
            })
            .collect();
        Self::new(steps)
    }

    /// Steps not yet yielded.
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    /// Remaining steps without consuming them.
    pub fn pending(&self) -> &[ScanStep] {
        self.steps.as_slice()
    }
}

impl Iterator for StepQueue {
    type Item = ScanStep;

    fn next(&mut self) -> Option<ScanStep> {
        self.steps.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.steps.size_hint()
    }
}

impl ExactSizeIterator for StepQueue {}
