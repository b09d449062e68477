//! Scan point files.
//!
//! A scan point file is a CSV with a `step_index,voltage` header and one
//! step per row.

use super::step_queue::{ScanStep, StepQueue};
use crate::error::{AppResult, ScanError};
use std::path::Path;

/// Read every row of `path` into a [`StepQueue`].
pub fn load_csv(path: impl AsRef<Path>) -> AppResult<StepQueue> {
    let path = path.as_ref();
    let to_error = |source: csv::Error| ScanError::ScanPoints {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(to_error)?;
    let steps = reader
        .deserialize::<ScanStep>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(to_error)?;
    StepQueue::new(steps)
}

/// Write `steps` in the format [`load_csv`] reads.
pub fn write_csv(path: impl AsRef<Path>, steps: &[ScanStep]) -> AppResult<()> {
    let path = path.as_ref();
    let to_error = |source: csv::Error| ScanError::ScanPoints {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(to_error)?;
    for step in steps {
        writer.serialize(step).map_err(to_error)?;
    }
    writer.flush()?;
    Ok(())
}
