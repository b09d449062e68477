//! Outcome of one scan pass.

use super::gate::StepResult;
use super::retry_ledger::FailedStep;
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

/// Every measured step and every failure of a pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Controller session that produced the pass.
    pub session_id: Uuid,
    /// When the pass began.
    pub started_at: DateTime<Utc>,
    /// When the pass ended, `None` while running.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether this pass replayed a retry ledger.
    pub retry_pass: bool,
    /// Gate output for every step that produced measurements, valid or not.
    pub results: Vec<StepResult>,
    /// Everything recorded in the ledger during this pass.
    pub failures: Vec<FailedStep>,
}

impl ScanReport {
    /// Empty report starting now.
    pub fn new(session_id: Uuid, retry_pass: bool) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            finished_at: None,
            retry_pass,
            results: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Stamp the finish time.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Steps that passed the gate.
    pub fn accepted(&self) -> usize {
        self.results.iter().filter(|r| r.valid).count()
    }

    /// Distinct steps that ended up in the ledger.
    pub fn failed_steps(&self) -> usize {
        self.failures
            .iter()
            .map(|f| f.step_index)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Fold a rerun pass into this one. Results and failures for every step
    /// the rerun attempted are replaced by the rerun's.
    pub fn merge_rerun(&mut self, rerun: ScanReport) {
        let attempted: HashSet<u32> = rerun
            .results
            .iter()
            .map(|r| r.step_index)
            .chain(rerun.failures.iter().map(|f| f.step_index))
            .collect();

        self.results.retain(|r| !attempted.contains(&r.step_index));
        self.failures.retain(|f| !attempted.contains(&f.step_index));
        self.results.extend(rerun.results);
        self.failures.extend(rerun.failures);
        self.results.sort_by_key(|r| r.step_index);
        if rerun.finished_at > self.finished_at {
            self.finished_at = rerun.finished_at;
        }
    }

    /// Fold this rerun into the results a previous pass wrote to `path`.
    ///
    /// The CSV holds gate results only, so failures come from this rerun
    /// alone. A missing file leaves the rerun as it is.
    pub fn onto_previous_results(self, path: impl AsRef<Path>) -> AppResult<ScanReport> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(self);
        }
        let mut merged = ScanReport {
            session_id: self.session_id,
            started_at: self.started_at,
            finished_at: None,
            retry_pass: self.retry_pass,
            results: Self::read_results_csv(path)?,
            failures: Vec::new(),
        };
        merged.merge_rerun(self);
        Ok(merged)
    }

    /// Read rows written by [`ScanReport::write_results_csv`].
    pub fn read_results_csv(path: impl AsRef<Path>) -> AppResult<Vec<StepResult>> {
        let mut reader = csv::Reader::from_path(path).map_err(std::io::Error::from)?;
        let mut results = Vec::new();
        for row in reader.deserialize::<CsvRecord>() {
            results.push(row.map_err(std::io::Error::from)?.into());
        }
        Ok(results)
    }

    /// Write the gate results as CSV, one row per step.
    pub fn write_results_csv(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path).map_err(std::io::Error::from)?;
        for result in &self.results {
            writer
                .serialize(CsvRow::from(result))
                .map_err(std::io::Error::from)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    step_index: u32,
    avg_frequency: f64,
    freq_stddev: f64,
    avg_intensity: f64,
    intensity_stddev: f64,
    n_freq_samples: u32,
    n_intensity_samples: u32,
    valid: bool,
    reason: &'a str,
}

impl<'a> From<&'a StepResult> for CsvRow<'a> {
    fn from(r: &'a StepResult) -> Self {
        Self {
            step_index: r.step_index,
            avg_frequency: r.avg_frequency,
            freq_stddev: r.freq_stddev,
            avg_intensity: r.avg_intensity,
            intensity_stddev: r.intensity_stddev,
            n_freq_samples: r.n_freq_samples,
            n_intensity_samples: r.n_intensity_samples,
            valid: r.valid,
            reason: r.reason.as_deref().unwrap_or(""),
        }
    }
}

#[derive(Deserialize)]
struct CsvRecord {
    step_index: u32,
    avg_frequency: f64,
    freq_stddev: f64,
    avg_intensity: f64,
    intensity_stddev: f64,
    n_freq_samples: u32,
    n_intensity_samples: u32,
    valid: bool,
    reason: String,
}

impl From<CsvRecord> for StepResult {
    fn from(r: CsvRecord) -> Self {
        Self {
            step_index: r.step_index,
            avg_frequency: r.avg_frequency,
            freq_stddev: r.freq_stddev,
            avg_intensity: r.avg_intensity,
            intensity_stddev: r.intensity_stddev,
            n_freq_samples: r.n_freq_samples,
            n_intensity_samples: r.n_intensity_samples,
            valid: r.valid,
            reason: (!r.reason.is_empty()).then_some(r.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(step_index: u32, valid: bool) -> StepResult {
        StepResult {
            step_index,
            avg_frequency: 1.0,
            freq_stddev: 0.0,
            avg_intensity: 1.0,
            intensity_stddev: 0.0,
            n_freq_samples: 10,
            n_intensity_samples: 10,
            valid,
            reason: (!valid).then(|| "intensity unstable".to_string()),
        }
    }

    fn failure(step_index: u32, reason: &str) -> FailedStep {
        FailedStep {
            step_index,
            voltage: step_index as f64,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn rerun_replaces_attempted_steps_only() {
        let mut first = ScanReport::new(Uuid::new_v4(), false);
        first.results = vec![result(0, false), result(1, true), result(2, false)];
        first.failures = vec![
            failure(0, "intensity unstable"),
            failure(2, "intensity unstable"),
            failure(3, "protocol-timeout"),
        ];

        let mut rerun = ScanReport::new(Uuid::new_v4(), true);
        rerun.results = vec![result(0, true), result(2, false)];
        rerun.failures = vec![failure(2, "frequency unstable")];
        rerun.finish();

        first.merge_rerun(rerun);
        assert_eq!(first.accepted(), 2);
        assert_eq!(
            first.results.iter().map(|r| r.step_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let reasons: Vec<(u32, &str)> = first
            .failures
            .iter()
            .map(|f| (f.step_index, f.reason.as_str()))
            .collect();
        assert_eq!(reasons, vec![(3, "protocol-timeout"), (2, "frequency unstable")]);
        assert_eq!(first.failed_steps(), 2);
        assert!(first.finished_at.is_some());
    }

    #[test]
    fn results_csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let mut report = ScanReport::new(Uuid::new_v4(), false);
        report.results = vec![result(0, true), result(1, false)];
        report.write_results_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("step_index,avg_frequency"));
        assert_eq!(lines.count(), 2);
        assert!(text.contains("intensity unstable"));
    }

    #[test]
    fn rerun_is_folded_onto_previous_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let mut first = ScanReport::new(Uuid::new_v4(), false);
        first.results = vec![result(0, true), result(1, false), result(2, false)];
        first.write_results_csv(&path).unwrap();
        assert_eq!(ScanReport::read_results_csv(&path).unwrap(), first.results);

        let mut rerun = ScanReport::new(Uuid::new_v4(), true);
        rerun.results = vec![result(1, true), result(2, false)];
        rerun.failures = vec![failure(2, "intensity unstable")];
        rerun.finish();
        let rerun_id = rerun.session_id;

        let merged = rerun.onto_previous_results(&path).unwrap();
        assert_eq!(merged.session_id, rerun_id);
        assert!(merged.retry_pass);
        assert_eq!(merged.accepted(), 2);
        assert_eq!(
            merged.results.iter().map(|r| (r.step_index, r.valid)).collect::<Vec<_>>(),
            vec![(0, true), (1, true), (2, false)]
        );
        assert_eq!(merged.failed_steps(), 1);
        assert!(merged.finished_at.is_some());
    }

    #[test]
    fn missing_previous_results_keep_the_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut rerun = ScanReport::new(Uuid::new_v4(), true);
        rerun.results = vec![result(4, true)];
        let merged = rerun
            .onto_previous_results(dir.path().join("absent.csv"))
            .unwrap();
        assert_eq!(merged.results.len(), 1);
    }
}
