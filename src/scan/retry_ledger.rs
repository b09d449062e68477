//! Durable record of failed steps.
//!
//! The ledger file is JSON Lines: one `{"step_index","voltage","reason"}`
//! object per line, in record order. `persist` writes a temporary file in
//! the destination directory, syncs it and renames it over the target, so a
//! crash mid-write leaves either the old file or the new one, never a mix.
//!
//! Records are append-only and never deduplicated on write. A file that
//! accumulated several passes can hold the same step more than once;
//! [`RetryLedger::replay_queue`] keeps the most recent reason per step.

use super::step_queue::{ScanStep, StepQueue};
use crate::error::{AppResult, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// One failed step and why it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
    /// Index of the failed step.
    pub step_index: u32,
    /// Commanded setpoint.
    pub voltage: f64,
    /// Failure reason.
    pub reason: String,
}

impl FailedStep {
    /// The step to re-run.
    pub fn step(&self) -> ScanStep {
        ScanStep::new(self.step_index, self.voltage)
    }
}

/// Append-only list of [`FailedStep`]s for one pass.
#[derive(Debug, Clone, Default)]
pub struct RetryLedger {
    entries: Vec<FailedStep>,
}

impl RetryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure.
    pub fn record(&mut self, step_index: u32, voltage: f64, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(step_index, voltage, reason = %reason, "step recorded for retry");
        self.entries.push(FailedStep {
            step_index,
            voltage,
            reason,
        });
    }

    /// Failures in recording order.
    pub fn entries(&self) -> &[FailedStep] {
        &self.entries
    }

    /// Number of recorded failures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No failures recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every entry to `path`, atomically replacing any previous file.
    ///
    /// Unchanged contents always produce byte-identical files.
    pub fn persist(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        let to_error = |source: std::io::Error| ScanError::Persistence {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir).map_err(to_error)?;
        for entry in &self.entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| to_error(std::io::Error::new(ErrorKind::InvalidData, e)))?;
            tmp.write_all(line.as_bytes()).map_err(to_error)?;
            tmp.write_all(b"\n").map_err(to_error)?;
        }
        tmp.flush().map_err(to_error)?;
        tmp.as_file().sync_all().map_err(to_error)?;
        tmp.persist(path).map_err(|e| to_error(e.error))?;

        info!(path = %path.display(), entries = self.entries.len(), "retry ledger persisted");
        Ok(())
    }

    /// Read a ledger file. A missing file is an empty ledger.
    ///
    /// # Errors
    /// - `ScanError::LedgerFormat` with the one-based line of the first bad record
    /// - `ScanError::Persistence` if the file exists but cannot be read
    pub fn load(path: impl AsRef<Path>) -> AppResult<Vec<FailedStep>> {
        let path = path.as_ref();
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no retry ledger, nothing to replay");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ScanError::Persistence {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut entries = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| ScanError::Persistence {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry =
                serde_json::from_str(&line).map_err(|source| ScanError::LedgerFormat {
                    path: path.to_path_buf(),
                    line: n + 1,
                    source,
                })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Queue of steps to re-run: one per step index, in first-seen order,
    /// with the voltage of its most recent record.
    pub fn replay_queue(entries: &[FailedStep]) -> AppResult<StepQueue> {
        let mut order: Vec<u32> = Vec::new();
        let mut latest: HashMap<u32, &FailedStep> = HashMap::new();
        for entry in entries {
            if latest.insert(entry.step_index, entry).is_none() {
                order.push(entry.step_index);
            }
        }
        let steps = order
            .iter()
            .filter_map(|index| latest.get(index).map(|entry| entry.step()))
            .collect();
        StepQueue::new(steps)
    }

    /// Most recent reason recorded for each step index.
    pub fn latest_reasons(entries: &[FailedStep]) -> HashMap<u32, &str> {
        entries
            .iter()
            .map(|entry| (entry.step_index, entry.reason.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = RetryLedger::load(dir.path().join("absent.jsonl")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn format_is_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = RetryLedger::new();
        ledger.record(0, 1.5, "intensity unstable");
        ledger.persist(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "{\"step_index\":0,\"voltage\":1.5,\"reason\":\"intensity unstable\"}\n"
        );
    }

    #[test]
    fn round_trip_preserves_order_and_values_and_persist_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = RetryLedger::new();
        ledger.record(3, -0.25, "intensity unstable");
        ledger.record(0, 0.125, "protocol-timeout");
        ledger.record(3, -0.25, "frequency and intensity unstable");
        ledger.record(7, 9.75, "actuation: rejected \"set 12 V\"\nlimit 10 V");
        ledger.record(1, 0.0, "session-aborted: Connection lost: peer reset\tafter ARM");

        ledger.persist(&path).unwrap();
        let first = fs::read(&path).unwrap();
        ledger.persist(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
        assert_eq!(first.iter().filter(|&&b| b == b'\n').count(), 5);

        let loaded = RetryLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger.entries());
    }

    #[test]
    fn corrupt_line_is_reported_with_its_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        fs::write(
            &path,
            "{\"step_index\":0,\"voltage\":1.0,\"reason\":\"x\"}\n\nnot json\n",
        )
        .unwrap();
        match RetryLedger::load(&path) {
            Err(ScanError::LedgerFormat { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unwritable_directory_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("ledger.jsonl");
        let mut ledger = RetryLedger::new();
        ledger.record(1, 0.0, "protocol-timeout");
        assert!(matches!(
            ledger.persist(&path),
            Err(ScanError::Persistence { .. })
        ));
    }

    #[test]
    fn failed_persist_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let mut ledger = RetryLedger::new();
        ledger.record(1, 0.0, "protocol-timeout");
        ledger.persist(&path).unwrap();
        let before = fs::read(&path).unwrap();

        // A directory squatting on the target makes the final rename fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), b"x").unwrap();
        ledger.record(2, 0.5, "intensity unstable");
        assert!(ledger.persist(&blocked).is_err());

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn replay_dedupes_keeping_latest_record() {
        let entries = vec![
            FailedStep {
                step_index: 4,
                voltage: 0.4,
                reason: "intensity unstable".into(),
            },
            FailedStep {
                step_index: 2,
                voltage: 0.2,
                reason: "protocol-timeout".into(),
            },
            FailedStep {
                step_index: 4,
                voltage: 0.4,
                reason: "frequency unstable".into(),
            },
        ];
        let steps: Vec<ScanStep> = RetryLedger::replay_queue(&entries).unwrap().collect();
        assert_eq!(steps, vec![ScanStep::new(4, 0.4), ScanStep::new(2, 0.2)]);
        assert_eq!(
            RetryLedger::latest_reasons(&entries).get(&4),
            Some(&"frequency unstable")
        );
    }
}
