//! Scan passes over a [`StepQueue`].
//!
//! A pass runs every step through the controller handshake, gates the
//! result, and records every step that did not yield a valid measurement in
//! a [`RetryLedger`]. The ledger is persisted when the pass ends, including
//! when a session-ending error cuts it short. In that case the step in
//! flight and every step not yet attempted are recorded as
//! `session-aborted: <cause>` before the error is returned.

use super::gate::ValidationGate;
use super::report::ScanReport;
use super::retry_ledger::RetryLedger;
use super::step_queue::{ScanStep, StepQueue};
use crate::error::{AppResult, ScanError};
use crate::network::{ControllerSession, MessageKind, StepOutcome};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

/// Drives scan passes and owns the retry ledger location.
pub struct ScanRunner<S> {
    session: ControllerSession<S>,
    gate: ValidationGate,
    ledger_path: PathBuf,
}

impl<S> ScanRunner<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Drive `session`, judge steps with `gate` and persist failures to `ledger_path`.
    pub fn new(
        session: ControllerSession<S>,
        gate: ValidationGate,
        ledger_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            gate,
            ledger_path: ledger_path.into(),
        }
    }

    /// Where failed steps are written.
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Run every step of `queue` once.
    ///
    /// `retry` marks the STEP commands of a ledger replay.
    ///
    /// # Errors
    /// A protocol violation or lost connection ends the pass after the
    /// ledger has been written. A ledger that cannot be written is also an
    /// error, since the failures would otherwise be lost.
    pub async fn run_pass(&mut self, queue: StepQueue, retry: bool) -> AppResult<ScanReport> {
        let ledger_path = self.ledger_path.clone();
        self.run_pass_into(queue, retry, &ledger_path).await
    }

    /// Replay the steps recorded in the ledger file at `path`.
    ///
    /// The file is rewritten with only the steps that still fail.
    pub async fn rerun_failed(&mut self, path: impl AsRef<Path>) -> AppResult<ScanReport> {
        let path = path.as_ref();
        let entries = RetryLedger::load(path)?;
        if entries.is_empty() {
            info!(path = %path.display(), "retry ledger is empty, nothing to rerun");
            let mut report = ScanReport::new(self.session.session_id(), true);
            report.finish();
            return Ok(report);
        }
        let queue = RetryLedger::replay_queue(&entries)?;
        info!(path = %path.display(), steps = queue.remaining(), "re-running failed steps");
        let mut by_reason: BTreeMap<&str, usize> = BTreeMap::new();
        for reason in RetryLedger::latest_reasons(&entries).into_values() {
            *by_reason.entry(reason).or_default() += 1;
        }
        for (reason, steps) in by_reason {
            debug!(reason, steps, "previous failures");
        }
        self.run_pass_into(queue, true, path).await
    }

    async fn run_pass_into(
        &mut self,
        mut queue: StepQueue,
        retry: bool,
        ledger_path: &Path,
    ) -> AppResult<ScanReport> {
        let mut report = ScanReport::new(self.session.session_id(), retry);
        let mut ledger = RetryLedger::new();
        info!(
            session_id = %report.session_id,
            steps = queue.remaining(),
            retry,
            "scan pass started"
        );

        while let Some(step) = queue.next() {
            let outcome = self.session.run_step(step, retry).await;
            let err = match outcome {
                Ok(StepOutcome::Measured(measurement)) => {
                    match self.gate.evaluate(&measurement.remote.summary, &measurement.local) {
                        Ok(result) => {
                            if let Some(reason) = &result.reason {
                                info!(step_index = step.step_index, reason = %reason, "step rejected");
                                ledger.record(step.step_index, step.voltage, reason.clone());
                            }
                            report.results.push(result);
                            continue;
                        }
                        Err(violation) => ScanError::from(violation),
                    }
                }
                Ok(StepOutcome::TimedOut { phase }) => {
                    let attempts = match phase {
                        MessageKind::Step | MessageKind::Arm | MessageKind::Trig => {
                            self.session.settings().max_retries + 1
                        }
                        _ => 1,
                    };
                    let timeout = ScanError::Timeout { phase, attempts };
                    warn!(step_index = step.step_index, error = %timeout, "step escalated");
                    ledger.record(step.step_index, step.voltage, timeout.ledger_reason());
                    continue;
                }
                Ok(StepOutcome::ActuationFailed(reason)) => {
                    ledger.record(step.step_index, step.voltage, reason);
                    continue;
                }
                Err(err) => err,
            };

            return Err(abort(err, step, &queue, ledger, ledger_path));
        }

        ledger.persist(ledger_path)?;
        report.failures = ledger.entries().to_vec();
        report.finish();
        info!(
            accepted = report.accepted(),
            failed = report.failed_steps(),
            "scan pass finished"
        );
        Ok(report)
    }
}

fn abort(
    err: ScanError,
    step: ScanStep,
    queue: &StepQueue,
    mut ledger: RetryLedger,
    ledger_path: &Path,
) -> ScanError {
    let reason = err.ledger_reason();
    error!(error = %err, step_index = step.step_index, remaining = queue.remaining(), "scan session aborted");
    ledger.record(step.step_index, step.voltage, reason.clone());
    for pending in queue.pending() {
        ledger.record(pending.step_index, pending.voltage, reason.clone());
    }
    if let Err(persist_err) = ledger.persist(ledger_path) {
        error!(error = %persist_err, "retry ledger could not be written after abort");
    }
    err
}
