//! Step planning, validation and the retry ledger.

pub mod gate;
pub mod points;
pub mod report;
pub mod retry_ledger;
pub mod runner;
pub mod step_queue;

pub use gate::{StabilityThresholds, StepResult, ValidationGate};
pub use report::ScanReport;
pub use retry_ledger::{FailedStep, RetryLedger};
pub use runner::ScanRunner;
pub use step_queue::{ScanStep, StepQueue};
