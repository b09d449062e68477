//! # Spectro Scan
//!
//! Coordination of a stepped laser-spectroscopy scan across two nodes:
//!
//! - the **controller** sets the laser tuning voltage, samples the
//!   frequency reference, and drives the per-step handshake;
//! - the **analyzer** samples detector intensity when triggered and reports
//!   a summary back.
//!
//! ## Crate Structure
//!
//! - **`scan`**: step planning ([`scan::StepQueue`]), the validation gate,
//!   the retry ledger and the pass runner.
//! - **`network`**: wire protocol, framed link, per-step session state
//!   machine and the controller and analyzer drivers.
//! - **`acquisition`**: interval and event-driven sample schedulers.
//! - **`hardware`**: device capability traits and simulated devices.
//! - **`measurement`**: samples and window statistics.
//! - **`config`**: layered configuration (TOML + environment).
//! - **`error`**: the crate-wide [`error::ScanError`].
//! - **`tracing_setup`**: subscriber installation.
//! - **`validation`**: small checks used by configuration validation.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod network;
pub mod scan;
pub mod tracing_setup;
pub mod validation;

pub use error::{AppResult, ScanError};
