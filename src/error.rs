//! Custom error types for the scan coordination layer.
//!
//! This module defines the primary error type, `ScanError`, together with the
//! narrower enums it wraps. Using the `thiserror` crate, it gives every layer a
//! consistent way to report failures, from device reads up to the handshake
//! driver.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceError`**: signal states and reachability problems reported by a
//!   device. Inside an acquisition loop these are logged and the sample is
//!   skipped; they only surface as `ScanError::Device` when an actuation call
//!   fails.
//! - **`ProtocolViolation`**: malformed frames, step index mismatches, or a
//!   message that is not legal in the current session state. Fatal to the
//!   session and never retried automatically.
//! - **`ScanError::Timeout`**: no reply within the bounded wait. The controller
//!   driver converts exhausted retries into a step-level failure instead of
//!   returning this variant.
//! - **`ScanError::Persistence` / `ScanError::LedgerFormat`**: retry ledger
//!   read or write failures, always surfaced to the operator.
//!
//! A stability rejection is not an error at all: it is a `StepResult` with
//! `valid == false`.

use crate::network::protocol::MessageKind;
use crate::network::session::SessionState;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Failure reported by a physical (or simulated) device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The measurement server is not running.
    #[error("device inactive")]
    Inactive,

    /// The wavemeter sees no light.
    #[error("no signal")]
    NoSignal,

    /// The interferogram could not be evaluated.
    #[error("bad signal")]
    BadSignal,

    /// Exposure is too short for a reading.
    #[error("signal too low")]
    LowSignal,

    /// The detector is saturated.
    #[error("signal too high")]
    HighSignal,

    /// The device could not be contacted.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// A voltage beyond the output limit was requested.
    #[error("requested {requested} V exceeds the ±{limit} V output limit")]
    OutOfRange {
        /// Voltage that was requested.
        requested: f64,
        /// Configured absolute limit.
        limit: f64,
    },

    /// A ramp rate outside the accepted range was requested.
    #[error("ramp rate {requested} V/s is outside (0, {max}] V/s")]
    RateExceeded {
        /// Ramp rate that was requested.
        requested: f64,
        /// Largest rate the output accepts.
        max: f64,
    },
}

impl DeviceError {
    /// Signal-quality failures are expected during normal operation and are
    /// logged at a lower severity than connectivity problems.
    pub fn is_signal_state(&self) -> bool {
        matches!(
            self,
            DeviceError::NoSignal
                | DeviceError::BadSignal
                | DeviceError::LowSignal
                | DeviceError::HighSignal
        )
    }
}

/// Frame-level decode failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame does not start with the protocol magic.
    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    /// The peer speaks another protocol version.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// The kind byte names no known message.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Kind and class bytes disagree.
    #[error("message kind {kind} does not belong to class {class}")]
    ClassMismatch {
        /// Raw kind byte.
        kind: u8,
        /// Raw class byte.
        class: u8,
    },

    /// The payload is shorter than its fields.
    #[error("truncated payload: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required by the known fields.
        need: usize,
        /// Bytes actually present.
        have: usize,
    },

    /// The declared payload exceeds the frame limit.
    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    /// A field decoded to an impossible value.
    #[error("invalid field value: {0}")]
    InvalidField(&'static str),
}

/// A breach of the handshake contract.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    /// A frame could not be decoded.
    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// A message carried the wrong step index.
    #[error("step index mismatch: expected {expected}, got {got}")]
    StepMismatch {
        /// Index the receiver is working on.
        expected: u32,
        /// Index carried by the message.
        got: u32,
    },

    /// A message arrived that the current state does not accept.
    #[error("unexpected {kind:?} message in state {state:?}")]
    UnexpectedMessage {
        /// Session state when the message arrived.
        state: SessionState,
        /// Kind of the offending message.
        kind: MessageKind,
    },

    /// The session state machine rejected an event.
    #[error("invalid transition from {from:?} on {event}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: SessionState,
        /// Name of the event that was rejected.
        event: &'static str,
    },

    /// FIN summaries were not one intensity and one frequency channel.
    #[error("channel summaries do not cover intensity and frequency")]
    QuantityMismatch,
}

/// Top-level error for scan coordination.
#[derive(Error, Debug)]
pub enum ScanError {
    /// A device failed.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The peer broke the handshake.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// No reply arrived within the retry budget.
    #[error("Timed out waiting for reply to {phase:?} after {attempts} attempts")]
    Timeout {
        /// Message whose reply never arrived.
        phase: MessageKind,
        /// Number of sends made.
        attempts: u32,
    },

    /// The link to the peer closed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The retry ledger could not be written.
    #[error("Failed to persist retry ledger at {}: {source}", path.display())]
    Persistence {
        /// Ledger path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A retry ledger line did not parse.
    #[error("Corrupt retry ledger {} at line {line}: {source}", path.display())]
    LedgerFormat {
        /// Ledger path.
        path: PathBuf,
        /// One-based line number of the bad record.
        line: usize,
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },

    /// The scan point file could not be read.
    #[error("Failed to read scan points from {}: {source}", path.display())]
    ScanPoints {
        /// Scan point file.
        path: PathBuf,
        /// CSV parser failure.
        #[source]
        source: csv::Error,
    },

    /// A device handle was used after release or never claimed.
    #[error("Invalid device handle: {0}")]
    InvalidDevice(String),

    /// A device is already claimed.
    #[error("Device {0} is already claimed by another component")]
    DeviceBusy(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded configuration failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}

impl From<DecodeError> for ScanError {
    fn from(value: DecodeError) -> Self {
        ScanError::Protocol(ProtocolViolation::Decode(value))
    }
}

impl ScanError {
    /// Whether the error ends the whole session rather than a single step.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            ScanError::Protocol(_) | ScanError::ConnectionLost(_) | ScanError::Io(_)
        )
    }

    /// Short reason string recorded in the retry ledger when this error
    /// aborts a step.
    pub fn ledger_reason(&self) -> String {
        match self {
            ScanError::Timeout { .. } => "protocol-timeout".to_string(),
            other => format!("session-aborted: {other}"),
        }
    }
}
