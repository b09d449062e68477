//! Atomic Hardware Capabilities
//!
//! The scan core talks to instruments through three narrow capability traits
//! instead of concrete driver types:
//!
//! - [`VoltageOutput`]: rate-limited actuation (`set_output(voltage, max_rate)`)
//! - [`ScalarSource`]: one-shot polled reads (`read_scalar()`)
//! - [`CallbackSource`]: device-pushed events (`register_callback` /
//!   `unregister_callback`)
//!
//! Every device also implements [`DeviceHandle`], which ties the device's
//! lifetime to an explicitly owned value and hands out an exclusive
//! [`DeviceClaim`]. A scheduler or actuator holds the claim for as long as it
//! uses the device; dropping the claim releases it.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is thread-safe (requires Send + Sync)
//! - Reports device failures as [`DeviceError`] so callers can match on the
//!   signal state instead of catching nested exception types
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn read_twice<S: ScalarSource>(device: &S) -> Result<f64, DeviceError> {
//!     let a = device.read_scalar().await?;
//!     let b = device.read_scalar().await?;
//!     Ok((a.value + b.value) / 2.0)
//! }
//! ```

use crate::error::{AppResult, DeviceError, ScanError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Device ownership
// =============================================================================

/// Shared "in use" flag embedded in every device.
#[derive(Debug, Clone, Default)]
pub struct ClaimFlag(Arc<AtomicBool>);

impl ClaimFlag {
    /// Create an unclaimed flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a claim is currently outstanding.
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Exclusive use of one device. Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    device_id: String,
    flag: ClaimFlag,
}

impl DeviceClaim {
    /// Identifier of the claimed device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.flag.0.store(false, Ordering::Release);
    }
}

/// Identity, validity and exclusive ownership of a device.
pub trait DeviceHandle: Send + Sync {
    /// Stable identifier used in logs and error messages.
    fn device_id(&self) -> &str;

    /// Whether the underlying session to the instrument is open.
    fn is_open(&self) -> bool;

    /// The device's claim flag.
    fn claim_flag(&self) -> &ClaimFlag;

    /// Take exclusive ownership of the device.
    ///
    /// # Errors
    /// - `ScanError::InvalidDevice` if the handle is not open
    /// - `ScanError::DeviceBusy` if another component holds a claim
    fn claim(&self) -> AppResult<DeviceClaim> {
        if !self.is_open() {
            return Err(ScanError::InvalidDevice(self.device_id().to_string()));
        }
        let flag = self.claim_flag();
        if !flag.try_acquire() {
            return Err(ScanError::DeviceBusy(self.device_id().to_string()));
        }
        Ok(DeviceClaim {
            device_id: self.device_id().to_string(),
            flag: flag.clone(),
        })
    }
}

// =============================================================================
// Acquisition capabilities
// =============================================================================

/// A raw polled value and the device-clock time it was taken at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Measured value.
    pub value: f64,
    /// Device clock in milliseconds.
    pub timestamp_ms: u64,
}

/// Capability: polled scalar reads (wavemeter frequency, photodiode level).
///
/// # Contract
/// - Each call performs one acquisition attempt
/// - Signal-state failures are returned, never panicked
#[async_trait]
pub trait ScalarSource: DeviceHandle {
    /// Read one value.
    async fn read_scalar(&self) -> Result<Reading, DeviceError>;
}

/// Vendor event kinds a callback can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// New frequency on a measurement channel.
    Frequency {
        /// One-based channel number.
        channel: u8,
    },
    /// New wavelength on a measurement channel.
    Wavelength {
        /// One-based channel number.
        channel: u8,
    },
    /// New intensity on an analog input channel. Raised by DAQ buffer
    /// callbacks; there is no wavemeter mode code for it.
    Intensity {
        /// One-based channel number.
        channel: u8,
    },
    /// Anything the scan layer does not interpret.
    Other(i32),
}

impl EventKind {
    /// Vendor mode code for channel 1 frequency.
    pub const FREQUENCY_1: i32 = 28;
    /// Vendor mode code for channel 2 frequency.
    pub const FREQUENCY_2: i32 = 29;
    /// Vendor mode code for channel 1 wavelength.
    pub const WAVELENGTH_1: i32 = 42;
    /// Vendor mode code for channel 2 wavelength.
    pub const WAVELENGTH_2: i32 = 43;

    /// Map a vendor mode code.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::FREQUENCY_1 => EventKind::Frequency { channel: 1 },
            Self::FREQUENCY_2 => EventKind::Frequency { channel: 2 },
            Self::WAVELENGTH_1 => EventKind::Wavelength { channel: 1 },
            Self::WAVELENGTH_2 => EventKind::Wavelength { channel: 2 },
            other => EventKind::Other(other),
        }
    }
}

/// One event pushed by a device callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceEvent {
    /// What the event reports.
    pub kind: EventKind,
    /// Integer payload; the device timestamp in milliseconds for
    /// measurement events.
    pub int_value: i64,
    /// Floating payload; the measured value for measurement events.
    pub dbl_value: f64,
}

impl DeviceEvent {
    /// Build an event from raw vendor callback arguments.
    pub fn from_raw(mode: i32, int_value: i64, dbl_value: f64) -> Self {
        Self {
            kind: EventKind::from_code(mode),
            int_value,
            dbl_value,
        }
    }
}

/// Closure a device invokes for each pushed event.
///
/// May be called from a device-owned thread, concurrently with anything the
/// registering component does.
pub type EventHandler = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Capability: device-pushed events.
///
/// # Contract
/// - At most one handler is registered at a time; registering replaces
/// - `unregister_callback` stops future deliveries, but a delivery already
///   in flight on the device thread may still complete afterwards
pub trait CallbackSource: DeviceHandle {
    /// Install `handler`.
    fn register_callback(&self, handler: EventHandler) -> Result<(), DeviceError>;

    /// Remove the current handler, if any.
    fn unregister_callback(&self);
}

// =============================================================================
// Actuation capability
// =============================================================================

/// Capability: rate-limited voltage output (cavity piezo driver).
///
/// # Contract
/// - `set_output` ramps from the current value to `voltage` no faster than
///   `max_rate` V/s and returns once the ramp is written
/// - Voltages beyond the device limit are rejected with `OutOfRange`
#[async_trait]
pub trait VoltageOutput: DeviceHandle {
    /// Ramp to `voltage` at no more than `max_rate` V/s.
    async fn set_output(&self, voltage: f64, max_rate: f64) -> Result<(), DeviceError>;

    /// Last voltage written.
    async fn output(&self) -> f64;
}
