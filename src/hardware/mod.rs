//! Hardware capability traits and simulated devices.
//!
//! Real instrument drivers (analog output card, wavemeter vendor library,
//! photodiode DAQ) live outside this crate; they plug in by implementing the
//! traits in [`capabilities`].

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    CallbackSource, ClaimFlag, DeviceClaim, DeviceEvent, DeviceHandle, EventHandler, EventKind,
    Reading, ScalarSource, VoltageOutput,
};
