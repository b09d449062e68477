//! Two-node handshake: wire format, framed link, per-step session state and
//! the controller and analyzer drivers.

pub mod analyzer;
pub mod clock;
pub mod controller;
pub mod link;
pub mod protocol;
pub mod session;

pub use analyzer::{AnalyzerNode, AnalyzerSettings, AnalyzerSummary};
pub use clock::NodeClock;
pub use controller::{ControllerSession, ControllerSettings, StepMeasurement, StepOutcome};
pub use link::MessageLink;
pub use protocol::{FinReport, Message, MessageKind, RawSample, StepCommand, TriggerCommand};
pub use session::{ReplayCache, SessionState, StepSession};
