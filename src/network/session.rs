//! Per-step session state machine.
//!
//! Each node runs its own [`StepSession`]; the two are reconciled only by the
//! message exchange.
//!
//! ```text
//!  Idle ──ready──► Ready ──arm──► Armed ──trigger──► TriggerPending
//!   ▲               │ ▲ step                               │ acquire
//!   │               └─┘                                    ▼
//!   └──────finish──── Reported ◄────────report────────── Acquiring
//! ```
//!
//! `reset` returns to `Idle` from anywhere and is how a step is abandoned.
//! [`ReplayCache`] remembers the last request/reply pair so a retransmitted
//! request is answered again without repeating its side effects.

use super::protocol::Message;
use crate::error::ProtocolViolation;
use std::fmt;

/// Where a node is within the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No step in progress.
    Idle,
    /// Peer can take a step.
    Ready,
    /// ARM acknowledged.
    Armed,
    /// TRIG acknowledged, waiting for the start time.
    TriggerPending,
    /// Sampling the window.
    Acquiring,
    /// FIN sent or received.
    Reported,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "IDLE",
            SessionState::Ready => "READY",
            SessionState::Armed => "ARMED",
            SessionState::TriggerPending => "TRIGGER_PENDING",
            SessionState::Acquiring => "ACQUIRING",
            SessionState::Reported => "REPORTED",
        };
        f.write_str(name)
    }
}

/// Validated state transitions for one node.
#[derive(Debug, Clone)]
pub struct StepSession {
    state: SessionState,
    step_index: Option<u32>,
}

impl Default for StepSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StepSession {
    /// Fresh session in `Idle`.
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            step_index: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Step the session is working on, once STEP has been exchanged.
    pub fn step_index(&self) -> Option<u32> {
        self.step_index
    }

    /// Peer is (or is assumed) idle and able to take the next step.
    pub fn ready(&mut self) -> Result<(), ProtocolViolation> {
        match self.state {
            SessionState::Idle | SessionState::Reported => {
                self.state = SessionState::Ready;
                self.step_index = None;
                Ok(())
            }
            from => Err(invalid(from, "ready")),
        }
    }

    /// Setpoint announced. May be repeated while still `Ready`.
    pub fn step(&mut self, step_index: u32) -> Result<(), ProtocolViolation> {
        match self.state {
            SessionState::Ready => {
                self.step_index = Some(step_index);
                Ok(())
            }
            from => Err(invalid(from, "step")),
        }
    }

    /// ARM accepted for the announced step.
    pub fn arm(&mut self) -> Result<(), ProtocolViolation> {
        match (self.state, self.step_index) {
            (SessionState::Ready, Some(_)) => {
                self.state = SessionState::Armed;
                Ok(())
            }
            (from, _) => Err(invalid(from, "arm")),
        }
    }

    /// TRIG accepted.
    pub fn trigger(&mut self) -> Result<(), ProtocolViolation> {
        self.advance(SessionState::Armed, SessionState::TriggerPending, "trigger")
    }

    /// Acquisition window opened.
    pub fn acquire(&mut self) -> Result<(), ProtocolViolation> {
        self.advance(SessionState::TriggerPending, SessionState::Acquiring, "acquire")
    }

    /// FIN exchanged.
    pub fn report(&mut self) -> Result<(), ProtocolViolation> {
        self.advance(SessionState::Acquiring, SessionState::Reported, "report")
    }

    /// FIN acknowledged; back to `Idle`.
    pub fn finish(&mut self) -> Result<(), ProtocolViolation> {
        self.advance(SessionState::Reported, SessionState::Idle, "finish")?;
        self.step_index = None;
        Ok(())
    }

    /// Abandon the current step.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.step_index = None;
    }

    /// Acquisition data (FIN, RAW) may only leave a node once its TRIG has
    /// been acknowledged and sampling has begun.
    pub fn ensure_may_send_data(&self) -> Result<(), ProtocolViolation> {
        match self.state {
            SessionState::Acquiring | SessionState::Reported => Ok(()),
            from => Err(invalid(from, "send data")),
        }
    }

    fn advance(
        &mut self,
        from: SessionState,
        to: SessionState,
        event: &'static str,
    ) -> Result<(), ProtocolViolation> {
        if self.state != from {
            return Err(invalid(self.state, event));
        }
        self.state = to;
        Ok(())
    }
}

fn invalid(from: SessionState, event: &'static str) -> ProtocolViolation {
    ProtocolViolation::InvalidTransition { from, event }
}

// =============================================================================
// Duplicate handling
// =============================================================================

/// Last request received and the reply sent for it.
#[derive(Debug, Clone, Default)]
pub struct ReplayCache {
    last: Option<(Message, Message)>,
}

impl ReplayCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `reply` as the answer to `request`.
    pub fn remember(&mut self, request: Message, reply: Message) {
        self.last = Some((request, reply));
    }

    /// The stored reply if `request` repeats the remembered one.
    pub fn reply_for(&self, request: &Message) -> Option<&Message> {
        match &self.last {
            Some((seen, reply)) if seen == request => Some(reply),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::MessageKind;

    #[test]
    fn full_step_cycle() {
        let mut session = StepSession::new();
        session.ready().unwrap();
        session.step(4).unwrap();
        session.arm().unwrap();
        session.trigger().unwrap();
        session.acquire().unwrap();
        session.ensure_may_send_data().unwrap();
        session.report().unwrap();
        assert_eq!(session.state(), SessionState::Reported);
        assert_eq!(session.step_index(), Some(4));
        session.finish().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.step_index(), None);
    }

    #[test]
    fn arm_requires_a_step() {
        let mut session = StepSession::new();
        session.ready().unwrap();
        assert_eq!(
            session.arm(),
            Err(ProtocolViolation::InvalidTransition {
                from: SessionState::Ready,
                event: "arm"
            })
        );
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let mut session = StepSession::new();
        assert!(session.trigger().is_err());
        session.ready().unwrap();
        session.step(0).unwrap();
        assert!(session.acquire().is_err());
        assert!(session.report().is_err());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn data_cannot_leave_before_acquisition() {
        let mut session = StepSession::new();
        session.ready().unwrap();
        session.step(1).unwrap();
        session.arm().unwrap();
        session.trigger().unwrap();
        assert!(session.ensure_may_send_data().is_err());
        session.acquire().unwrap();
        assert!(session.ensure_may_send_data().is_ok());
    }

    #[test]
    fn reset_abandons_from_anywhere() {
        let mut session = StepSession::new();
        session.ready().unwrap();
        session.step(9).unwrap();
        session.arm().unwrap();
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        session.ready().unwrap();
    }

    #[test]
    fn replay_cache_matches_exact_request() {
        let mut cache = ReplayCache::new();
        cache.remember(Message::Arm, Message::ack(MessageKind::Arm, 5));
        assert_eq!(
            cache.reply_for(&Message::Arm),
            Some(&Message::ack(MessageKind::Arm, 5))
        );
        assert!(cache.reply_for(&Message::Ready).is_none());
        cache.remember(Message::Ready, Message::ack(MessageKind::Ready, 6));
        assert!(cache.reply_for(&Message::Arm).is_none());
    }
}
