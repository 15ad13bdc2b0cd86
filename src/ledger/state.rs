//! Ledger FSM State Definitions
//!
//! State IDs are stored as SMALLINT in `ledger_records_tb`.
//!
//! ```text
//! CREATED ──accepted──▶ SUBMITTED ──queued──▶ PENDING ──success──▶ COMPLETED
//!    │                                           │
//!    ├──rejected / cancelled──▶ FAILED ◀──failure / timeout──┘
//! ```

use std::fmt;

use serde::{Serialize, Serializer};

/// Ledger record states
///
/// Terminal states: COMPLETED (40), FAILED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum LedgerState {
    /// Record persisted, gateway not yet called (or call failed without effect)
    Created = 0,

    /// Gateway accepted the request and assigned an external reference
    Submitted = 10,

    /// Gateway queued the request; outcome arrives by callback or poll
    Pending = 20,

    /// Terminal: money moved, balance effect applied
    Completed = 40,

    /// Terminal: no money moved
    Failed = -10,
}

impl LedgerState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, LedgerState::Completed | LedgerState::Failed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(LedgerState::Created),
            10 => Some(LedgerState::Submitted),
            20 => Some(LedgerState::Pending),
            40 => Some(LedgerState::Completed),
            -10 => Some(LedgerState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Created => "CREATED",
            LedgerState::Submitted => "SUBMITTED",
            LedgerState::Pending => "PENDING",
            LedgerState::Completed => "COMPLETED",
            LedgerState::Failed => "FAILED",
        }
    }

    /// Apply an event to this state.
    pub fn on(self, event: LedgerEvent) -> Transition {
        use LedgerEvent::*;
        use LedgerState::*;

        if self.is_terminal() {
            return Transition::Ignore;
        }

        match (self, event) {
            (Created, GatewayAccepted) => Transition::Move(Submitted),
            (Created, GatewayRejected) | (Created, Cancelled) => Transition::Move(Failed),
            (Submitted, GatewayQueued) => Transition::Move(Pending),
            (Pending, CallbackSucceeded) => Transition::Move(Completed),
            (Pending, CallbackFailed) | (Pending, TimedOut) => Transition::Move(Failed),
            _ => Transition::Invalid,
        }
    }
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for LedgerState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        LedgerState::from_id(value).ok_or(())
    }
}

impl Serialize for LedgerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Events that drive the ledger FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerEvent {
    GatewayAccepted,
    GatewayRejected,
    GatewayQueued,
    CallbackSucceeded,
    CallbackFailed,
    TimedOut,
    Cancelled,
}

impl LedgerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEvent::GatewayAccepted => "gateway-accepted",
            LedgerEvent::GatewayRejected => "gateway-rejected",
            LedgerEvent::GatewayQueued => "gateway-queued",
            LedgerEvent::CallbackSucceeded => "callback-success",
            LedgerEvent::CallbackFailed => "callback-failure",
            LedgerEvent::TimedOut => "timeout",
            LedgerEvent::Cancelled => "cancel",
        }
    }
}

impl fmt::Display for LedgerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying an event to a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Legal transition to the given state
    Move(LedgerState),
    /// Record is terminal; the event is a no-op
    Ignore,
    /// Event is not legal from the current non-terminal state
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [LedgerState; 5] = [
        LedgerState::Created,
        LedgerState::Submitted,
        LedgerState::Pending,
        LedgerState::Completed,
        LedgerState::Failed,
    ];

    const ALL_EVENTS: [LedgerEvent; 7] = [
        LedgerEvent::GatewayAccepted,
        LedgerEvent::GatewayRejected,
        LedgerEvent::GatewayQueued,
        LedgerEvent::CallbackSucceeded,
        LedgerEvent::CallbackFailed,
        LedgerEvent::TimedOut,
        LedgerEvent::Cancelled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(LedgerState::Completed.is_terminal());
        assert!(LedgerState::Failed.is_terminal());
        assert!(!LedgerState::Created.is_terminal());
        assert!(!LedgerState::Submitted.is_terminal());
        assert!(!LedgerState::Pending.is_terminal());
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in ALL_STATES {
            assert_eq!(LedgerState::from_id(state.id()), Some(state));
        }
        assert!(LedgerState::from_id(30).is_none());
        assert!(LedgerState::try_from(-20).is_err());
    }

    #[test]
    fn test_transition_table() {
        use LedgerEvent::*;
        use LedgerState::*;

        assert_eq!(Created.on(GatewayAccepted), Transition::Move(Submitted));
        assert_eq!(Created.on(GatewayRejected), Transition::Move(Failed));
        assert_eq!(Created.on(Cancelled), Transition::Move(Failed));
        assert_eq!(Submitted.on(GatewayQueued), Transition::Move(Pending));
        assert_eq!(Pending.on(CallbackSucceeded), Transition::Move(Completed));
        assert_eq!(Pending.on(CallbackFailed), Transition::Move(Failed));
        assert_eq!(Pending.on(TimedOut), Transition::Move(Failed));
    }

    #[test]
    fn test_no_cancel_once_submitted() {
        assert_eq!(
            LedgerState::Submitted.on(LedgerEvent::Cancelled),
            Transition::Invalid
        );
        assert_eq!(
            LedgerState::Pending.on(LedgerEvent::Cancelled),
            Transition::Invalid
        );
    }

    #[test]
    fn test_callbacks_before_pending_are_invalid() {
        assert_eq!(
            LedgerState::Created.on(LedgerEvent::CallbackSucceeded),
            Transition::Invalid
        );
        assert_eq!(
            LedgerState::Submitted.on(LedgerEvent::CallbackSucceeded),
            Transition::Invalid
        );
    }

    #[test]
    fn test_terminal_states_ignore_every_event() {
        for state in [LedgerState::Completed, LedgerState::Failed] {
            for event in ALL_EVENTS {
                assert_eq!(state.on(event), Transition::Ignore, "{state} on {event}");
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(LedgerState::Pending.to_string(), "PENDING");
        assert_eq!(
            serde_json::to_string(&LedgerState::Completed).unwrap(),
            r#""COMPLETED""#
        );
    }
}
