//! Session state machine.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifiers::SessionId;
use crate::transport::TransportKind;

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a [`ConnectionSession`](super::ConnectionSession).
///
/// ```text
/// Idle → Connecting → Handshaking → Open ⇄ EventListening → Closing → Disconnected
///            │             │          │          │
///            └──► Error ◄──┘          └──────────┴──► TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Created, nothing opened.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Running the protocol handshake.
    Handshaking,
    /// Session open; commands work.
    Open,
    /// Session open with an event listener attached.
    EventListening,
    /// Releasing the channel.
    Closing,
    /// Channel released.
    Disconnected,
    /// Transport or handshake failure.
    Error,
    /// An operation exceeded its deadline.
    TimedOut,
}

impl SessionState {
    /// Returns `true` for states a session never leaves on its own.
    ///
    /// A new session may only be created once the previous one is terminal.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error | Self::TimedOut)
    }

    /// Returns `true` if device operations are accepted.
    #[inline]
    #[must_use]
    pub const fn accepts_operations(self) -> bool {
        matches!(self, Self::Open | Self::EventListening)
    }

    /// Returns `true` if the transition `self → to` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use SessionState::{
            Closing, Connecting, Disconnected, Error, EventListening, Handshaking, Idle, Open,
            TimedOut,
        };

        match (self, to) {
            (Idle, Connecting)
            | (Connecting, Handshaking | Error)
            | (Handshaking, Open | Error)
            | (Open, EventListening)
            | (EventListening, Open)
            | (Closing, Disconnected) => true,
            // any live state may time out or fail
            (Connecting | Handshaking | Open | EventListening, TimedOut) => true,
            (Open | EventListening, Error) => true,
            // explicit disconnect or detach from anywhere but Idle/Closing/Disconnected
            (Connecting | Handshaking | Open | EventListening | Error | TimedOut, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Transition
// ============================================================================

/// One state change, reported to the [`TransitionHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Session that changed.
    pub session_id: SessionId,
    /// Its transport.
    pub transport_kind: TransportKind,
    /// Previous state.
    pub from: SessionState,
    /// New state.
    pub to: SessionState,
    /// Human-readable cause, if any.
    pub message: Option<String>,
    /// Set when the cause is a known-fatal low-level status.
    pub fatal: bool,
}

/// Callback invoked synchronously on every transition.
///
/// Must not block.
pub type TransitionHandler = std::sync::Arc<dyn Fn(&Transition) + Send + Sync>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Disconnected.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(!SessionState::Open.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        let path = [Idle, Connecting, Handshaking, Open, EventListening, Closing, Disconnected];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_rejected_transitions() {
        use SessionState::*;
        assert!(!Idle.can_transition_to(Open));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Open));
        assert!(!TimedOut.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Error));
    }

    #[test]
    fn test_serde_and_display() {
        assert_eq!(
            serde_json::to_string(&SessionState::EventListening).expect("serialize"),
            "\"eventListening\""
        );
        assert_eq!(SessionState::TimedOut.to_string(), "TimedOut");
    }
}
