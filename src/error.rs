//! Error types for the tethering core.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ptp_tether::{Error, Result};
//!
//! async fn shoot(session: &ConnectionSession) -> Result<()> {
//!     session.capture().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Severity |
//! |----------|----------|----------|
//! | Configuration | [`Error::Config`], [`Error::UnsupportedTransport`] | caller |
//! | Transport | [`Error::Transport`] ([`TransportError`]) | retry |
//! | Handshake | [`Error::Handshake`] ([`HandshakeError`]) | retry on fresh channel |
//! | Session | [`Error::Busy`], [`Error::InvalidState`], [`Error::Operation`] | caller |
//! | Timeout | [`Error::TimedOut`] | operator guidance |
//! | Fatal | [`Error::RestartRequired`] | process restart |
//! | Supervisor | [`Error::SessionActive`], [`Error::NotConnected`], [`Error::DeviceNotFound`] | caller |
//! | External | [`Error::Json`] | caller |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::handshake::HandshakePhase;
use crate::identifiers::SessionId;
use crate::session::SessionState;
use crate::transport::TransportKind;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// TransportError
// ============================================================================

/// Failure of a transport channel (USB or TCP).
///
/// Always recoverable from the core's point of view: the caller decides
/// whether to retry. The session state machine decides severity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No OS-level permission grant for the USB device.
    #[error("Permission denied for device {device}")]
    PermissionDenied {
        /// Device description.
        device: String,
    },

    /// Device is held by another process or session.
    #[error("Device busy: {device}")]
    DeviceBusy {
        /// Device description.
        device: String,
    },

    /// Device physically removed or link dropped mid-operation.
    #[error("Device disconnected")]
    Disconnected,

    /// Network peer could not be reached.
    #[error("Unreachable {address}: {reason}")]
    Unreachable {
        /// Target address.
        address: String,
        /// Underlying cause.
        reason: String,
    },

    /// Send or receive exceeded its deadline.
    ///
    /// `status` carries the low-level driver status when the backend
    /// reported one.
    #[error("Timed out after {timeout_ms}ms (status: {status:?})")]
    Timeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
        /// Low-level status code, if any.
        status: Option<i32>,
    },

    /// Bytes on the wire did not form a valid container or packet.
    #[error("Malformed frame: {reason}")]
    Malformed {
        /// What was wrong with the frame.
        reason: String,
    },

    /// Responder refused the connection (PTP/IP InitFail).
    #[error("Connection rejected by device (reason {reason:#x})")]
    Rejected {
        /// Reason code from the device.
        reason: u32,
    },
}

impl TransportError {
    /// Creates an unreachable error.
    #[inline]
    pub fn unreachable(address: impl ToString, reason: impl ToString) -> Self {
        Self::Unreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Creates a malformed-frame error.
    #[inline]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Creates a timeout error without a low-level status.
    #[inline]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout {
            timeout_ms,
            status: None,
        }
    }

    /// Returns the low-level status attached to a timeout.
    #[inline]
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Timeout { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<IoError> for TransportError {
    fn from(err: IoError) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut => Self::timeout(0),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Disconnected,
            _ => Self::Unreachable {
                address: String::new(),
                reason: err.to_string(),
            },
        }
    }
}

// ============================================================================
// HandshakeError
// ============================================================================

/// What went wrong during a handshake phase.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Device answered with a response code other than the expected one.
    #[error("unexpected response code {code:#06x}")]
    UnexpectedResponse {
        /// PTP response code.
        code: u16,
    },

    /// Response payload could not be parsed.
    #[error("malformed response: {reason}")]
    Malformed {
        /// Parse failure description.
        reason: String,
    },

    /// Channel failed while the phase was in flight.
    #[error("transport: {0}")]
    Transport(TransportError),
}

/// Handshake aborted in a specific phase.
///
/// Never retried on the same channel: the caller closes the channel and
/// restarts at `Init` on a fresh one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Handshake failed in {phase}: {failure}")]
pub struct HandshakeError {
    /// Phase in which the handshake stopped.
    pub phase: HandshakePhase,
    /// Failure cause.
    pub failure: HandshakeFailure,
}

impl HandshakeError {
    /// Creates an unexpected-response error.
    #[inline]
    #[must_use]
    pub fn response(phase: HandshakePhase, code: u16) -> Self {
        Self {
            phase,
            failure: HandshakeFailure::UnexpectedResponse { code },
        }
    }

    /// Creates a malformed-response error.
    #[inline]
    pub fn malformed(phase: HandshakePhase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            failure: HandshakeFailure::Malformed {
                reason: reason.into(),
            },
        }
    }

    /// Creates a transport error wrapped in a phase.
    #[inline]
    #[must_use]
    pub fn transport(phase: HandshakePhase, err: TransportError) -> Self {
        Self {
            phase,
            failure: HandshakeFailure::Transport(err),
        }
    }

    /// Returns the device response code, if the failure carried one.
    #[inline]
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self.failure {
            HandshakeFailure::UnexpectedResponse { code } => Some(code),
            _ => None,
        }
    }
}

// ============================================================================
// AttachError
// ============================================================================

/// Failure to attach an [`EventListener`](crate::session::EventListener).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// Another listener already owns this session's event source.
    #[error("Session {session_id} already has a listener attached")]
    AlreadyAttached {
        /// Session that is taken.
        session_id: SessionId,
    },

    /// Session is not in a state that produces events.
    #[error("Session is {state}, events require an open session")]
    NotOpen {
        /// Current session state.
        state: SessionState,
    },

    /// Event source was already closed by the channel.
    #[error("Event source closed")]
    SourceClosed,
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when options or builder input are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// No transport implementation registered for this kind.
    #[error("No transport configured for {kind}")]
    UnsupportedTransport {
        /// Requested transport.
        kind: TransportKind,
    },

    // ========================================================================
    // Transport & Handshake Errors
    // ========================================================================
    /// Transport channel failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Another operation is in flight on this session.
    ///
    /// Caller error: wait for the outstanding operation and try again.
    #[error("Session busy: {operation} rejected, another operation is in flight")]
    Busy {
        /// Operation that was rejected.
        operation: String,
    },

    /// Operation not allowed in the current session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Current session state.
        state: SessionState,
        /// Operation that was attempted.
        operation: String,
    },

    /// Device answered a command with a non-OK response code.
    #[error("Device rejected {operation}: response {code:#06x}")]
    Operation {
        /// Operation name.
        operation: String,
        /// PTP response code.
        code: u16,
    },

    /// Operation exceeded its deadline; the session is now `TimedOut`.
    #[error("{operation} timed out after {timeout_ms}ms")]
    TimedOut {
        /// Operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
        /// Low-level status reported by the transport.
        status: Option<i32>,
    },

    /// Transport is unrecoverable until the process restarts.
    #[error("Camera transport is wedged, restart the application")]
    RestartRequired,

    // ========================================================================
    // Supervisor Errors
    // ========================================================================
    /// A non-terminal session already exists.
    #[error("Another session is still {state}")]
    SessionActive {
        /// State of the existing session.
        state: SessionState,
    },

    /// No session is connected.
    #[error("Not connected")]
    NotConnected,

    /// Candidate could not be re-resolved to an attached device.
    #[error("Device not found: {identity}")]
    DeviceNotFound {
        /// Candidate identity.
        identity: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    #[inline]
    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(state: SessionState, operation: impl Into<String>) -> Self {
        Self::InvalidState {
            state,
            operation: operation.into(),
        }
    }

    /// Creates a device-rejected-operation error.
    #[inline]
    pub fn operation(operation: impl Into<String>, code: u16) -> Self {
        Self::Operation {
            operation: operation.into(),
            code,
        }
    }

    /// Creates a timed out error.
    #[inline]
    pub fn timed_out(operation: impl Into<String>, timeout_ms: u64, status: Option<i32>) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            timeout_ms,
            status,
        }
    }

    /// Creates a device not found error.
    #[inline]
    pub fn device_not_found(identity: impl ToString) -> Self {
        Self::DeviceNotFound {
            identity: identity.to_string(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. } | Self::Transport(TransportError::Timeout { .. })
        )
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns `true` if the caller misused the API (not a device fault).
    #[inline]
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::InvalidState { .. } | Self::SessionActive { .. }
        )
    }

    /// Returns `true` if this error blocks all interaction until restart.
    #[inline]
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::RestartRequired)
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry (handshake errors only on a
    /// fresh channel).
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Handshake(_)
                | Self::Busy { .. }
                | Self::TimedOut { .. }
                | Self::Operation { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::busy("capture");
        assert_eq!(
            err.to_string(),
            "Session busy: capture rejected, another operation is in flight"
        );
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("missing backend");
        assert_eq!(err.to_string(), "Configuration error: missing backend");
    }

    #[test]
    fn test_handshake_error_code() {
        let err = HandshakeError::response(HandshakePhase::AuthenticatingPhase2, 0x2002);
        assert_eq!(err.code(), Some(0x2002));
        assert!(err.to_string().contains("AuthenticatingPhase2"));

        let err = HandshakeError::transport(HandshakePhase::ChannelOpen, TransportError::Disconnected);
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::timed_out("capture", 5000, None);
        let transport_timeout: Error = TransportError::timeout(1000).into();
        let other_err = Error::NotConnected;

        assert!(timeout_err.is_timeout());
        assert!(transport_timeout.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_requires_restart() {
        assert!(Error::RestartRequired.requires_restart());
        assert!(!Error::RestartRequired.is_recoverable());
        assert!(!Error::timed_out("probe", 10, Some(-1)).requires_restart());
    }

    #[test]
    fn test_caller_errors_are_not_faults() {
        assert!(Error::busy("probe").is_caller_error());
        assert!(Error::invalid_state(SessionState::Idle, "capture").is_caller_error());
        assert!(!Error::from(TransportError::Disconnected).is_caller_error());
    }

    #[test]
    fn test_transport_status() {
        let err = TransportError::Timeout {
            timeout_ms: 100,
            status: Some(-9),
        };
        assert_eq!(err.status(), Some(-9));
        assert_eq!(TransportError::Disconnected.status(), None);
    }

    #[test]
    fn test_from_io_error() {
        let eof: TransportError = IoError::new(ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(eof, TransportError::Disconnected);

        let refused: TransportError = IoError::new(ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(refused, TransportError::Unreachable { .. }));

        // I/O failures surface as transport errors, never as a separate variant
        let err = Error::from(TransportError::from(IoError::new(ErrorKind::BrokenPipe, "gone")));
        assert!(matches!(err, Error::Transport(TransportError::Disconnected)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
