//! PTP Tether - camera connection and capture-event core.
//!
//! This library connects to still cameras over USB (PTP) or Wi-Fi (PTP/IP),
//! runs the session handshake including vendor two-phase authentication,
//! and publishes capture events to the application.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryService ──candidates──► ConnectionSupervisor
//!                                        │ owns (one live at a time)
//!                                        ▼
//!                  ConnectionSession ◄── ProtocolHandshake
//!                        │ owns
//!                        ▼
//!                     Channel ◄── Transport (USB / PTP/IP)
//!                        │ notifications
//!                        ▼
//!                  EventListener ──► broadcast<SessionEvent>
//! ```
//!
//! Key design principles:
//!
//! - One supervisor owns the only live session; connects are refused until
//!   the previous session is terminal
//! - Each session owns its channel exclusively; one operation in flight
//! - Responses are correlated by transaction ID and never reach the event
//!   queue
//! - Event-driven listener (no polling), at most one loop per session
//!
//! # Quick Start
//!
//! ```ignore
//! use futures_util::StreamExt;
//! use ptp_tether::{CaptureEvent, ConnectionSupervisor, Result, TransportKind};
//!
//! async fn shoot(backend: std::sync::Arc<dyn ptp_tether::UsbBackend>) -> Result<()> {
//!     let supervisor = ConnectionSupervisor::builder()
//!         .usb_backend(backend)
//!         .build()?;
//!     let mut events = supervisor.subscribe_events();
//!
//!     let mut found = supervisor.discover(TransportKind::UsbPtp)?;
//!     let Some(candidate) = found.next().await else {
//!         return Ok(());
//!     };
//!
//!     let session = supervisor.connect(&candidate).await?;
//!     session.capture().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let CaptureEvent::PhotoCaptured { path, .. } = event.event {
//!             println!("stored {path}");
//!             break;
//!         }
//!     }
//!
//!     supervisor.disconnect().await
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`discovery`] | USB and PTP/IP device discovery |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`handshake`] | Session handshake and vendor auth strategies |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | PTP and PTP/IP wire formats |
//! | [`session`] | [`ConnectionSession`] and [`EventListener`] |
//! | [`supervisor`] | [`ConnectionSupervisor`] and configuration |
//! | [`transport`] | USB and TCP transports, per-session channel |

// ============================================================================
// Modules
// ============================================================================

/// Device discovery.
///
/// - [`UsbDiscovery`] - attached still-image devices
/// - [`PtpIpDiscovery`] - access-point gateway or station subnet scan
pub mod discovery;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Session handshake.
///
/// Pluggable vendor authentication lives in [`handshake::auth`].
pub mod handshake;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// PTP wire protocol.
///
/// Containers, datasets and the PTP/IP packet codec.
pub mod protocol;

/// Connection sessions and the event listener.
pub mod session;

/// Connection supervisor and options.
pub mod supervisor;

/// Transport layer.
///
/// USB and PTP/IP links plus the exclusive per-session channel.
pub mod transport;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Discovery types
pub use discovery::{
    DeviceCandidate, DeviceIdentity, DiscoveryService, NetworkEnvironment, NetworkIdentity,
    PtpIpDiscovery, StaticNetwork, UsbDiscovery,
};

// Error types
pub use error::{AttachError, Error, HandshakeError, HandshakeFailure, Result, TransportError};

// Handshake types
pub use handshake::{
    AuthProfile, AuthRegistry, AuthStep, AuthStrategy, HandshakePhase, HandshakeResult, NoAuth,
    ProtocolHandshake, TwoPhaseAuth,
};

// Identifier types
pub use identifiers::{ListenerId, ObjectHandle, SessionId, TransactionId};

// Protocol types
pub use protocol::{DeviceInfo, OperationRequest, OperationResponse};

// Session types
pub use session::{
    CaptureEvent, ConnectionSession, EventListener, PendingOperation, SessionEvent, SessionState,
    Transition, TransitionHandler,
};

// Supervisor types
pub use supervisor::{
    ConnectionSupervisor, STILL_IMAGE_CLASS, SupervisorBuilder, SupervisorStatus, TetherOptions,
    Timeouts,
};

// Transport types
pub use transport::{
    CallbackBridge, ConnectTarget, NativeEvent, PermissionStatus, PermissionToken, TcpTransport,
    Transport, TransportKind, UsbBackend, UsbDeviceInfo, UsbEndpoints, UsbTransport,
};
