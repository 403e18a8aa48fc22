//! Transport layer.
//!
//! A transport turns a resolved [`ConnectTarget`] into a pair of link halves
//! (writer + reader of PTP containers). The per-session [`Channel`] then owns
//! both halves exclusively and runs the single I/O loop that correlates
//! responses to requests and routes events into the notification queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   transact()   ┌──────────────┐  FrameWriter  ┌────────┐
//! │ ConnectionSession│───────────────►│   Channel    │──────────────►│        │
//! │  (1 permit)      │◄───────────────│  I/O loop    │◄──────────────│ Device │
//! └──────────────────┘  OperationResp │              │  FrameReader  │        │
//!                                     └──────┬───────┘               └────────┘
//!            native driver callbacks         │ events
//!            ──────► CallbackBridge ─────────▼
//!                                  bounded notification queue ──► EventListener
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `link` | Frame reader/writer traits and pump-backed reader |
//! | `channel` | Exclusive per-session I/O loop with correlation |
//! | `bridge` | Non-blocking bridge for native callbacks |
//! | `tcp` | PTP/IP over TCP (access-point and station modes) |
//! | `usb` | USB PTP over an external backend |

// ============================================================================
// Submodules
// ============================================================================

/// Non-blocking bridge for native driver callbacks.
pub mod bridge;

/// Exclusive per-session I/O loop.
pub mod channel;

/// Frame reader/writer abstractions.
pub mod link;

/// PTP/IP transport.
pub mod tcp;

/// USB PTP transport.
pub mod usb;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

// ============================================================================
// Re-exports
// ============================================================================

pub use bridge::{CallbackBridge, NativeEvent, Notification};
pub use channel::Channel;
pub use link::{FrameReader, FrameWriter, LinkHalves};
pub use tcp::TcpTransport;
pub use usb::{
    PacketSink, PacketSource, PermissionStatus, PermissionToken, UsbBackend, UsbDeviceInfo,
    UsbEndpoints, UsbTransport,
};

// ============================================================================
// TransportKind
// ============================================================================

/// Which physical path a session uses.
///
/// Immutable once a session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// USB still-image class device.
    UsbPtp,
    /// PTP/IP after joining the camera's own access point.
    PtpIpAccessPoint,
    /// PTP/IP with both parties on a shared network.
    PtpIpStation,
}

impl TransportKind {
    /// Returns `true` for the PTP/IP variants.
    #[inline]
    #[must_use]
    pub const fn is_network(self) -> bool {
        matches!(self, Self::PtpIpAccessPoint | Self::PtpIpStation)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsbPtp => write!(f, "USB"),
            Self::PtpIpAccessPoint => write!(f, "PTP/IP (access point)"),
            Self::PtpIpStation => write!(f, "PTP/IP (station)"),
        }
    }
}

// ============================================================================
// ConnectTarget
// ============================================================================

/// A candidate re-resolved into a transport-specific address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Attached USB device.
    Usb(UsbDeviceInfo),
    /// PTP/IP responder.
    Network(SocketAddr),
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb(device) => write!(f, "{device}"),
            Self::Network(addr) => write!(f, "{addr}"),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Opens links of one [`TransportKind`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind this implementation serves.
    fn kind(&self) -> TransportKind;

    /// Opens a link to `target`.
    ///
    /// `bridge` feeds native driver callbacks into the session's
    /// notification queue; transports without native callbacks may ignore
    /// it.
    ///
    /// # Errors
    ///
    /// - [`TransportError::PermissionDenied`] / [`TransportError::DeviceBusy`] (USB)
    /// - [`TransportError::Unreachable`] / [`TransportError::Timeout`] (network)
    /// - [`TransportError::Rejected`] if the responder refuses the connection
    async fn open(
        &self,
        target: &ConnectTarget,
        bridge: CallbackBridge,
    ) -> Result<LinkHalves, TransportError>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&TransportKind::PtpIpStation).expect("serialize");
        assert_eq!(json, "\"ptpIpStation\"");
        let back: TransportKind = serde_json::from_str("\"usbPtp\"").expect("deserialize");
        assert_eq!(back, TransportKind::UsbPtp);
    }

    #[test]
    fn test_is_network() {
        assert!(!TransportKind::UsbPtp.is_network());
        assert!(TransportKind::PtpIpAccessPoint.is_network());
        assert!(TransportKind::PtpIpStation.is_network());
    }

    #[test]
    fn test_target_display() {
        let target = ConnectTarget::Network("192.168.1.1:15740".parse().expect("addr"));
        assert_eq!(target.to_string(), "192.168.1.1:15740");
    }
}
