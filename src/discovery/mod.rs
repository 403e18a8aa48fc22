//! Device discovery.
//!
//! Each [`DiscoveryService`] produces one finite round of
//! [`DeviceCandidate`]s per call. Rounds are independent: calling
//! [`discover`](DiscoveryService::discover) again re-scans. Dropping the
//! stream cancels the round between candidates.
//!
//! | Service | Transport | Source |
//! |---------|-----------|--------|
//! | [`UsbDiscovery`] | `UsbPtp` | backend enumeration, class/vendor filter |
//! | [`PtpIpDiscovery`] (access point) | `PtpIpAccessPoint` | the gateway of the joined camera network |
//! | [`PtpIpDiscovery`] (station) | `PtpIpStation` | TCP probe of the local subnet |
//!
//! Candidates are descriptive only. Before connecting, the supervisor
//! re-resolves a candidate into a transport address.

// ============================================================================
// Submodules
// ============================================================================

/// PTP/IP discovery.
pub mod network;

/// USB discovery.
pub mod usb;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::transport::{TransportKind, UsbDeviceInfo};

// ============================================================================
// Re-exports
// ============================================================================

pub use network::{NetworkEnvironment, NetworkIdentity, PtpIpDiscovery, StaticNetwork};
pub use usb::UsbDiscovery;

// ============================================================================
// DeviceIdentity
// ============================================================================

/// How a candidate is found again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceIdentity {
    /// USB device.
    #[serde(rename_all = "camelCase")]
    Usb {
        /// Bus number at discovery time.
        bus: u8,
        /// Address at discovery time.
        address: u8,
        /// USB vendor ID.
        vendor_id: u16,
        /// USB product ID.
        product_id: u16,
        /// Serial number, preferred for re-resolution.
        serial: Option<String>,
    },
    /// PTP/IP responder.
    Network {
        /// Responder socket address.
        addr: SocketAddr,
    },
}

impl DeviceIdentity {
    /// Identity of an enumerated USB device.
    #[must_use]
    pub fn usb(device: &UsbDeviceInfo) -> Self {
        Self::Usb {
            bus: device.bus,
            address: device.address,
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            serial: device.serial.clone(),
        }
    }

    /// Returns `true` if `device` is the device this identity names.
    ///
    /// Matches by serial when both sides have one, by bus and address
    /// otherwise.
    #[must_use]
    pub fn matches_usb(&self, device: &UsbDeviceInfo) -> bool {
        let Self::Usb {
            bus,
            address,
            vendor_id,
            product_id,
            serial,
        } = self
        else {
            return false;
        };

        match (serial, &device.serial) {
            (Some(expected), Some(actual)) => {
                expected == actual && *vendor_id == device.vendor_id && *product_id == device.product_id
            }
            _ => (*bus, *address) == device.location(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb {
                serial: Some(serial),
                vendor_id,
                product_id,
                ..
            } => write!(f, "usb:{vendor_id:04x}:{product_id:04x}:{serial}"),
            Self::Usb { bus, address, .. } => write!(f, "usb:{bus:03}:{address:03}"),
            Self::Network { addr } => write!(f, "ptpip://{addr}"),
        }
    }
}

// ============================================================================
// DeviceCandidate
// ============================================================================

/// A device found by one discovery round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCandidate {
    /// How to find the device again.
    pub identity: DeviceIdentity,
    /// Name for display.
    pub display_name: String,
    /// Transport that reaches it.
    pub transport_kind: TransportKind,
    /// Whether it answered during this round.
    pub online: bool,
}

// ============================================================================
// DiscoveryService
// ============================================================================

/// Produces candidates for one transport kind.
pub trait DiscoveryService: Send + Sync {
    /// Transport this service discovers for.
    fn kind(&self) -> TransportKind;

    /// Starts one discovery round.
    fn discover(&self) -> BoxStream<'static, DeviceCandidate>;
}

// ============================================================================
// Tests
// ============================================================================
