//! USB discovery.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tracing::{debug, trace};

use crate::transport::{TransportKind, UsbBackend, UsbDeviceInfo};

use super::{DeviceCandidate, DeviceIdentity, DiscoveryService};

// ============================================================================
// UsbDiscovery
// ============================================================================

/// Enumerates attached still-image devices.
#[derive(Clone)]
pub struct UsbDiscovery {
    backend: Arc<dyn UsbBackend>,
    interface_class: u8,
    vendor_allowlist: Vec<u16>,
}

impl UsbDiscovery {
    /// Creates a discovery over `backend`.
    ///
    /// An empty `vendor_allowlist` accepts every vendor.
    #[must_use]
    pub fn new(backend: Arc<dyn UsbBackend>, interface_class: u8, vendor_allowlist: Vec<u16>) -> Self {
        Self {
            backend,
            interface_class,
            vendor_allowlist,
        }
    }

    /// Returns `true` if `device` passes the class and vendor filters.
    #[must_use]
    pub fn accepts(&self, device: &UsbDeviceInfo) -> bool {
        device.interface_class == self.interface_class
            && (self.vendor_allowlist.is_empty() || self.vendor_allowlist.contains(&device.vendor_id))
    }

    /// Enumerates and filters attached devices.
    #[must_use]
    pub fn list(&self) -> Vec<UsbDeviceInfo> {
        self.backend
            .list_devices()
            .into_iter()
            .filter(|device| {
                let accepted = self.accepts(device);
                if !accepted {
                    trace!(%device, class = device.interface_class, "Skipping USB device");
                }
                accepted
            })
            .collect()
    }
}

impl DiscoveryService for UsbDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::UsbPtp
    }

    fn discover(&self) -> BoxStream<'static, DeviceCandidate> {
        let candidates: Vec<_> = self
            .list()
            .into_iter()
            .map(|device| DeviceCandidate {
                identity: DeviceIdentity::usb(&device),
                display_name: device.display_name(),
                transport_kind: TransportKind::UsbPtp,
                online: true,
            })
            .collect();

        debug!(found = candidates.len(), "USB discovery round");
        stream::iter(candidates).boxed()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::error::TransportError;
    use crate::transport::{CallbackBridge, PermissionStatus, PermissionToken, UsbEndpoints};

    struct Bus(Vec<UsbDeviceInfo>);

    #[async_trait]
    impl UsbBackend for Bus {
        fn list_devices(&self) -> Vec<UsbDeviceInfo> {
            self.0.clone()
        }

        async fn request_permission(&self, _device: &UsbDeviceInfo) -> PermissionStatus {
            PermissionStatus::Denied
        }

        async fn open(
            &self,
            _device: &UsbDeviceInfo,
            _token: PermissionToken,
            _bridge: CallbackBridge,
        ) -> Result<UsbEndpoints, TransportError> {
            Err(TransportError::Disconnected)
        }
    }

    fn device(address: u8, vendor_id: u16, class: u8) -> UsbDeviceInfo {
        UsbDeviceInfo {
            bus: 1,
            address,
            vendor_id,
            product_id: 0x1000,
            interface_class: class,
            manufacturer: Some("Maker".into()),
            product: Some(format!("Model {address}")),
            serial: None,
        }
    }

    fn bus() -> Arc<dyn UsbBackend> {
        Arc::new(Bus(vec![
            device(2, 0x04A9, 6),
            device(3, 0x04B0, 6),
            // keyboard
            device(4, 0x046D, 3),
        ]))
    }

    #[tokio::test]
    async fn test_filters_by_interface_class() {
        let discovery = UsbDiscovery::new(bus(), 6, Vec::new());
        let found: Vec<_> = discovery.discover().collect().await;

        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.transport_kind == TransportKind::UsbPtp && c.online));
    }

    #[tokio::test]
    async fn test_filters_by_vendor_allowlist() {
        let discovery = UsbDiscovery::new(bus(), 6, vec![0x04B0]);
        let found: Vec<_> = discovery.discover().collect().await;

        assert_eq!(found.len(), 1);
        assert!(matches!(
            found[0].identity,
            DeviceIdentity::Usb { vendor_id: 0x04B0, address: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_each_call_rescans() {
        let discovery = UsbDiscovery::new(bus(), 6, Vec::new());
        let first: Vec<_> = discovery.discover().collect().await;
        let second: Vec<_> = discovery.discover().collect().await;
        assert_eq!(first, second);
    }
}
