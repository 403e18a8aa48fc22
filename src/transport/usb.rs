//! USB PTP transport.
//!
//! The OS-level USB stack and the native driver are external collaborators
//! reached through [`UsbBackend`]. This module adds the permission gate and
//! the USB container framing on top of the backend's raw pipes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::identifiers::TransactionId;
use crate::protocol::{Container, OperationRequest};

use super::bridge::CallbackBridge;
use super::link::{FrameWriter, LinkHalves, PumpReader, PumpSender};
use super::{ConnectTarget, Transport, TransportKind};

// ============================================================================
// UsbDeviceInfo
// ============================================================================

/// An attached USB device as enumerated by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Interface class of the first interface (6 = still image).
    pub interface_class: u8,
    /// Manufacturer string descriptor.
    pub manufacturer: Option<String>,
    /// Product string descriptor.
    pub product: Option<String>,
    /// Serial number string descriptor.
    pub serial: Option<String>,
}

impl UsbDeviceInfo {
    /// Returns the `(bus, address)` pair identifying this attachment.
    #[inline]
    #[must_use]
    pub const fn location(&self) -> (u8, u8) {
        (self.bus, self.address)
    }

    /// Returns a human-readable name.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) if p.starts_with(m.as_str()) => p.clone(),
            (Some(m), Some(p)) => format!("{m} {p}"),
            (None, Some(p)) => p.clone(),
            (Some(m), None) => m.clone(),
            (None, None) => format!("USB camera {:04x}:{:04x}", self.vendor_id, self.product_id),
        }
    }
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {} addr {})",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

// ============================================================================
// Permission
// ============================================================================

/// Opaque OS permission grant for one device attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionToken(pub u64);

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// User or OS granted access.
    Granted(PermissionToken),
    /// Access refused.
    Denied,
}

impl PermissionStatus {
    /// Returns `true` if access was granted.
    #[inline]
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

// ============================================================================
// Backend Traits
// ============================================================================

/// Outbound bulk pipe.
#[async_trait]
pub trait PacketSink: Send {
    /// Sends one transfer.
    ///
    /// # Errors
    ///
    /// `Timeout` should carry the backend's low-level status when known.
    async fn send(&mut self, transfer: Bytes, timeout: Duration) -> Result<(), TransportError>;

    /// Releases the pipe.
    async fn close(&mut self) {}
}

/// Inbound bulk or interrupt pipe.
#[async_trait]
pub trait PacketSource: Send {
    /// Waits for the next complete transfer (one container).
    ///
    /// # Errors
    ///
    /// `Timeout` means an idle read and is not fatal; anything else ends the
    /// pipe.
    async fn recv(&mut self) -> Result<Bytes, TransportError>;
}

/// Pipes of an opened still-image interface.
pub struct UsbEndpoints {
    /// Bulk-out pipe (commands and data-out).
    pub bulk_out: Box<dyn PacketSink>,
    /// Bulk-in pipe (data-in and responses).
    pub bulk_in: Box<dyn PacketSource>,
    /// Interrupt-in pipe (events).
    pub interrupt_in: Box<dyn PacketSource>,
}

/// OS USB subsystem and native driver boundary.
#[async_trait]
pub trait UsbBackend: Send + Sync {
    /// Enumerates attached devices.
    fn list_devices(&self) -> Vec<UsbDeviceInfo>;

    /// Asks the OS (and possibly the user) for access to `device`.
    async fn request_permission(&self, device: &UsbDeviceInfo) -> PermissionStatus;

    /// Claims the interface and opens its pipes.
    ///
    /// `bridge` receives the native driver's asynchronous callbacks for as
    /// long as the device stays open.
    ///
    /// # Errors
    ///
    /// - [`TransportError::DeviceBusy`] if another process holds the interface
    /// - [`TransportError::Disconnected`] if the device went away
    /// - [`TransportError::PermissionDenied`] if the token was revoked
    async fn open(
        &self,
        device: &UsbDeviceInfo,
        token: PermissionToken,
        bridge: CallbackBridge,
    ) -> Result<UsbEndpoints, TransportError>;
}

// ============================================================================
// UsbTransport
// ============================================================================

/// USB transport with a permission-grant table.
pub struct UsbTransport {
    backend: Arc<dyn UsbBackend>,
    grants: Mutex<FxHashMap<(u8, u8), PermissionToken>>,
    write_timeout: Duration,
}

impl UsbTransport {
    /// Creates a transport over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn UsbBackend>, write_timeout: Duration) -> Self {
        Self {
            backend,
            grants: Mutex::new(FxHashMap::default()),
            write_timeout,
        }
    }

    /// Returns the backend.
    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn UsbBackend> {
        &self.backend
    }

    /// Requests access to `device` and records a grant.
    pub async fn request_permission(&self, device: &UsbDeviceInfo) -> PermissionStatus {
        let status = self.backend.request_permission(device).await;
        match status {
            PermissionStatus::Granted(token) => {
                self.grants.lock().insert(device.location(), token);
                info!(%device, "USB permission granted");
            }
            PermissionStatus::Denied => {
                self.grants.lock().remove(&device.location());
                warn!(%device, "USB permission denied");
            }
        }
        status
    }

    /// Returns `true` if a grant is recorded for `device`.
    #[inline]
    #[must_use]
    pub fn has_permission(&self, device: &UsbDeviceInfo) -> bool {
        self.grants.lock().contains_key(&device.location())
    }

    /// Forgets the grant for `device`.
    pub fn revoke(&self, device: &UsbDeviceInfo) {
        self.grants.lock().remove(&device.location());
    }
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::UsbPtp
    }

    async fn open(
        &self,
        target: &ConnectTarget,
        bridge: CallbackBridge,
    ) -> Result<LinkHalves, TransportError> {
        let ConnectTarget::Usb(device) = target else {
            return Err(TransportError::unreachable(target, "not a USB target"));
        };

        let token = self
            .grants
            .lock()
            .get(&device.location())
            .copied()
            .ok_or_else(|| TransportError::PermissionDenied {
                device: device.to_string(),
            })?;

        let endpoints = self.backend.open(device, token, bridge).await?;
        info!(%device, "USB device opened");

        let (tx, mut reader) = PumpReader::channel();
        reader.adopt(tokio::spawn(run_pipe_pump("bulk-in", endpoints.bulk_in, tx.clone())));
        reader.adopt(tokio::spawn(run_pipe_pump(
            "interrupt-in",
            endpoints.interrupt_in,
            tx,
        )));

        Ok(LinkHalves::new(
            Box::new(UsbWriter {
                bulk_out: endpoints.bulk_out,
                timeout: self.write_timeout,
            }),
            Box::new(reader),
        ))
    }
}

// ============================================================================
// UsbWriter
// ============================================================================

/// Bulk-out writer.
struct UsbWriter {
    bulk_out: Box<dyn PacketSink>,
    timeout: Duration,
}

#[async_trait]
impl FrameWriter for UsbWriter {
    async fn write_operation(
        &mut self,
        transaction_id: TransactionId,
        request: &OperationRequest,
    ) -> Result<(), TransportError> {
        let command = Container::command(request.code, transaction_id, request.params.clone());
        self.bulk_out.send(command.encode_usb(), self.timeout).await?;

        if let Some(data) = &request.data {
            let data = Container::data(request.code, transaction_id, data.clone());
            self.bulk_out.send(data.encode_usb(), self.timeout).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.bulk_out.close().await;
    }
}

// ============================================================================
// Pumps
// ============================================================================

/// Decodes one inbound pipe until it fails.
async fn run_pipe_pump(name: &'static str, mut source: Box<dyn PacketSource>, tx: PumpSender) {
    loop {
        match source.recv().await {
            Ok(transfer) => match Container::decode_usb(transfer) {
                Ok(container) => {
                    if tx.send(Ok(container)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(pipe = name, error = %e, "Dropping malformed USB container"),
            },

            Err(e @ TransportError::Timeout { .. }) => {
                trace!(pipe = name, "Idle USB read");
                if e.status().is_some() && tx.send(Err(e)).await.is_err() {
                    break;
                }
            }

            Err(e) => {
                debug!(pipe = name, error = %e, "USB pipe closed");
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
