//! Virtual USB camera for unit tests.
//!
//! [`VirtualUsb`] implements [`UsbBackend`] with in-memory pipes and a task
//! that answers PTP commands according to a [`Behavior`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::handshake::{AuthProfile, AuthRegistry, AuthStep, ProtocolHandshake};
use crate::identifiers::TransactionId;
use crate::protocol::codes::{event, operation, response};
use crate::protocol::dataset::put_u32_array;
use crate::protocol::{Container, ContainerKind, DeviceInfo};
use crate::session::{ConnectionSession, SessionState, Transition, TransitionHandler};
use crate::supervisor::{TetherOptions, Timeouts};
use crate::transport::{
    CallbackBridge, Channel, ConnectTarget, Notification, PacketSink, PacketSource,
    PermissionStatus, PermissionToken, Transport, TransportKind, UsbBackend, UsbDeviceInfo,
    UsbEndpoints, UsbTransport,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Vendor operations of the "acme" test vendor.
pub(crate) const ACME_PHASE_ONE: u16 = 0x9101;
pub(crate) const ACME_PHASE_TWO: u16 = 0x9102;
pub(crate) const ACME_LIVE_VIEW: u16 = 0x9153;

/// Options with short deadlines.
pub(crate) fn test_options() -> TetherOptions {
    TetherOptions::new().with_timeouts(Timeouts {
        connect_ms: 500,
        handshake_ms: 300,
        command_ms: 300,
        capture_ms: 300,
        close_ms: 200,
        probe_ms: 100,
    })
}

/// Two-phase profile matching [`Behavior::acme`].
pub(crate) fn acme_profile() -> AuthProfile {
    AuthProfile {
        name: "acme".into(),
        vendor_extension_id: Some(0x0B),
        manufacturer: None,
        phase_one: AuthStep::new(ACME_PHASE_ONE, [1]),
        phase_two: AuthStep::new(ACME_PHASE_TWO, [2]),
        forward_challenge: true,
        live_view_operation: Some(ACME_LIVE_VIEW),
    }
}

/// The single device the virtual backend enumerates.
pub(crate) fn usb_device() -> UsbDeviceInfo {
    UsbDeviceInfo {
        bus: 1,
        address: 4,
        vendor_id: 0x04A9,
        product_id: 0x32D2,
        interface_class: 6,
        manufacturer: Some("Generic".into()),
        product: Some("Virtual Camera".into()),
        serial: Some("VC0001".into()),
    }
}

/// Opens a session on `camera` with the acme profile registered.
pub(crate) async fn open_session(camera: &Arc<VirtualUsb>) -> ConnectionSession {
    let options = Arc::new(test_options().with_auth_profile(acme_profile()));
    let mut registry = AuthRegistry::new();
    registry.register_profiles(&options.auth_profiles);
    let handshake = ProtocolHandshake::new(Arc::new(registry), options.timeouts.handshake());

    let session = ConnectionSession::new(TransportKind::UsbPtp, options, None);
    let transport = camera.granted_transport().await;
    session
        .open(&transport, &camera.target(), &handshake)
        .await
        .expect("open session");
    session
}

// ============================================================================
// TransitionLog
// ============================================================================

/// Records every reported transition.
#[derive(Clone, Default)]
pub(crate) struct TransitionLog(Arc<Mutex<Vec<Transition>>>);

impl TransitionLog {
    pub(crate) fn handler(&self) -> TransitionHandler {
        let log = Arc::clone(&self.0);
        Arc::new(move |t: &Transition| log.lock().push(t.clone()))
    }

    pub(crate) fn states(&self) -> Vec<SessionState> {
        self.0.lock().iter().map(|t| t.to).collect()
    }

    pub(crate) fn any_fatal(&self) -> bool {
        self.0.lock().iter().any(|t| t.fatal)
    }
}

// ============================================================================
// Behavior
// ============================================================================

/// How the virtual camera answers.
#[derive(Debug, Clone)]
pub(crate) struct Behavior {
    pub device_info: DeviceInfo,
    pub responses: FxHashMap<u16, u16>,
    pub reply_params: FxHashMap<u16, Vec<u32>>,
    pub data_replies: FxHashMap<u16, Bytes>,
    pub silent: Vec<u16>,
    pub delays: FxHashMap<u16, Duration>,
    pub send_failures: FxHashMap<u16, TransportError>,
    pub capture_handle: Option<u32>,
    pub deny_permission: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        let device_info = DeviceInfo {
            standard_version: 100,
            operations_supported: vec![
                operation::GET_DEVICE_INFO,
                operation::OPEN_SESSION,
                operation::CLOSE_SESSION,
                operation::GET_STORAGE_IDS,
                operation::INITIATE_CAPTURE,
            ],
            events_supported: vec![event::OBJECT_ADDED, event::CAPTURE_COMPLETE],
            manufacturer: "Generic".into(),
            model: "Virtual Camera".into(),
            device_version: "1.0".into(),
            serial_number: "VC0001".into(),
            ..DeviceInfo::default()
        };

        let mut storage_ids = BytesMut::new();
        put_u32_array(&mut storage_ids, &[0x0001_0001]);
        let mut data_replies = FxHashMap::default();
        data_replies.insert(operation::GET_STORAGE_IDS, storage_ids.freeze());

        Self {
            device_info,
            responses: FxHashMap::default(),
            reply_params: FxHashMap::default(),
            data_replies,
            silent: Vec::new(),
            delays: FxHashMap::default(),
            send_failures: FxHashMap::default(),
            capture_handle: Some(0x2A),
            deny_permission: false,
        }
    }
}

impl Behavior {
    /// A device requiring the acme two-phase exchange.
    pub(crate) fn acme() -> Self {
        let mut behavior = Self::default();
        behavior.device_info.vendor_extension_id = 0x0B;
        behavior.device_info.manufacturer = "Acme".into();
        behavior.device_info.model = "A-1".into();
        behavior.data_replies.insert(
            ACME_LIVE_VIEW,
            Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9]),
        );
        behavior
    }

    pub(crate) fn with_response(mut self, op: u16, code: u16) -> Self {
        self.responses.insert(op, code);
        self
    }

    pub(crate) fn with_reply_params(mut self, op: u16, params: Vec<u32>) -> Self {
        self.reply_params.insert(op, params);
        self
    }

    pub(crate) fn with_silent(mut self, op: u16) -> Self {
        self.silent.push(op);
        self
    }

    pub(crate) fn with_delay(mut self, op: u16, delay: Duration) -> Self {
        self.delays.insert(op, delay);
        self
    }

    pub(crate) fn with_send_failure(mut self, op: u16, error: TransportError) -> Self {
        self.send_failures.insert(op, error);
        self
    }

    pub(crate) fn denying_permission(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    fn data_for(&self, op: u16) -> Option<Bytes> {
        if op == operation::GET_DEVICE_INFO {
            return Some(self.device_info.encode());
        }
        self.data_replies.get(&op).cloned()
    }
}

// ============================================================================
// VirtualUsb
// ============================================================================

/// Pipes of the currently open link.
struct LiveLink {
    bulk_in: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    interrupt: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    bridge: CallbackBridge,
    task: JoinHandle<()>,
}

/// In-memory USB camera.
pub(crate) struct VirtualUsb {
    behavior: Arc<Behavior>,
    received: Arc<Mutex<Vec<(u16, Vec<u32>)>>>,
    attached: AtomicBool,
    live: Mutex<Option<LiveLink>>,
}

impl VirtualUsb {
    pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::new(behavior),
            received: Arc::new(Mutex::new(Vec::new())),
            attached: AtomicBool::new(true),
            live: Mutex::new(None),
        })
    }

    /// Transport over this camera without a permission grant.
    pub(crate) fn transport(self: &Arc<Self>) -> UsbTransport {
        let backend: Arc<dyn UsbBackend> = Arc::clone(self) as Arc<dyn UsbBackend>;
        UsbTransport::new(backend, Duration::from_millis(200))
    }

    /// Transport with the grant already recorded.
    pub(crate) async fn granted_transport(self: &Arc<Self>) -> UsbTransport {
        let transport = self.transport();
        transport.request_permission(&usb_device()).await;
        transport
    }

    pub(crate) fn target(&self) -> ConnectTarget {
        ConnectTarget::Usb(usb_device())
    }

    /// Opens a raw channel, bypassing sessions.
    pub(crate) async fn open_channel(self: &Arc<Self>) -> (Channel, mpsc::Receiver<Notification>) {
        let transport = self.granted_transport().await;
        let (bridge, rx) = CallbackBridge::channel(32);
        let link = transport
            .open(&self.target(), bridge.clone())
            .await
            .expect("open link");
        (Channel::spawn(TransportKind::UsbPtp, link, bridge), rx)
    }

    /// Operation codes received so far, in order.
    pub(crate) fn received_codes(&self) -> Vec<u16> {
        self.received.lock().iter().map(|(code, _)| *code).collect()
    }

    /// Parameters of the last request with `op`.
    pub(crate) fn received_params(&self, op: u16) -> Option<Vec<u32>> {
        self.received
            .lock()
            .iter()
            .rev()
            .find(|(code, _)| *code == op)
            .map(|(_, params)| params.clone())
    }

    /// Native driver bridge of the open link.
    pub(crate) fn bridge(&self) -> Option<CallbackBridge> {
        self.live.lock().as_ref().map(|l| l.bridge.clone())
    }

    /// Sends an unsolicited event on the interrupt pipe.
    pub(crate) fn emit_event(&self, code: u16, params: Vec<u32>) {
        if let Some(live) = self.live.lock().as_ref() {
            let container = Container::event(code, TransactionId::SESSIONLESS, params);
            let _ = live.interrupt.send(Ok(container.encode_usb()));
        }
    }

    /// Pulls the cable.
    pub(crate) fn unplug(&self) {
        self.attached.store(false, Ordering::SeqCst);
        if let Some(live) = self.live.lock().take() {
            live.task.abort();
            drop(live.bulk_in);
            drop(live.interrupt);
            live.bridge.device_removed();
        }
    }

    /// Plugs the cable back in.
    pub(crate) fn replug(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UsbBackend for VirtualUsb {
    fn list_devices(&self) -> Vec<UsbDeviceInfo> {
        if self.attached.load(Ordering::SeqCst) {
            vec![usb_device()]
        } else {
            Vec::new()
        }
    }

    async fn request_permission(&self, _device: &UsbDeviceInfo) -> PermissionStatus {
        if self.behavior.deny_permission {
            PermissionStatus::Denied
        } else {
            PermissionStatus::Granted(PermissionToken(7))
        }
    }

    async fn open(
        &self,
        device: &UsbDeviceInfo,
        _token: PermissionToken,
        bridge: CallbackBridge,
    ) -> Result<UsbEndpoints, TransportError> {
        if !self.attached.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        // a released link's camera task ends once its pipes drain
        let previous = self.live.lock().take();
        if let Some(mut previous) = previous
            && tokio::time::timeout(Duration::from_millis(100), &mut previous.task)
                .await
                .is_err()
        {
            *self.live.lock() = Some(previous);
            return Err(TransportError::DeviceBusy {
                device: device.to_string(),
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (bulk_tx, bulk_rx) = mpsc::unbounded_channel();
        let (intr_tx, intr_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_camera(
            Arc::clone(&self.behavior),
            Arc::clone(&self.received),
            out_rx,
            bulk_tx.clone(),
            intr_tx.clone(),
        ));

        *self.live.lock() = Some(LiveLink {
            bulk_in: bulk_tx,
            interrupt: intr_tx,
            bridge,
            task,
        });

        Ok(UsbEndpoints {
            bulk_out: Box::new(VirtualSink {
                tx: out_tx,
                failures: self.behavior.send_failures.clone(),
            }),
            bulk_in: Box::new(VirtualSource(bulk_rx)),
            interrupt_in: Box::new(VirtualSource(intr_rx)),
        })
    }
}

// ============================================================================
// Pipes
// ============================================================================

struct VirtualSink {
    tx: mpsc::UnboundedSender<Bytes>,
    failures: FxHashMap<u16, TransportError>,
}

#[async_trait]
impl PacketSink for VirtualSink {
    async fn send(&mut self, transfer: Bytes, _timeout: Duration) -> Result<(), TransportError> {
        if let Ok(container) = Container::decode_usb(transfer.clone())
            && container.kind == ContainerKind::Command
            && let Some(e) = self.failures.get(&container.code)
        {
            return Err(e.clone());
        }
        self.tx.send(transfer).map_err(|_| TransportError::Disconnected)
    }
}

struct VirtualSource(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>);

#[async_trait]
impl PacketSource for VirtualSource {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        self.0.recv().await.unwrap_or(Err(TransportError::Disconnected))
    }
}

/// Answers commands until the host side goes away.
async fn run_camera(
    behavior: Arc<Behavior>,
    received: Arc<Mutex<Vec<(u16, Vec<u32>)>>>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    bulk_in: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    interrupt: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
) {
    while let Some(transfer) = out_rx.recv().await {
        let Ok(command) = Container::decode_usb(transfer) else {
            continue;
        };
        if command.kind != ContainerKind::Command {
            continue;
        }

        let op = command.code;
        let tid = command.transaction_id;
        received.lock().push((op, command.params));

        if behavior.silent.contains(&op) {
            continue;
        }
        if let Some(delay) = behavior.delays.get(&op) {
            tokio::time::sleep(*delay).await;
        }

        let code = behavior.responses.get(&op).copied().unwrap_or(response::OK);
        if code == response::OK
            && let Some(data) = behavior.data_for(op)
        {
            let _ = bulk_in.send(Ok(Container::data(op, tid, data).encode_usb()));
        }

        let params = behavior.reply_params.get(&op).cloned().unwrap_or_default();
        let _ = bulk_in.send(Ok(Container::response(code, tid, params).encode_usb()));

        if op == operation::INITIATE_CAPTURE
            && code == response::OK
            && let Some(handle) = behavior.capture_handle
        {
            let added = Container::event(event::OBJECT_ADDED, TransactionId::SESSIONLESS, vec![handle]);
            let _ = interrupt.send(Ok(added.encode_usb()));
        }
    }
}
