//! Connection supervisor.
//!
//! The [`ConnectionSupervisor`] is the one object the application talks to.
//! It owns the active session and its event listener, and it routes
//! discovery and connect requests to the matching transport.
//!
//! # Exclusivity
//!
//! Connect, disconnect and shutdown are serialized. A connect is refused
//! with [`Error::SessionActive`] while the previous session is not terminal,
//! so there is never more than one live session per supervisor.
//!
//! # Restart latch
//!
//! A timeout carrying a fatal low-level status latches the supervisor. From
//! then on every connect returns [`Error::RestartRequired`]; only a new
//! process clears it.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, watch};
use tracing::{debug, info, warn};

use crate::discovery::{
    DeviceCandidate, DeviceIdentity, DiscoveryService, NetworkEnvironment, PtpIpDiscovery,
    UsbDiscovery,
};
use crate::error::{Error, Result};
use crate::handshake::{AuthRegistry, AuthStrategy, ProtocolHandshake};
use crate::session::{ConnectionSession, EventListener, SessionEvent, SessionState};
use crate::transport::{
    ConnectTarget, PermissionStatus, TcpTransport, Transport, TransportKind, UsbBackend,
    UsbDeviceInfo, UsbTransport,
};

use super::builder::SupervisorBuilder;
use super::options::TetherOptions;
use super::status::{StatusReporter, SupervisorStatus};

// ============================================================================
// Types
// ============================================================================

/// USB side of the supervisor.
struct UsbSide {
    transport: Arc<UsbTransport>,
    discovery: UsbDiscovery,
}

/// Internal shared state for the supervisor.
pub(crate) struct SupervisorInner {
    /// Validated options.
    options: Arc<TetherOptions>,
    /// USB transport and discovery, if a backend was configured.
    usb: Option<UsbSide>,
    /// Wireless network subsystem, if configured.
    network: Option<Arc<dyn NetworkEnvironment>>,
    /// Handshake shared by all sessions.
    handshake: ProtocolHandshake,
    /// Current or last session.
    session: Mutex<Option<ConnectionSession>>,
    /// Serializes connect, disconnect and shutdown.
    gate: AsyncMutex<()>,
    /// Single listener, re-attached per session.
    listener: EventListener,
    /// Status aggregation and restart latch.
    reporter: Arc<StatusReporter>,
}

// ============================================================================
// ConnectionSupervisor
// ============================================================================

/// Top-level coordinator for camera connections.
///
/// Cheap to clone; clones share the same supervisor.
///
/// # Example
///
/// ```ignore
/// use futures_util::StreamExt;
/// use ptp_tether::{ConnectionSupervisor, TransportKind};
///
/// let supervisor = ConnectionSupervisor::builder().usb_backend(backend).build()?;
/// let mut events = supervisor.subscribe_events();
///
/// let mut found = supervisor.discover(TransportKind::UsbPtp)?;
/// if let Some(candidate) = found.next().await {
///     let session = supervisor.connect(&candidate).await?;
///     session.capture().await?;
///     let photo = events.recv().await?;
/// }
/// supervisor.disconnect().await?;
/// ```
#[derive(Clone)]
pub struct ConnectionSupervisor {
    /// Shared inner state.
    pub(crate) inner: Arc<SupervisorInner>,
}

// ============================================================================
// ConnectionSupervisor - Display
// ============================================================================

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("usb", &self.inner.usb.is_some())
            .field("network", &self.inner.network.is_some())
            .field("status", &self.current_state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionSupervisor - Constructor
// ============================================================================

impl ConnectionSupervisor {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// Creates a supervisor from validated parts.
    pub(crate) fn new(
        options: TetherOptions,
        usb_backend: Option<Arc<dyn UsbBackend>>,
        network: Option<Arc<dyn NetworkEnvironment>>,
        strategies: Vec<Arc<dyn AuthStrategy>>,
    ) -> Self {
        let options = Arc::new(options);

        let mut registry = AuthRegistry::new();
        for strategy in strategies {
            registry.register(strategy);
        }
        registry.register_profiles(&options.auth_profiles);
        let handshake = ProtocolHandshake::new(Arc::new(registry), options.timeouts.handshake());

        let usb = usb_backend.map(|backend| UsbSide {
            transport: Arc::new(UsbTransport::new(
                Arc::clone(&backend),
                options.timeouts.command(),
            )),
            discovery: UsbDiscovery::new(
                backend,
                options.usb_interface_class,
                options.usb_vendor_allowlist.clone(),
            ),
        });

        let (events, _) = broadcast::channel(options.event_broadcast_capacity);

        info!(
            usb = usb.is_some(),
            network = network.is_some(),
            auth_strategies = handshake.registry().len(),
            "Connection supervisor created"
        );

        Self {
            inner: Arc::new(SupervisorInner {
                options,
                usb,
                network,
                handshake,
                session: Mutex::new(None),
                gate: AsyncMutex::new(()),
                listener: EventListener::new(events),
                reporter: StatusReporter::new(),
            }),
        }
    }
}

// ============================================================================
// ConnectionSupervisor - Accessors
// ============================================================================

impl ConnectionSupervisor {
    /// Returns the options in effect.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TetherOptions {
        &self.inner.options
    }

    /// Returns a snapshot of the aggregated status.
    #[inline]
    #[must_use]
    pub fn current_state(&self) -> SupervisorStatus {
        self.inner.reporter.snapshot()
    }

    /// Watches the aggregated status.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.reporter.subscribe()
    }

    /// Subscribes to capture events of every session this supervisor runs.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.listener.subscribe()
    }

    /// Returns the current or last session.
    #[must_use]
    pub fn active_session(&self) -> Option<ConnectionSession> {
        self.inner.session.lock().clone()
    }

    /// Returns `true` once a fatal condition latched the supervisor.
    #[inline]
    #[must_use]
    pub fn restart_required(&self) -> bool {
        self.inner.reporter.restart_required()
    }
}

// ============================================================================
// ConnectionSupervisor - Discovery
// ============================================================================

impl ConnectionSupervisor {
    /// Starts one discovery round for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTransport`] if `kind` was not configured.
    pub fn discover(&self, kind: TransportKind) -> Result<BoxStream<'static, DeviceCandidate>> {
        let stream = match kind {
            TransportKind::UsbPtp => self.usb(kind)?.discovery.discover(),
            TransportKind::PtpIpAccessPoint => PtpIpDiscovery::access_point(
                self.network(kind)?,
                self.inner.options.ptpip_port,
                self.inner.options.timeouts.probe(),
            )
            .discover(),
            TransportKind::PtpIpStation => PtpIpDiscovery::station(
                self.network(kind)?,
                self.inner.options.ptpip_port,
                self.inner.options.timeouts.probe(),
                self.inner.options.scan_concurrency,
                self.inner.options.scan_host_limit,
            )
            .discover(),
        };

        debug!(%kind, "Discovery round started");
        Ok(stream)
    }

    /// Asks the USB subsystem for access to `candidate`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedTransport`] if USB was not configured
    /// - [`Error::DeviceNotFound`] if the device is no longer attached
    pub async fn request_usb_permission(&self, candidate: &DeviceCandidate) -> Result<PermissionStatus> {
        let usb = self.usb(TransportKind::UsbPtp)?;
        let device = self.find_usb_device(usb, &candidate.identity)?;
        Ok(usb.transport.request_permission(&device).await)
    }
}

// ============================================================================
// ConnectionSupervisor - Lifecycle
// ============================================================================

impl ConnectionSupervisor {
    /// Connects to `candidate` and starts publishing its events.
    ///
    /// A terminal previous session is released first. USB permission is
    /// requested on the way if no grant is recorded. If the listener cannot
    /// attach, the session stays `Open` and the status line says why.
    ///
    /// # Errors
    ///
    /// - [`Error::RestartRequired`] once the supervisor is latched
    /// - [`Error::SessionActive`] if the previous session is still live
    /// - [`Error::UnsupportedTransport`] if the candidate's transport was not
    ///   configured
    /// - [`Error::DeviceNotFound`] if the candidate cannot be re-resolved
    /// - any error of [`ConnectionSession::open`]
    pub async fn connect(&self, candidate: &DeviceCandidate) -> Result<ConnectionSession> {
        let _gate = self.inner.gate.lock().await;

        if self.restart_required() {
            return Err(Error::RestartRequired);
        }

        if let Some(prior) = self.active_session() {
            let state = prior.state();
            if !state.is_terminal() {
                return Err(Error::SessionActive { state });
            }
        }
        self.release_prior().await;

        let kind = candidate.transport_kind;
        let (transport, target) = self.resolve(candidate).await?;

        let session = ConnectionSession::new(
            kind,
            Arc::clone(&self.inner.options),
            Some(self.inner.reporter.handler()),
        );
        self.inner.reporter.track(session.id(), kind);
        *self.inner.session.lock() = Some(session.clone());

        info!(session_id = %session.id(), %kind, %target, device = %candidate.display_name, "Connecting");
        session
            .open(transport.as_ref(), &target, &self.inner.handshake)
            .await?;

        if let Err(e) = self.inner.listener.attach(&session).await {
            warn!(session_id = %session.id(), error = %e, "Events unavailable for this session");
            self.inner.reporter.note(format!("connected, events unavailable: {e}"));
        }

        Ok(session)
    }

    /// Closes the current session.
    ///
    /// The listener publishes [`DeviceDetached`](crate::CaptureEvent::DeviceDetached)
    /// as its last event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no session or it is
    /// already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let _gate = self.inner.gate.lock().await;

        let session = self.active_session().ok_or(Error::NotConnected)?;
        if session.state() == SessionState::Disconnected {
            return Err(Error::NotConnected);
        }

        info!(session_id = %session.id(), "Disconnecting");
        session.close().await;
        self.inner.listener.detach().await;
        Ok(())
    }

    /// Closes any session and stops the listener. Idempotent.
    pub async fn shutdown(&self) {
        let _gate = self.inner.gate.lock().await;
        self.release_prior().await;
        info!("Connection supervisor shut down");
    }

    /// Stops the listener and closes the held session, if any.
    async fn release_prior(&self) {
        let prior = self.active_session();
        if let Some(prior) = prior {
            prior.close().await;
        }
        self.inner.listener.detach().await;
    }
}

// ============================================================================
// ConnectionSupervisor - Resolution
// ============================================================================

impl ConnectionSupervisor {
    /// Re-resolves a candidate into a transport and address.
    async fn resolve(&self, candidate: &DeviceCandidate) -> Result<(Arc<dyn Transport>, ConnectTarget)> {
        let kind = candidate.transport_kind;

        match kind {
            TransportKind::UsbPtp => {
                let usb = self.usb(kind)?;
                let device = self.find_usb_device(usb, &candidate.identity)?;
                if !usb.transport.has_permission(&device) {
                    usb.transport.request_permission(&device).await;
                }
                let transport: Arc<dyn Transport> = Arc::clone(&usb.transport) as Arc<dyn Transport>;
                Ok((transport, ConnectTarget::Usb(device)))
            }

            TransportKind::PtpIpAccessPoint | TransportKind::PtpIpStation => {
                let env = self.network(kind)?;
                let addr = self.resolve_network(kind, env.as_ref(), &candidate.identity)?;
                let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
                    kind,
                    self.inner.options.timeouts.connect(),
                    self.inner.options.host_guid,
                    self.inner.options.host_name.clone(),
                ));
                Ok((transport, ConnectTarget::Network(addr)))
            }
        }
    }

    /// Access point: the camera is whatever gateway we are joined to now.
    /// Station: the probed address.
    fn resolve_network(
        &self,
        kind: TransportKind,
        env: &dyn NetworkEnvironment,
        identity: &DeviceIdentity,
    ) -> Result<SocketAddr> {
        let DeviceIdentity::Network { addr } = identity else {
            return Err(Error::device_not_found(identity));
        };

        if kind == TransportKind::PtpIpStation {
            return Ok(*addr);
        }

        let gateway = env
            .identity()
            .and_then(|network| network.gateway)
            .ok_or_else(|| Error::device_not_found(identity))?;
        Ok(SocketAddr::new(gateway.into(), addr.port()))
    }

    fn find_usb_device(&self, usb: &UsbSide, identity: &DeviceIdentity) -> Result<UsbDeviceInfo> {
        usb.discovery
            .list()
            .into_iter()
            .find(|device| identity.matches_usb(device))
            .ok_or_else(|| Error::device_not_found(identity))
    }

    fn usb(&self, kind: TransportKind) -> Result<&UsbSide> {
        self.inner
            .usb
            .as_ref()
            .ok_or(Error::UnsupportedTransport { kind })
    }

    fn network(&self, kind: TransportKind) -> Result<Arc<dyn NetworkEnvironment>> {
        self.inner
            .network
            .clone()
            .ok_or(Error::UnsupportedTransport { kind })
    }
}

// ============================================================================
// Tests
// ============================================================================
