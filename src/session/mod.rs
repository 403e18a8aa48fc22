//! Connection sessions.
//!
//! A [`ConnectionSession`] owns exactly one [`Channel`] plus the handshake
//! result, runs the session state machine and serializes device operations.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `state` | [`SessionState`] and transition reporting |
//! | `event` | [`CaptureEvent`] and [`SessionEvent`] |
//! | `listener` | [`EventListener`] receive loop |
//!
//! # Operations
//!
//! At most one operation is in flight per session. A second request while one
//! is outstanding fails immediately with [`Error::Busy`]; nothing is queued.
//!
//! | Outcome | Next state | Returned |
//! |---------|------------|----------|
//! | OK response | unchanged | `Ok` |
//! | Non-OK response | unchanged | [`Error::Operation`] |
//! | Deadline exceeded | `TimedOut` | [`Error::TimedOut`] |
//! | Deadline exceeded with a fatal status | `TimedOut` (fatal) | [`Error::RestartRequired`] |
//! | Link failure | `Error` | [`Error::Transport`] |
//! | Device removed | `Disconnected` | [`Error::Transport`] |
//!
//! Device removal closes the session even when no listener is attached.

// ============================================================================
// Submodules
// ============================================================================

/// Capture events.
pub mod event;

/// Event listener.
pub mod listener;

/// Session state machine.
pub mod state;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{AttachError, Error, HandshakeFailure, Result, TransportError};
use crate::handshake::{AuthStrategy, HandshakeResult, ProtocolHandshake};
use crate::identifiers::{ListenerId, SessionId};
use crate::protocol::codes::{operation, response};
use crate::protocol::dataset::DatasetReader;
use crate::protocol::{DeviceInfo, OperationRequest, OperationResponse};
use crate::supervisor::TetherOptions;
use crate::transport::{CallbackBridge, Channel, ConnectTarget, Notification, Transport, TransportKind};

// ============================================================================
// Re-exports
// ============================================================================

pub use event::{CaptureEvent, SessionEvent};
pub use listener::EventListener;
pub use state::{SessionState, Transition, TransitionHandler};

// ============================================================================
// PendingOperation
// ============================================================================

/// Snapshot of the operation currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Operation name.
    pub name: String,
    /// PTP operation code.
    pub code: u16,
    /// When the request was issued.
    pub started_at: Instant,
    /// Deadline granted to it.
    pub timeout: Duration,
}

impl PendingOperation {
    /// Time spent waiting so far.
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Clears the pending snapshot when the operation ends, however it ends.
struct PendingGuard<'a>(&'a Mutex<Option<PendingOperation>>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

// ============================================================================
// Event Source
// ============================================================================

/// Receive side handed to the attached listener.
pub(crate) struct EventSource {
    /// Ordered notification queue.
    pub receiver: mpsc::Receiver<Notification>,
    /// Link-down flag.
    pub down: watch::Receiver<bool>,
}

/// Notification queue parked in the session while no listener holds it.
#[derive(Default)]
struct EventSlot {
    receiver: Option<mpsc::Receiver<Notification>>,
    down: Option<watch::Receiver<bool>>,
    owner: Option<ListenerId>,
}

/// What the handshake left behind.
struct Negotiated {
    result: HandshakeResult,
    strategy: Arc<dyn AuthStrategy>,
    opened_at: SystemTime,
}

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for a session.
pub(crate) struct SessionInner {
    /// Local session identifier.
    id: SessionId,
    /// Transport this session runs over.
    kind: TransportKind,
    /// Deadlines and fatal status codes.
    options: Arc<TetherOptions>,
    /// Current state.
    state: Mutex<SessionState>,
    /// Exclusively owned channel.
    channel: Mutex<Option<Arc<Channel>>>,
    /// Handshake outcome, set once on entering `Open`.
    negotiated: Mutex<Option<Negotiated>>,
    /// Single operation permit.
    permit: Semaphore,
    /// Operation in flight.
    pending: Mutex<Option<PendingOperation>>,
    /// Notification queue not currently held by a listener.
    events: Mutex<EventSlot>,
    /// Serializes close.
    close_gate: AsyncMutex<()>,
    /// State change callback.
    on_transition: Option<TransitionHandler>,
}

// ============================================================================
// ConnectionSession
// ============================================================================

/// One exclusive, stateful ownership of a transport.
///
/// Cheap to clone; clones share the same session.
///
/// # Example
///
/// ```ignore
/// let session = supervisor.connect(&candidate).await?;
/// session.capture().await?;
/// let storages = session.probe().await?;
/// supervisor.disconnect().await?;
/// ```
#[derive(Clone)]
pub struct ConnectionSession {
    /// Shared inner state.
    pub(crate) inner: Arc<SessionInner>,
}

// ============================================================================
// ConnectionSession - Display
// ============================================================================

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionSession - Constructor
// ============================================================================

impl ConnectionSession {
    /// Creates an `Idle` session.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        options: Arc<TetherOptions>,
        on_transition: Option<TransitionHandler>,
    ) -> Self {
        let id = SessionId::generate();
        debug!(session_id = %id, %kind, "Session created");

        Self {
            inner: Arc::new(SessionInner {
                id,
                kind,
                options,
                state: Mutex::new(SessionState::Idle),
                channel: Mutex::new(None),
                negotiated: Mutex::new(None),
                permit: Semaphore::new(1),
                pending: Mutex::new(None),
                events: Mutex::new(EventSlot::default()),
                close_gate: AsyncMutex::new(()),
                on_transition,
            }),
        }
    }
}

// ============================================================================
// ConnectionSession - Accessors
// ============================================================================

impl ConnectionSession {
    /// Returns the local session ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Returns the transport kind.
    #[inline]
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Returns `true` once the session reached a terminal state.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns the handshake result, once the session has been opened.
    #[must_use]
    pub fn handshake_result(&self) -> Option<HandshakeResult> {
        self.inner.negotiated.lock().as_ref().map(|n| n.result.clone())
    }

    /// Returns the negotiated device capabilities.
    #[must_use]
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner
            .negotiated
            .lock()
            .as_ref()
            .map(|n| n.result.device_info.clone())
    }

    /// Returns when the session entered `Open`.
    #[must_use]
    pub fn opened_at(&self) -> Option<SystemTime> {
        self.inner.negotiated.lock().as_ref().map(|n| n.opened_at)
    }

    /// Returns the operation in flight, if any.
    #[must_use]
    pub fn pending_operation(&self) -> Option<PendingOperation> {
        self.inner.pending.lock().clone()
    }

    /// Returns how many notifications were dropped on queue overflow.
    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        self.channel().map_or(0, |c| c.bridge().dropped())
    }

    /// Returns `true` while the session still holds a channel.
    #[inline]
    #[must_use]
    pub fn has_channel(&self) -> bool {
        self.inner.channel.lock().is_some()
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.channel.lock().clone()
    }
}

// ============================================================================
// ConnectionSession - State Machine
// ============================================================================

impl ConnectionSession {
    /// Applies `self → to` if allowed and reports it.
    ///
    /// Returns `false` (and changes nothing) if the transition is not allowed
    /// from the current state.
    pub(crate) fn transition(&self, to: SessionState, message: Option<String>, fatal: bool) -> bool {
        let from = {
            let mut state = self.inner.state.lock();
            let from = *state;
            if !from.can_transition_to(to) {
                debug!(session_id = %self.inner.id, %from, %to, "Transition not allowed");
                return false;
            }
            *state = to;
            from
        };

        match &message {
            Some(message) => info!(session_id = %self.inner.id, %from, %to, fatal, %message, "Session state changed"),
            None => info!(session_id = %self.inner.id, %from, %to, "Session state changed"),
        }

        if let Some(handler) = &self.inner.on_transition {
            handler(&Transition {
                session_id: self.inner.id,
                transport_kind: self.inner.kind,
                from,
                to,
                message,
                fatal,
            });
        }
        true
    }
}

// ============================================================================
// ConnectionSession - Lifecycle
// ============================================================================

impl ConnectionSession {
    /// Opens the transport and runs the handshake.
    ///
    /// `Idle → Connecting → Handshaking → Open`. A transport failure ends in
    /// `Error`; so does a handshake failure, after the channel was closed.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the session is not `Idle` or was closed
    ///   while opening
    /// - [`Error::Transport`] if the transport could not be opened
    /// - [`Error::Handshake`] if the handshake failed
    /// - [`Error::RestartRequired`] if a handshake phase timed out with a
    ///   fatal status
    pub async fn open(
        &self,
        transport: &dyn Transport,
        target: &ConnectTarget,
        handshake: &ProtocolHandshake,
    ) -> Result<HandshakeResult> {
        if !self.transition(SessionState::Connecting, Some(format!("connecting to {target}")), false) {
            return Err(Error::invalid_state(self.state(), "open"));
        }

        // Connecting
        let (bridge, receiver) = CallbackBridge::channel(self.inner.options.event_queue_capacity);
        let down = bridge.down_signal();
        let link_down = bridge.down_signal();
        let deadline = self.inner.options.timeouts.connect();

        let opened = match timeout(deadline, transport.open(target, bridge.clone())).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(deadline.as_millis() as u64)),
        };

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                warn!(session_id = %self.inner.id, %target, error = %e, "Transport open failed");
                self.transition(SessionState::Error, Some(e.to_string()), false);
                return Err(e.into());
            }
        };

        let channel = Arc::new(Channel::spawn(self.inner.kind, link, bridge));
        *self.inner.channel.lock() = Some(Arc::clone(&channel));

        // Handshaking
        if !self.transition(SessionState::Handshaking, None, false) {
            self.release_channel().await;
            return Err(Error::invalid_state(self.state(), "open"));
        }

        let outcome = match handshake.run(&channel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_channel().await;

                if let HandshakeFailure::Transport(TransportError::Timeout {
                    status: Some(status),
                    ..
                }) = &e.failure
                    && self.inner.options.is_fatal_status(*status)
                {
                    error!(session_id = %self.inner.id, status = *status, phase = %e.phase, "Fatal status during handshake");
                    self.transition(SessionState::TimedOut, Some(e.to_string()), true);
                    return Err(Error::RestartRequired);
                }

                self.transition(SessionState::Error, Some(e.to_string()), false);
                return Err(e.into());
            }
        };

        let result = outcome.result.clone();
        *self.inner.negotiated.lock() = Some(Negotiated {
            result: outcome.result,
            strategy: outcome.strategy,
            opened_at: SystemTime::now(),
        });
        {
            let mut slot = self.inner.events.lock();
            slot.receiver = Some(receiver);
            slot.down = Some(down);
            slot.owner = None;
        }

        let message = format!("{} ready", result.device_info.display_name());
        if !self.transition(SessionState::Open, Some(message), false) {
            self.release_channel().await;
            return Err(Error::invalid_state(self.state(), "open"));
        }

        tokio::spawn(watch_link(Arc::downgrade(&self.inner), link_down));

        Ok(result)
    }

    /// Closes the session.
    ///
    /// `→ Closing → Disconnected`. Sends a best-effort CloseSession if the
    /// session was open and idle, then releases the channel. Idempotent;
    /// a no-op on an `Idle` session.
    pub async fn close(&self) {
        self.close_with(None).await;
    }

    /// [`close`](Self::close) with a cause shown in status messages.
    pub(crate) async fn close_with(&self, reason: Option<String>) {
        let _gate = self.inner.close_gate.lock().await;

        let from = self.state();
        if !self.transition(SessionState::Closing, reason.clone(), false) {
            return;
        }

        if from.accepts_operations()
            && let Some(channel) = self.channel()
            && let Ok(_permit) = self.inner.permit.try_acquire()
        {
            let request = OperationRequest::new(operation::CLOSE_SESSION, []);
            match channel.transact(request, self.inner.options.timeouts.close()).await {
                Ok(reply) => debug!(session_id = %self.inner.id, code = response::name(reply.code), "CloseSession answered"),
                Err(e) => debug!(session_id = %self.inner.id, error = %e, "CloseSession failed"),
            }
        }

        self.release_channel().await;
        *self.inner.events.lock() = EventSlot::default();

        self.transition(SessionState::Disconnected, reason, false);
    }

    /// Takes the channel out of the session and waits for it to close.
    async fn release_channel(&self) {
        let channel = self.inner.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
            debug!(session_id = %self.inner.id, "Channel released");
        }
    }
}

// ============================================================================
// ConnectionSession - Operations
// ============================================================================

impl ConnectionSession {
    /// Triggers a capture.
    ///
    /// The resulting photo arrives as a [`CaptureEvent::PhotoCaptured`]
    /// through the attached listener.
    ///
    /// # Errors
    ///
    /// See the operation table in the module docs.
    pub async fn capture(&self) -> Result<()> {
        let request = OperationRequest::new(operation::INITIATE_CAPTURE, [0, 0]);
        self.run_operation("capture", request, self.inner.options.timeouts.capture())
            .await?;
        Ok(())
    }

    /// Diagnostic round trip: lists the device's storage IDs.
    ///
    /// # Errors
    ///
    /// See the operation table in the module docs; a malformed storage list
    /// is reported as [`TransportError::Malformed`].
    pub async fn probe(&self) -> Result<Vec<u32>> {
        let request = OperationRequest::new(operation::GET_STORAGE_IDS, []);
        let reply = self
            .run_operation("probe", request, self.inner.options.timeouts.command())
            .await?;
        let ids = DatasetReader::new(&reply.data).u32_array()?;
        Ok(ids)
    }

    /// Runs one arbitrary command.
    ///
    /// # Errors
    ///
    /// See the operation table in the module docs.
    pub async fn execute(&self, request: OperationRequest) -> Result<OperationResponse> {
        let name = format!("operation {:#06x}", request.code);
        self.run_operation(&name, request, self.inner.options.timeouts.command())
            .await
    }

    /// Fetches one live-view frame through the vendor's live-view operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Operation`] with `OperationNotSupported` if the
    /// selected vendor strategy has no live-view operation; otherwise see the
    /// operation table in the module docs.
    pub async fn live_view_frame(&self) -> Result<Bytes> {
        let request = self
            .inner
            .negotiated
            .lock()
            .as_ref()
            .and_then(|n| n.strategy.live_view_request());

        let Some(request) = request else {
            let state = self.state();
            if !state.accepts_operations() {
                return Err(Error::invalid_state(state, "live view"));
            }
            return Err(Error::operation("live view", response::OPERATION_NOT_SUPPORTED));
        };

        let reply = self
            .run_operation("live view", request, self.inner.options.timeouts.command())
            .await?;
        Ok(reply.data)
    }

    /// Runs one operation under the single permit and classifies its outcome.
    async fn run_operation(
        &self,
        name: &str,
        request: OperationRequest,
        deadline: Duration,
    ) -> Result<OperationResponse> {
        let state = self.state();
        if !state.accepts_operations() {
            return Err(Error::invalid_state(state, name));
        }

        let Ok(_permit) = self.inner.permit.try_acquire() else {
            debug!(session_id = %self.inner.id, operation = name, "Rejected, operation in flight");
            return Err(Error::busy(name));
        };

        let Some(channel) = self.channel() else {
            return Err(Error::invalid_state(self.state(), name));
        };

        *self.inner.pending.lock() = Some(PendingOperation {
            name: name.to_string(),
            code: request.code,
            started_at: Instant::now(),
            timeout: deadline,
        });
        let _pending = PendingGuard(&self.inner.pending);

        match channel.transact(request, deadline).await {
            Ok(reply) if reply.is_ok() => Ok(reply),

            Ok(reply) => {
                warn!(
                    session_id = %self.inner.id,
                    operation = name,
                    code = response::name(reply.code),
                    "Device rejected operation"
                );
                Err(Error::operation(name, reply.code))
            }

            Err(TransportError::Timeout { status, .. }) => {
                let timeout_ms = deadline.as_millis() as u64;

                if let Some(code) = status
                    && self.inner.options.is_fatal_status(code)
                {
                    error!(
                        session_id = %self.inner.id,
                        operation = name,
                        status = code,
                        "Fatal transport status, restart required"
                    );
                    let message = format!("{name} timed out with fatal status {code}");
                    self.transition(SessionState::TimedOut, Some(message), true);
                    return Err(Error::RestartRequired);
                }

                let message = format!("{name} timed out after {timeout_ms}ms");
                self.transition(SessionState::TimedOut, Some(message), false);
                Err(Error::timed_out(name, timeout_ms, status))
            }

            Err(e) if e == TransportError::Disconnected || channel.bridge().is_down() => {
                warn!(session_id = %self.inner.id, operation = name, error = %e, "Link lost during operation");
                self.close_with(Some(DEVICE_DETACHED.to_string())).await;
                Err(e.into())
            }

            Err(e) => {
                self.transition(SessionState::Error, Some(format!("{name}: {e}")), false);
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// Link Watcher
// ============================================================================

/// Status message for a session closed by device removal.
pub(crate) const DEVICE_DETACHED: &str = "device detached";

/// Closes an `Open` session whose link went down while no listener holds
/// the notification queue. An attached listener handles removal itself.
async fn watch_link(session: Weak<SessionInner>, mut down: watch::Receiver<bool>) {
    if down.wait_for(|down| *down).await.is_err() {
        return;
    }

    let Some(inner) = session.upgrade() else {
        return;
    };
    let session = ConnectionSession { inner };

    if session.state() != SessionState::Open || session.inner.events.lock().owner.is_some() {
        return;
    }

    info!(session_id = %session.id(), "Device detached without a listener");
    session.close_with(Some(DEVICE_DETACHED.to_string())).await;
}

// ============================================================================
// ConnectionSession - Event Source
// ============================================================================

impl ConnectionSession {
    /// Hands the notification queue to `listener` and enters
    /// `EventListening`.
    ///
    /// Fails if any listener, `listener` included, still owns the queue: a
    /// loop that has not handed it back is still running.
    pub(crate) fn claim_event_source(
        &self,
        listener: ListenerId,
    ) -> std::result::Result<EventSource, AttachError> {
        let source = {
            let mut slot = self.inner.events.lock();

            if let Some(owner) = slot.owner {
                debug!(session_id = %self.inner.id, %owner, %listener, "Event source still owned");
                return Err(AttachError::AlreadyAttached {
                    session_id: self.inner.id,
                });
            }

            let state = self.state();
            if state != SessionState::Open {
                return Err(AttachError::NotOpen { state });
            }

            let (Some(receiver), Some(down)) = (slot.receiver.take(), slot.down.clone()) else {
                return Err(AttachError::SourceClosed);
            };
            slot.owner = Some(listener);
            EventSource { receiver, down }
        };

        if !self.transition(SessionState::EventListening, None, false) {
            let state = self.state();
            let mut slot = self.inner.events.lock();
            slot.owner = None;
            if slot.down.is_some() {
                slot.receiver = Some(source.receiver);
            }
            return Err(AttachError::NotOpen { state });
        }

        Ok(source)
    }

    /// Returns the notification queue from `listener` and leaves
    /// `EventListening`.
    ///
    /// Ignored if `listener` no longer owns the queue (the session was closed
    /// in the meantime).
    pub(crate) fn restore_event_source(
        &self,
        listener: ListenerId,
        receiver: Option<mpsc::Receiver<Notification>>,
    ) {
        {
            let mut slot = self.inner.events.lock();
            if slot.owner != Some(listener) {
                return;
            }
            slot.owner = None;
            if slot.down.is_some() {
                slot.receiver = receiver;
            }
        }

        self.transition(SessionState::Open, Some("event listener detached".to_string()), false);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::handshake::AuthRegistry;
    use crate::testing::{Behavior, TransitionLog, VirtualUsb, acme_profile, test_options};

    const LIVE_VIEW: u16 = 0x9153;

    fn handshake(options: &TetherOptions) -> ProtocolHandshake {
        let mut registry = AuthRegistry::new();
        registry.register_profiles(&options.auth_profiles);
        ProtocolHandshake::new(Arc::new(registry), options.timeouts.handshake())
    }

    async fn open_with(
        camera: &Arc<VirtualUsb>,
        options: TetherOptions,
    ) -> (ConnectionSession, TransitionLog, Result<HandshakeResult>) {
        let log = TransitionLog::default();
        let options = Arc::new(options);
        let session = ConnectionSession::new(TransportKind::UsbPtp, Arc::clone(&options), Some(log.handler()));
        let transport = camera.granted_transport().await;
        let result = session
            .open(&transport, &camera.target(), &handshake(&options))
            .await;
        (session, log, result)
    }

    async fn open(camera: &Arc<VirtualUsb>) -> ConnectionSession {
        let (session, _log, result) = open_with(camera, test_options()).await;
        result.expect("open");
        session
    }

    #[tokio::test]
    async fn test_open_walks_happy_path() {
        let camera = VirtualUsb::new(Behavior::default());
        let (session, log, result) = open_with(&camera, test_options()).await;

        let result = result.expect("open");
        assert!(!result.authenticated);
        assert_eq!(session.state(), SessionState::Open);
        assert!(session.opened_at().is_some());
        assert_eq!(
            log.states(),
            vec![SessionState::Connecting, SessionState::Handshaking, SessionState::Open]
        );
    }

    #[tokio::test]
    async fn test_phase_two_failure_closes_channel_and_errors() {
        let camera = VirtualUsb::new(Behavior::acme().with_response(0x9102, response::ACCESS_DENIED));
        let options = test_options().with_auth_profile(acme_profile());
        let (session, log, result) = open_with(&camera, options).await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Handshake(ref e) if e.phase == crate::handshake::HandshakePhase::AuthenticatingPhase2));
        assert_eq!(session.state(), SessionState::Error);
        assert!(!session.has_channel());
        assert!(!log.states().contains(&SessionState::Open));
    }

    #[tokio::test]
    async fn test_permission_denied_ends_in_error() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = ConnectionSession::new(TransportKind::UsbPtp, Arc::new(test_options()), None);
        let transport = camera.transport();

        let err = session
            .open(&transport, &camera.target(), &handshake(&test_options()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::PermissionDenied { .. })));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_open_twice_is_invalid() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open(&camera).await;
        let transport = camera.granted_transport().await;

        let err = session
            .open(&transport, &camera.target(), &handshake(&test_options()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: SessionState::Open, .. }));
    }

    #[tokio::test]
    async fn test_operations_require_open_session() {
        let session = ConnectionSession::new(TransportKind::UsbPtp, Arc::new(test_options()), None);
        let err = session.capture().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: SessionState::Idle, .. }));
        assert!(err.is_caller_error());
    }

    #[tokio::test]
    async fn test_second_operation_is_busy_not_queued() {
        let camera = VirtualUsb::new(
            Behavior::default().with_delay(operation::INITIATE_CAPTURE, Duration::from_millis(200)),
        );
        let session = open(&camera).await;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            session.pending_operation().map(|p| p.code),
            Some(operation::INITIATE_CAPTURE)
        );

        let started = Instant::now();
        let err = session.probe().await.unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));
        assert!(started.elapsed() < Duration::from_millis(100));

        first.await.expect("join").expect("capture");
        assert!(session.pending_operation().is_none());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_probe_returns_storage_ids() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open(&camera).await;
        assert_eq!(session.probe().await.expect("probe"), vec![0x0001_0001]);
    }

    #[tokio::test]
    async fn test_rejected_operation_keeps_state() {
        let camera = VirtualUsb::new(
            Behavior::default().with_response(operation::INITIATE_CAPTURE, response::DEVICE_BUSY),
        );
        let session = open(&camera).await;

        let err = session.capture().await.unwrap_err();
        assert!(matches!(err, Error::Operation { code: response::DEVICE_BUSY, .. }));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let camera = VirtualUsb::new(Behavior::default().with_silent(operation::INITIATE_CAPTURE));
        let (session, log, result) = open_with(&camera, test_options()).await;
        result.expect("open");

        let err = session.capture().await.unwrap_err();
        assert!(matches!(err, Error::TimedOut { .. }));
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(!log.any_fatal());
    }

    #[tokio::test]
    async fn test_fatal_status_requires_restart() {
        let camera = VirtualUsb::new(Behavior::default().with_send_failure(
            operation::INITIATE_CAPTURE,
            TransportError::Timeout {
                timeout_ms: 100,
                status: Some(-116),
            },
        ));
        let (session, log, result) = open_with(&camera, test_options().with_fatal_status(-116)).await;
        result.expect("open");

        let err = session.capture().await.unwrap_err();
        assert!(err.requires_restart());
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(log.any_fatal());
    }

    #[tokio::test]
    async fn test_unlisted_status_is_plain_timeout() {
        let camera = VirtualUsb::new(Behavior::default().with_send_failure(
            operation::INITIATE_CAPTURE,
            TransportError::Timeout {
                timeout_ms: 100,
                status: Some(-5),
            },
        ));
        let (session, _log, result) = open_with(&camera, test_options().with_fatal_status(-116)).await;
        result.expect("open");

        let err = session.capture().await.unwrap_err();
        assert!(matches!(err, Error::TimedOut { status: Some(-5), .. }));
    }

    #[tokio::test]
    async fn test_live_view_uses_vendor_operation() {
        let camera = VirtualUsb::new(Behavior::acme());
        let options = test_options().with_auth_profile(acme_profile());
        let (session, _log, result) = open_with(&camera, options).await;
        assert!(result.expect("open").authenticated);

        let frame = session.live_view_frame().await.expect("frame");
        assert!(frame.starts_with(&[0xFF, 0xD8]));
        assert!(camera.received_codes().contains(&LIVE_VIEW));
    }

    #[tokio::test]
    async fn test_live_view_unsupported_without_vendor() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open(&camera).await;

        let err = session.live_view_frame().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Operation { code: response::OPERATION_NOT_SUPPORTED, .. }
        ));
    }

    #[tokio::test]
    async fn test_close_sends_close_session_and_is_idempotent() {
        let camera = VirtualUsb::new(Behavior::default());
        let (session, log, result) = open_with(&camera, test_options()).await;
        result.expect("open");

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.has_channel());
        assert!(camera.received_codes().contains(&operation::CLOSE_SESSION));
        assert_eq!(
            log.states()[3..],
            [SessionState::Closing, SessionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_close_after_timeout_reaches_disconnected() {
        let camera = VirtualUsb::new(Behavior::default().with_silent(operation::INITIATE_CAPTURE));
        let session = open(&camera).await;
        let _ = session.capture().await;

        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        // no CloseSession on a timed-out device
        assert!(!camera.received_codes().contains(&operation::CLOSE_SESSION));
    }

    async fn wait_for_state(session: &ConnectionSession, state: SessionState) {
        timeout(Duration::from_secs(2), async {
            while session.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state reached in time");
    }

    #[tokio::test]
    async fn test_unplug_without_listener_disconnects() {
        let camera = VirtualUsb::new(Behavior::default());
        let (session, log, result) = open_with(&camera, test_options()).await;
        result.expect("open");

        camera.unplug();
        wait_for_state(&session, SessionState::Disconnected).await;

        assert!(!session.has_channel());
        assert_eq!(
            log.states()[3..],
            [SessionState::Closing, SessionState::Disconnected]
        );
        let err = session.probe().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { state: SessionState::Disconnected, .. }));
    }

    #[tokio::test]
    async fn test_native_removal_without_listener_disconnects() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open(&camera).await;

        camera.bridge().expect("bridge").device_removed();
        wait_for_state(&session, SessionState::Disconnected).await;
        assert!(!session.has_channel());
    }

    #[tokio::test]
    async fn test_operation_right_after_unplug_disconnects() {
        let camera = VirtualUsb::new(Behavior::default());
        let (session, log, result) = open_with(&camera, test_options()).await;
        result.expect("open");

        camera.unplug();
        assert!(session.probe().await.is_err());

        wait_for_state(&session, SessionState::Disconnected).await;
        assert!(!log.states().contains(&SessionState::Error));
    }

    #[tokio::test]
    async fn test_close_idle_session_is_noop() {
        let session = ConnectionSession::new(TransportKind::PtpIpStation, Arc::new(test_options()), None);
        session.close().await;
        assert_eq!(session.state(), SessionState::Idle);
    }
}
