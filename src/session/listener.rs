//! Event listener.
//!
//! An [`EventListener`] borrows a session's notification queue and runs one
//! receive loop that republishes every notification as a [`SessionEvent`].
//!
//! ```text
//! CallbackBridge ─┐
//!                 ├─► notification queue ─► receive loop ─► broadcast<SessionEvent>
//! Channel events ─┘                             │
//!                       link down ──────────────┴─► DeviceDetached, close session
//! ```
//!
//! The loop has no polling interval; it wakes only on a notification, the
//! link-down flag or a stop request.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::AttachError;
use crate::identifiers::{ListenerId, SessionId};
use crate::transport::Notification;

use super::event::{CaptureEvent, SessionEvent};
use super::{ConnectionSession, DEVICE_DETACHED, EventSource};

// ============================================================================
// Types
// ============================================================================

/// The loop currently bound to a session.
struct ActiveLoop {
    session: ConnectionSession,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Decrements the running-loop counter when the loop task ends.
struct LoopGuard(Arc<AtomicUsize>);

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// EventListener
// ============================================================================

/// Single background subscriber bound to one session at a time.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = tokio::sync::broadcast::channel(64);
/// let listener = EventListener::new(tx);
/// listener.attach(&session).await?;
/// listener.attach(&session).await?; // no-op
///
/// while let Ok(SessionEvent { event, .. }) = rx.recv().await {
///     if event.is_detached() {
///         break;
///     }
/// }
/// listener.detach().await;
/// ```
pub struct EventListener {
    id: ListenerId,
    sink: broadcast::Sender<SessionEvent>,
    active: Mutex<Option<ActiveLoop>>,
    /// Held across a whole attach or detach, including the join.
    lifecycle: AsyncMutex<()>,
    loops: Arc<AtomicUsize>,
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("id", &self.id)
            .field("session", &self.attached_session())
            .field("loops", &self.loops_running())
            .finish()
    }
}

impl EventListener {
    /// Creates a detached listener publishing into `sink`.
    #[must_use]
    pub fn new(sink: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            id: ListenerId::next(),
            sink,
            active: Mutex::new(None),
            lifecycle: AsyncMutex::new(()),
            loops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns this listener's ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Returns the session the loop is bound to, if it is still running.
    #[must_use]
    pub fn attached_session(&self) -> Option<SessionId> {
        self.active
            .lock()
            .as_ref()
            .filter(|a| !a.task.is_finished())
            .map(|a| a.session.id())
    }

    /// Returns the number of receive loops currently running (0 or 1).
    #[inline]
    #[must_use]
    pub fn loops_running(&self) -> usize {
        self.loops.load(Ordering::SeqCst)
    }

    /// Subscribes to the events this listener publishes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sink.subscribe()
    }

    /// Attaches to `session` and starts the receive loop.
    ///
    /// Attaching again to the session the loop already serves is a no-op.
    /// An attach issued while a [`detach`](Self::detach) is still joining
    /// the old loop waits for it and then starts a fresh loop. On success
    /// the session moves `Open → EventListening`.
    ///
    /// # Errors
    ///
    /// - [`AttachError::AlreadyAttached`] if this listener serves another
    ///   session, or another listener holds this one
    /// - [`AttachError::NotOpen`] if the session is not `Open`
    /// - [`AttachError::SourceClosed`] if the notification queue is gone
    pub async fn attach(&self, session: &ConnectionSession) -> Result<(), AttachError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut active = self.active.lock();

        if let Some(current) = active.as_ref()
            && !current.task.is_finished()
        {
            if current.session.id() == session.id() {
                trace!(listener = %self.id, session_id = %session.id(), "Already attached");
                return Ok(());
            }
            return Err(AttachError::AlreadyAttached {
                session_id: current.session.id(),
            });
        }

        let source = session.claim_event_source(self.id)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.loops.fetch_add(1, Ordering::SeqCst);
        let guard = LoopGuard(Arc::clone(&self.loops));

        let task = tokio::spawn(run_receive_loop(
            self.id,
            session.clone(),
            source,
            stop_rx,
            self.sink.clone(),
            guard,
        ));

        *active = Some(ActiveLoop {
            session: session.clone(),
            stop: stop_tx,
            task,
        });

        info!(listener = %self.id, session_id = %session.id(), "Event listener attached");
        Ok(())
    }

    /// Stops the receive loop and waits until it has fully exited.
    ///
    /// When this returns the notification queue is back in the session and a
    /// new [`attach`](Self::attach) can start immediately. No-op if nothing
    /// is attached.
    pub async fn detach(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let active = self.active.lock().take();
        let Some(active) = active else {
            return;
        };

        let _ = active.stop.send(());
        if let Err(e) = active.task.await {
            warn!(listener = %self.id, error = %e, "Receive loop ended abnormally");
        }

        info!(listener = %self.id, session_id = %active.session.id(), "Event listener detached");
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        // Dropping the stop sender ends the loop; it still restores the queue.
        if let Some(active) = self.active.get_mut().take() {
            drop(active.stop);
        }
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

/// Why the loop ended.
enum LoopExit {
    /// Detach (or listener drop).
    Stopped(mpsc::Receiver<Notification>),
    /// Link gone; the queue still holds what arrived before.
    Detached(mpsc::Receiver<Notification>),
}

async fn run_receive_loop(
    listener: ListenerId,
    session: ConnectionSession,
    source: EventSource,
    mut stop: oneshot::Receiver<()>,
    sink: broadcast::Sender<SessionEvent>,
    _guard: LoopGuard,
) {
    let session_id = session.id();
    let EventSource {
        mut receiver,
        mut down,
    } = source;

    debug!(%listener, %session_id, "Receive loop started");

    let exit = if *down.borrow() {
        LoopExit::Detached(receiver)
    } else {
        loop {
            tokio::select! {
                biased;

                _ = &mut stop => break LoopExit::Stopped(receiver),

                notification = receiver.recv() => match notification {
                    Some(notification) => publish(&sink, session_id, notification),
                    None => break LoopExit::Detached(receiver),
                },

                changed = down.changed() => {
                    if changed.is_err() || *down.borrow_and_update() {
                        break LoopExit::Detached(receiver);
                    }
                }
            }
        }
    };

    match exit {
        LoopExit::Stopped(receiver) => {
            session.restore_event_source(listener, Some(receiver));
            debug!(%listener, %session_id, "Receive loop stopped");
        }

        LoopExit::Detached(mut receiver) => {
            // Deliver what was already queued, then the final event.
            let mut drained = 0usize;
            while let Ok(notification) = receiver.try_recv() {
                publish(&sink, session_id, notification);
                drained += 1;
            }
            send(&sink, session_id, CaptureEvent::DeviceDetached);
            info!(%listener, %session_id, drained, "Device detached");

            session.close_with(Some(DEVICE_DETACHED.to_string())).await;
        }
    }
}

fn publish(sink: &broadcast::Sender<SessionEvent>, session_id: SessionId, notification: Notification) {
    if let Some(event) = CaptureEvent::from_notification(notification) {
        send(sink, session_id, event);
    }
}

fn send(sink: &broadcast::Sender<SessionEvent>, session_id: SessionId, event: CaptureEvent) {
    if sink.send(SessionEvent { session_id, event }).is_err() {
        trace!(%session_id, "No event subscribers");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    use crate::protocol::codes::{event, operation};
    use crate::session::SessionState;
    use crate::testing::{Behavior, VirtualUsb, open_session};

    fn listener() -> (EventListener, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (EventListener::new(tx), rx)
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> CaptureEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("event")
            .event
    }

    #[tokio::test]
    async fn test_attach_twice_runs_one_loop() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, _rx) = listener();

        listener.attach(&session).await.expect("attach");
        listener.attach(&session).await.expect("attach again");

        assert_eq!(listener.loops_running(), 1);
        assert_eq!(listener.attached_session(), Some(session.id()));
        assert_eq!(session.state(), SessionState::EventListening);
    }

    #[tokio::test]
    async fn test_attach_requires_open_session() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        session.close().await;
        let (listener, _rx) = listener();

        let err = listener.attach(&session).await.unwrap_err();
        assert_eq!(
            err,
            AttachError::NotOpen {
                state: SessionState::Disconnected
            }
        );
        assert_eq!(listener.loops_running(), 0);
    }

    #[tokio::test]
    async fn test_second_listener_is_rejected() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (first, _rx1) = listener();
        let (second, _rx2) = listener();

        first.attach(&session).await.expect("attach");
        let err = second.attach(&session).await.unwrap_err();
        assert!(matches!(err, AttachError::AlreadyAttached { .. }));
        assert_eq!(second.loops_running(), 0);
    }

    #[tokio::test]
    async fn test_capture_produces_photo_event() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();
        listener.attach(&session).await.expect("attach");

        session.capture().await.expect("capture");

        match next_event(&mut rx).await {
            CaptureEvent::PhotoCaptured { path, .. } => assert_eq!(path, "ptp://object/0000002a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_native_and_device_events_keep_order() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();
        listener.attach(&session).await.expect("attach");

        let bridge = camera.bridge().expect("bridge");
        assert!(bridge.photo_captured("/dcim/100/IMG_0001.JPG", "IMG_0001.JPG"));
        assert!(bridge.native_error(-4, "lens cap"));

        assert!(matches!(
            next_event(&mut rx).await,
            CaptureEvent::PhotoCaptured { ref file_name, .. } if file_name == "IMG_0001.JPG"
        ));
        assert!(matches!(next_event(&mut rx).await, CaptureEvent::NativeError { code: -4, .. }));
    }

    #[tokio::test]
    async fn test_detach_waits_for_loop_and_restores_open() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();

        listener.attach(&session).await.expect("attach");
        listener.detach().await;

        assert_eq!(listener.loops_running(), 0);
        assert_eq!(listener.attached_session(), None);
        assert_eq!(session.state(), SessionState::Open);

        // events queued while detached are delivered after re-attach
        camera.emit_event(event::OBJECT_ADDED, vec![7]);
        listener.attach(&session).await.expect("re-attach");
        assert!(matches!(next_event(&mut rx).await, CaptureEvent::PhotoCaptured { .. }));
    }

    #[tokio::test]
    async fn test_attach_detach_interleaving_never_overlaps() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, _rx) = listener();

        for _ in 0..25 {
            listener.attach(&session).await.expect("attach");
            assert_eq!(listener.loops_running(), 1);
            tokio::task::yield_now().await;
            listener.detach().await;
            assert_eq!(listener.loops_running(), 0);
        }
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_attach_during_detach_starts_fresh_loop() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();
        listener.attach(&session).await.expect("attach");

        let ((), attached) = tokio::join!(listener.detach(), listener.attach(&session));

        attached.expect("attach after detach");
        assert_eq!(listener.loops_running(), 1);
        assert_eq!(listener.attached_session(), Some(session.id()));
        assert_eq!(session.state(), SessionState::EventListening);

        camera.emit_event(event::OBJECT_ADDED, vec![9]);
        assert!(matches!(next_event(&mut rx).await, CaptureEvent::PhotoCaptured { .. }));
    }

    #[tokio::test]
    async fn test_unplug_emits_detached_last_and_closes() {
        let camera = VirtualUsb::new(Behavior::default());
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();
        listener.attach(&session).await.expect("attach");

        let bridge = camera.bridge().expect("bridge");
        bridge.photo_captured("/dcim/a.jpg", "a.jpg");
        camera.unplug();

        assert!(matches!(next_event(&mut rx).await, CaptureEvent::PhotoCaptured { .. }));
        assert_eq!(next_event(&mut rx).await, CaptureEvent::DeviceDetached);

        timeout(Duration::from_secs(2), async {
            while listener.loops_running() > 0 || session.state() != SessionState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop exits and session closes");
        assert!(!session.has_channel());
    }

    #[tokio::test]
    async fn test_operation_failure_does_not_stop_events() {
        let camera = VirtualUsb::new(Behavior::default().with_response(
            operation::INITIATE_CAPTURE,
            crate::protocol::codes::response::STORE_FULL,
        ));
        let session = open_session(&camera).await;
        let (listener, mut rx) = listener();
        listener.attach(&session).await.expect("attach");

        assert!(session.capture().await.is_err());
        camera.emit_event(event::STORE_FULL, vec![]);
        assert!(matches!(next_event(&mut rx).await, CaptureEvent::NativeError { .. }));
        assert_eq!(session.state(), SessionState::EventListening);
    }
}
