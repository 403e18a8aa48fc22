//! Exclusive per-session I/O channel.
//!
//! The channel owns both link halves and spawns one tokio task that handles:
//!
//! - Outgoing operations from the session
//! - Inbound responses, correlated to requests by transaction ID
//! - Inbound data phases, accumulated into the pending request
//! - Inbound events, routed into the bounded notification queue
//!
//! Routing is decided by container type and transaction ID, never by arrival
//! order, so a response can never end up in the event stream.
//!
//! # Queue Overflow
//!
//! | Queue | Full queue | Visible as |
//! |-------|------------|------------|
//! | Correlation map | n/a, one reply slot per request | - |
//! | Notification queue | device event dropped, loop keeps reading | `warn!` log, [`CallbackBridge::dropped`] |
//!
//! The I/O loop never waits on the notification queue: a response stuck
//! behind an unread event would stall the session. With no listener attached
//! the queue fills up to its capacity and later events are dropped.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::identifiers::{TransactionCounter, TransactionId};
use crate::protocol::{Container, ContainerKind, OperationRequest, OperationResponse};

use super::TransportKind;
use super::bridge::CallbackBridge;
use super::link::{FrameReader, FrameWriter, LinkHalves};

// ============================================================================
// Constants
// ============================================================================

/// Maximum correlated requests in flight on one channel.
const MAX_PENDING_REQUESTS: usize = 8;

// ============================================================================
// Types
// ============================================================================

/// Reply slot of one in-flight request.
type ReplySender = oneshot::Sender<Result<OperationResponse, TransportError>>;

/// A request waiting for its response phase.
struct PendingReply {
    /// Device-to-host data received so far.
    data: BytesMut,
    /// Where the response goes.
    reply_tx: ReplySender,
}

/// Map of transaction IDs to pending replies.
type CorrelationMap = FxHashMap<TransactionId, PendingReply>;

// ============================================================================
// ChannelCommand
// ============================================================================

/// Internal commands for the I/O loop.
enum ChannelCommand {
    /// Send an operation and register its reply slot.
    Send {
        transaction_id: TransactionId,
        request: OperationRequest,
        reply_tx: ReplySender,
    },
    /// Remove a timed-out correlation entry.
    RemoveCorrelation(TransactionId),
    /// Shut the link down.
    Shutdown,
}

// ============================================================================
// Channel
// ============================================================================

/// One open link, exclusively owned by a session.
///
/// `Channel` is `Send + Sync`; the session serializes operations on top of
/// it, the channel itself only guarantees correct correlation.
pub struct Channel {
    /// Transport this channel runs over.
    kind: TransportKind,
    /// Commands to the I/O loop.
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    /// Correlation map (shared with the I/O loop).
    correlation: Arc<Mutex<CorrelationMap>>,
    /// Transaction ID allocator for in-session operations.
    transactions: TransactionCounter,
    /// Last low-level status seen on an idle read timeout.
    last_status: Arc<Mutex<Option<i32>>>,
    /// Flips to `true` once the I/O loop has exited.
    closed: watch::Receiver<bool>,
    /// I/O loop task.
    io_task: Mutex<Option<JoinHandle<()>>>,
    /// Producer side of the session's notification queue.
    bridge: CallbackBridge,
}

impl Channel {
    /// Spawns the I/O loop over an opened link.
    #[must_use]
    pub fn spawn(kind: TransportKind, link: LinkHalves, bridge: CallbackBridge) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let correlation = Arc::new(Mutex::new(CorrelationMap::default()));
        let last_status = Arc::new(Mutex::new(None));
        let (closed_tx, closed) = watch::channel(false);

        let io_task = tokio::spawn(Self::run_io_loop(
            link,
            command_rx,
            Arc::clone(&correlation),
            bridge.clone(),
            Arc::clone(&last_status),
            closed_tx,
        ));

        debug!(%kind, "Channel I/O loop started");

        Self {
            kind,
            command_tx,
            correlation,
            transactions: TransactionCounter::new(),
            last_status,
            closed,
            io_task: Mutex::new(Some(io_task)),
            bridge,
        }
    }

    /// Returns the transport kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Returns `true` once the I/O loop has exited.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Returns the number of requests waiting for a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().len()
    }

    /// Returns the bridge feeding this channel's notification queue.
    #[inline]
    #[must_use]
    pub fn bridge(&self) -> &CallbackBridge {
        &self.bridge
    }

    /// Runs one in-session operation under a fresh transaction ID.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Disconnected`] if the channel is closed
    /// - [`TransportError::Timeout`] if no response arrived in time
    /// - Whatever the writer reported while sending
    pub async fn transact(
        &self,
        request: OperationRequest,
        deadline: Duration,
    ) -> Result<OperationResponse, TransportError> {
        let transaction_id = self.transactions.next();
        self.send_with_timeout(transaction_id, request, deadline)
            .await
    }

    /// Runs one operation outside a session (transaction ID 0).
    ///
    /// # Errors
    ///
    /// Same as [`transact`](Self::transact).
    pub async fn transact_sessionless(
        &self,
        request: OperationRequest,
        deadline: Duration,
    ) -> Result<OperationResponse, TransportError> {
        self.send_with_timeout(TransactionId::SESSIONLESS, request, deadline)
            .await
    }

    async fn send_with_timeout(
        &self,
        transaction_id: TransactionId,
        request: OperationRequest,
        deadline: Duration,
    ) -> Result<OperationResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }

        {
            let correlation = self.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending requests"
                );
                return Err(TransportError::DeviceBusy {
                    device: format!("{} channel", self.kind),
                });
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let code = request.code;

        self.command_tx
            .send(ChannelCommand::Send {
                transaction_id,
                request,
                reply_tx,
            })
            .map_err(|_| TransportError::Disconnected)?;

        match timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                let _ = self
                    .command_tx
                    .send(ChannelCommand::RemoveCorrelation(transaction_id));

                let status = *self.last_status.lock();
                warn!(
                    code = format_args!("{code:#06x}"),
                    %transaction_id,
                    timeout_ms = deadline.as_millis() as u64,
                    ?status,
                    "Operation timed out"
                );
                Err(TransportError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                    status,
                })
            }
        }
    }

    /// Shuts the link down and waits for the I/O loop to exit.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let _ = self.command_tx.send(ChannelCommand::Shutdown);
        let task = self.io_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Channel I/O task ended abnormally");
        }
    }

    /// I/O loop that owns the link.
    async fn run_io_loop(
        link: LinkHalves,
        mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
        correlation: Arc<Mutex<CorrelationMap>>,
        bridge: CallbackBridge,
        last_status: Arc<Mutex<Option<i32>>>,
        closed_tx: watch::Sender<bool>,
    ) {
        let LinkHalves {
            mut writer,
            mut reader,
        } = link;

        let reason = loop {
            tokio::select! {
                // Inbound frames from the device
                frame = reader.read_frame() => {
                    match frame {
                        Ok(container) => Self::route_inbound(container, &correlation, &bridge),

                        Err(TransportError::Timeout { status, .. }) => {
                            if status.is_some() {
                                *last_status.lock() = status;
                            }
                            trace!(?status, "Idle read timeout");
                        }

                        Err(e) => {
                            debug!(error = %e, "Link read failed");
                            break e;
                        }
                    }
                }

                // Commands from the session
                command = command_rx.recv() => {
                    match command {
                        Some(ChannelCommand::Send { transaction_id, request, reply_tx }) => {
                            Self::handle_send(
                                transaction_id,
                                request,
                                reply_tx,
                                writer.as_mut(),
                                &correlation,
                            ).await;
                        }

                        Some(ChannelCommand::RemoveCorrelation(transaction_id)) => {
                            correlation.lock().remove(&transaction_id);
                            debug!(%transaction_id, "Removed timed-out correlation");
                        }

                        Some(ChannelCommand::Shutdown) | None => {
                            debug!("Channel shutdown requested");
                            writer.shutdown().await;
                            break TransportError::Disconnected;
                        }
                    }
                }
            }
        };

        closed_tx.send_replace(true);
        bridge.mark_down();
        Self::fail_pending_requests(&correlation, &reason);
        drop(reader);

        debug!("Channel I/O loop terminated");
    }

    /// Routes one inbound container.
    fn route_inbound(
        container: Container,
        correlation: &Arc<Mutex<CorrelationMap>>,
        bridge: &CallbackBridge,
    ) {
        let transaction_id = container.transaction_id;

        match container.kind {
            ContainerKind::Response => {
                let pending = correlation.lock().remove(&transaction_id);
                match pending {
                    Some(pending) => {
                        trace!(%transaction_id, code = format_args!("{:#06x}", container.code), "Response received");
                        let _ = pending.reply_tx.send(Ok(OperationResponse {
                            code: container.code,
                            transaction_id,
                            params: container.params,
                            data: pending.data.freeze(),
                        }));
                    }
                    None => warn!(%transaction_id, "Response for unknown transaction"),
                }
            }

            ContainerKind::Data => {
                let mut correlation = correlation.lock();
                match correlation.get_mut(&transaction_id) {
                    Some(pending) => pending.data.extend_from_slice(&container.payload),
                    None => warn!(
                        %transaction_id,
                        len = container.payload.len(),
                        "Data for unknown transaction"
                    ),
                }
            }

            ContainerKind::Event => {
                trace!(code = format_args!("{:#06x}", container.code), "Event received");
                bridge.device_event(container);
            }

            ContainerKind::Command => {
                warn!(code = format_args!("{:#06x}", container.code), "Unexpected command from device");
            }
        }
    }

    /// Registers the reply slot and writes the operation.
    async fn handle_send(
        transaction_id: TransactionId,
        request: OperationRequest,
        reply_tx: ReplySender,
        writer: &mut dyn FrameWriter,
        correlation: &Arc<Mutex<CorrelationMap>>,
    ) {
        // Store correlation before sending
        correlation.lock().insert(
            transaction_id,
            PendingReply {
                data: BytesMut::new(),
                reply_tx,
            },
        );

        if let Err(e) = writer.write_operation(transaction_id, &request).await {
            warn!(%transaction_id, error = %e, "Failed to send operation");
            if let Some(pending) = correlation.lock().remove(&transaction_id) {
                let _ = pending.reply_tx.send(Err(e));
            }
            return;
        }

        trace!(%transaction_id, code = format_args!("{:#06x}", request.code), "Operation sent");
    }

    /// Fails all pending requests with the loop's exit reason.
    fn fail_pending_requests(correlation: &Arc<Mutex<CorrelationMap>>, reason: &TransportError) {
        let pending: Vec<_> = correlation.lock().drain().collect();
        let count = pending.len();

        for (_, p) in pending {
            let _ = p.reply_tx.send(Err(reason.clone()));
        }

        if count > 0 {
            debug!(count, "Failed pending requests on shutdown");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Sole owner: stop the loop even if close() was never awaited.
        let _ = self.command_tx.send(ChannelCommand::Shutdown);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::protocol::codes::{event, operation, response};
    use crate::transport::bridge::Notification;

    /// Writer that forwards operations to the test body.
    struct ScriptWriter {
        sent: mpsc::UnboundedSender<(TransactionId, OperationRequest)>,
        fail_with: Option<TransportError>,
    }

    #[async_trait]
    impl FrameWriter for ScriptWriter {
        async fn write_operation(
            &mut self,
            transaction_id: TransactionId,
            request: &OperationRequest,
        ) -> Result<(), TransportError> {
            if let Some(e) = self.fail_with.clone() {
                return Err(e);
            }
            let _ = self.sent.send((transaction_id, request.clone()));
            Ok(())
        }

        async fn shutdown(&mut self) {}
    }

    /// Reader fed by the test body.
    struct ScriptReader(mpsc::UnboundedReceiver<Result<Container, TransportError>>);

    #[async_trait]
    impl FrameReader for ScriptReader {
        async fn read_frame(&mut self) -> Result<Container, TransportError> {
            self.0.recv().await.unwrap_or(Err(TransportError::Disconnected))
        }
    }

    struct Harness {
        channel: Channel,
        sent: mpsc::UnboundedReceiver<(TransactionId, OperationRequest)>,
        inbound: mpsc::UnboundedSender<Result<Container, TransportError>>,
        notifications: mpsc::Receiver<Notification>,
    }

    fn harness(fail_with: Option<TransportError>) -> Harness {
        harness_with_capacity(fail_with, 16)
    }

    fn harness_with_capacity(fail_with: Option<TransportError>, capacity: usize) -> Harness {
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (bridge, notifications) = CallbackBridge::channel(capacity);
        let link = LinkHalves::new(
            Box::new(ScriptWriter {
                sent: sent_tx,
                fail_with,
            }),
            Box::new(ScriptReader(inbound_rx)),
        );
        Harness {
            channel: Channel::spawn(TransportKind::UsbPtp, link, bridge),
            sent,
            inbound,
            notifications,
        }
    }

    #[tokio::test]
    async fn test_response_correlated_and_event_routed_apart() {
        let mut h = harness(None);
        let inbound = h.inbound.clone();

        let responder = tokio::spawn(async move {
            let (tid, req) = h.sent.recv().await.expect("request");
            assert_eq!(req.code, operation::GET_STORAGE_IDS);
            // event reusing the same transaction ID must not satisfy the request
            inbound
                .send(Ok(Container::event(event::OBJECT_ADDED, tid, vec![7])))
                .expect("event");
            inbound
                .send(Ok(Container::data(req.code, tid, Bytes::from_static(b"ab"))))
                .expect("data");
            inbound
                .send(Ok(Container::data(req.code, tid, Bytes::from_static(b"cd"))))
                .expect("data");
            inbound
                .send(Ok(Container::response(response::OK, tid, vec![])))
                .expect("response");
        });

        let resp = h
            .channel
            .transact(
                OperationRequest::new(operation::GET_STORAGE_IDS, []),
                Duration::from_secs(2),
            )
            .await
            .expect("transact");
        responder.await.expect("responder");

        assert!(resp.is_ok());
        assert_eq!(&resp.data[..], b"abcd");

        match h.notifications.recv().await {
            Some(Notification::Device(c)) => assert_eq!(c.code, event::OBJECT_ADDED),
            other => panic!("expected device event, got {other:?}"),
        }
        assert_eq!(h.channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events_but_not_responses() {
        let mut h = harness_with_capacity(None, 2);
        let inbound = h.inbound.clone();

        tokio::spawn(async move {
            let (tid, _) = h.sent.recv().await.expect("request");
            for handle in 0..5 {
                let _ = inbound.send(Ok(Container::event(event::OBJECT_ADDED, TransactionId::SESSIONLESS, vec![handle])));
            }
            let _ = inbound.send(Ok(Container::response(response::OK, tid, vec![])));
        });

        let resp = h
            .channel
            .transact(OperationRequest::new(operation::INITIATE_CAPTURE, [0, 0]), Duration::from_secs(2))
            .await
            .expect("response despite full queue");
        assert!(resp.is_ok());
        assert_eq!(h.channel.bridge().dropped(), 3);

        // the oldest events survive, in order
        for expected in 0..2 {
            match h.notifications.recv().await {
                Some(Notification::Device(c)) => assert_eq!(c.params, vec![expected]),
                other => panic!("expected device event, got {other:?}"),
            }
        }
        assert!(h.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sessionless_uses_transaction_zero() {
        let mut h = harness(None);
        let inbound = h.inbound.clone();
        tokio::spawn(async move {
            let (tid, _) = h.sent.recv().await.expect("request");
            assert_eq!(tid, TransactionId::SESSIONLESS);
            let _ = inbound.send(Ok(Container::response(response::OK, tid, vec![])));
        });

        let resp = h
            .channel
            .transact_sessionless(
                OperationRequest::new(operation::GET_DEVICE_INFO, []),
                Duration::from_secs(2),
            )
            .await
            .expect("transact");
        assert_eq!(resp.transaction_id, TransactionId::SESSIONLESS);
    }

    #[tokio::test]
    async fn test_timeout_carries_last_status_and_cleans_up() {
        let h = harness(None);
        h.inbound
            .send(Err(TransportError::Timeout {
                timeout_ms: 0,
                status: Some(-116),
            }))
            .expect("idle timeout");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h
            .channel
            .transact(
                OperationRequest::new(operation::INITIATE_CAPTURE, [0, 0]),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(-116));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.channel.pending_count(), 0);
        assert!(!h.channel.is_closed());
    }

    #[tokio::test]
    async fn test_writer_error_propagates() {
        let h = harness(Some(TransportError::Timeout {
            timeout_ms: 500,
            status: Some(-7),
        }));
        let err = h
            .channel
            .transact(
                OperationRequest::new(operation::INITIATE_CAPTURE, [0, 0]),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(-7));
    }

    #[tokio::test]
    async fn test_link_loss_fails_pending_and_marks_down() {
        let h = harness(None);
        let down = h.channel.bridge().down_signal();
        let inbound = h.inbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = inbound.send(Err(TransportError::Disconnected));
        });

        let err = h
            .channel
            .transact(
                OperationRequest::new(operation::GET_STORAGE_IDS, []),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.channel.is_closed());
        assert!(*down.borrow());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness(None);
        h.channel.close().await;
        h.channel.close().await;
        assert!(h.channel.is_closed());

        let err = h
            .channel
            .transact(OperationRequest::new(operation::GET_STORAGE_IDS, []), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
    }
}
