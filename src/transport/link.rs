//! Frame reader/writer abstractions.
//!
//! Every transport is reduced to two halves that speak [`Container`]s:
//! a writer that sends one operation (command phase plus optional data-out
//! phase) and a reader that yields inbound responses, data and events in
//! arrival order.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::identifiers::TransactionId;
use crate::protocol::{Container, OperationRequest};

// ============================================================================
// Constants
// ============================================================================

/// Capacity of the queue between pump tasks and the channel I/O loop.
pub const PUMP_CAPACITY: usize = 64;

// ============================================================================
// Traits
// ============================================================================

/// Outbound half of a link.
#[async_trait]
pub trait FrameWriter: Send {
    /// Sends one operation under `transaction_id`.
    ///
    /// # Errors
    ///
    /// Returns the transport failure; a `Timeout` may carry the backend's
    /// low-level status.
    async fn write_operation(
        &mut self,
        transaction_id: TransactionId,
        request: &OperationRequest,
    ) -> Result<(), TransportError>;

    /// Releases the outbound resources. Errors are ignored.
    async fn shutdown(&mut self);
}

/// Inbound half of a link.
///
/// `read_frame` must be cancel-safe: the channel polls it inside
/// `tokio::select!`.
#[async_trait]
pub trait FrameReader: Send {
    /// Waits for the next inbound container.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] when the link is gone. A
    /// `Timeout` error is informational (idle read) and the caller may keep
    /// reading.
    async fn read_frame(&mut self) -> Result<Container, TransportError>;
}

// ============================================================================
// LinkHalves
// ============================================================================

/// The two halves of an opened link.
pub struct LinkHalves {
    /// Outbound half.
    pub writer: Box<dyn FrameWriter>,
    /// Inbound half.
    pub reader: Box<dyn FrameReader>,
}

impl LinkHalves {
    /// Bundles a writer and a reader.
    #[inline]
    #[must_use]
    pub fn new(writer: Box<dyn FrameWriter>, reader: Box<dyn FrameReader>) -> Self {
        Self { writer, reader }
    }
}

// ============================================================================
// PumpReader
// ============================================================================

/// Inbound frames produced by pump tasks.
pub type PumpSender = mpsc::Sender<Result<Container, TransportError>>;

/// Reader fed by one or more pump tasks.
///
/// Transports with several inbound pipes (PTP/IP command + event sockets,
/// USB bulk-in + interrupt-in) run one pump per pipe and merge them here.
/// The mpsc receive is cancel-safe. Dropping the reader aborts the pumps.
pub struct PumpReader {
    rx: mpsc::Receiver<Result<Container, TransportError>>,
    pumps: Vec<JoinHandle<()>>,
}

impl PumpReader {
    /// Creates a reader and the sender its pumps feed.
    #[must_use]
    pub fn channel() -> (PumpSender, Self) {
        let (tx, rx) = mpsc::channel(PUMP_CAPACITY);
        (
            tx,
            Self {
                rx,
                pumps: Vec::new(),
            },
        )
    }

    /// Registers a pump task so it is aborted with the reader.
    pub fn adopt(&mut self, pump: JoinHandle<()>) {
        self.pumps.push(pump);
    }
}

#[async_trait]
impl FrameReader for PumpReader {
    async fn read_frame(&mut self) -> Result<Container, TransportError> {
        self.rx
            .recv()
            .await
            .unwrap_or(Err(TransportError::Disconnected))
    }
}

impl Drop for PumpReader {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
