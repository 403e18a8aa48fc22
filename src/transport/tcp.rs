//! PTP/IP transport over TCP.
//!
//! Used for both access-point mode (camera hosts the Wi-Fi network) and
//! station mode (camera and host on a shared network). The network join is
//! the caller's business; this module only connects within it.
//!
//! # Link Layout
//!
//! | Socket | Carries |
//! |--------|---------|
//! | command | OperationRequest out; StartData/Data/EndData + OperationResponse in |
//! | event | Event in; ProbeRequest/ProbeResponse both ways |

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::identifiers::TransactionId;
use crate::protocol::OperationRequest;
use crate::protocol::ptpip::{
    self, Packet, PacketAssembler, PROTOCOL_VERSION, operation_packets, read_packet, write_packet,
};

use super::bridge::CallbackBridge;
use super::link::{FrameWriter, LinkHalves, PumpReader, PumpSender};
use super::{ConnectTarget, Transport, TransportKind};

// ============================================================================
// TcpTransport
// ============================================================================

/// PTP/IP initiator.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    kind: TransportKind,
    connect_timeout: Duration,
    guid: Uuid,
    host_name: String,
}

impl TcpTransport {
    /// Creates a transport for one of the PTP/IP kinds.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        connect_timeout: Duration,
        guid: Uuid,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            connect_timeout,
            guid,
            host_name: host_name.into(),
        }
    }

    /// Connects one socket within the configured deadline.
    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| TransportError::unreachable(addr, e))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Reads one setup packet within the configured deadline.
    async fn read_setup(&self, stream: &mut TcpStream) -> Result<Packet, TransportError> {
        timeout(self.connect_timeout, read_packet(stream))
            .await
            .map_err(|_| TransportError::timeout(self.connect_timeout.as_millis() as u64))?
    }

    /// Runs the command-socket init exchange and returns the connection number.
    async fn init_command(&self, stream: &mut TcpStream) -> Result<u32, TransportError> {
        write_packet(
            stream,
            &Packet::InitCommandRequest {
                guid: self.guid,
                name: self.host_name.clone(),
                version: PROTOCOL_VERSION,
            },
        )
        .await?;

        match self.read_setup(stream).await? {
            Packet::InitCommandAck {
                connection_number,
                name,
                version,
                ..
            } => {
                debug!(connection_number, responder = %name, version = format_args!("{version:#x}"), "Command channel initialized");
                Ok(connection_number)
            }
            Packet::InitFail { reason } => Err(TransportError::Rejected { reason }),
            other => Err(TransportError::malformed(format!(
                "expected InitCommandAck, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    /// Runs the event-socket init exchange.
    async fn init_event(
        &self,
        stream: &mut TcpStream,
        connection_number: u32,
    ) -> Result<(), TransportError> {
        write_packet(stream, &Packet::InitEventRequest { connection_number }).await?;

        match self.read_setup(stream).await? {
            Packet::InitEventAck => Ok(()),
            Packet::InitFail { reason } => Err(TransportError::Rejected { reason }),
            other => Err(TransportError::malformed(format!(
                "expected InitEventAck, got packet type {}",
                other.packet_type()
            ))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(
        &self,
        target: &ConnectTarget,
        _bridge: CallbackBridge,
    ) -> Result<LinkHalves, TransportError> {
        let ConnectTarget::Network(addr) = target else {
            return Err(TransportError::unreachable(target, "not a network target"));
        };
        let addr = *addr;

        let mut command = self.connect(addr).await?;
        let connection_number = self.init_command(&mut command).await?;

        let mut event = self.connect(addr).await?;
        self.init_event(&mut event, connection_number).await?;

        info!(%addr, connection_number, kind = %self.kind, "PTP/IP link established");

        let (command_read, command_write) = command.into_split();
        let (event_read, event_write) = event.into_split();

        let (tx, mut reader) = PumpReader::channel();
        reader.adopt(tokio::spawn(run_command_pump(command_read, tx.clone())));
        reader.adopt(tokio::spawn(run_event_pump(event_read, event_write, tx)));

        Ok(LinkHalves::new(
            Box::new(TcpWriter {
                command: command_write,
            }),
            Box::new(reader),
        ))
    }
}

// ============================================================================
// TcpWriter
// ============================================================================

/// Command-socket writer.
struct TcpWriter {
    command: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpWriter {
    async fn write_operation(
        &mut self,
        transaction_id: TransactionId,
        request: &OperationRequest,
    ) -> Result<(), TransportError> {
        for packet in operation_packets(transaction_id, request) {
            write_packet(&mut self.command, &packet).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.command.shutdown().await;
    }
}

// ============================================================================
// Pumps
// ============================================================================

/// Reads the command socket until it fails.
async fn run_command_pump(mut read: OwnedReadHalf, tx: PumpSender) {
    let mut assembler = PacketAssembler::new();
    loop {
        let next = match read_packet(&mut read).await {
            Ok(packet) => assembler.push(packet),
            Err(e) => Err(e),
        };
        match next {
            Ok(Some(container)) => {
                if tx.send(Ok(container)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "Command socket pump stopped");
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Reads the event socket and answers keepalive probes.
async fn run_event_pump(mut read: OwnedReadHalf, mut write: OwnedWriteHalf, tx: PumpSender) {
    let mut assembler = PacketAssembler::new();
    loop {
        let packet = match read_packet(&mut read).await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Event socket pump stopped");
                let _ = tx.send(Err(e)).await;
                break;
            }
        };

        if packet == Packet::ProbeRequest {
            trace!("Answering PTP/IP probe");
            if let Err(e) = write_packet(&mut write, &Packet::ProbeResponse).await {
                warn!(error = %e, "Failed to answer probe");
            }
            continue;
        }

        match assembler.push(packet) {
            Ok(Some(container)) => {
                if tx.send(Ok(container)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Dropping malformed event packet"),
        }
    }
}

/// Default PTP/IP endpoint for a host.
#[inline]
#[must_use]
pub fn endpoint(ip: std::net::IpAddr) -> SocketAddr {
    SocketAddr::new(ip, ptpip::DEFAULT_PORT)
}

// ============================================================================
// Tests
// ============================================================================
