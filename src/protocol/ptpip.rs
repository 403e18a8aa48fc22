//! PTP/IP packet codec.
//!
//! PTP/IP runs over two TCP connections to the same port: a command/data
//! connection and an event connection. Every packet starts with an 8-byte
//! header:
//!
//! ```text
//! offset  size  field
//! 0       4     length (header + body)
//! 4       4     packet type
//! 8       n     body
//! ```
//!
//! # Connection Setup
//!
//! 1. Command socket: `InitCommandRequest` → `InitCommandAck` (or `InitFail`)
//! 2. Event socket: `InitEventRequest(connection number)` → `InitEventAck`
//! 3. Operations flow on the command socket; events on the event socket

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use uuid::Uuid;

use crate::error::TransportError;
use crate::identifiers::TransactionId;

use super::container::{Container, MAX_PARAMS};
use super::operation::OperationRequest;

// ============================================================================
// Constants
// ============================================================================

/// IANA-registered PTP/IP port.
pub const DEFAULT_PORT: u16 = 15740;

/// Protocol version sent in `InitCommandRequest` (1.0).
pub const PROTOCOL_VERSION: u32 = 0x0001_0000;

/// Packet header size.
pub const HEADER_LEN: usize = 8;

/// Largest packet accepted from a responder.
pub const MAX_PACKET_LEN: u32 = 64 * 1024 * 1024;

/// Largest data chunk sent in a single `Data`/`EndData` packet.
const DATA_CHUNK_LEN: usize = 64 * 1024;

/// `OperationRequest` data phase: no data or device-to-host data.
const DATA_PHASE_NONE_OR_IN: u32 = 1;

/// `OperationRequest` data phase: host-to-device data follows.
const DATA_PHASE_OUT: u32 = 2;

// ============================================================================
// PacketType
// ============================================================================

/// Raw packet type values.
mod packet_type {
    pub const INIT_COMMAND_REQUEST: u32 = 1;
    pub const INIT_COMMAND_ACK: u32 = 2;
    pub const INIT_EVENT_REQUEST: u32 = 3;
    pub const INIT_EVENT_ACK: u32 = 4;
    pub const INIT_FAIL: u32 = 5;
    pub const OPERATION_REQUEST: u32 = 6;
    pub const OPERATION_RESPONSE: u32 = 7;
    pub const EVENT: u32 = 8;
    pub const START_DATA: u32 = 9;
    pub const DATA: u32 = 10;
    pub const CANCEL: u32 = 11;
    pub const END_DATA: u32 = 12;
    pub const PROBE_REQUEST: u32 = 13;
    pub const PROBE_RESPONSE: u32 = 14;
}

// ============================================================================
// Packet
// ============================================================================

/// One PTP/IP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Initiator opens the command connection.
    InitCommandRequest {
        /// Initiator GUID.
        guid: Uuid,
        /// Initiator friendly name.
        name: String,
        /// Protocol version.
        version: u32,
    },
    /// Responder accepts the command connection.
    InitCommandAck {
        /// Connection number to quote on the event socket.
        connection_number: u32,
        /// Responder GUID.
        guid: Uuid,
        /// Responder friendly name.
        name: String,
        /// Protocol version.
        version: u32,
    },
    /// Initiator binds the event connection.
    InitEventRequest {
        /// Connection number from `InitCommandAck`.
        connection_number: u32,
    },
    /// Responder accepts the event connection.
    InitEventAck,
    /// Responder refuses the connection.
    InitFail {
        /// Failure reason.
        reason: u32,
    },
    /// Command phase.
    OperationRequest {
        /// 1 = no data / data in, 2 = data out.
        data_phase: u32,
        /// Operation code.
        code: u16,
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Parameters.
        params: Vec<u32>,
    },
    /// Response phase.
    OperationResponse {
        /// Response code.
        code: u16,
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Parameters.
        params: Vec<u32>,
    },
    /// Asynchronous event.
    Event {
        /// Event code.
        code: u16,
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Parameters.
        params: Vec<u32>,
    },
    /// Start of a data phase.
    StartData {
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Total payload length (`u64::MAX` if unknown).
        total_length: u64,
    },
    /// Intermediate data chunk.
    Data {
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Chunk bytes.
        payload: Bytes,
    },
    /// Cancels a transaction.
    Cancel {
        /// Transaction ID.
        transaction_id: TransactionId,
    },
    /// Final data chunk.
    EndData {
        /// Transaction ID.
        transaction_id: TransactionId,
        /// Chunk bytes.
        payload: Bytes,
    },
    /// Keepalive probe.
    ProbeRequest,
    /// Keepalive answer.
    ProbeResponse,
}

// ============================================================================
// Packet - Encoding
// ============================================================================

impl Packet {
    /// Returns the wire type value.
    #[must_use]
    pub const fn packet_type(&self) -> u32 {
        match self {
            Self::InitCommandRequest { .. } => packet_type::INIT_COMMAND_REQUEST,
            Self::InitCommandAck { .. } => packet_type::INIT_COMMAND_ACK,
            Self::InitEventRequest { .. } => packet_type::INIT_EVENT_REQUEST,
            Self::InitEventAck => packet_type::INIT_EVENT_ACK,
            Self::InitFail { .. } => packet_type::INIT_FAIL,
            Self::OperationRequest { .. } => packet_type::OPERATION_REQUEST,
            Self::OperationResponse { .. } => packet_type::OPERATION_RESPONSE,
            Self::Event { .. } => packet_type::EVENT,
            Self::StartData { .. } => packet_type::START_DATA,
            Self::Data { .. } => packet_type::DATA,
            Self::Cancel { .. } => packet_type::CANCEL,
            Self::EndData { .. } => packet_type::END_DATA,
            Self::ProbeRequest => packet_type::PROBE_REQUEST,
            Self::ProbeResponse => packet_type::PROBE_RESPONSE,
        }
    }

    /// Encodes header and body.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Self::InitCommandRequest {
                guid,
                name,
                version,
            } => {
                body.extend_from_slice(guid.as_bytes());
                put_wide_string(&mut body, name);
                body.put_u32_le(*version);
            }
            Self::InitCommandAck {
                connection_number,
                guid,
                name,
                version,
            } => {
                body.put_u32_le(*connection_number);
                body.extend_from_slice(guid.as_bytes());
                put_wide_string(&mut body, name);
                body.put_u32_le(*version);
            }
            Self::InitEventRequest { connection_number } => body.put_u32_le(*connection_number),
            Self::InitFail { reason } => body.put_u32_le(*reason),
            Self::OperationRequest {
                data_phase,
                code,
                transaction_id,
                params,
            } => {
                body.put_u32_le(*data_phase);
                body.put_u16_le(*code);
                body.put_u32_le(transaction_id.as_u32());
                params.iter().for_each(|&p| body.put_u32_le(p));
            }
            Self::OperationResponse {
                code,
                transaction_id,
                params,
            }
            | Self::Event {
                code,
                transaction_id,
                params,
            } => {
                body.put_u16_le(*code);
                body.put_u32_le(transaction_id.as_u32());
                params.iter().for_each(|&p| body.put_u32_le(p));
            }
            Self::StartData {
                transaction_id,
                total_length,
            } => {
                body.put_u32_le(transaction_id.as_u32());
                body.put_u64_le(*total_length);
            }
            Self::Data {
                transaction_id,
                payload,
            }
            | Self::EndData {
                transaction_id,
                payload,
            } => {
                body.put_u32_le(transaction_id.as_u32());
                body.extend_from_slice(payload);
            }
            Self::Cancel { transaction_id } => body.put_u32_le(transaction_id.as_u32()),
            Self::InitEventAck | Self::ProbeRequest | Self::ProbeResponse => {}
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u32_le((HEADER_LEN + body.len()) as u32);
        out.put_u32_le(self.packet_type());
        out.extend_from_slice(&body);
        out.freeze()
    }
}

// ============================================================================
// Packet - Decoding
// ============================================================================

impl Packet {
    /// Decodes a packet body of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] for unknown types or truncated
    /// bodies.
    pub fn decode(kind: u32, mut body: Bytes) -> Result<Self, TransportError> {
        let packet = match kind {
            packet_type::INIT_COMMAND_REQUEST => {
                let guid = take_guid(&mut body)?;
                let name = take_wide_string(&mut body)?;
                let version = take_u32(&mut body)?;
                Self::InitCommandRequest {
                    guid,
                    name,
                    version,
                }
            }
            packet_type::INIT_COMMAND_ACK => {
                let connection_number = take_u32(&mut body)?;
                let guid = take_guid(&mut body)?;
                let name = take_wide_string(&mut body)?;
                let version = take_u32(&mut body)?;
                Self::InitCommandAck {
                    connection_number,
                    guid,
                    name,
                    version,
                }
            }
            packet_type::INIT_EVENT_REQUEST => Self::InitEventRequest {
                connection_number: take_u32(&mut body)?,
            },
            packet_type::INIT_EVENT_ACK => Self::InitEventAck,
            packet_type::INIT_FAIL => Self::InitFail {
                reason: take_u32(&mut body)?,
            },
            packet_type::OPERATION_REQUEST => {
                let data_phase = take_u32(&mut body)?;
                let code = take_u16(&mut body)?;
                let transaction_id = TransactionId::from_raw(take_u32(&mut body)?);
                Self::OperationRequest {
                    data_phase,
                    code,
                    transaction_id,
                    params: take_params(&mut body)?,
                }
            }
            packet_type::OPERATION_RESPONSE | packet_type::EVENT => {
                let code = take_u16(&mut body)?;
                let transaction_id = TransactionId::from_raw(take_u32(&mut body)?);
                let params = take_params(&mut body)?;
                if kind == packet_type::EVENT {
                    Self::Event {
                        code,
                        transaction_id,
                        params,
                    }
                } else {
                    Self::OperationResponse {
                        code,
                        transaction_id,
                        params,
                    }
                }
            }
            packet_type::START_DATA => {
                let transaction_id = TransactionId::from_raw(take_u32(&mut body)?);
                if body.remaining() < 8 {
                    return Err(TransportError::malformed("truncated StartData"));
                }
                Self::StartData {
                    transaction_id,
                    total_length: body.get_u64_le(),
                }
            }
            packet_type::DATA => Self::Data {
                transaction_id: TransactionId::from_raw(take_u32(&mut body)?),
                payload: body,
            },
            packet_type::END_DATA => Self::EndData {
                transaction_id: TransactionId::from_raw(take_u32(&mut body)?),
                payload: body,
            },
            packet_type::CANCEL => Self::Cancel {
                transaction_id: TransactionId::from_raw(take_u32(&mut body)?),
            },
            packet_type::PROBE_REQUEST => Self::ProbeRequest,
            packet_type::PROBE_RESPONSE => Self::ProbeResponse,
            other => {
                return Err(TransportError::malformed(format!(
                    "unknown PTP/IP packet type {other}"
                )));
            }
        };
        Ok(packet)
    }
}

fn take_u16(body: &mut Bytes) -> Result<u16, TransportError> {
    if body.remaining() < 2 {
        return Err(TransportError::malformed("truncated u16"));
    }
    Ok(body.get_u16_le())
}

fn take_u32(body: &mut Bytes) -> Result<u32, TransportError> {
    if body.remaining() < 4 {
        return Err(TransportError::malformed("truncated u32"));
    }
    Ok(body.get_u32_le())
}

fn take_guid(body: &mut Bytes) -> Result<Uuid, TransportError> {
    if body.remaining() < 16 {
        return Err(TransportError::malformed("truncated GUID"));
    }
    let raw = body.split_to(16);
    Uuid::from_slice(&raw).map_err(|e| TransportError::malformed(e.to_string()))
}

fn take_params(body: &mut Bytes) -> Result<Vec<u32>, TransportError> {
    if body.remaining() % 4 != 0 || body.remaining() / 4 > MAX_PARAMS {
        return Err(TransportError::malformed(format!(
            "invalid parameter block of {} bytes",
            body.remaining()
        )));
    }
    let mut params = Vec::with_capacity(body.remaining() / 4);
    while body.has_remaining() {
        params.push(body.get_u32_le());
    }
    Ok(params)
}

fn take_wide_string(body: &mut Bytes) -> Result<String, TransportError> {
    let mut units = Vec::new();
    loop {
        let unit = take_u16(body).map_err(|_| TransportError::malformed("unterminated name"))?;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    Ok(String::from_utf16_lossy(&units))
}

fn put_wide_string(buf: &mut BytesMut, value: &str) {
    value.encode_utf16().for_each(|u| buf.put_u16_le(u));
    buf.put_u16_le(0);
}

// ============================================================================
// Stream I/O
// ============================================================================

/// Reads one packet from a socket half.
///
/// # Errors
///
/// - [`TransportError::Disconnected`] on EOF or reset
/// - [`TransportError::Malformed`] on an invalid header or body
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let kind = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if (length as usize) < HEADER_LEN || length > MAX_PACKET_LEN {
        return Err(TransportError::malformed(format!(
            "invalid packet length {length}"
        )));
    }

    let mut body = vec![0u8; length as usize - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    trace!(kind, length, "PTP/IP packet received");

    Packet::decode(kind, Bytes::from(body))
}

/// Writes one packet to a socket half.
///
/// # Errors
///
/// Returns a [`TransportError`] mapped from the socket error.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    trace!(kind = packet.packet_type(), "PTP/IP packet sent");
    Ok(())
}

// ============================================================================
// Outbound Translation
// ============================================================================

/// Expands one operation into the packets that carry it.
#[must_use]
pub fn operation_packets(transaction_id: TransactionId, request: &OperationRequest) -> Vec<Packet> {
    let data_phase = if request.has_data_out() {
        DATA_PHASE_OUT
    } else {
        DATA_PHASE_NONE_OR_IN
    };

    let mut packets = vec![Packet::OperationRequest {
        data_phase,
        code: request.code,
        transaction_id,
        params: request.params.clone(),
    }];

    if let Some(data) = &request.data {
        packets.push(Packet::StartData {
            transaction_id,
            total_length: data.len() as u64,
        });

        let mut remaining = data.clone();
        while remaining.len() > DATA_CHUNK_LEN {
            packets.push(Packet::Data {
                transaction_id,
                payload: remaining.split_to(DATA_CHUNK_LEN),
            });
        }
        packets.push(Packet::EndData {
            transaction_id,
            payload: remaining,
        });
    }

    packets
}

// ============================================================================
// PacketAssembler
// ============================================================================

/// In-progress inbound data phase.
#[derive(Debug)]
struct PendingData {
    transaction_id: TransactionId,
    total_length: u64,
    buffer: BytesMut,
}

/// Turns inbound packets into [`Container`]s, reassembling data phases.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    pending: Option<PendingData>,
}

impl PacketAssembler {
    /// Creates an idle assembler.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one packet.
    ///
    /// Returns a container once a response, event or complete data phase is
    /// available. Probe packets yield nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] on out-of-sequence data packets,
    /// length mismatches, or init packets after setup.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Container>, TransportError> {
        match packet {
            Packet::OperationResponse {
                code,
                transaction_id,
                params,
            } => Ok(Some(Container::response(code, transaction_id, params))),

            Packet::Event {
                code,
                transaction_id,
                params,
            } => Ok(Some(Container::event(code, transaction_id, params))),

            Packet::StartData {
                transaction_id,
                total_length,
            } => {
                if let Some(previous) = self.pending.take() {
                    return Err(TransportError::malformed(format!(
                        "StartData for {transaction_id} while {} incomplete",
                        previous.transaction_id
                    )));
                }
                let capacity = usize::try_from(total_length)
                    .unwrap_or(0)
                    .min(MAX_PACKET_LEN as usize);
                self.pending = Some(PendingData {
                    transaction_id,
                    total_length,
                    buffer: BytesMut::with_capacity(capacity),
                });
                Ok(None)
            }

            Packet::Data {
                transaction_id,
                payload,
            } => {
                self.pending_for(transaction_id)?
                    .buffer
                    .extend_from_slice(&payload);
                Ok(None)
            }

            Packet::EndData {
                transaction_id,
                payload,
            } => {
                self.pending_for(transaction_id)?
                    .buffer
                    .extend_from_slice(&payload);
                let Some(done) = self.pending.take() else {
                    return Err(TransportError::malformed("EndData without StartData"));
                };
                if done.total_length != u64::MAX && done.total_length != done.buffer.len() as u64 {
                    return Err(TransportError::malformed(format!(
                        "data phase for {transaction_id} announced {} bytes, got {}",
                        done.total_length,
                        done.buffer.len()
                    )));
                }
                Ok(Some(Container::data(0, transaction_id, done.buffer.freeze())))
            }

            Packet::Cancel { transaction_id } => {
                if self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.transaction_id == transaction_id)
                {
                    self.pending = None;
                }
                Ok(None)
            }

            Packet::ProbeRequest | Packet::ProbeResponse => Ok(None),

            other => Err(TransportError::malformed(format!(
                "unexpected packet type {} after setup",
                other.packet_type()
            ))),
        }
    }

    fn pending_for(&mut self, transaction_id: TransactionId) -> Result<&mut PendingData, TransportError> {
        match self.pending.as_mut() {
            Some(p) if p.transaction_id == transaction_id => Ok(p),
            _ => Err(TransportError::malformed(format!(
                "data for {transaction_id} without StartData"
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
