//! Normalized PTP container and USB container framing.
//!
//! # USB Layout
//!
//! ```text
//! offset  size  field
//! 0       4     length (header + body)
//! 4       2     container type
//! 6       2     code
//! 8       4     transaction id
//! 12      n     params (u32 each) or data payload
//! ```

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::identifiers::TransactionId;

// ============================================================================
// Constants
// ============================================================================

/// Size of the USB container header.
pub const USB_HEADER_LEN: usize = 12;

/// Maximum number of parameters in a command, response or event.
pub const MAX_PARAMS: usize = 5;

// ============================================================================
// ContainerKind
// ============================================================================

/// Container type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContainerKind {
    /// Operation request.
    Command = 1,
    /// Data phase.
    Data = 2,
    /// Operation response.
    Response = 3,
    /// Asynchronous event.
    Event = 4,
}

impl ContainerKind {
    /// Parses the wire value.
    #[must_use]
    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::Command),
            2 => Some(Self::Data),
            3 => Some(Self::Response),
            4 => Some(Self::Event),
            _ => None,
        }
    }

    /// Returns `true` for kinds that carry parameters rather than a payload.
    #[inline]
    #[must_use]
    pub const fn has_params(self) -> bool {
        !matches!(self, Self::Data)
    }
}

// ============================================================================
// Container
// ============================================================================

/// One PTP container, independent of the transport that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Container type.
    pub kind: ContainerKind,
    /// Operation, response or event code.
    pub code: u16,
    /// Transaction this container belongs to.
    pub transaction_id: TransactionId,
    /// Parameters (empty for data containers).
    pub params: Vec<u32>,
    /// Payload (empty for non-data containers).
    pub payload: Bytes,
}

impl Container {
    /// Creates a command container.
    #[must_use]
    pub fn command(code: u16, transaction_id: TransactionId, params: Vec<u32>) -> Self {
        Self::with_params(ContainerKind::Command, code, transaction_id, params)
    }

    /// Creates a response container.
    #[must_use]
    pub fn response(code: u16, transaction_id: TransactionId, params: Vec<u32>) -> Self {
        Self::with_params(ContainerKind::Response, code, transaction_id, params)
    }

    /// Creates an event container.
    #[must_use]
    pub fn event(code: u16, transaction_id: TransactionId, params: Vec<u32>) -> Self {
        Self::with_params(ContainerKind::Event, code, transaction_id, params)
    }

    /// Creates a data container.
    #[must_use]
    pub fn data(code: u16, transaction_id: TransactionId, payload: Bytes) -> Self {
        Self {
            kind: ContainerKind::Data,
            code,
            transaction_id,
            params: Vec::new(),
            payload,
        }
    }

    fn with_params(
        kind: ContainerKind,
        code: u16,
        transaction_id: TransactionId,
        params: Vec<u32>,
    ) -> Self {
        Self {
            kind,
            code,
            transaction_id,
            params,
            payload: Bytes::new(),
        }
    }

    /// Returns parameter `index`, if present.
    #[inline]
    #[must_use]
    pub fn param(&self, index: usize) -> Option<u32> {
        self.params.get(index).copied()
    }

    /// Encodes the container in USB framing.
    #[must_use]
    pub fn encode_usb(&self) -> Bytes {
        let body_len = if self.kind.has_params() {
            self.params.len() * 4
        } else {
            self.payload.len()
        };
        let mut buf = BytesMut::with_capacity(USB_HEADER_LEN + body_len);
        buf.put_u32_le((USB_HEADER_LEN + body_len) as u32);
        buf.put_u16_le(self.kind as u16);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.transaction_id.as_u32());
        if self.kind.has_params() {
            for &p in &self.params {
                buf.put_u32_le(p);
            }
        } else {
            buf.extend_from_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Decodes one USB container from a complete bulk or interrupt transfer.
    ///
    /// Trailing bytes beyond the declared length are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] if the header is truncated,
    /// the length is inconsistent, the type is unknown, or a parameter block
    /// is not a whole number of `u32`s.
    pub fn decode_usb(mut transfer: Bytes) -> Result<Self, TransportError> {
        if transfer.len() < USB_HEADER_LEN {
            return Err(TransportError::malformed(format!(
                "container shorter than header: {} bytes",
                transfer.len()
            )));
        }

        let length = transfer.get_u32_le() as usize;
        let raw_kind = transfer.get_u16_le();
        let code = transfer.get_u16_le();
        let transaction_id = TransactionId::from_raw(transfer.get_u32_le());

        if length < USB_HEADER_LEN || length - USB_HEADER_LEN > transfer.len() {
            return Err(TransportError::malformed(format!(
                "declared length {length} does not match transfer of {} bytes",
                transfer.len() + USB_HEADER_LEN
            )));
        }
        let mut body = transfer.split_to(length - USB_HEADER_LEN);

        let kind = ContainerKind::from_u16(raw_kind)
            .ok_or_else(|| TransportError::malformed(format!("unknown container type {raw_kind}")))?;

        if !kind.has_params() {
            return Ok(Self::data(code, transaction_id, body));
        }

        if body.len() % 4 != 0 || body.len() / 4 > MAX_PARAMS {
            return Err(TransportError::malformed(format!(
                "invalid parameter block of {} bytes",
                body.len()
            )));
        }
        let mut params = Vec::with_capacity(body.len() / 4);
        while body.has_remaining() {
            params.push(body.get_u32_le());
        }

        Ok(Self::with_params(kind, code, transaction_id, params))
    }
}

// ============================================================================
// Tests
// ============================================================================
