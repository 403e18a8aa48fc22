//! Operation request and response pairs.
//!
//! A request is one command phase plus an optional host-to-device data phase.
//! A response is the device's response phase plus any device-to-host data
//! collected for the same transaction.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;

use crate::identifiers::TransactionId;

use super::codes::response;

// ============================================================================
// OperationRequest
// ============================================================================

/// A command to send to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    /// Operation code.
    pub code: u16,
    /// Up to five parameters.
    pub params: Vec<u32>,
    /// Host-to-device data phase, if any.
    pub data: Option<Bytes>,
}

impl OperationRequest {
    /// Creates a request without a data phase.
    #[inline]
    #[must_use]
    pub fn new(code: u16, params: impl Into<Vec<u32>>) -> Self {
        Self {
            code,
            params: params.into(),
            data: None,
        }
    }

    /// Attaches a host-to-device data phase.
    #[inline]
    #[must_use]
    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns `true` if the request carries a data-out phase.
    #[inline]
    #[must_use]
    pub fn has_data_out(&self) -> bool {
        self.data.is_some()
    }
}

// ============================================================================
// OperationResponse
// ============================================================================

/// The device's answer to one [`OperationRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    /// Response code.
    pub code: u16,
    /// Transaction the response closes.
    pub transaction_id: TransactionId,
    /// Response parameters.
    pub params: Vec<u32>,
    /// Device-to-host data phase (empty if none).
    pub data: Bytes,
}

impl OperationResponse {
    /// Returns `true` if the response code is OK.
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == response::OK
    }

    /// Returns parameter `index`, if present.
    #[inline]
    #[must_use]
    pub fn param(&self, index: usize) -> Option<u32> {
        self.params.get(index).copied()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes::operation;

    #[test]
    fn test_request_builder() {
        let req = OperationRequest::new(operation::INITIATE_CAPTURE, [0, 0]);
        assert!(!req.has_data_out());

        let req = req.with_data(Bytes::from_static(b"\x01"));
        assert!(req.has_data_out());
    }

    #[test]
    fn test_response_ok() {
        let ok = OperationResponse {
            code: response::OK,
            transaction_id: TransactionId::from_raw(1),
            params: vec![42],
            data: Bytes::new(),
        };
        assert!(ok.is_ok());
        assert_eq!(ok.param(0), Some(42));

        let busy = OperationResponse {
            code: response::DEVICE_BUSY,
            ..ok
        };
        assert!(!busy.is_ok());
    }
}
