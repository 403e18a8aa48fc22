//! PTP dataset primitives.
//!
//! Datasets are little-endian. Strings are a `u8` character count (including
//! the terminating NUL) followed by UTF-16LE code units; arrays are a `u32`
//! element count followed by the elements.

// ============================================================================
// Imports
// ============================================================================

use bytes::{BufMut, BytesMut};

use crate::error::TransportError;

// ============================================================================
// Constants
// ============================================================================

/// Longest string a `u8` count can describe, excluding the NUL.
const MAX_STRING_CHARS: usize = 254;

/// Upper bound on array element counts accepted from a device.
const MAX_ARRAY_LEN: u32 = 4096;

// ============================================================================
// DatasetReader
// ============================================================================

/// Bounds-checked cursor over a dataset payload.
#[derive(Debug)]
pub struct DatasetReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> DatasetReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    #[inline]
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Returns the number of unread bytes.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], TransportError> {
        if self.remaining() < len {
            return Err(TransportError::malformed(format!(
                "truncated {what} at offset {}: need {len}, have {}",
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a `u8`.
    pub fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Reads a little-endian `u16`.
    pub fn u16(&mut self) -> Result<u16, TransportError> {
        let b = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian `u32`.
    pub fn u32(&mut self) -> Result<u32, TransportError> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a PTP string.
    pub fn string(&mut self) -> Result<String, TransportError> {
        let chars = usize::from(self.u8()?);
        if chars == 0 {
            return Ok(String::new());
        }
        let raw = self.take(chars * 2, "string")?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Reads a `u16` array.
    pub fn u16_array(&mut self) -> Result<Vec<u16>, TransportError> {
        let len = self.u32()?;
        if len > MAX_ARRAY_LEN {
            return Err(TransportError::malformed(format!(
                "array length {len} exceeds {MAX_ARRAY_LEN}"
            )));
        }
        (0..len).map(|_| self.u16()).collect()
    }

    /// Reads a `u32` array.
    pub fn u32_array(&mut self) -> Result<Vec<u32>, TransportError> {
        let len = self.u32()?;
        if len > MAX_ARRAY_LEN {
            return Err(TransportError::malformed(format!(
                "array length {len} exceeds {MAX_ARRAY_LEN}"
            )));
        }
        (0..len).map(|_| self.u32()).collect()
    }
}

// ============================================================================
// Writers
// ============================================================================

/// Appends a PTP string, truncating to the 254 characters a `u8` count allows.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    let units: Vec<u16> = value.encode_utf16().take(MAX_STRING_CHARS).collect();
    if units.is_empty() {
        buf.put_u8(0);
        return;
    }
    // count includes the NUL terminator
    buf.put_u8((units.len() + 1) as u8);
    for unit in units {
        buf.put_u16_le(unit);
    }
    buf.put_u16_le(0);
}

/// Appends a `u16` array.
pub fn put_u16_array(buf: &mut BytesMut, values: &[u16]) {
    buf.put_u32_le(values.len() as u32);
    for &v in values {
        buf.put_u16_le(v);
    }
}

/// Appends a `u32` array.
pub fn put_u32_array(buf: &mut BytesMut, values: &[u32]) {
    buf.put_u32_le(values.len() as u32);
    for &v in values {
        buf.put_u32_le(v);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "EOS");
        // count(4) + 'E','O','S',NUL as UTF-16LE
        assert_eq!(&buf[..], &[4, b'E', 0, b'O', 0, b'S', 0, 0, 0]);

        let mut reader = DatasetReader::new(&buf);
        assert_eq!(reader.string().expect("string"), "EOS");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_empty_string_is_single_zero() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "");
        assert_eq!(&buf[..], &[0]);
        assert_eq!(DatasetReader::new(&buf).string().expect("string"), "");
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let mut reader = DatasetReader::new(&[0x01]);
        let err = reader.u16().unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_oversized_array_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_ARRAY_LEN + 1);
        let err = DatasetReader::new(&buf).u16_array().unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn test_long_string_truncated() {
        let long = "x".repeat(400);
        let mut buf = BytesMut::new();
        put_string(&mut buf, &long);
        assert_eq!(buf[0], 255);
        let parsed = DatasetReader::new(&buf).string().expect("string");
        assert_eq!(parsed.len(), MAX_STRING_CHARS);
    }
}
