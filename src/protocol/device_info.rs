//! DeviceInfo dataset (returned by GetDeviceInfo).

// ============================================================================
// Imports
// ============================================================================

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

use super::dataset::{self, DatasetReader};

// ============================================================================
// DeviceInfo
// ============================================================================

/// Capabilities and identity reported by the device.
///
/// Drives vendor auth selection and is kept on the session as its
/// negotiated capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// PTP standard version (e.g. 100 for 1.00).
    pub standard_version: u16,
    /// Vendor extension ID.
    pub vendor_extension_id: u32,
    /// Vendor extension version.
    pub vendor_extension_version: u16,
    /// Vendor extension description.
    pub vendor_extension_desc: String,
    /// Functional mode.
    pub functional_mode: u16,
    /// Supported operation codes.
    pub operations_supported: Vec<u16>,
    /// Supported event codes.
    pub events_supported: Vec<u16>,
    /// Supported device property codes.
    pub device_properties_supported: Vec<u16>,
    /// Capture formats.
    pub capture_formats: Vec<u16>,
    /// Image formats.
    pub image_formats: Vec<u16>,
    /// Manufacturer.
    pub manufacturer: String,
    /// Model.
    pub model: String,
    /// Firmware version.
    pub device_version: String,
    /// Serial number.
    pub serial_number: String,
}

impl DeviceInfo {
    /// Parses the dataset.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Malformed`] if the dataset is truncated or
    /// an array length is implausible.
    pub fn parse(data: &[u8]) -> Result<Self, TransportError> {
        let mut r = DatasetReader::new(data);
        Ok(Self {
            standard_version: r.u16()?,
            vendor_extension_id: r.u32()?,
            vendor_extension_version: r.u16()?,
            vendor_extension_desc: r.string()?,
            functional_mode: r.u16()?,
            operations_supported: r.u16_array()?,
            events_supported: r.u16_array()?,
            device_properties_supported: r.u16_array()?,
            capture_formats: r.u16_array()?,
            image_formats: r.u16_array()?,
            manufacturer: r.string()?,
            model: r.string()?,
            device_version: r.string()?,
            serial_number: r.string()?,
        })
    }

    /// Encodes the dataset.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u16_le(self.standard_version);
        buf.put_u32_le(self.vendor_extension_id);
        buf.put_u16_le(self.vendor_extension_version);
        dataset::put_string(&mut buf, &self.vendor_extension_desc);
        buf.put_u16_le(self.functional_mode);
        dataset::put_u16_array(&mut buf, &self.operations_supported);
        dataset::put_u16_array(&mut buf, &self.events_supported);
        dataset::put_u16_array(&mut buf, &self.device_properties_supported);
        dataset::put_u16_array(&mut buf, &self.capture_formats);
        dataset::put_u16_array(&mut buf, &self.image_formats);
        dataset::put_string(&mut buf, &self.manufacturer);
        dataset::put_string(&mut buf, &self.model);
        dataset::put_string(&mut buf, &self.device_version);
        dataset::put_string(&mut buf, &self.serial_number);
        buf.freeze()
    }

    /// Returns `true` if the device lists `code` among its operations.
    #[inline]
    #[must_use]
    pub fn supports_operation(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }

    /// Returns a human-readable `manufacturer model` label.
    #[must_use]
    pub fn display_name(&self) -> String {
        match (self.manufacturer.trim(), self.model.trim()) {
            ("", "") => "PTP camera".to_string(),
            ("", model) => model.to_string(),
            (maker, "") => maker.to_string(),
            (maker, model) if model.starts_with(maker) => model.to_string(),
            (maker, model) => format!("{maker} {model}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
