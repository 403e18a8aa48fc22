//! Tethering options.
//!
//! Options are plain data: build them in code with the `with_*` methods or
//! load them from JSON. Every field has a default, so an empty object is a
//! valid configuration.
//!
//! # Example
//!
//! ```ignore
//! use ptp_tether::TetherOptions;
//!
//! let options = TetherOptions::from_json_str(r#"{
//!     "timeouts": { "captureMs": 20000 },
//!     "fatalStatusCodes": [-116]
//! }"#)?;
//! assert_eq!(options.ptpip_port, 15740);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::handshake::AuthProfile;
use crate::protocol::ptpip::DEFAULT_PORT;

// ============================================================================
// Constants
// ============================================================================

/// USB interface class of still-image (PTP) devices.
pub const STILL_IMAGE_CLASS: u8 = 6;

// ============================================================================
// Timeouts
// ============================================================================

/// Deadlines for blocking device calls, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Timeouts {
    /// Opening the transport (TCP connect, USB claim).
    pub connect_ms: u64,
    /// Each handshake phase.
    pub handshake_ms: u64,
    /// Generic commands.
    pub command_ms: u64,
    /// Capture trigger.
    pub capture_ms: u64,
    /// Best-effort CloseSession on disconnect.
    pub close_ms: u64,
    /// One discovery probe.
    pub probe_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            handshake_ms: 5_000,
            command_ms: 5_000,
            capture_ms: 15_000,
            close_ms: 1_000,
            probe_ms: 400,
        }
    }
}

impl Timeouts {
    /// Transport open deadline.
    #[inline]
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Per-phase handshake deadline.
    #[inline]
    #[must_use]
    pub const fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    /// Generic command deadline.
    #[inline]
    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    /// Capture deadline.
    #[inline]
    #[must_use]
    pub const fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }

    /// CloseSession deadline.
    #[inline]
    #[must_use]
    pub const fn close(&self) -> Duration {
        Duration::from_millis(self.close_ms)
    }

    /// Discovery probe deadline.
    #[inline]
    #[must_use]
    pub const fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let all = [
            ("connectMs", self.connect_ms),
            ("handshakeMs", self.handshake_ms),
            ("commandMs", self.command_ms),
            ("captureMs", self.capture_ms),
            ("closeMs", self.close_ms),
            ("probeMs", self.probe_ms),
        ];
        match all.iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(format!("timeouts.{name} must be greater than zero")),
            None => Ok(()),
        }
    }
}

// ============================================================================
// TetherOptions
// ============================================================================

/// Configuration of the tethering core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TetherOptions {
    /// Call deadlines.
    pub timeouts: Timeouts,

    /// PTP/IP TCP port.
    pub ptpip_port: u16,

    /// Friendly name sent in the PTP/IP init request.
    pub host_name: String,

    /// Host GUID sent in the PTP/IP init request.
    ///
    /// Cameras that pair remember this value, so keep it stable.
    pub host_guid: Uuid,

    /// Capacity of each session's notification queue.
    pub event_queue_capacity: usize,

    /// Capacity of the application-facing event broadcast.
    pub event_broadcast_capacity: usize,

    /// USB vendor IDs accepted by discovery. Empty accepts any vendor.
    pub usb_vendor_allowlist: Vec<u16>,

    /// USB interface class accepted by discovery.
    pub usb_interface_class: u8,

    /// Concurrent probes during a station-mode scan.
    pub scan_concurrency: usize,

    /// Upper bound on hosts probed per station-mode scan.
    pub scan_host_limit: usize,

    /// Low-level status codes that leave the transport unrecoverable.
    ///
    /// A timeout carrying one of these latches the supervisor into
    /// restart-required.
    pub fatal_status_codes: Vec<i32>,

    /// Vendor two-phase authentication profiles.
    pub auth_profiles: Vec<AuthProfile>,
}

impl Default for TetherOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            ptpip_port: DEFAULT_PORT,
            host_name: "ptp-tether".to_string(),
            host_guid: Uuid::nil(),
            event_queue_capacity: 256,
            event_broadcast_capacity: 256,
            usb_vendor_allowlist: Vec::new(),
            usb_interface_class: STILL_IMAGE_CLASS,
            scan_concurrency: 32,
            scan_host_limit: 1024,
            fatal_status_codes: Vec::new(),
            auth_profiles: Vec::new(),
        }
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TetherOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input and [`Error::Config`] if
    /// the parsed options fail [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate().map_err(Error::config)?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TetherOptions {
    /// Replaces all timeouts.
    #[inline]
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the PTP/IP port.
    #[inline]
    #[must_use]
    pub fn with_ptpip_port(mut self, port: u16) -> Self {
        self.ptpip_port = port;
        self
    }

    /// Sets the PTP/IP host identity.
    #[inline]
    #[must_use]
    pub fn with_host(mut self, name: impl Into<String>, guid: Uuid) -> Self {
        self.host_name = name.into();
        self.host_guid = guid;
        self
    }

    /// Sets the notification queue capacity.
    #[inline]
    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Accepts USB devices from `vendor_id`.
    #[inline]
    #[must_use]
    pub fn with_usb_vendor(mut self, vendor_id: u16) -> Self {
        self.usb_vendor_allowlist.push(vendor_id);
        self
    }

    /// Sets station-mode scan limits.
    #[inline]
    #[must_use]
    pub fn with_scan_limits(mut self, concurrency: usize, host_limit: usize) -> Self {
        self.scan_concurrency = concurrency;
        self.scan_host_limit = host_limit;
        self
    }

    /// Marks a low-level status code as fatal.
    #[inline]
    #[must_use]
    pub fn with_fatal_status(mut self, code: i32) -> Self {
        self.fatal_status_codes.push(code);
        self
    }

    /// Adds a vendor authentication profile.
    #[inline]
    #[must_use]
    pub fn with_auth_profile(mut self, profile: AuthProfile) -> Self {
        self.auth_profiles.push(profile);
        self
    }
}

// ============================================================================
// Queries & Validation
// ============================================================================

impl TetherOptions {
    /// Returns `true` if `status` is configured as fatal.
    #[inline]
    #[must_use]
    pub fn is_fatal_status(&self, status: i32) -> bool {
        self.fatal_status_codes.contains(&status)
    }

    /// Returns `true` if discovery accepts `vendor_id`.
    #[inline]
    #[must_use]
    pub fn accepts_usb_vendor(&self, vendor_id: u16) -> bool {
        self.usb_vendor_allowlist.is_empty() || self.usb_vendor_allowlist.contains(&vendor_id)
    }

    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns an error message naming the first invalid field.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.timeouts.validate()?;

        if self.ptpip_port == 0 {
            return Err("ptpipPort must not be zero".to_string());
        }
        if self.event_queue_capacity == 0 || self.event_broadcast_capacity == 0 {
            return Err("event queue capacities must be greater than zero".to_string());
        }
        if self.scan_concurrency == 0 {
            return Err("scanConcurrency must be greater than zero".to_string());
        }
        for profile in &self.auth_profiles {
            profile.validate()?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
