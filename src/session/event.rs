//! Capture events published to the application.

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::trace;

use crate::identifiers::{ObjectHandle, SessionId};
use crate::protocol::codes::event;
use crate::protocol::{Container, ContainerKind};
use crate::transport::{NativeEvent, Notification};

// ============================================================================
// CaptureEvent
// ============================================================================

/// Asynchronous notification from the device or its driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CaptureEvent {
    /// A photo was stored.
    #[serde(rename_all = "camelCase")]
    PhotoCaptured {
        /// Path or URI of the stored file.
        path: String,
        /// File name component.
        file_name: String,
        /// Milliseconds since the Unix epoch when the event was received.
        timestamp_ms: u64,
    },
    /// One live-view frame.
    LiveViewFrame {
        /// Frame bytes (base64 in JSON).
        #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
        bytes: Bytes,
    },
    /// Error reported by the device or driver.
    NativeError {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
    /// The device went away. Always the last event of a listener run.
    DeviceDetached,
}

impl CaptureEvent {
    /// Converts one queued notification.
    ///
    /// Returns `None` for device events with no application meaning.
    #[must_use]
    pub fn from_notification(notification: Notification) -> Option<Self> {
        match notification {
            Notification::Native(NativeEvent::PhotoCaptured { path, file_name }) => {
                Some(Self::PhotoCaptured {
                    path,
                    file_name,
                    timestamp_ms: now_ms(),
                })
            }
            Notification::Native(NativeEvent::LiveViewFrame(bytes)) => {
                Some(Self::LiveViewFrame { bytes })
            }
            Notification::Native(NativeEvent::Error { code, message }) => {
                Some(Self::NativeError { code, message })
            }
            Notification::Device(container) => Self::from_device_event(&container),
        }
    }

    /// Maps a PTP event container.
    fn from_device_event(container: &Container) -> Option<Self> {
        if container.kind != ContainerKind::Event {
            return None;
        }

        match container.code {
            event::OBJECT_ADDED => {
                let handle = ObjectHandle::from_raw(container.param(0)?);
                Some(Self::PhotoCaptured {
                    path: format!("ptp://object/{handle}"),
                    file_name: handle.to_string(),
                    timestamp_ms: now_ms(),
                })
            }
            event::STORE_FULL => Some(Self::NativeError {
                code: i32::from(event::STORE_FULL),
                message: "Storage full".to_string(),
            }),
            event::DEVICE_RESET => Some(Self::NativeError {
                code: i32::from(event::DEVICE_RESET),
                message: "Device reset".to_string(),
            }),
            code => {
                trace!(code = format_args!("{code:#06x}"), "Ignoring device event");
                None
            }
        }
    }

    /// Returns `true` for [`CaptureEvent::DeviceDetached`].
    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::DeviceDetached)
    }
}

// ============================================================================
// SessionEvent
// ============================================================================

/// A capture event tagged with its session.
///
/// Ordering is FIFO within one session; nothing is guaranteed across
/// sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Session that produced the event.
    pub session_id: SessionId,
    /// The event.
    pub event: CaptureEvent,
}

// ============================================================================
// Helpers
// ============================================================================

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_base64<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded)
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

// ============================================================================
// Tests
// ============================================================================
