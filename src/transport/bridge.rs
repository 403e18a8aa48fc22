//! Bridge from native driver callbacks into the session's event queue.
//!
//! Native callbacks run on whatever thread the driver owns. They must never
//! block, so every push is a `try_send` into a bounded queue; overflow drops
//! the notification with a warning and bumps a counter. Removal is not
//! queued: it flips a watch flag that the listener observes even when the
//! queue is full.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::protocol::Container;

// ============================================================================
// NativeEvent
// ============================================================================

/// Asynchronous condition reported by the native driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeEvent {
    /// Driver stored a captured photo.
    PhotoCaptured {
        /// Full path or URI of the stored file.
        path: String,
        /// File name component.
        file_name: String,
    },
    /// Live-view frame (usually JPEG).
    LiveViewFrame(Bytes),
    /// Driver-level error.
    Error {
        /// Driver error code.
        code: i32,
        /// Driver message.
        message: String,
    },
}

// ============================================================================
// Notification
// ============================================================================

/// One entry of the ordered notification queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// PTP event container received from the device.
    Device(Container),
    /// Callback from the native driver.
    Native(NativeEvent),
}

// ============================================================================
// CallbackBridge
// ============================================================================

/// Cloneable, non-blocking producer side of a notification queue.
#[derive(Debug, Clone)]
pub struct CallbackBridge {
    tx: mpsc::Sender<Notification>,
    down: Arc<watch::Sender<bool>>,
    dropped: Arc<AtomicU64>,
}

impl CallbackBridge {
    /// Creates a bridge and the queue receiver it feeds.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (down, _) = watch::channel(false);
        (
            Self {
                tx,
                down: Arc::new(down),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Reports a stored photo. Returns `false` if the notification was dropped.
    pub fn photo_captured(&self, path: impl Into<String>, file_name: impl Into<String>) -> bool {
        self.push(Notification::Native(NativeEvent::PhotoCaptured {
            path: path.into(),
            file_name: file_name.into(),
        }))
    }

    /// Reports a live-view frame. Returns `false` if the frame was dropped.
    pub fn live_view_frame(&self, frame: Bytes) -> bool {
        self.push(Notification::Native(NativeEvent::LiveViewFrame(frame)))
    }

    /// Reports a driver error. Returns `false` if the notification was dropped.
    pub fn native_error(&self, code: i32, message: impl Into<String>) -> bool {
        self.push(Notification::Native(NativeEvent::Error {
            code,
            message: message.into(),
        }))
    }

    /// Reports that the device was physically removed.
    pub fn device_removed(&self) {
        debug!("Native driver reported device removal");
        self.mark_down();
    }

    /// Queues a device event container.
    pub(crate) fn device_event(&self, container: Container) -> bool {
        self.push(Notification::Device(container))
    }

    /// Flags the link as gone.
    pub(crate) fn mark_down(&self) {
        self.down.send_replace(true);
    }

    /// Returns `true` once the link is gone.
    #[inline]
    #[must_use]
    pub fn is_down(&self) -> bool {
        *self.down.borrow()
    }

    /// Subscribes to the link-down flag.
    #[must_use]
    pub fn down_signal(&self) -> watch::Receiver<bool> {
        self.down.subscribe()
    }

    /// Returns how many notifications were dropped on overflow.
    #[inline]
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped = total, kind = kind_of(&n), "Notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Notification queue closed");
                false
            }
        }
    }
}

fn kind_of(n: &Notification) -> &'static str {
    match n {
        Notification::Device(_) => "device",
        Notification::Native(NativeEvent::PhotoCaptured { .. }) => "photo",
        Notification::Native(NativeEvent::LiveViewFrame(_)) => "live-view",
        Notification::Native(NativeEvent::Error { .. }) => "error",
    }
}

// ============================================================================
// Tests
// ============================================================================
