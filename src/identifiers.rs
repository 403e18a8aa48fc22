//! Type-safe identifiers for sessions and device transactions.
//!
//! Newtype wrappers keep host-side session IDs, device transaction IDs and
//! object handles from being mixed up at compile time.
//!
//! | Type | Origin | Wire size |
//! |------|--------|-----------|
//! | [`SessionId`] | Host (UUID v4) | n/a |
//! | [`TransactionId`] | Host, per channel | `u32` |
//! | [`ObjectHandle`] | Device | `u32` |
//! | [`ListenerId`] | Host, process-wide | n/a |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// SessionId
// ============================================================================

/// Host-side identifier of one [`ConnectionSession`](crate::session::ConnectionSession).
///
/// Unique for the lifetime of the process. Unrelated to the session number
/// negotiated with the device (see [`HandshakeResult`](crate::handshake::HandshakeResult)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random session ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// TransactionId
// ============================================================================

/// PTP transaction ID.
///
/// `0` is reserved for operations issued outside an open session
/// (GetDeviceInfo, OpenSession). Everything else is allocated by
/// [`TransactionCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Transaction ID used before a session is opened.
    pub const SESSIONLESS: Self = Self(0);

    /// Creates a transaction ID from its raw wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ============================================================================
// TransactionCounter
// ============================================================================

/// Monotonic transaction ID allocator, one per channel.
///
/// Starts at 1 and skips 0 and `0xFFFFFFFF` on wrap-around.
#[derive(Debug)]
pub struct TransactionCounter(AtomicU32);

impl TransactionCounter {
    /// Creates a counter whose first allocation is 1.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    /// Allocates the next transaction ID.
    pub fn next(&self) -> TransactionId {
        loop {
            let raw = self.0.fetch_add(1, Ordering::Relaxed);
            if raw != 0 && raw != u32::MAX {
                return TransactionId(raw);
            }
        }
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ObjectHandle
// ============================================================================

/// Device-assigned handle of an object (photo, folder) on camera storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    /// Creates a handle from its raw wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw wire value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

// ============================================================================
// ListenerId
// ============================================================================

/// Process-wide counter backing [`ListenerId::next`].
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`EventListener`](crate::session::EventListener).
///
/// Used by a session to tell its current owner apart from other listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocates a fresh listener ID.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
