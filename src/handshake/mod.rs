//! Protocol handshake.
//!
//! Turns a freshly opened [`Channel`] into a device session:
//!
//! ```text
//! Init → ChannelOpen → DeviceInfoExchanged ─┬─► AuthenticatingPhase1 → AuthenticatingPhase2 → Authenticated ─┐
//!                                           └──────────────────────────────────────────────────────────────┴─► SessionOpened → Done
//! ```
//!
//! Every phase is one request/response pair sent outside a session
//! (transaction ID 0). Any transport failure, non-OK response or malformed
//! payload aborts with a [`HandshakeError`] naming the phase. The handshake
//! never retries on the same channel: the caller closes it and starts over
//! on a fresh one.

// ============================================================================
// Submodules
// ============================================================================

/// Vendor authentication strategies.
pub mod auth;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HandshakeError, TransportError};
use crate::protocol::codes::{operation, response};
use crate::protocol::{DeviceInfo, OperationRequest, OperationResponse};
use crate::transport::Channel;

// ============================================================================
// Re-exports
// ============================================================================

pub use auth::{AuthProfile, AuthRegistry, AuthStep, AuthStrategy, NoAuth, TwoPhaseAuth};

// ============================================================================
// Session Numbers
// ============================================================================

/// Next session number to request with OpenSession.
static NEXT_SESSION_NUMBER: AtomicU32 = AtomicU32::new(1);

fn next_session_number() -> u32 {
    loop {
        let n = NEXT_SESSION_NUMBER.fetch_add(1, Ordering::Relaxed);
        if n != 0 {
            return n;
        }
    }
}

// ============================================================================
// HandshakePhase
// ============================================================================

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakePhase {
    /// Nothing sent yet.
    Init,
    /// Channel confirmed open; DeviceInfo requested.
    ChannelOpen,
    /// DeviceInfo parsed.
    DeviceInfoExchanged,
    /// First vendor auth request in flight.
    AuthenticatingPhase1,
    /// Second vendor auth request in flight.
    AuthenticatingPhase2,
    /// Vendor auth accepted.
    Authenticated,
    /// OpenSession accepted.
    SessionOpened,
    /// Handshake complete.
    Done,
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// HandshakeResult
// ============================================================================

/// What the handshake negotiated. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    /// PTP session number in use on the device.
    pub session_id: u32,
    /// Device capabilities.
    pub device_info: DeviceInfo,
    /// Whether a vendor exchange ran and succeeded.
    pub authenticated: bool,
}

/// Handshake result plus the strategy that will serve vendor operations.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Negotiated session.
    pub result: HandshakeResult,
    /// Strategy selected by DeviceInfo.
    pub strategy: Arc<dyn AuthStrategy>,
}

// ============================================================================
// ProtocolHandshake
// ============================================================================

/// Drives the handshake state machine over a channel.
#[derive(Debug, Clone)]
pub struct ProtocolHandshake {
    registry: Arc<AuthRegistry>,
    step_timeout: Duration,
}

impl ProtocolHandshake {
    /// Creates a handshake with a per-phase deadline.
    #[must_use]
    pub fn new(registry: Arc<AuthRegistry>, step_timeout: Duration) -> Self {
        Self {
            registry,
            step_timeout,
        }
    }

    /// Returns the strategy registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<AuthRegistry> {
        &self.registry
    }

    /// Runs the handshake to completion.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] carrying the phase in which it stopped.
    /// The channel is left as is; closing it is the caller's job.
    pub async fn run(&self, channel: &Channel) -> Result<HandshakeOutcome, HandshakeError> {
        let mut phase = HandshakePhase::Init;

        // Init → ChannelOpen
        if channel.is_closed() {
            return Err(HandshakeError::transport(phase, TransportError::Disconnected));
        }
        phase = advance(phase, HandshakePhase::ChannelOpen);

        // ChannelOpen → DeviceInfoExchanged
        let reply = self
            .exchange(channel, phase, OperationRequest::new(operation::GET_DEVICE_INFO, []))
            .await?;
        let device_info = DeviceInfo::parse(&reply.data)
            .map_err(|e| HandshakeError::malformed(phase, e.to_string()))?;
        phase = advance(phase, HandshakePhase::DeviceInfoExchanged);
        info!(
            manufacturer = %device_info.manufacturer,
            model = %device_info.model,
            vendor_extension = format_args!("{:#x}", device_info.vendor_extension_id),
            "DeviceInfo received"
        );

        // Optional vendor branch
        let strategy = self.registry.select(&device_info);
        let mut authenticated = false;

        if let Some(first) = strategy.phase_one(&device_info) {
            phase = advance(phase, HandshakePhase::AuthenticatingPhase1);
            let challenge = self.exchange(channel, phase, first).await?;

            phase = advance(phase, HandshakePhase::AuthenticatingPhase2);
            let second = strategy
                .phase_two(&device_info, &challenge)
                .ok_or_else(|| HandshakeError::malformed(phase, "challenge cannot be answered"))?;
            self.exchange(channel, phase, second).await?;

            phase = advance(phase, HandshakePhase::Authenticated);
            authenticated = true;
            info!(strategy = strategy.name(), "Vendor authentication accepted");
        }

        // OpenSession
        let session_id = next_session_number();
        let open = OperationRequest::new(operation::OPEN_SESSION, [session_id]);
        let reply = self.send(channel, phase, open).await?;
        match reply.code {
            response::OK => {}
            response::SESSION_ALREADY_OPEN => {
                warn!(session_id, "Device reports session already open, reusing it");
            }
            code => return Err(HandshakeError::response(phase, code)),
        }
        phase = advance(phase, HandshakePhase::SessionOpened);

        advance(phase, HandshakePhase::Done);

        Ok(HandshakeOutcome {
            result: HandshakeResult {
                session_id,
                device_info,
                authenticated,
            },
            strategy,
        })
    }

    /// Sends one request and requires an OK response.
    async fn exchange(
        &self,
        channel: &Channel,
        phase: HandshakePhase,
        request: OperationRequest,
    ) -> Result<OperationResponse, HandshakeError> {
        let reply = self.send(channel, phase, request).await?;
        if !reply.is_ok() {
            return Err(HandshakeError::response(phase, reply.code));
        }
        Ok(reply)
    }

    /// Sends one request, mapping transport failures to the phase.
    async fn send(
        &self,
        channel: &Channel,
        phase: HandshakePhase,
        request: OperationRequest,
    ) -> Result<OperationResponse, HandshakeError> {
        channel
            .transact_sessionless(request, self.step_timeout)
            .await
            .map_err(|e| HandshakeError::transport(phase, e))
    }
}

fn advance(from: HandshakePhase, to: HandshakePhase) -> HandshakePhase {
    debug!(%from, %to, "Handshake phase");
    to
}

// ============================================================================
// Tests
// ============================================================================
