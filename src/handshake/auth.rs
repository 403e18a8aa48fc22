//! Vendor authentication strategies.
//!
//! Some vendors refuse to open a session until the host has run a two-phase
//! vendor exchange. The state machine in [`ProtocolHandshake`](super::ProtocolHandshake)
//! only knows *that* there are two phases; the byte layout of each phase
//! comes from an [`AuthStrategy`] selected by the device's `DeviceInfo`.
//!
//! Strategies are either registered in code or declared as
//! [`AuthProfile`]s in the options:
//!
//! ```json
//! {
//!   "name": "acme-pairing",
//!   "vendorExtensionId": 11,
//!   "phaseOne": { "operation": 37121, "params": [1] },
//!   "phaseTwo": { "operation": 37122, "params": [] },
//!   "forwardChallenge": true
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::container::MAX_PARAMS;
use crate::protocol::{DeviceInfo, OperationRequest, OperationResponse};

// ============================================================================
// AuthStrategy
// ============================================================================

/// Vendor-specific handshake extension.
pub trait AuthStrategy: Send + Sync + fmt::Debug {
    /// Strategy name for logs.
    fn name(&self) -> &str;

    /// Returns `true` if this strategy handles `info`.
    fn matches(&self, info: &DeviceInfo) -> bool;

    /// First authentication request, or `None` to skip vendor auth.
    fn phase_one(&self, info: &DeviceInfo) -> Option<OperationRequest>;

    /// Second authentication request, built from the phase-one reply.
    ///
    /// Returning `None` after a phase-one request aborts the handshake.
    fn phase_two(&self, info: &DeviceInfo, reply: &OperationResponse) -> Option<OperationRequest>;

    /// Request that fetches one live-view frame, if the vendor has one.
    fn live_view_request(&self) -> Option<OperationRequest> {
        None
    }
}

// ============================================================================
// NoAuth
// ============================================================================

/// Fallback for vendors without an authentication step.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthStrategy for NoAuth {
    fn name(&self) -> &str {
        "none"
    }

    fn matches(&self, _info: &DeviceInfo) -> bool {
        true
    }

    fn phase_one(&self, _info: &DeviceInfo) -> Option<OperationRequest> {
        None
    }

    fn phase_two(&self, _info: &DeviceInfo, _reply: &OperationResponse) -> Option<OperationRequest> {
        None
    }
}

// ============================================================================
// AuthProfile
// ============================================================================

/// One request of a vendor exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStep {
    /// Vendor operation code.
    pub operation: u16,
    /// Fixed parameters.
    #[serde(default)]
    pub params: Vec<u32>,
}

impl AuthStep {
    /// Creates a step.
    #[inline]
    #[must_use]
    pub fn new(operation: u16, params: impl Into<Vec<u32>>) -> Self {
        Self {
            operation,
            params: params.into(),
        }
    }
}

/// Declarative two-phase authentication for one vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    /// Profile name for logs.
    pub name: String,
    /// Match on the DeviceInfo vendor extension ID.
    #[serde(default)]
    pub vendor_extension_id: Option<u32>,
    /// Match on the manufacturer (case-insensitive substring).
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Phase-one request.
    pub phase_one: AuthStep,
    /// Phase-two request.
    pub phase_two: AuthStep,
    /// Append the phase-one response parameters to the phase-two request.
    #[serde(default)]
    pub forward_challenge: bool,
    /// Vendor operation that returns one live-view frame.
    #[serde(default)]
    pub live_view_operation: Option<u16>,
}

impl AuthProfile {
    /// Returns `true` if every configured criterion matches `info`.
    #[must_use]
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        if self.vendor_extension_id.is_none() && self.manufacturer.is_none() {
            return false;
        }
        let vendor_ok = self
            .vendor_extension_id
            .is_none_or(|id| id == info.vendor_extension_id);
        let maker_ok = self.manufacturer.as_deref().is_none_or(|m| {
            info.manufacturer
                .to_ascii_lowercase()
                .contains(&m.to_ascii_lowercase())
        });
        vendor_ok && maker_ok
    }

    /// Validates the profile.
    ///
    /// # Errors
    ///
    /// Returns a message if no match criterion is set or a step has too many
    /// parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.vendor_extension_id.is_none() && self.manufacturer.is_none() {
            return Err(format!(
                "auth profile '{}' needs vendorExtensionId or manufacturer",
                self.name
            ));
        }
        for step in [&self.phase_one, &self.phase_two] {
            if step.params.len() > MAX_PARAMS {
                return Err(format!(
                    "auth profile '{}': operation {:#06x} has more than {MAX_PARAMS} params",
                    self.name, step.operation
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TwoPhaseAuth
// ============================================================================

/// Strategy driven by an [`AuthProfile`].
#[derive(Debug, Clone)]
pub struct TwoPhaseAuth {
    profile: AuthProfile,
}

impl TwoPhaseAuth {
    /// Wraps a profile.
    #[inline]
    #[must_use]
    pub fn new(profile: AuthProfile) -> Self {
        Self { profile }
    }

    /// Returns the profile.
    #[inline]
    #[must_use]
    pub fn profile(&self) -> &AuthProfile {
        &self.profile
    }
}

impl AuthStrategy for TwoPhaseAuth {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn matches(&self, info: &DeviceInfo) -> bool {
        self.profile.matches(info)
    }

    fn phase_one(&self, _info: &DeviceInfo) -> Option<OperationRequest> {
        let step = &self.profile.phase_one;
        Some(OperationRequest::new(step.operation, step.params.clone()))
    }

    fn phase_two(&self, _info: &DeviceInfo, reply: &OperationResponse) -> Option<OperationRequest> {
        let step = &self.profile.phase_two;
        let mut params = step.params.clone();
        if self.profile.forward_challenge {
            params.extend_from_slice(&reply.params);
            if params.len() > MAX_PARAMS {
                warn!(
                    profile = %self.profile.name,
                    challenge = reply.params.len(),
                    "Forwarded challenge does not fit the phase-two request"
                );
                return None;
            }
        }
        Some(OperationRequest::new(step.operation, params))
    }

    fn live_view_request(&self) -> Option<OperationRequest> {
        self.profile
            .live_view_operation
            .map(|code| OperationRequest::new(code, []))
    }
}

// ============================================================================
// AuthRegistry
// ============================================================================

/// Ordered list of strategies; first match wins, [`NoAuth`] otherwise.
#[derive(Debug, Clone)]
pub struct AuthRegistry {
    strategies: Vec<Arc<dyn AuthStrategy>>,
    fallback: Arc<dyn AuthStrategy>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: Arc::new(NoAuth),
        }
    }

    /// Appends a strategy.
    pub fn register(&mut self, strategy: Arc<dyn AuthStrategy>) {
        self.strategies.push(strategy);
    }

    /// Appends one [`TwoPhaseAuth`] per profile.
    pub fn register_profiles(&mut self, profiles: &[AuthProfile]) {
        for profile in profiles {
            self.register(Arc::new(TwoPhaseAuth::new(profile.clone())));
        }
    }

    /// Returns the number of registered strategies (excluding the fallback).
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns `true` if only the fallback is available.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Selects the strategy for `info`.
    #[must_use]
    pub fn select(&self, info: &DeviceInfo) -> Arc<dyn AuthStrategy> {
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.matches(info))
            .unwrap_or(&self.fallback);
        debug!(strategy = strategy.name(), manufacturer = %info.manufacturer, "Auth strategy selected");
        Arc::clone(strategy)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::TransactionId;
    use bytes::Bytes;

    fn profile() -> AuthProfile {
        AuthProfile {
            name: "acme".into(),
            vendor_extension_id: Some(0x0B),
            manufacturer: None,
            phase_one: AuthStep::new(0x9101, [1]),
            phase_two: AuthStep::new(0x9102, [2]),
            forward_challenge: true,
            live_view_operation: Some(0x9153),
        }
    }

    fn info(vendor: u32, maker: &str) -> DeviceInfo {
        DeviceInfo {
            vendor_extension_id: vendor,
            manufacturer: maker.into(),
            ..DeviceInfo::default()
        }
    }

    #[test]
    fn test_profile_matching() {
        assert!(profile().matches(&info(0x0B, "Whoever")));
        assert!(!profile().matches(&info(0x06, "Whoever")));

        let by_maker = AuthProfile {
            vendor_extension_id: None,
            manufacturer: Some("acme".into()),
            ..profile()
        };
        assert!(by_maker.matches(&info(0, "ACME Corp")));
        assert!(!by_maker.matches(&info(0, "Other")));
    }

    #[test]
    fn test_profile_without_criteria_never_matches() {
        let p = AuthProfile {
            vendor_extension_id: None,
            manufacturer: None,
            ..profile()
        };
        assert!(!p.matches(&info(0x0B, "acme")));
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_phase_two_forwards_challenge() {
        let auth = TwoPhaseAuth::new(profile());
        let reply = OperationResponse {
            code: 0x2001,
            transaction_id: TransactionId::SESSIONLESS,
            params: vec![0xAA, 0xBB, 0xCC, 0xDD],
            data: Bytes::new(),
        };
        let req = auth.phase_two(&info(0x0B, ""), &reply).expect("phase two");
        assert_eq!(req.code, 0x9102);
        assert_eq!(req.params, vec![2, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_oversized_challenge_is_refused() {
        let auth = TwoPhaseAuth::new(profile());
        let reply = OperationResponse {
            code: 0x2001,
            transaction_id: TransactionId::SESSIONLESS,
            params: vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE],
            data: Bytes::new(),
        };
        assert!(auth.phase_two(&info(0x0B, ""), &reply).is_none());
    }

    #[test]
    fn test_registry_falls_back_to_no_auth() {
        let mut registry = AuthRegistry::new();
        registry.register_profiles(&[profile()]);

        assert_eq!(registry.select(&info(0x0B, "")).name(), "acme");
        let fallback = registry.select(&info(0x06, ""));
        assert_eq!(fallback.name(), "none");
        assert!(fallback.phase_one(&info(0x06, "")).is_none());
        assert!(fallback.live_view_request().is_none());
    }

    #[test]
    fn test_profile_from_json() {
        let json = r#"{
            "name": "acme-pairing",
            "manufacturer": "Acme",
            "phaseOne": { "operation": 37121, "params": [1] },
            "phaseTwo": { "operation": 37122 }
        }"#;
        let p: AuthProfile = serde_json::from_str(json).expect("parse");
        assert_eq!(p.phase_one.operation, 0x9101);
        assert!(p.phase_two.params.is_empty());
        assert!(!p.forward_challenge);
        assert!(p.validate().is_ok());
    }
}
