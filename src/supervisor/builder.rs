//! Builder for [`ConnectionSupervisor`].
//!
//! # Example
//!
//! ```ignore
//! use ptp_tether::{ConnectionSupervisor, TetherOptions};
//!
//! let supervisor = ConnectionSupervisor::builder()
//!     .usb_backend(backend)
//!     .network(wifi)
//!     .options(TetherOptions::from_json_str(&config)?)
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::discovery::NetworkEnvironment;
use crate::error::{Error, Result};
use crate::handshake::AuthStrategy;
use crate::transport::UsbBackend;

use super::core::ConnectionSupervisor;
use super::options::TetherOptions;

// ============================================================================
// SupervisorBuilder
// ============================================================================

/// Builder for configuring a [`ConnectionSupervisor`].
///
/// Use [`ConnectionSupervisor::builder()`] to create one.
#[derive(Default, Clone)]
pub struct SupervisorBuilder {
    /// USB subsystem.
    usb_backend: Option<Arc<dyn UsbBackend>>,
    /// Wireless network subsystem.
    network: Option<Arc<dyn NetworkEnvironment>>,
    /// Strategies consulted before the configured profiles.
    strategies: Vec<Arc<dyn AuthStrategy>>,
    /// Options.
    options: TetherOptions,
}

impl fmt::Debug for SupervisorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorBuilder")
            .field("usb", &self.usb_backend.is_some())
            .field("network", &self.network.is_some())
            .field("strategies", &self.strategies)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SupervisorBuilder Implementation
// ============================================================================

impl SupervisorBuilder {
    /// Creates an empty builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables USB through `backend`.
    #[inline]
    #[must_use]
    pub fn usb_backend(mut self, backend: Arc<dyn UsbBackend>) -> Self {
        self.usb_backend = Some(backend);
        self
    }

    /// Enables both PTP/IP modes through `env`.
    #[inline]
    #[must_use]
    pub fn network(mut self, env: Arc<dyn NetworkEnvironment>) -> Self {
        self.network = Some(env);
        self
    }

    /// Registers a vendor auth strategy.
    ///
    /// Strategies are tried in registration order, before the profiles from
    /// the options.
    #[inline]
    #[must_use]
    pub fn auth_strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Replaces the options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: TetherOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the supervisor.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if neither USB nor a network environment is set
    /// - [`Error::Config`] if the options fail validation
    pub fn build(self) -> Result<ConnectionSupervisor> {
        self.validate()?;

        Ok(ConnectionSupervisor::new(
            self.options,
            self.usb_backend,
            self.network,
            self.strategies,
        ))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl SupervisorBuilder {
    fn validate(&self) -> Result<()> {
        if self.usb_backend.is_none() && self.network.is_none() {
            return Err(Error::config(
                "No transport configured. Use .usb_backend() and/or .network() to enable one.",
            ));
        }

        self.options.validate().map_err(Error::config)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::discovery::StaticNetwork;
    use crate::handshake::NoAuth;
    use crate::supervisor::Timeouts;

    fn offline() -> Arc<dyn NetworkEnvironment> {
        Arc::new(StaticNetwork::offline())
    }

    #[test]
    fn test_new_creates_empty_builder() {
        let builder = SupervisorBuilder::new();
        assert!(builder.usb_backend.is_none());
        assert!(builder.network.is_none());
        assert!(builder.strategies.is_empty());
    }

    #[test]
    fn test_build_fails_without_transport() {
        let err = SupervisorBuilder::new().build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("No transport"));
    }

    #[test]
    fn test_build_fails_with_invalid_options() {
        let options = TetherOptions::new().with_timeouts(Timeouts {
            command_ms: 0,
            ..Timeouts::default()
        });
        let err = SupervisorBuilder::new()
            .network(offline())
            .options(options)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("commandMs"));
    }

    #[test]
    fn test_auth_strategies_accumulate() {
        let builder = SupervisorBuilder::new()
            .auth_strategy(Arc::new(NoAuth))
            .auth_strategy(Arc::new(NoAuth));
        assert_eq!(builder.strategies.len(), 2);
    }

    #[test]
    fn test_build_with_network_only() {
        let supervisor = SupervisorBuilder::new().network(offline()).build();
        assert!(supervisor.is_ok());
    }
}
