//! Connection supervisor and configuration.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | [`SupervisorBuilder`] |
//! | `core` | [`ConnectionSupervisor`] |
//! | `options` | [`TetherOptions`] and [`Timeouts`] |
//! | `status` | [`SupervisorStatus`] |

// ============================================================================
// Submodules
// ============================================================================

/// Supervisor builder.
pub mod builder;

/// Supervisor implementation.
pub mod core;

/// Tethering options.
pub mod options;

/// Aggregated status.
pub mod status;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::SupervisorBuilder;
pub use core::ConnectionSupervisor;
pub use options::{STILL_IMAGE_CLASS, TetherOptions, Timeouts};
pub use status::SupervisorStatus;
