//! PTP wire protocol types.
//!
//! This module defines the byte layouts exchanged with the camera, for both
//! transports:
//!
//! | Message | USB | PTP/IP |
//! |---------|-----|--------|
//! | Command | Container type 1 | `OperationRequest` packet |
//! | Data | Container type 2 | `StartData` + `Data`* + `EndData` |
//! | Response | Container type 3 | `OperationResponse` packet |
//! | Event | Container type 4 (interrupt pipe) | `Event` packet (event socket) |
//!
//! Both transports are normalized into [`Container`] values before they
//! reach the channel, so correlation and event routing do not care which
//! transport carried them.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codes` | Operation, response and event code tables |
//! | `container` | Normalized container and USB framing |
//! | `dataset` | PTP dataset primitives (strings, arrays) |
//! | `device_info` | `DeviceInfo` dataset |
//! | `operation` | Request/response pairs |
//! | `ptpip` | PTP/IP packet codec and reassembly |

// ============================================================================
// Submodules
// ============================================================================

/// Operation, response and event codes.
pub mod codes;

/// Normalized container type and USB container codec.
pub mod container;

/// Dataset read/write primitives.
pub mod dataset;

/// DeviceInfo dataset.
pub mod device_info;

/// Operation request and response types.
pub mod operation;

/// PTP/IP packet codec.
pub mod ptpip;

// ============================================================================
// Re-exports
// ============================================================================

pub use container::{Container, ContainerKind};
pub use device_info::DeviceInfo;
pub use operation::{OperationRequest, OperationResponse};
pub use ptpip::{Packet, PacketAssembler};
