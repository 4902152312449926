//! Error types for mesh session operations.

use crate::aci::Status;
use crate::correlator::HandleKind;
use thiserror::Error;

/// Errors produced by the correlation engine, the provisioning workflow and the
/// node directory.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The transport channel is closed or the bridge connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device answered a command with a non-zero status.
    #[error("{command} failed with status {status}")]
    DeviceStatus { command: String, status: Status },

    /// A bounded wait on the device expired.
    #[error("device unresponsive while waiting for {waiting_for}")]
    DeviceUnresponsive { waiting_for: String },

    /// No unprovisioned device or node matches the request.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("element {element} not found on node {address:#06x}")]
    ElementNotFound { address: u16, element: u16 },

    #[error("model {model_id:#06x} not found on element {element} of node {address:#06x}")]
    ModelNotFound {
        address: u16,
        element: u16,
        model_id: u16,
    },

    /// A response arrived while the previous one of the same kind was still unread.
    #[error("{0} exchange slot already holds an unread value")]
    SlotOccupied(HandleKind),

    /// Reading or writing the node directory failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
