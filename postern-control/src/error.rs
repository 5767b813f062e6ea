//! Error types for the control system

use thiserror::Error;

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in the control system
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol deserialization error: {0}")]
    ProtocolDeserialization(#[from] bincode::error::DecodeError),

    #[error("Protocol serialization error: {0}")]
    ProtocolSerialization(#[from] bincode::error::EncodeError),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Incompatible protocol version: peer={peer}, local={local}")]
    VersionMismatch { peer: u32, local: u32 },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid socket path: {0}")]
    InvalidSocketPath(String),
}
