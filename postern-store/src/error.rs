//! Error types for the postern-store crate.
//!
//! Logical failures (`NotFound`, `StatusMismatch`) are reported to the caller
//! as-is, and so is a full store. Everything else is a persistence failure,
//! which the delivery core treats as the store being unavailable.

use std::io;

use thiserror::Error;

use crate::{MessageId, MessageStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A conditional update found the message in a status it did not expect.
    #[error("Message {id} is {actual}")]
    StatusMismatch { id: MessageId, actual: MessageStatus },

    #[error("Store capacity exceeded: {capacity} messages")]
    CapacityExceeded { capacity: usize },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl StoreError {
    /// Whether the failure came from the persistence layer rather than from
    /// the state of the requested record
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Io(_) | Self::Serialization(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Corrupted record {file}: {reason}")]
    Corrupted { file: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Store path cannot contain '..' components: {0}")]
    ParentDir(String),

    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_unavailable() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StoreError::from(io_err);

        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_logical_errors_are_not_unavailable() {
        assert!(!StoreError::NotFound(MessageId::new(1)).is_unavailable());

        let mismatch = StoreError::StatusMismatch {
            id: MessageId::new(2),
            actual: MessageStatus::InProgress,
        };
        assert!(!mismatch.is_unavailable());
        assert_eq!(mismatch.to_string(), "Message 2 is Delivery in progress");

        assert!(!StoreError::CapacityExceeded { capacity: 3 }.is_unavailable());
    }
}
