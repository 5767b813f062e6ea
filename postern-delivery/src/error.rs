//! Typed error handling for delivery operations.
//!
//! Attempt failures are split the way SMTP splits them:
//! - Permanent failures (5xx replies, unknown domains) are never retried
//! - Temporary failures (4xx replies, network trouble) are retried with backoff
//! - System errors are internal problems, not a verdict on the message
//!
//! [`QueueError`] is the taxonomy surfaced to operators by the queue control
//! service.

use postern_store::{MessageId, MessageStatus, StoreError};
use thiserror::Error;

use crate::{DnsError, executor::TransportError};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),

    #[error("Unexpected SMTP reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery processor not initialized: {0}")]
    NotInitialized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

/// DNS failures that will not change on retry are permanent
impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(domain) => Self::Temporary(TemporaryError::Timeout(domain)),
            DnsError::LookupFailed(err) => {
                Self::Temporary(TemporaryError::DnsLookupFailed(err.to_string()))
            }
        }
    }
}

/// A transport that could not complete the exchange never proves the
/// message undeliverable, so every transport error is temporary
impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Timeout(what) => Self::Temporary(TemporaryError::Timeout(what)),
            other => Self::Temporary(TemporaryError::ConnectionFailed(other.to_string())),
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

/// Failures surfaced to callers of the queue control service
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    #[error("Message {id} is in state \"{status}\"")]
    InvalidState { id: MessageId, status: MessageStatus },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Queue is full: {capacity} messages")]
    QueueFull { capacity: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for QueueError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::StatusMismatch { id, actual } => Self::InvalidState { id, status: actual },
            StoreError::CapacityExceeded { capacity } => Self::QueueFull { capacity },
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_error_conversion() {
        let err: DeliveryError = DnsError::NoMailServers("example.com".to_string()).into();
        assert!(err.is_permanent());

        let err: DeliveryError = DnsError::DomainNotFound("example.com".to_string()).into();
        assert!(err.is_permanent());

        let err: DeliveryError = DnsError::Timeout("example.com".to_string()).into();
        assert!(err.is_temporary());
    }

    #[test]
    fn test_transport_errors_are_temporary() {
        let err: DeliveryError = TransportError::Connect("connection refused".to_string()).into();
        assert!(err.is_temporary());
        assert_eq!(
            err.to_string(),
            "Temporary failure: Connection failed: Connection error: connection refused"
        );

        let err: DeliveryError = TransportError::Timeout("DATA".to_string()).into();
        assert!(err.is_temporary());
    }

    #[test]
    fn test_store_error_to_queue_error() {
        let err: QueueError = StoreError::NotFound(MessageId::new(4)).into();
        assert!(matches!(err, QueueError::NotFound(id) if id == MessageId::new(4)));

        let err: QueueError = StoreError::StatusMismatch {
            id: MessageId::new(5),
            actual: MessageStatus::InProgress,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Message 5 is in state \"Delivery in progress\""
        );

        let err: QueueError = StoreError::CapacityExceeded { capacity: 10 }.into();
        assert_eq!(err.to_string(), "Queue is full: 10 messages");

        let err: QueueError = StoreError::Unavailable("disk full".to_string()).into();
        assert!(matches!(err, QueueError::StoreUnavailable(_)));
    }

    #[test]
    fn test_error_display() {
        let error = DeliveryError::Permanent(PermanentError::MessageRejected(
            "550 no such user".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Permanent failure: Message rejected: 550 no such user"
        );
    }
}
