//! Message Record Store
//!
//! The single source of truth for queued messages. The delivery core only
//! ever talks to the [`MessageStore`] trait; the backends here persist the
//! records in memory or on disk.

pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;
pub mod types;

pub use backends::{FileMessageStore, MemoryMessageStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use r#trait::MessageStore;
pub use types::{MessageId, MessageStatus, NewMessage, QueuedMessage, Transition};
