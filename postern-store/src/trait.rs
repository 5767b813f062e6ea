use std::time::SystemTime;

use async_trait::async_trait;

use crate::{MessageId, MessageStatus, NewMessage, QueuedMessage, Result, Transition};

/// Durable record of every queued message and its lifecycle state
///
/// Implementations must make each operation atomic per message id: a reader
/// never observes a status without its matching scheduling fields, and two
/// conditional updates racing on the same id cannot both succeed.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Store a new message as `Scheduled`, due at its `added_at`, and return
    /// the stored record with its assigned id
    ///
    /// # Errors
    /// Returns a persistence error if the message could not be stored
    async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage>;

    /// # Errors
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) for an unknown id
    async fn get(&self, id: MessageId) -> Result<QueuedMessage>;

    /// Every stored message, ordered by id
    ///
    /// # Errors
    /// Returns a persistence error if the records could not be read
    async fn list_all(&self) -> Result<Vec<QueuedMessage>>;

    /// Apply `transition` only if the message is currently in one of the
    /// `expected` statuses, returning the updated record
    ///
    /// # Errors
    /// - [`StoreError::NotFound`](crate::StoreError::NotFound) for an unknown id
    /// - [`StoreError::StatusMismatch`](crate::StoreError::StatusMismatch) when the
    ///   current status is not expected; nothing is written
    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> Result<QueuedMessage>;

    /// Remove the message only if it is in one of the `expected` statuses,
    /// returning the removed record
    ///
    /// # Errors
    /// Same as [`MessageStore::transition`]
    async fn delete_if(&self, id: MessageId, expected: &[MessageStatus]) -> Result<QueuedMessage>;

    /// Unconditionally set the status, and the next attempt time if given
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) for an unknown id
    async fn update_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        next_attempt: Option<SystemTime>,
    ) -> Result<()> {
        let transition = next_attempt.map_or_else(
            || Transition::to(status),
            |next| Transition::to(status).at(next),
        );
        self.transition(id, &MessageStatus::ALL, transition).await?;
        Ok(())
    }

    /// Unconditionally remove the message
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`](crate::StoreError::NotFound) for an unknown id
    async fn delete(&self, id: MessageId) -> Result<()> {
        self.delete_if(id, &MessageStatus::ALL).await?;
        Ok(())
    }
}
