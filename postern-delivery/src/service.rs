//! Queue Control service
//!
//! The operator-facing surface over the queue: list, discard, bounce, plus
//! the inbound hand-off ([`QueueService::enqueue`]). The control socket
//! handler talks to the [`QueueService`] trait, never to the processor.

use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use postern_store::{MessageId, NewMessage, QueuedMessage};
use tokio::sync::Notify;

use crate::{error::QueueError, scheduler::Scheduler};

#[async_trait]
pub trait QueueService: Send + Sync + std::fmt::Debug {
    /// Every queued message, oldest first. Never mutates the queue.
    ///
    /// # Errors
    /// Returns [`QueueError::StoreUnavailable`] if the store cannot be read
    async fn list_messages(&self) -> Result<Vec<QueuedMessage>, QueueError>;

    /// # Errors
    /// Returns [`QueueError::NotFound`] for an unknown id
    async fn get(&self, id: MessageId) -> Result<QueuedMessage, QueueError>;

    /// Remove a message without a bounce
    ///
    /// # Errors
    /// - [`QueueError::NotFound`] for an unknown id
    /// - [`QueueError::InvalidState`] while a delivery attempt holds it
    async fn discard(&self, id: MessageId) -> Result<(), QueueError>;

    /// Bounce a message back to its sender now
    ///
    /// # Errors
    /// - [`QueueError::NotFound`] for an unknown id
    /// - [`QueueError::InvalidState`] while a delivery attempt holds it or a
    ///   discard is pending
    async fn bounce(&self, id: MessageId) -> Result<(), QueueError>;

    /// Accept a message for delivery
    ///
    /// # Errors
    /// Returns [`QueueError::StoreUnavailable`] if the message could not be stored
    async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage, QueueError>;

    /// Ask the processor for an immediate pass
    fn process_now(&self);
}

/// [`QueueService`] backed by the [`Scheduler`]
///
/// Operations that create work wake the processor so it is picked up
/// without waiting for the next interval.
#[derive(Debug, Clone)]
pub struct QueueControl {
    scheduler: Arc<Scheduler>,
    wake: Arc<Notify>,
}

impl QueueControl {
    pub const fn new(scheduler: Arc<Scheduler>, wake: Arc<Notify>) -> Self {
        Self { scheduler, wake }
    }
}

#[async_trait]
impl QueueService for QueueControl {
    async fn list_messages(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        let mut messages = self.scheduler.list_all().await?;
        messages.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn get(&self, id: MessageId) -> Result<QueuedMessage, QueueError> {
        Ok(self.scheduler.get(id).await?)
    }

    async fn discard(&self, id: MessageId) -> Result<(), QueueError> {
        self.scheduler.discard(id).await
    }

    async fn bounce(&self, id: MessageId) -> Result<(), QueueError> {
        self.scheduler.bounce(id, SystemTime::now()).await?;
        self.wake.notify_one();
        Ok(())
    }

    async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage, QueueError> {
        let queued = self.scheduler.enqueue(message).await?;
        self.wake.notify_one();
        Ok(queued)
    }

    fn process_now(&self) {
        self.wake.notify_one();
    }
}
