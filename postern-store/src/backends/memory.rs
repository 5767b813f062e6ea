use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::Mutex;

use crate::{
    MessageId, MessageStatus, NewMessage, QueuedMessage, StoreError, Transition,
    r#trait::MessageStore,
};

/// In-memory message store
///
/// Records live in a `DashMap`; every conditional update holds the shard
/// lock for its id while checking and writing, so claims on the same
/// message are mutually exclusive without a global lock.
///
/// Nothing survives a restart. Intended for tests and for deployments that
/// accept losing the queue on a crash.
///
/// # Capacity Management
/// With a capacity set, `enqueue` fails with
/// [`StoreError::CapacityExceeded`] once the store is full. Enqueues are
/// admitted one at a time so concurrent callers cannot overshoot the limit.
#[derive(Debug, Clone)]
pub struct MemoryMessageStore {
    pub(crate) messages: Arc<DashMap<MessageId, QueuedMessage>>,
    next_id: Arc<AtomicU64>,
    capacity: Option<usize>,
    admission: Arc<Mutex<()>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: None,
            admission: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn enqueue(&self, message: NewMessage) -> crate::Result<QueuedMessage> {
        let _admitted = match self.capacity {
            Some(capacity) => {
                let guard = self.admission.lock().await;
                if self.messages.len() >= capacity {
                    return Err(StoreError::CapacityExceeded { capacity });
                }
                Some(guard)
            }
            None => None,
        };

        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queued = message.into_queued(id);
        self.messages.insert(id, queued.clone());

        Ok(queued)
    }

    async fn get(&self, id: MessageId) -> crate::Result<QueuedMessage> {
        self.messages
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_all(&self) -> crate::Result<Vec<QueuedMessage>> {
        let mut messages: Vec<_> = self.messages.iter().map(|e| e.value().clone()).collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> crate::Result<QueuedMessage> {
        let mut entry = self.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let actual = entry.status;
        if !expected.contains(&actual) {
            return Err(StoreError::StatusMismatch { id, actual });
        }

        transition.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn delete_if(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
    ) -> crate::Result<QueuedMessage> {
        match self.messages.entry(id) {
            Entry::Occupied(entry) => {
                let actual = entry.get().status;
                if expected.contains(&actual) {
                    Ok(entry.remove())
                } else {
                    Err(StoreError::StatusMismatch { id, actual })
                }
            }
            Entry::Vacant(_) => Err(StoreError::NotFound(id)),
        }
    }
}
