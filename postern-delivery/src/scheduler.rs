//! Delivery Scheduler: the per-message state machine
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!   ┌──────► Scheduled ──── claim ────► InProgress ── success ──► (removed)
//!   │           │  ▲                     │    │
//!   │  soft     │  └───── soft failure ──┘    │ hard failure /
//!   │  failure  │                             │ retries exhausted
//!   │           ▼                             ▼
//!   │   WillBeDiscarded ──► (removed)   WillBeBounced ── bounce sent ──► (removed)
//! ```
//!
//! Every transition is a conditional store update on the expected current
//! status, so two workers (or a worker and an operator) can never both win.
//! The `InProgress` status is the lease that guarantees at most one attempt
//! per message.

use std::{sync::Arc, time::SystemTime};

use postern_store::{
    MessageId, MessageStatus, MessageStore, NewMessage, QueuedMessage, StoreError, Transition,
};
use tracing::{debug, warn};

use crate::{
    bounce::{self, BounceConfig},
    error::QueueError,
    events::{DeliveryEvent, EventSink},
    executor::Outcome,
    policy::{RetryDecision, RetryPolicy, StoreRetryPolicy},
};

const OPERATOR_BOUNCE: &str = "Bounced by the mail administrator";

/// Where a message ended up after an attempt was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Delivered,
    Deferred(SystemTime),
    Bounced,
}

/// Result of startup recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Interrupted attempts reset to `Scheduled`
    pub rescheduled: usize,
    /// Pending discards completed
    pub discarded: usize,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    store: Arc<dyn MessageStore>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    store_retry: StoreRetryPolicy,
    bounce: BounceConfig,
}

/// Lost races show up as a missing record or an unexpected status
const fn lost_race(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::NotFound(_) | StoreError::StatusMismatch { .. }
    )
}

impl Scheduler {
    pub fn new(store: Arc<dyn MessageStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            store,
            events,
            retry: RetryPolicy::default(),
            store_retry: StoreRetryPolicy::default(),
            bounce: BounceConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_store_retry(mut self, store_retry: StoreRetryPolicy) -> Self {
        self.store_retry = store_retry;
        self
    }

    #[must_use]
    pub fn with_bounce_config(mut self, bounce: BounceConfig) -> Self {
        self.bounce = bounce;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) async fn list_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.store_retry.run("list_all", || self.store.list_all()).await
    }

    pub(crate) async fn get(&self, id: MessageId) -> Result<QueuedMessage, StoreError> {
        self.store_retry.run("get", || self.store.get(id)).await
    }

    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> Result<QueuedMessage, StoreError> {
        self.store_retry
            .run("transition", || {
                self.store.transition(id, expected, transition.clone())
            })
            .await
    }

    async fn delete_if(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
    ) -> Result<QueuedMessage, StoreError> {
        self.store_retry
            .run("delete", || self.store.delete_if(id, expected))
            .await
    }

    /// Store a new message, due immediately
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage, StoreError> {
        let queued = self
            .store_retry
            .run("enqueue", || self.store.enqueue(message.clone()))
            .await?;
        self.events.record(DeliveryEvent::enqueued(&queued));
        Ok(queued)
    }

    /// Reset state left behind by a previous run
    ///
    /// `InProgress` messages were interrupted mid-attempt and become due
    /// again at `now`; pending discards are completed.
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn recover(&self, now: SystemTime) -> Result<Recovery, StoreError> {
        let mut recovery = Recovery::default();

        for message in self.list_all().await? {
            match message.status {
                MessageStatus::InProgress => {
                    if self.release(message.id, now).await? {
                        recovery.rescheduled += 1;
                    }
                }
                MessageStatus::WillBeDiscarded => {
                    if self.remove_discarded(message.id).await? {
                        recovery.discarded += 1;
                    }
                }
                MessageStatus::Scheduled | MessageStatus::WillBeBounced => {}
            }
        }

        Ok(recovery)
    }

    /// Hand back every `InProgress` lease `held` does not claim, due again at
    /// `now`
    ///
    /// A worker that could not record its outcome leaves the message
    /// `InProgress` with nobody attempting it.
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn release_abandoned(
        &self,
        held: impl Fn(MessageId) -> bool,
        now: SystemTime,
    ) -> Result<usize, StoreError> {
        let mut released = 0;
        for message in self.list_all().await? {
            if message.status == MessageStatus::InProgress
                && !held(message.id)
                && self.release(message.id, now).await?
            {
                released += 1;
            }
        }
        Ok(released)
    }

    async fn release(&self, id: MessageId, now: SystemTime) -> Result<bool, StoreError> {
        match self
            .transition(
                id,
                &[MessageStatus::InProgress],
                Transition::to(MessageStatus::Scheduled).at(now),
            )
            .await
        {
            Ok(_) => {
                self.events.record(DeliveryEvent::Recovered { id });
                Ok(true)
            }
            Err(err) if lost_race(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Ids of `Scheduled` messages due at `now`, earliest first
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn due_messages(&self, now: SystemTime) -> Result<Vec<MessageId>, StoreError> {
        let mut due: Vec<_> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|m| m.status == MessageStatus::Scheduled && m.is_due(now))
            .map(|m| (m.next_delivery_scheduled_at, m.id))
            .collect();
        due.sort_unstable();

        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    /// Take the `InProgress` lease on a due message
    ///
    /// Returns `None` when the message is gone, not due, or another worker or
    /// an operator got to it first.
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn claim(
        &self,
        id: MessageId,
        now: SystemTime,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        let current = match self.get(id).await {
            Ok(message) => message,
            Err(err) if lost_race(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        if current.status != MessageStatus::Scheduled || !current.is_due(now) {
            return Ok(None);
        }

        match self
            .transition(
                id,
                &[MessageStatus::Scheduled],
                Transition::to(MessageStatus::InProgress),
            )
            .await
        {
            Ok(claimed) => {
                self.events.record(DeliveryEvent::Claimed {
                    id,
                    attempt: claimed.attempts + 1,
                });
                Ok(Some(claimed))
            }
            Err(err) if lost_race(&err) => {
                debug!(id = %id, "Lost the claim race");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply the outcome of an attempt to a claimed message
    ///
    /// # Errors
    /// - [`StoreError::StatusMismatch`] if the message was not `InProgress`
    /// - the store error once in-place retries are exhausted
    pub async fn settle(
        &self,
        message: &QueuedMessage,
        outcome: Outcome,
        now: SystemTime,
    ) -> Result<Settlement, StoreError> {
        let id = message.id;
        let failures = message.attempts + 1;

        match outcome {
            Outcome::Success { server } => {
                self.delete_if(id, &[MessageStatus::InProgress]).await?;
                self.events.record(DeliveryEvent::Delivered { id, server });
                Ok(Settlement::Delivered)
            }
            Outcome::SoftFailure(reason) => {
                match self.retry.decide(
                    failures,
                    message.added_at,
                    message.next_delivery_scheduled_at,
                    now,
                ) {
                    RetryDecision::RetryAt(next) => {
                        self.transition(
                            id,
                            &[MessageStatus::InProgress],
                            Transition::to(MessageStatus::Scheduled)
                                .at(next)
                                .attempts(failures)
                                .error(reason.clone()),
                        )
                        .await?;
                        self.events.record(DeliveryEvent::Deferred {
                            id,
                            attempts: failures,
                            reason,
                            next_attempt: next,
                        });
                        Ok(Settlement::Deferred(next))
                    }
                    RetryDecision::Exhausted => self.mark_bounced(id, failures, reason, now).await,
                }
            }
            Outcome::HardFailure(reason) => self.mark_bounced(id, failures, reason, now).await,
        }
    }

    async fn mark_bounced(
        &self,
        id: MessageId,
        attempts: u32,
        reason: String,
        now: SystemTime,
    ) -> Result<Settlement, StoreError> {
        self.transition(
            id,
            &[MessageStatus::InProgress],
            Transition::to(MessageStatus::WillBeBounced)
                .at(now)
                .attempts(attempts)
                .error(reason.clone()),
        )
        .await?;
        self.events.record(DeliveryEvent::Bounced { id, reason });
        Ok(Settlement::Bounced)
    }

    async fn remove_discarded(&self, id: MessageId) -> Result<bool, StoreError> {
        match self.delete_if(id, &[MessageStatus::WillBeDiscarded]).await {
            Ok(_) => {
                self.events.record(DeliveryEvent::Discarded { id });
                Ok(true)
            }
            Err(err) if lost_race(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Complete every pending discard
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn purge_discarded(&self) -> Result<usize, StoreError> {
        let mut purged = 0;
        for message in self.list_all().await? {
            if message.status == MessageStatus::WillBeDiscarded
                && self.remove_discarded(message.id).await?
            {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Send the bounce for every `WillBeBounced` message due at `now` and
    /// remove the original
    ///
    /// # Errors
    /// Returns the store error once in-place retries are exhausted
    pub async fn generate_bounces(&self, now: SystemTime) -> Result<usize, StoreError> {
        let mut settled = 0;
        for message in self.list_all().await? {
            if message.status == MessageStatus::WillBeBounced
                && message.is_due(now)
                && self.bounce_one(&message, now).await?
            {
                settled += 1;
            }
        }
        Ok(settled)
    }

    /// The bounce is stored before the original is removed, so a crash in
    /// between duplicates the bounce rather than losing it. A bounce whose
    /// original changed state in the meantime is withdrawn.
    async fn bounce_one(&self, original: &QueuedMessage, now: SystemTime) -> Result<bool, StoreError> {
        let Some(notice) = bounce::generate_bounce(original, &self.bounce, now) else {
            let reason = if self.bounce.enabled {
                "Message from the null sender is not bounced"
            } else {
                "Bounces are disabled"
            };
            return match self.delete_if(original.id, &[MessageStatus::WillBeBounced]).await {
                Ok(_) => {
                    self.events.record(DeliveryEvent::Dropped {
                        id: original.id,
                        reason: reason.to_string(),
                    });
                    Ok(true)
                }
                Err(err) if lost_race(&err) => Ok(false),
                Err(err) => Err(err),
            };
        };

        let notice = self.enqueue(notice).await?;

        match self.delete_if(original.id, &[MessageStatus::WillBeBounced]).await {
            Ok(_) => {
                self.events.record(DeliveryEvent::BounceGenerated {
                    original: original.id,
                    bounce: notice.id,
                });
                Ok(true)
            }
            Err(err) => {
                warn!(
                    id = %original.id,
                    bounce = %notice.id,
                    error = %err,
                    "Original changed before removal, withdrawing bounce"
                );
                if let Err(withdraw) = self.delete_if(notice.id, &[MessageStatus::Scheduled]).await {
                    warn!(bounce = %notice.id, error = %withdraw, "Failed to withdraw bounce");
                }
                if lost_race(&err) { Ok(false) } else { Err(err) }
            }
        }
    }

    /// Operator discard: `→ WillBeDiscarded → removed`, no bounce
    ///
    /// # Errors
    /// - [`QueueError::NotFound`] for an unknown id
    /// - [`QueueError::InvalidState`] while an attempt holds the message
    pub async fn discard(&self, id: MessageId) -> Result<(), QueueError> {
        self.transition(
            id,
            &MessageStatus::SETTLED,
            Transition::to(MessageStatus::WillBeDiscarded),
        )
        .await?;
        self.remove_discarded(id).await?;
        Ok(())
    }

    /// Operator bounce: `→ WillBeBounced`, due immediately
    ///
    /// # Errors
    /// - [`QueueError::NotFound`] for an unknown id
    /// - [`QueueError::InvalidState`] while an attempt holds the message or a
    ///   discard is pending
    pub async fn bounce(&self, id: MessageId, now: SystemTime) -> Result<(), QueueError> {
        self.transition(
            id,
            &[MessageStatus::Scheduled, MessageStatus::WillBeBounced],
            Transition::to(MessageStatus::WillBeBounced)
                .at(now)
                .error(OPERATOR_BOUNCE),
        )
        .await?;
        self.events.record(DeliveryEvent::Bounced {
            id,
            reason: OPERATOR_BOUNCE.to_string(),
        });
        Ok(())
    }
}
