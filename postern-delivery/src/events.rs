//! Queue lifecycle events
//!
//! Every state change the delivery core makes is reported to an injected
//! [`EventSink`]. The default [`TracingEventSink`] writes them as structured
//! `tracing` events with an `event` field naming the change, redacting
//! addresses when configured.

use std::time::SystemTime;

use postern_common::redact_email;
use postern_store::{MessageId, QueuedMessage};
use serde::{Deserialize, Serialize};

/// A state change of a queued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Enqueued {
        id: MessageId,
        mail_from: String,
        rcpt_to: String,
        size: usize,
    },
    /// An interrupted attempt was reset at startup
    Recovered { id: MessageId },
    Claimed { id: MessageId, attempt: u32 },
    Delivered { id: MessageId, server: String },
    Deferred {
        id: MessageId,
        attempts: u32,
        reason: String,
        next_attempt: SystemTime,
    },
    /// The message now waits for bounce generation
    Bounced { id: MessageId, reason: String },
    BounceGenerated { original: MessageId, bounce: MessageId },
    Discarded { id: MessageId },
    /// Removed without a bounce, e.g. a failed bounce or bounces disabled
    Dropped { id: MessageId, reason: String },
}

impl DeliveryEvent {
    #[must_use]
    pub fn enqueued(message: &QueuedMessage) -> Self {
        Self::Enqueued {
            id: message.id,
            mail_from: message.mail_from.clone(),
            rcpt_to: message.rcpt_to.clone(),
            size: message.data.len(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "MessageEnqueued",
            Self::Recovered { .. } => "MessageRecovered",
            Self::Claimed { .. } => "DeliveryAttempt",
            Self::Delivered { .. } => "DeliverySuccess",
            Self::Deferred { .. } => "DeliveryDeferred",
            Self::Bounced { .. } => "DeliveryFailure",
            Self::BounceGenerated { .. } => "BounceGenerated",
            Self::Discarded { .. } => "MessageDiscarded",
            Self::Dropped { .. } => "MessageDropped",
        }
    }

    #[must_use]
    pub const fn id(&self) -> MessageId {
        match self {
            Self::Enqueued { id, .. }
            | Self::Recovered { id }
            | Self::Claimed { id, .. }
            | Self::Delivered { id, .. }
            | Self::Deferred { id, .. }
            | Self::Bounced { id, .. }
            | Self::Discarded { id }
            | Self::Dropped { id, .. } => *id,
            Self::BounceGenerated { original, .. } => *original,
        }
    }
}

/// Receiver of queue lifecycle events
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: DeliveryEvent);
}

/// Address redaction for the tracing sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub redact_sender: bool,
    #[serde(default)]
    pub redact_recipients: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TracingEventSink {
    config: EventConfig,
}

impl TracingEventSink {
    #[must_use]
    pub const fn new(config: EventConfig) -> Self {
        Self { config }
    }
}

impl EventSink for TracingEventSink {
    fn record(&self, event: DeliveryEvent) {
        let name = event.name();

        match event {
            DeliveryEvent::Enqueued {
                id,
                mail_from,
                rcpt_to,
                size,
            } => tracing::event!(
                tracing::Level::INFO,
                event = name,
                id = %id,
                sender = %redact_email(&mail_from, self.config.redact_sender),
                recipient = %redact_email(&rcpt_to, self.config.redact_recipients),
                size,
                "Message enqueued"
            ),
            DeliveryEvent::Recovered { id } => tracing::event!(
                tracing::Level::WARN,
                event = name,
                id = %id,
                "Interrupted delivery attempt rescheduled"
            ),
            DeliveryEvent::Claimed { id, attempt } => tracing::event!(
                tracing::Level::DEBUG,
                event = name,
                id = %id,
                attempt,
                "Delivery attempt started"
            ),
            DeliveryEvent::Delivered { id, server } => tracing::event!(
                tracing::Level::INFO,
                event = name,
                id = %id,
                server = %server,
                "Message delivered"
            ),
            DeliveryEvent::Deferred {
                id,
                attempts,
                reason,
                next_attempt,
            } => tracing::event!(
                tracing::Level::INFO,
                event = name,
                id = %id,
                attempts,
                reason = %reason,
                next_attempt = ?next_attempt,
                "Delivery deferred"
            ),
            DeliveryEvent::Bounced { id, reason } => tracing::event!(
                tracing::Level::WARN,
                event = name,
                id = %id,
                reason = %reason,
                "Message will be bounced"
            ),
            DeliveryEvent::BounceGenerated { original, bounce } => tracing::event!(
                tracing::Level::INFO,
                event = name,
                id = %original,
                bounce = %bounce,
                "Bounce generated"
            ),
            DeliveryEvent::Discarded { id } => tracing::event!(
                tracing::Level::INFO,
                event = name,
                id = %id,
                "Message discarded"
            ),
            DeliveryEvent::Dropped { id, reason } => tracing::event!(
                tracing::Level::WARN,
                event = name,
                id = %id,
                reason = %reason,
                "Message dropped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_and_ids() {
        let event = DeliveryEvent::BounceGenerated {
            original: MessageId::new(3),
            bounce: MessageId::new(4),
        };
        assert_eq!(event.name(), "BounceGenerated");
        assert_eq!(event.id(), MessageId::new(3));

        let event = DeliveryEvent::Discarded { id: MessageId::new(5) };
        assert_eq!(event.name(), "MessageDiscarded");
        assert_eq!(event.id(), MessageId::new(5));
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingEventSink::new(EventConfig {
            redact_sender: true,
            redact_recipients: true,
        });

        sink.record(DeliveryEvent::Enqueued {
            id: MessageId::new(1),
            mail_from: "a@x.com".to_string(),
            rcpt_to: "b@y.com".to_string(),
            size: 12,
        });
        sink.record(DeliveryEvent::Deferred {
            id: MessageId::new(1),
            attempts: 1,
            reason: "451 busy".to_string(),
            next_attempt: SystemTime::now(),
        });
        sink.record(DeliveryEvent::Dropped {
            id: MessageId::new(1),
            reason: "null sender".to_string(),
        });
    }
}
