use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

/// Identifier of a queued message
///
/// Assigned by the store at enqueue time, starting at 1 and increasing
/// monotonically. Ids are never reused while the store's records survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parse a message id from a record filename such as `42.bin` or `42.eml`
    ///
    /// Anything that is not a plain decimal stem with one of those extensions
    /// is rejected, which keeps path separators and traversal out.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename
            .strip_suffix(".bin")
            .or_else(|| filename.strip_suffix(".eml"))?;

        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        stem.parse().ok().map(Self)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a queued message
///
/// Success is not a status: a delivered message is removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// A worker holds the message for an active attempt
    InProgress,
    /// The operator discarded the message; removal is pending
    WillBeDiscarded,
    /// Waiting for `next_delivery_scheduled_at`
    Scheduled,
    /// Waiting for bounce generation at `next_delivery_scheduled_at`
    WillBeBounced,
}

impl MessageStatus {
    pub const ALL: [Self; 4] = [
        Self::InProgress,
        Self::WillBeDiscarded,
        Self::Scheduled,
        Self::WillBeBounced,
    ];

    /// Every status an attempt may not be holding
    pub const SETTLED: [Self; 3] = [Self::WillBeDiscarded, Self::Scheduled, Self::WillBeBounced];
}

impl Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProgress => "Delivery in progress",
            Self::WillBeDiscarded => "Will be discarded",
            Self::Scheduled => "Scheduled",
            Self::WillBeBounced => "Will be bounced",
        })
    }
}

/// A message as held by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub mail_from: String,
    pub rcpt_to: String,
    pub status: MessageStatus,
    pub added_at: SystemTime,
    pub next_delivery_scheduled_at: SystemTime,
    /// Number of failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Raw message content. The file store keeps it in a separate `.eml` file.
    #[serde(skip)]
    pub data: Arc<[u8]>,
}

impl QueuedMessage {
    #[must_use]
    pub fn is_due(&self, now: SystemTime) -> bool {
        now >= self.next_delivery_scheduled_at
    }
}

/// A message handed to the store for enqueueing
///
/// The store assigns the id and always starts the message as
/// [`MessageStatus::Scheduled`], due immediately.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub mail_from: String,
    pub rcpt_to: String,
    pub data: Arc<[u8]>,
    pub added_at: SystemTime,
}

impl NewMessage {
    pub fn new(
        mail_from: impl Into<String>,
        rcpt_to: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            mail_from: mail_from.into(),
            rcpt_to: rcpt_to.into(),
            data: data.into(),
            added_at: SystemTime::now(),
        }
    }

    #[must_use]
    pub const fn added_at(mut self, added_at: SystemTime) -> Self {
        self.added_at = added_at;
        self
    }

    pub(crate) fn into_queued(self, id: MessageId) -> QueuedMessage {
        QueuedMessage {
            id,
            mail_from: self.mail_from,
            rcpt_to: self.rcpt_to,
            status: MessageStatus::Scheduled,
            added_at: self.added_at,
            next_delivery_scheduled_at: self.added_at,
            attempts: 0,
            last_error: None,
            data: self.data,
        }
    }
}

/// A status change applied atomically together with its scheduling fields
///
/// ```
/// use std::time::SystemTime;
/// use postern_store::{MessageStatus, Transition};
///
/// let t = Transition::to(MessageStatus::Scheduled)
///     .at(SystemTime::UNIX_EPOCH)
///     .attempts(3)
///     .error("451 try later");
/// assert_eq!(t.status(), MessageStatus::Scheduled);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    status: MessageStatus,
    next_delivery_scheduled_at: Option<SystemTime>,
    attempts: Option<u32>,
    last_error: Option<String>,
}

impl Transition {
    #[must_use]
    pub const fn to(status: MessageStatus) -> Self {
        Self {
            status,
            next_delivery_scheduled_at: None,
            attempts: None,
            last_error: None,
        }
    }

    #[must_use]
    pub const fn at(mut self, next: SystemTime) -> Self {
        self.next_delivery_scheduled_at = Some(next);
        self
    }

    #[must_use]
    pub const fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    #[must_use]
    pub const fn status(&self) -> MessageStatus {
        self.status
    }

    pub(crate) fn apply(self, message: &mut QueuedMessage) {
        message.status = self.status;
        if let Some(next) = self.next_delivery_scheduled_at {
            message.next_delivery_scheduled_at = next;
        }
        if let Some(attempts) = self.attempts {
            message.attempts = attempts;
        }
        if let Some(error) = self.last_error {
            message.last_error = Some(error);
        }
    }
}
