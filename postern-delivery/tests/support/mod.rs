//! Fake collaborators for delivery scenarios
//!
//! - [`ScriptedTransport`]: replies from a script, records every endpoint,
//!   tracks how many sends overlap
//! - [`StaticMx`]: fixed MX answers per domain
//! - [`RecordingSink`]: keeps every lifecycle event
//! - [`FlakyStore`]: a memory store whose first calls fail as unavailable
//! - [`LeaseOutageStore`]: a memory store that cannot move messages out of
//!   `InProgress` while the outage is on
#![allow(dead_code)] // Test utility module - not all helpers are used by every test

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use postern_common::Domain;
use postern_delivery::{
    DeliveryEvent, DnsError, EventSink, MailServer, MxResolver, Reply, ResolvedRoute, Transport,
    TransportError,
};
use postern_store::{
    MemoryMessageStore, MessageId, MessageStatus, MessageStore, NewMessage, QueuedMessage,
    StoreError, Transition,
};

/// One entry of a transport script
#[derive(Debug, Clone)]
pub enum Step {
    Reply(u16),
    Refuse,
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub target: String,
    pub local_ip: Option<std::net::IpAddr>,
    pub id: MessageId,
    pub rcpt_to: String,
}

#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    delay: Option<Duration>,
    sent: Mutex<Vec<Sent>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    /// Replies `code` to everything
    pub fn always(code: u16) -> Arc<Self> {
        Self::scripted(Vec::new(), Step::Reply(code))
    }

    /// Plays `script` in order, then `fallback` forever
    pub fn scripted(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            sent: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Replies 250 after holding every send for `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Reply(250),
            delay: Some(delay),
            sent: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn targets(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.target.clone()).collect()
    }

    /// Most sends ever in flight at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, route: &ResolvedRoute, message: &QueuedMessage) -> Result<Reply, TransportError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        self.sent.lock().push(Sent {
            target: route.address(),
            local_ip: route.local_ip,
            id: message.id,
            rcpt_to: message.rcpt_to.clone(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self.script.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        self.active.fetch_sub(1, Ordering::SeqCst);

        match step {
            Step::Reply(code) => Ok(Reply::new(code, "scripted")),
            Step::Refuse => Err(TransportError::Connect("connection refused".to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct StaticMx {
    records: HashMap<Domain, Vec<MailServer>>,
    lookups: AtomicUsize,
}

impl StaticMx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, domain: &str, exchangers: &[(&str, u16)]) -> Self {
        self.records.insert(
            Domain::new(domain),
            exchangers
                .iter()
                .map(|(host, preference)| MailServer::new(*host, *preference))
                .collect(),
        );
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MxResolver for StaticMx {
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.records.get(domain).map_or_else(
            || Err(DnsError::DomainNotFound(domain.to_string())),
            |servers| {
                let mut servers = servers.clone();
                servers.sort_by_key(|s| s.priority);
                Ok(Arc::new(servers))
            },
        )
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(DeliveryEvent::name).collect()
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: DeliveryEvent) {
        self.events.lock().push(event);
    }
}

/// Fails the first `failures` calls of every kind with `Unavailable`
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryMessageStore,
    remaining: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemoryMessageStore, failures: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(failures),
        }
    }

    fn trip(&self) -> Result<(), StoreError> {
        let tripped = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage, StoreError> {
        self.trip()?;
        self.inner.enqueue(message).await
    }

    async fn get(&self, id: MessageId) -> Result<QueuedMessage, StoreError> {
        self.trip()?;
        self.inner.get(id).await
    }

    async fn list_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.trip()?;
        self.inner.list_all().await
    }

    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> Result<QueuedMessage, StoreError> {
        self.trip()?;
        self.inner.transition(id, expected, transition).await
    }

    async fn delete_if(&self, id: MessageId, expected: &[MessageStatus]) -> Result<QueuedMessage, StoreError> {
        self.trip()?;
        self.inner.delete_if(id, expected).await
    }
}

/// Fails every update or delete that expects `InProgress` while `outage` is set
#[derive(Debug, Default)]
pub struct LeaseOutageStore {
    inner: MemoryMessageStore,
    outage: AtomicBool,
}

impl LeaseOutageStore {
    pub fn set_outage(&self, on: bool) {
        self.outage.store(on, Ordering::SeqCst);
    }

    fn check(&self, expected: &[MessageStatus]) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) && expected.contains(&MessageStatus::InProgress) {
            Err(StoreError::Unavailable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for LeaseOutageStore {
    async fn enqueue(&self, message: NewMessage) -> Result<QueuedMessage, StoreError> {
        self.inner.enqueue(message).await
    }

    async fn get(&self, id: MessageId) -> Result<QueuedMessage, StoreError> {
        self.inner.get(id).await
    }

    async fn list_all(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.inner.list_all().await
    }

    async fn transition(
        &self,
        id: MessageId,
        expected: &[MessageStatus],
        transition: Transition,
    ) -> Result<QueuedMessage, StoreError> {
        self.check(expected)?;
        self.inner.transition(id, expected, transition).await
    }

    async fn delete_if(&self, id: MessageId, expected: &[MessageStatus]) -> Result<QueuedMessage, StoreError> {
        self.check(expected)?;
        self.inner.delete_if(id, expected).await
    }
}

pub fn message(from: &str, to: &str) -> NewMessage {
    NewMessage::new(from, to, b"Subject: hello\r\n\r\nHi there\r\n".to_vec())
}

pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}
