//! Delivery scheduling, route resolution and attempt execution
//!
//! This crate provides functionality to:
//! - Resolve the endpoint for a destination host from configured routes, with
//!   DNS MX records as the fallback
//! - Attempt delivery through a pluggable [`Transport`] and classify the reply
//! - Drive each queued message through its lifecycle, retrying with backoff
//!   and bouncing what cannot be delivered
//! - Expose operator control over the queue

pub mod bounce;
mod dns;
mod error;
pub mod events;
mod executor;
pub mod policy;
mod processor;
mod scheduler;
mod service;

pub use bounce::BounceConfig;
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MxResolver};
pub use error::{DeliveryError, PermanentError, QueueError, SystemError, TemporaryError};
pub use events::{DeliveryEvent, EventConfig, EventSink, TracingEventSink};
pub use executor::{Executor, Outcome, Reply, Transport, TransportError};
pub use policy::{
    ResolvedRoute, RetryDecision, RetryPolicy, Route, RouteError, RouteId, RouteSpec, RouteTable,
    StoreRetryPolicy,
};
pub use processor::{DeliveryProcessor, PassSummary};
pub use scheduler::{Recovery, Scheduler, Settlement};
pub use service::{QueueControl, QueueService};
