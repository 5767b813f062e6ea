//! Delivery Attempt Executor
//!
//! One attempt per call: resolve the endpoint, hand the envelope and content
//! to the [`Transport`], classify the final reply. The executor reports an
//! [`Outcome`] and never touches message status; the
//! [`Scheduler`](crate::Scheduler) owns every transition.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use postern_common::domain_of;
use postern_store::QueuedMessage;
use thiserror::Error;
use tracing::debug;

use crate::{
    dns::MxResolver,
    error::{DeliveryError, PermanentError, TemporaryError},
    policy::{ResolvedRoute, RouteTable},
};

/// Failure to complete an exchange with the remote server
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out during {0}")]
    Timeout(String),

    #[error("Connection closed by remote server")]
    Closed,
}

/// The final reply of the remote server to a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Classify the reply: 2xx accepted, 5xx permanent, anything else
    /// (4xx or an unexpected code) temporary
    ///
    /// # Errors
    /// Returns the [`DeliveryError`] for any reply other than 2xx
    pub fn classify(&self) -> Result<(), DeliveryError> {
        if self.is_success() {
            Ok(())
        } else if self.is_permanent() {
            Err(PermanentError::MessageRejected(self.to_string()).into())
        } else if self.code >= 400 && self.code < 500 {
            Err(TemporaryError::SmtpTemporary(self.to_string()).into())
        } else {
            Err(TemporaryError::UnexpectedReply(self.to_string()).into())
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Outbound SMTP client supplied by the embedding process
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Connect to `route`, transmit the envelope and content of `message`,
    /// and return the server's final reply
    ///
    /// # Errors
    /// Returns a [`TransportError`] when the exchange could not be completed
    async fn send(&self, route: &ResolvedRoute, message: &QueuedMessage) -> Result<Reply, TransportError>;
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by `server`
    Success { server: String },
    /// Worth retrying later
    SoftFailure(String),
    /// Will never succeed; the message should be bounced
    HardFailure(String),
}

impl Outcome {
    fn from_error(error: &DeliveryError) -> Self {
        if error.is_permanent() {
            Self::HardFailure(error.to_string())
        } else {
            Self::SoftFailure(error.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    routes: Arc<RouteTable>,
    resolver: Arc<dyn MxResolver>,
    transport: Arc<dyn Transport>,
}

impl Executor {
    pub fn new(
        routes: Arc<RouteTable>,
        resolver: Arc<dyn MxResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            routes,
            resolver,
            transport,
        }
    }

    #[must_use]
    pub const fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Perform one delivery attempt for `message`
    #[tracing::instrument(level = "debug", skip_all, fields(id = %message.id))]
    pub async fn attempt(&self, message: &QueuedMessage) -> Outcome {
        match self.try_attempt(message).await {
            Ok(server) => Outcome::Success { server },
            Err(err) => {
                debug!(error = %err, "Delivery attempt failed");
                Outcome::from_error(&err)
            }
        }
    }

    async fn try_attempt(&self, message: &QueuedMessage) -> Result<String, DeliveryError> {
        let host = domain_of(&message.rcpt_to)
            .ok_or_else(|| PermanentError::InvalidRecipient(message.rcpt_to.clone()))?;

        let route = self.routes.resolve(&host, self.resolver.as_ref()).await?;
        debug!(
            host = %host,
            target = %route.address(),
            local_ip = ?route.local_ip,
            route = ?route.route.map(|r| r.get()),
            "Resolved delivery route"
        );

        let reply = self.transport.send(&route, message).await?;
        reply.classify()?;

        Ok(route.address())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::SystemTime;

    use parking_lot::Mutex;
    use postern_common::Domain;
    use postern_store::{MessageId, MessageStatus};

    use super::*;
    use crate::{
        dns::{DnsError, MailServer},
        policy::RouteSpec,
    };

    #[derive(Debug)]
    struct OneMx;

    #[async_trait]
    impl MxResolver for OneMx {
        async fn resolve_mail_servers(
            &self,
            domain: &Domain,
        ) -> Result<Arc<Vec<MailServer>>, DnsError> {
            match domain.as_str() {
                "y.com" => Ok(Arc::new(vec![MailServer::new("mx.y.com", 10)])),
                "gone.test" => Err(DnsError::DomainNotFound(domain.to_string())),
                _ => Err(DnsError::Timeout(domain.to_string())),
            }
        }
    }

    #[derive(Debug)]
    struct FixedTransport {
        reply: Result<Reply, String>,
        seen: Mutex<Vec<String>>,
    }

    impl FixedTransport {
        fn replying(code: u16) -> Self {
            Self {
                reply: Ok(Reply::new(code, "reply")),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            route: &ResolvedRoute,
            _message: &QueuedMessage,
        ) -> Result<Reply, TransportError> {
            self.seen.lock().push(route.address());
            self.reply.clone().map_err(TransportError::Connect)
        }
    }

    fn message(rcpt: &str) -> QueuedMessage {
        QueuedMessage {
            id: MessageId::new(1),
            mail_from: "a@x.com".to_string(),
            rcpt_to: rcpt.to_string(),
            status: MessageStatus::InProgress,
            added_at: SystemTime::UNIX_EPOCH,
            next_delivery_scheduled_at: SystemTime::UNIX_EPOCH,
            attempts: 0,
            last_error: None,
            data: Arc::from(&b"body"[..]),
        }
    }

    fn executor(transport: Arc<FixedTransport>) -> Executor {
        Executor::new(Arc::new(RouteTable::new()), Arc::new(OneMx), transport)
    }

    #[test]
    fn test_reply_classification() {
        assert!(Reply::new(250, "OK").classify().is_ok());
        assert!(Reply::new(550, "no such user").classify().unwrap_err().is_permanent());
        assert!(Reply::new(451, "try later").classify().unwrap_err().is_temporary());
        assert!(Reply::new(354, "go ahead").classify().unwrap_err().is_temporary());
    }

    #[tokio::test]
    async fn test_success_via_mx() {
        let transport = Arc::new(FixedTransport::replying(250));
        let outcome = executor(Arc::clone(&transport)).attempt(&message("b@y.com")).await;

        assert_eq!(
            outcome,
            Outcome::Success {
                server: "mx.y.com:25".to_string()
            }
        );
        assert_eq!(*transport.seen.lock(), vec!["mx.y.com:25".to_string()]);
    }

    #[tokio::test]
    async fn test_configured_route_wins_over_mx() {
        let transport = Arc::new(FixedTransport::replying(250));
        let executor = executor(Arc::clone(&transport));
        executor
            .routes()
            .add(RouteSpec {
                remote_host: Some("relay.example.net".to_string()),
                remote_port: Some(2525),
                ..RouteSpec::new("y.com")
            })
            .unwrap();

        executor.attempt(&message("b@y.com")).await;
        assert_eq!(*transport.seen.lock(), vec!["relay.example.net:2525".to_string()]);
    }

    #[tokio::test]
    async fn test_reply_codes_map_to_outcomes() {
        let soft = executor(Arc::new(FixedTransport::replying(421)))
            .attempt(&message("b@y.com"))
            .await;
        assert!(matches!(soft, Outcome::SoftFailure(reason) if reason.contains("421")));

        let hard = executor(Arc::new(FixedTransport::replying(550)))
            .attempt(&message("b@y.com"))
            .await;
        assert!(matches!(hard, Outcome::HardFailure(reason) if reason.contains("550")));
    }

    #[tokio::test]
    async fn test_transport_error_is_soft() {
        let transport = Arc::new(FixedTransport {
            reply: Err("connection refused".to_string()),
            seen: Mutex::new(Vec::new()),
        });

        let outcome = executor(transport).attempt(&message("b@y.com")).await;
        assert!(matches!(outcome, Outcome::SoftFailure(reason) if reason.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_dns_failures() {
        let transport = Arc::new(FixedTransport::replying(250));

        let outcome = executor(Arc::clone(&transport)).attempt(&message("b@gone.test")).await;
        assert!(matches!(outcome, Outcome::HardFailure(_)));

        let outcome = executor(Arc::clone(&transport)).attempt(&message("b@slow.test")).await;
        assert!(matches!(outcome, Outcome::SoftFailure(_)));

        assert!(transport.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recipient_without_domain_is_hard_failure() {
        let transport = Arc::new(FixedTransport::replying(250));
        let outcome = executor(transport).attempt(&message("postmaster")).await;

        assert_eq!(
            outcome,
            Outcome::HardFailure("Permanent failure: Invalid recipient: postmaster".to_string())
        );
    }
}
