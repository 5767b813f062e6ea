//! Operator commands against a running controller
//!
//! The controller runs with an in-memory store, a fixed MX answer and a
//! transport that always answers 451, so queued messages stay put after their
//! first attempt.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use postern::{
    Postern,
    cli::{self, Cli},
};
use postern_common::{Domain, Signal};
use postern_delivery::{
    DnsError, MailServer, MxResolver, QueueControl, QueueService, Reply, ResolvedRoute, Transport,
    TransportError,
};
use postern_store::{MessageId, NewMessage, QueuedMessage};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::{net::UnixStream, sync::broadcast};

#[derive(Debug)]
struct Busy;

#[async_trait]
impl Transport for Busy {
    async fn send(&self, _route: &ResolvedRoute, _message: &QueuedMessage) -> Result<Reply, TransportError> {
        Ok(Reply::new(451, "try again later"))
    }
}

#[derive(Debug)]
struct OneMx;

#[async_trait]
impl MxResolver for OneMx {
    async fn resolve_mail_servers(&self, domain: &Domain) -> Result<Arc<Vec<MailServer>>, DnsError> {
        Ok(Arc::new(vec![MailServer::new(format!("mx.{domain}"), 10)]))
    }
}

fn config(socket: &str) -> String {
    format!(
        r#"Postern (
            store: Memory(capacity: None),
            control: (socket: "{socket}"),
            delivery: (process_interval_secs: 3600, max_concurrent_deliveries: 2),
            routes: [(host: "example.net", remote_host: Some("relay.example.net"))],
            users: [(login: "alice", password: "secret", relay_allowed: true)],
            rcpt_hosts: ["example.org"],
        )"#
    )
}

async fn ctl(socket: &str, args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(
        ["posternctl", "-c", socket]
            .into_iter()
            .chain(args.iter().copied()),
    )?;
    let mut out = Vec::new();
    cli::execute(cli, &mut out).await?;
    Ok(String::from_utf8(out)?)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn listening(socket: &str) {
    eventually("control socket", || async move {
        UnixStream::connect(socket).await.is_ok()
    })
    .await;
}

async fn attempted(queue: &QueueControl, id: MessageId) {
    eventually("first delivery attempt", || async move {
        queue.get(id).await.is_ok_and(|m| m.attempts == 1)
    })
    .await;
}

/// Runs `scenario` against a live controller, then shuts it down
async fn with_controller<F, Fut>(scenario: F)
where
    F: FnOnce(String, QueueControl) -> Fut,
    Fut: Future<Output = ()>,
{
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("postern.sock").to_string_lossy().to_string();

    let instance = Postern::from_ron(&config(&socket))
        .unwrap()
        .with_resolver(Arc::new(OneMx))
        .init(Arc::new(Busy))
        .await
        .unwrap();
    let queue = instance.queue().clone();

    let (shutdown, _) = broadcast::channel(8);
    let serve = instance.serve(&shutdown);

    let driver = async {
        listening(&socket).await;
        scenario(socket.clone(), queue).await;
        shutdown.send(Signal::Shutdown).unwrap();
    };

    let (served, ()) = tokio::join!(serve, driver);
    served.unwrap();
    assert!(!std::path::Path::new(&socket).exists());
}

#[tokio::test]
async fn test_seeded_directory_and_routes() {
    with_controller(|socket, _| async move {
        assert_eq!(
            ctl(&socket, &["smtpd", "list-users"]).await.unwrap(),
            "Smtpd users:\nalice - Relay allowed: yes\n"
        );
        assert_eq!(
            ctl(&socket, &["smtpd", "getRcpthosts"]).await.unwrap(),
            "example.org\n"
        );

        let routes = ctl(&socket, &["routes", "list"]).await.unwrap();
        assert!(
            routes.contains(
                "Destination host: example.net - Priority: 1 - Local IPs: default - Remote host: relay.example.net:25"
            ),
            "{routes}"
        );
    })
    .await;
}

#[tokio::test]
async fn test_manage_users_and_hosts() {
    with_controller(|socket, _| async move {
        assert_eq!(ctl(&socket, &["smtpd", "add-user", "bob", "pw", "1"]).await.unwrap(), "");
        assert_eq!(ctl(&socket, &["smtpd", "del-user", "alice"]).await.unwrap(), "");
        assert_eq!(
            ctl(&socket, &["smtpd", "list-users"]).await.unwrap(),
            "Smtpd users:\nbob - Relay allowed: yes\n"
        );

        ctl(&socket, &["smtpd", "del-user", "bob"]).await.unwrap();
        assert_eq!(
            ctl(&socket, &["smtpd", "list-users"]).await.unwrap(),
            "There is no smtpd users yet.\n"
        );

        let err = ctl(&socket, &["smtpd", "del-user", "bob"]).await.unwrap_err();
        assert_eq!(err.to_string(), "User not found: bob");

        ctl(&socket, &["smtpd", "add-rcpt-host", "Example.COM"]).await.unwrap();
        assert_eq!(
            ctl(&socket, &["smtpd", "list-rcpt-hosts"]).await.unwrap(),
            "example.com\nexample.org\n"
        );
    })
    .await;
}

#[tokio::test]
async fn test_manage_routes() {
    with_controller(|socket, _| async move {
        let added = ctl(
            &socket,
            &["routes", "add", "--host", "example.com", "--priority", "5", "--local-ip", "127.0.0.1"],
        )
        .await
        .unwrap();
        assert_eq!(added, "Route 2 saved\n");

        let routes = ctl(&socket, &["routes", "list"]).await.unwrap();
        assert!(
            routes.contains(
                "2: Destination host: example.com - Priority: 5 - Local IPs: 127.0.0.1 - Remote host: MX:25"
            ),
            "{routes}"
        );

        ctl(&socket, &["routes", "del", "2"]).await.unwrap();
        ctl(&socket, &["routes", "del", "1"]).await.unwrap();
        assert_eq!(
            ctl(&socket, &["routes", "list"]).await.unwrap(),
            "There is no routes configured, all mails are routed following MX records\n"
        );

        let err = ctl(&socket, &["routes", "del", "1"]).await.unwrap_err();
        assert_eq!(err.to_string(), "Route not found: 1");
    })
    .await;
}

#[tokio::test]
async fn test_list_and_discard() {
    with_controller(|socket, queue| async move {
        assert_eq!(
            ctl(&socket, &["queue", "list"]).await.unwrap(),
            "There is no message in queue.\n"
        );

        let queued = queue
            .enqueue(NewMessage::new("a@example.org", "b@example.com", b"hi".to_vec()))
            .await
            .unwrap();
        attempted(&queue, queued.id).await;

        let listing = ctl(&socket, &["queue", "list"]).await.unwrap();
        assert!(listing.starts_with("1 messages in queue.\n"), "{listing}");
        assert!(
            listing.contains(&format!(
                "{} - From: a@example.org - To: b@example.com - Status: Scheduled - Added: ",
                queued.id
            )),
            "{listing}"
        );
        assert!(listing.contains("- Next delivery process scheduled at: "), "{listing}");

        ctl(&socket, &["queue", "discard", &queued.id.to_string()])
            .await
            .unwrap();
        assert_eq!(
            ctl(&socket, &["queue", "list"]).await.unwrap(),
            "There is no message in queue.\n"
        );

        let err = ctl(&socket, &["queue", "discard", "999"]).await.unwrap_err();
        assert_eq!(err.to_string(), "Message not found: 999");
    })
    .await;
}

#[tokio::test]
async fn test_bounce_returns_message_to_sender() {
    with_controller(|socket, queue| async move {
        let queued = queue
            .enqueue(NewMessage::new("a@example.org", "b@example.com", b"hi".to_vec()))
            .await
            .unwrap();
        attempted(&queue, queued.id).await;

        ctl(&socket, &["queue", "bounce", &queued.id.to_string()])
            .await
            .unwrap();

        let queue = &queue;
        eventually("bounce generation", || async move {
            let messages = queue.list_messages().await.unwrap();
            messages.len() == 1 && messages[0].mail_from == "<>"
        })
        .await;

        let listing = ctl(&socket, &["queue", "list"]).await.unwrap();
        assert!(listing.contains("From: <> - To: a@example.org"), "{listing}");
    })
    .await;
}

#[tokio::test]
async fn test_ping_and_status() {
    with_controller(|socket, _| async move {
        assert_eq!(
            ctl(&socket, &["system", "ping"]).await.unwrap(),
            "Pong! postern is responding\n"
        );

        let status = ctl(&socket, &["system", "status"]).await.unwrap();
        assert!(status.contains("Queue size:   0 message(s)"), "{status}");
        assert!(status.contains("Routes:       1"), "{status}");
        assert!(status.contains("Smtpd users:  1"), "{status}");
    })
    .await;
}

#[tokio::test]
async fn test_missing_socket() {
    let err = ctl("/nonexistent/postern.sock", &["queue", "list"])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Is postern running?"), "{err}");
}
