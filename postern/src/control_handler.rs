//! Control handler implementation for postern
//!
//! This module implements the `CommandHandler` trait, mapping control
//! requests onto the directory, the queue service and the route table.
//! Every failure becomes an error response carrying the error's message.

use std::{
    sync::Arc,
    time::{Instant, SystemTime},
};

use async_trait::async_trait;
use postern_common::{Directory, operator};
use postern_control::{
    ControlError, QueueCommand, QueueMessage, Request, RequestCommand, Response, ResponseData,
    RouteDefinition, RouteInfo, RoutesCommand, SmtpdCommand, SystemCommand, SystemStatus,
    UserInfo, server::CommandHandler,
};
use postern_delivery::{QueueService, Route, RouteId, RouteSpec, RouteTable};
use postern_store::{MessageId, MessageStatus, QueuedMessage};

type Result<T> = postern_control::Result<T>;

fn server_error(err: impl std::fmt::Display) -> ControlError {
    ControlError::ServerError(err.to_string())
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn queue_message(message: &QueuedMessage) -> QueueMessage {
    QueueMessage {
        id: message.id.get(),
        from: message.mail_from.clone(),
        to: message.rcpt_to.clone(),
        status: message.status.to_string(),
        attempts: message.attempts,
        added_at: unix_secs(message.added_at),
        next_attempt: (message.status != MessageStatus::InProgress)
            .then(|| unix_secs(message.next_delivery_scheduled_at)),
        last_error: message.last_error.clone(),
    }
}

fn route_info(route: &Route) -> RouteInfo {
    RouteInfo {
        id: route.id.get(),
        host: route.host.to_string(),
        priority: route.effective_priority(),
        local_ip: route.bind_address(),
        remote_host: route.remote_host.clone(),
        remote_port: route.effective_port(),
    }
}

fn route_spec(definition: RouteDefinition) -> RouteSpec {
    RouteSpec {
        host: definition.host.into(),
        priority: definition.priority,
        local_ip: definition.local_ip,
        remote_host: definition.remote_host,
        remote_port: definition.remote_port,
    }
}

/// Handler for control commands
#[derive(Debug)]
pub struct PosternControlHandler {
    directory: Arc<Directory>,
    queue: Arc<dyn QueueService>,
    routes: Arc<RouteTable>,
    /// Server start time for uptime calculation
    start_time: Instant,
}

impl PosternControlHandler {
    #[must_use]
    pub fn new(
        directory: Arc<Directory>,
        queue: Arc<dyn QueueService>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            directory,
            queue,
            routes,
            start_time: Instant::now(),
        }
    }

    fn handle_smtpd_command(&self, command: SmtpdCommand) -> Result<Response> {
        match command {
            SmtpdCommand::AddUser {
                login,
                password,
                relay_allowed,
            } => {
                let user = self
                    .directory
                    .add_user(&login, &password, relay_allowed)
                    .map_err(server_error)?;
                operator!("Smtpd user {} added (relay allowed: {relay_allowed})", user.login);
                Ok(Response::ok())
            }

            SmtpdCommand::DelUser { login } => {
                self.directory.del_user(&login).map_err(server_error)?;
                operator!("Smtpd user {login} deleted");
                Ok(Response::ok())
            }

            SmtpdCommand::ListUsers => {
                let users = self
                    .directory
                    .list_users()
                    .into_iter()
                    .map(|user| UserInfo {
                        login: user.login,
                        relay_allowed: user.relay_allowed,
                    })
                    .collect();
                Ok(Response::data(ResponseData::Users(users)))
            }

            SmtpdCommand::AddRcptHost { hostname } => {
                let host = self
                    .directory
                    .add_rcpt_host(&hostname)
                    .map_err(server_error)?;
                operator!("Rcpt host {} added", host.hostname);
                Ok(Response::ok())
            }

            SmtpdCommand::DelRcptHost { hostname } => {
                self.directory
                    .del_rcpt_host(&hostname)
                    .map_err(server_error)?;
                operator!("Rcpt host {hostname} deleted");
                Ok(Response::ok())
            }

            SmtpdCommand::ListRcptHosts => {
                let hosts = self
                    .directory
                    .list_rcpt_hosts()
                    .into_iter()
                    .map(|host| host.hostname.to_string())
                    .collect();
                Ok(Response::data(ResponseData::RcptHosts(hosts)))
            }
        }
    }

    async fn handle_queue_command(&self, command: QueueCommand) -> Result<Response> {
        match command {
            QueueCommand::List => {
                let messages = self.queue.list_messages().await.map_err(server_error)?;
                Ok(Response::data(ResponseData::QueueList(
                    messages.iter().map(queue_message).collect(),
                )))
            }

            QueueCommand::Discard { id } => {
                self.queue
                    .discard(MessageId::new(id))
                    .await
                    .map_err(server_error)?;
                operator!("Message {id} discarded");
                Ok(Response::ok())
            }

            QueueCommand::Bounce { id } => {
                self.queue
                    .bounce(MessageId::new(id))
                    .await
                    .map_err(server_error)?;
                operator!("Message {id} will be bounced");
                Ok(Response::ok())
            }

            QueueCommand::ProcessNow => {
                self.queue.process_now();
                Ok(Response::ok())
            }
        }
    }

    fn handle_routes_command(&self, command: RoutesCommand) -> Result<Response> {
        match command {
            RoutesCommand::List => Ok(Response::data(ResponseData::Routes(
                self.routes.list().iter().map(route_info).collect(),
            ))),

            RoutesCommand::Add(definition) => {
                let route = self
                    .routes
                    .add(route_spec(definition))
                    .map_err(server_error)?;
                operator!("Route {} for {} saved", route.id, route.host);
                Ok(Response::data(ResponseData::RouteAdded(route.id.get())))
            }

            RoutesCommand::Del { id } => {
                let route = self.routes.del(RouteId::new(id)).map_err(server_error)?;
                operator!("Route {} for {} deleted", route.id, route.host);
                Ok(Response::ok())
            }
        }
    }

    async fn handle_system_command(&self, command: SystemCommand) -> Result<Response> {
        match command {
            SystemCommand::Ping => Ok(Response::ok()),

            SystemCommand::Status => {
                let queue_size = self
                    .queue
                    .list_messages()
                    .await
                    .map_err(server_error)?
                    .len();

                Ok(Response::data(ResponseData::SystemStatus(SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.start_time.elapsed().as_secs(),
                    queue_size,
                    route_count: self.routes.list().len(),
                    user_count: self.directory.list_users().len(),
                    rcpt_host_count: self.directory.list_rcpt_hosts().len(),
                })))
            }
        }
    }
}

#[async_trait]
impl CommandHandler for PosternControlHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        match request.command {
            RequestCommand::Smtpd(command) => self.handle_smtpd_command(command),
            RequestCommand::Queue(command) => self.handle_queue_command(command).await,
            RequestCommand::Routes(command) => self.handle_routes_command(command),
            RequestCommand::System(command) => self.handle_system_command(command).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use postern_control::ResponsePayload;
    use postern_delivery::{QueueControl, Scheduler, TracingEventSink};
    use postern_store::{MemoryMessageStore, NewMessage};
    use pretty_assertions::assert_eq;

    use super::*;

    fn handler() -> (PosternControlHandler, QueueControl) {
        let scheduler = Scheduler::new(
            Arc::new(MemoryMessageStore::new()),
            Arc::new(TracingEventSink::default()),
        );
        let queue = QueueControl::new(Arc::new(scheduler), Arc::default());
        let handler = PosternControlHandler::new(
            Arc::new(Directory::new()),
            Arc::new(queue.clone()),
            Arc::new(RouteTable::new()),
        );
        (handler, queue)
    }

    async fn send(handler: &PosternControlHandler, command: RequestCommand) -> Result<Response> {
        handler.handle_request(Request::new(command)).await
    }

    async fn data(handler: &PosternControlHandler, command: RequestCommand) -> ResponseData {
        match send(handler, command).await.unwrap().payload {
            ResponsePayload::Data(data) => *data,
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_smtpd_users() {
        let (handler, _) = handler();

        for (login, relay_allowed) in [("bob", false), ("alice", true)] {
            send(
                &handler,
                RequestCommand::Smtpd(SmtpdCommand::AddUser {
                    login: login.to_string(),
                    password: "secret".to_string(),
                    relay_allowed,
                }),
            )
            .await
            .unwrap();
        }

        assert_eq!(
            data(&handler, RequestCommand::Smtpd(SmtpdCommand::ListUsers)).await,
            ResponseData::Users(vec![
                UserInfo {
                    login: "alice".to_string(),
                    relay_allowed: true,
                },
                UserInfo {
                    login: "bob".to_string(),
                    relay_allowed: false,
                },
            ])
        );

        send(
            &handler,
            RequestCommand::Smtpd(SmtpdCommand::DelUser {
                login: "bob".to_string(),
            }),
        )
        .await
        .unwrap();

        let err = send(
            &handler,
            RequestCommand::Smtpd(SmtpdCommand::DelUser {
                login: "bob".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Server error: User not found: bob");
    }

    #[tokio::test]
    async fn test_empty_password_is_a_config_error() {
        let (handler, _) = handler();

        let err = send(
            &handler,
            RequestCommand::Smtpd(SmtpdCommand::AddUser {
                login: "alice".to_string(),
                password: String::new(),
                relay_allowed: false,
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Configuration error"), "{err}");
    }

    #[tokio::test]
    async fn test_rcpt_hosts() {
        let (handler, _) = handler();

        for hostname in ["Example.ORG", "example.com"] {
            send(
                &handler,
                RequestCommand::Smtpd(SmtpdCommand::AddRcptHost {
                    hostname: hostname.to_string(),
                }),
            )
            .await
            .unwrap();
        }

        assert_eq!(
            data(&handler, RequestCommand::Smtpd(SmtpdCommand::ListRcptHosts)).await,
            ResponseData::RcptHosts(vec!["example.com".to_string(), "example.org".to_string()])
        );

        send(
            &handler,
            RequestCommand::Smtpd(SmtpdCommand::DelRcptHost {
                hostname: "example.org".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            data(&handler, RequestCommand::Smtpd(SmtpdCommand::ListRcptHosts)).await,
            ResponseData::RcptHosts(vec!["example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn test_queue_list_and_discard() {
        let (handler, queue) = handler();
        let queued = queue
            .enqueue(NewMessage::new("a@x.com", "b@y.com", b"hi".to_vec()))
            .await
            .unwrap();

        let ResponseData::QueueList(messages) =
            data(&handler, RequestCommand::Queue(QueueCommand::List)).await
        else {
            panic!("expected a queue list");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, queued.id.get());
        assert_eq!(messages[0].status, "Scheduled");
        assert!(messages[0].next_attempt.is_some());

        send(
            &handler,
            RequestCommand::Queue(QueueCommand::Discard {
                id: queued.id.get(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            data(&handler, RequestCommand::Queue(QueueCommand::List)).await,
            ResponseData::QueueList(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_queue_unknown_id() {
        let (handler, _) = handler();

        let err = send(&handler, RequestCommand::Queue(QueueCommand::Bounce { id: 77 }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Server error: Message not found: 77");
    }

    #[tokio::test]
    async fn test_queue_bounce() {
        let (handler, queue) = handler();
        let queued = queue
            .enqueue(NewMessage::new("a@x.com", "b@y.com", b"hi".to_vec()))
            .await
            .unwrap();

        send(
            &handler,
            RequestCommand::Queue(QueueCommand::Bounce {
                id: queued.id.get(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(
            queue.get(queued.id).await.unwrap().status,
            MessageStatus::WillBeBounced
        );
    }

    #[tokio::test]
    async fn test_routes() {
        let (handler, _) = handler();

        let ResponseData::RouteAdded(id) = data(
            &handler,
            RequestCommand::Routes(RoutesCommand::Add(RouteDefinition {
                host: "Example.com".to_string(),
                remote_host: Some("relay.example.net".to_string()),
                ..RouteDefinition::default()
            })),
        )
        .await
        else {
            panic!("expected a route id");
        };

        assert_eq!(
            data(&handler, RequestCommand::Routes(RoutesCommand::List)).await,
            ResponseData::Routes(vec![RouteInfo {
                id,
                host: "example.com".to_string(),
                priority: 1,
                local_ip: None,
                remote_host: Some("relay.example.net".to_string()),
                remote_port: 25,
            }])
        );

        send(&handler, RequestCommand::Routes(RoutesCommand::Del { id }))
            .await
            .unwrap();
        let err = send(&handler, RequestCommand::Routes(RoutesCommand::Del { id }))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Server error: Route not found: {id}"));
    }

    #[tokio::test]
    async fn test_invalid_route() {
        let (handler, _) = handler();

        let err = send(
            &handler,
            RequestCommand::Routes(RoutesCommand::Add(RouteDefinition::default())),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Invalid route"), "{err}");
    }

    #[tokio::test]
    async fn test_system_status() {
        let (handler, queue) = handler();
        queue
            .enqueue(NewMessage::new("a@x.com", "b@y.com", b"hi".to_vec()))
            .await
            .unwrap();

        assert_eq!(
            send(&handler, RequestCommand::System(SystemCommand::Ping))
                .await
                .unwrap()
                .payload,
            ResponsePayload::Ok
        );

        let ResponseData::SystemStatus(status) =
            data(&handler, RequestCommand::System(SystemCommand::Status)).await
        else {
            panic!("expected a status");
        };
        assert_eq!(status.queue_size, 1);
        assert_eq!(status.route_count, 0);
    }
}
