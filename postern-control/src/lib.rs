//! Control socket for a running postern instance
//!
//! Operators manage smtpd users, recipient hosts, routes and the delivery
//! queue through length-prefixed bincode requests on a Unix domain socket.

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use frame::{MAX_REQUEST_SIZE, MAX_RESPONSE_SIZE};
pub use protocol::{
    PROTOCOL_VERSION, QueueCommand, QueueMessage, Request, RequestCommand, Response, ResponseData,
    ResponsePayload, RouteDefinition, RouteInfo, RoutesCommand, SmtpdCommand, SystemCommand,
    SystemStatus, UserInfo,
};
pub use server::{CommandHandler, ControlServer};

/// Default control socket path
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/postern.sock";
