//! Control protocol types

use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
};

use chrono::{TimeZone, Utc, offset::LocalResult};
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Format a timestamp (seconds since epoch) as human-readable
fn format_timestamp(timestamp_secs: u64) -> String {
    let datetime = Utc.timestamp_opt(i64::try_from(timestamp_secs).unwrap_or(0), 0);
    if let LocalResult::Single(dt) = datetime {
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    } else {
        "unknown".to_string()
    }
}

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// The actual command to execute
    pub command: RequestCommand,
}

/// Request command types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    /// Smtpd users and recipient hosts
    Smtpd(SmtpdCommand),
    /// Queue management commands
    Queue(QueueCommand),
    /// Outgoing route management
    Routes(RoutesCommand),
    /// System management commands
    System(SystemCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmtpdCommand {
    AddUser {
        login: String,
        /// Clear password; only its digest is stored
        password: String,
        relay_allowed: bool,
    },
    DelUser {
        login: String,
    },
    /// Users allowed to relay after authentication
    ListUsers,
    AddRcptHost {
        hostname: String,
    },
    DelRcptHost {
        hostname: String,
    },
    ListRcptHosts,
}

/// Queue management commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueCommand {
    /// List every message in the queue
    List,
    /// Delete a message without bouncing it
    Discard { id: u64 },
    /// Return a message to its sender
    Bounce { id: u64 },
    /// Trigger an immediate processing pass
    ProcessNow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutesCommand {
    List,
    Add(RouteDefinition),
    Del { id: u64 },
}

/// A route as submitted by the operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub host: String,
    pub priority: Option<u32>,
    pub local_ip: Option<IpAddr>,
    /// `None` routes through the host's MX records
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
}

/// System management commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
    /// Get system status and statistics
    Status,
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version
    pub version: u32,
    /// The actual response payload
    pub payload: ResponsePayload,
}

/// Response payload types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed with error message
    Error(String),
}

/// Response data types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Queue message list, oldest first
    QueueList(Vec<QueueMessage>),
    /// Smtpd users, sorted by login
    Users(Vec<UserInfo>),
    /// Recipient hostnames, sorted
    RcptHosts(Vec<String>),
    /// Configured routes in resolution order
    Routes(Vec<RouteInfo>),
    /// Id assigned to a newly added (or updated) route
    RouteAdded(u64),
    /// System status information
    SystemStatus(SystemStatus),
    /// Simple string message
    Message(String),
}

/// Queue message summary (for list command)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: u64,
    pub from: String,
    pub to: String,
    /// Operator-facing status text
    pub status: String,
    pub attempts: u32,
    /// Time the message was queued (Unix timestamp in seconds)
    pub added_at: u64,
    /// Next processing time, absent while a delivery attempt is running
    pub next_attempt: Option<u64>,
    pub last_error: Option<String>,
}

impl Display for QueueMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - From: {} - To: {} - Status: {} - Added: {} ",
            self.id,
            self.from,
            self.to,
            self.status,
            format_timestamp(self.added_at)
        )?;
        if let Some(next) = self.next_attempt {
            write!(
                f,
                "- Next delivery process scheduled at: {}",
                format_timestamp(next)
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub login: String,
    pub relay_allowed: bool,
}

/// A configured route, with defaults already applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub id: u64,
    pub host: String,
    pub priority: u32,
    pub local_ip: Option<IpAddr>,
    pub remote_host: Option<String>,
    pub remote_port: u16,
}

impl Display for RouteInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Destination host: {} - Priority: {} - Local IPs: ",
            self.host, self.priority
        )?;
        match self.local_ip {
            Some(ip) => write!(f, "{ip}")?,
            None => f.write_str("default")?,
        }
        write!(
            f,
            " - Remote host: {}:{}",
            self.remote_host.as_deref().unwrap_or("MX"),
            self.remote_port
        )
    }
}

/// System status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Server version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Number of messages in queue
    pub queue_size: usize,
    pub route_count: usize,
    pub user_count: usize,
    pub rcpt_host_count: usize,
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: RequestCommand) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    /// Check if the request version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    /// Create an error response
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(message.into()),
        }
    }

    /// Create a success response with no data
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    /// Create a response with data
    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    /// Check if the response indicates success (not an error)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}
