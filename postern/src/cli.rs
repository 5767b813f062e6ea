//! Operator command line
//!
//! Subcommands mirror the control protocol one to one. Everything is written
//! to the caller's writer so the output can be checked without a terminal.

use std::{io::Write, net::IpAddr, time::Duration};

use clap::{Args, Parser, Subcommand};
use postern_control::{
    ControlClient, ControlError, DEFAULT_CONTROL_SOCKET, QueueCommand, RequestCommand,
    ResponseData, ResponsePayload, RouteDefinition, RoutesCommand, SmtpdCommand, SystemCommand,
};

/// Command-line utility for managing a running postern instance
#[derive(Parser, Debug)]
#[command(name = "posternctl")]
#[command(about = "Manage the postern delivery queue, routes and smtpd users", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    pub control_socket: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Commands to interact with smtpd users and recipient hosts
    Smtpd {
        #[command(subcommand)]
        action: SmtpdAction,
    },
    /// Commands to interact with the delivery queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Commands to manage outgoing routes
    Routes {
        #[command(subcommand)]
        action: RoutesAction,
    },
    /// System status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SmtpdAction {
    /// Add a smtpd user
    #[command(alias = "addUser")]
    AddUser {
        login: String,
        /// Clear password; only its digest is kept
        password: String,
        /// true/false, 1/0, t/f
        #[arg(action = clap::ArgAction::Set, value_parser = parse_bool, default_value = "false")]
        relay_allowed: bool,
    },
    /// Delete a smtpd user
    #[command(alias = "delUser")]
    DelUser { login: String },
    /// List users who can send mail after authentication
    #[command(alias = "listAutorizedUsers")]
    ListUsers,
    /// Add a hostname postern has to handle mail for
    #[command(alias = "addRcpthost")]
    AddRcptHost { hostname: String },
    /// Delete a rcpthost
    #[command(alias = "delRcpthost")]
    DelRcptHost { hostname: String },
    /// List all rcpthosts
    #[command(alias = "getRcpthosts")]
    ListRcptHosts,
}

#[derive(Subcommand, Debug)]
pub enum QueueAction {
    /// List messages in queue
    List,
    /// Discard (delete without bouncing) a message in queue
    Discard { id: u64 },
    /// Bounce a message in queue
    Bounce { id: u64 },
    /// Process the queue now instead of waiting for the next interval
    ProcessNow,
}

#[derive(Subcommand, Debug)]
pub enum RoutesAction {
    /// List routes
    List,
    /// Add a route, or update the one with the same host and target
    Add(RouteArgs),
    /// Delete a route by id
    Del { id: u64 },
}

#[derive(Args, Debug)]
pub struct RouteArgs {
    /// Destination host the route applies to
    #[arg(long)]
    pub host: String,
    /// Lower is preferred
    #[arg(long)]
    pub priority: Option<u32>,
    /// Local address to send from
    #[arg(long)]
    pub local_ip: Option<IpAddr>,
    /// Relay to send through. Without one, the host's MX records are used
    #[arg(long)]
    pub remote_host: Option<String>,
    #[arg(long)]
    pub remote_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum SystemAction {
    /// Check if postern is responding
    Ping,
    /// Get system status and statistics
    Status,
}

/// Accepts the same spellings as the original operator tool
fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(format!("invalid boolean: {other}")),
    }
}

impl Cli {
    fn request(self) -> RequestCommand {
        match self.command {
            Commands::Smtpd { action } => RequestCommand::Smtpd(match action {
                SmtpdAction::AddUser {
                    login,
                    password,
                    relay_allowed,
                } => SmtpdCommand::AddUser {
                    login,
                    password,
                    relay_allowed,
                },
                SmtpdAction::DelUser { login } => SmtpdCommand::DelUser { login },
                SmtpdAction::ListUsers => SmtpdCommand::ListUsers,
                SmtpdAction::AddRcptHost { hostname } => SmtpdCommand::AddRcptHost { hostname },
                SmtpdAction::DelRcptHost { hostname } => SmtpdCommand::DelRcptHost { hostname },
                SmtpdAction::ListRcptHosts => SmtpdCommand::ListRcptHosts,
            }),
            Commands::Queue { action } => RequestCommand::Queue(match action {
                QueueAction::List => QueueCommand::List,
                QueueAction::Discard { id } => QueueCommand::Discard { id },
                QueueAction::Bounce { id } => QueueCommand::Bounce { id },
                QueueAction::ProcessNow => QueueCommand::ProcessNow,
            }),
            Commands::Routes { action } => RequestCommand::Routes(match action {
                RoutesAction::List => RoutesCommand::List,
                RoutesAction::Add(route) => RoutesCommand::Add(RouteDefinition {
                    host: route.host,
                    priority: route.priority,
                    local_ip: route.local_ip,
                    remote_host: route.remote_host,
                    remote_port: route.remote_port,
                }),
                RoutesAction::Del { id } => RoutesCommand::Del { id },
            }),
            Commands::System { action } => RequestCommand::System(match action {
                SystemAction::Ping => SystemCommand::Ping,
                SystemAction::Status => SystemCommand::Status,
            }),
        }
    }
}

/// Send the parsed command to the control socket and print the result
///
/// # Errors
///
/// Returns the server's error message as-is, or a connection error naming
/// the socket
pub async fn execute(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let client =
        ControlClient::new(&cli.control_socket).with_timeout(Duration::from_secs(cli.timeout));

    if let Err(e) = client.check_socket_exists() {
        anyhow::bail!(
            "Cannot connect to postern control socket at {}: {e}. Is postern running?",
            cli.control_socket
        );
    }

    let ping = matches!(
        cli.command,
        Commands::System {
            action: SystemAction::Ping
        }
    );

    let response = match client.send(cli.request()).await {
        Ok(response) => response,
        Err(ControlError::ServerError(message)) => anyhow::bail!(message),
        Err(e) => return Err(e.into()),
    };

    match response.payload {
        ResponsePayload::Ok if ping => writeln!(out, "Pong! postern is responding")?,
        ResponsePayload::Ok => {}
        ResponsePayload::Data(data) => render(*data, out)?,
        ResponsePayload::Error(message) => anyhow::bail!(message),
    }

    Ok(())
}

/// Print a response the way the operator tool always has
///
/// # Errors
///
/// Returns an error if `out` cannot be written
pub fn render(data: ResponseData, out: &mut impl Write) -> std::io::Result<()> {
    match data {
        ResponseData::QueueList(messages) => {
            if messages.is_empty() {
                writeln!(out, "There is no message in queue.")?;
            } else {
                writeln!(out, "{} messages in queue.", messages.len())?;
                for message in messages {
                    writeln!(out, "{message}")?;
                }
            }
        }
        ResponseData::Users(users) => {
            if users.is_empty() {
                writeln!(out, "There is no smtpd users yet.")?;
            } else {
                writeln!(out, "Smtpd users:")?;
                for user in users {
                    let relay = if user.relay_allowed { "yes" } else { "no" };
                    writeln!(out, "{} - Relay allowed: {relay}", user.login)?;
                }
            }
        }
        ResponseData::RcptHosts(hosts) => {
            for host in hosts {
                writeln!(out, "{host}")?;
            }
        }
        ResponseData::Routes(routes) => {
            if routes.is_empty() {
                writeln!(
                    out,
                    "There is no routes configured, all mails are routed following MX records"
                )?;
            } else {
                for route in routes {
                    writeln!(out, "{}: {route}", route.id)?;
                }
            }
        }
        ResponseData::RouteAdded(id) => writeln!(out, "Route {id} saved")?,
        ResponseData::SystemStatus(status) => {
            writeln!(out, "Version:      {}", status.version)?;
            writeln!(out, "Uptime:       {}", format_duration(status.uptime_secs))?;
            writeln!(out, "Queue size:   {} message(s)", status.queue_size)?;
            writeln!(out, "Routes:       {}", status.route_count)?;
            writeln!(out, "Smtpd users:  {}", status.user_count)?;
            writeln!(out, "Rcpt hosts:   {}", status.rcpt_host_count)?;
        }
        ResponseData::Message(message) => writeln!(out, "{message}")?,
    }

    Ok(())
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
