use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use postern_common::{Directory, Signal, UserSeed, internal, logging};
use postern_control::{ControlServer, DEFAULT_CONTROL_SOCKET};
use postern_delivery::{
    DeliveryProcessor, EventSink, MxResolver, QueueControl, RouteSpec, RouteTable, Transport,
};
use postern_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::control_handler::PosternControlHandler;

fn default_socket() -> String {
    DEFAULT_CONTROL_SOCKET.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket")]
    pub socket: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
        }
    }
}

/// Top-level configuration, as read from `postern.config.ron`
///
/// ```ron
/// Postern (
///     store: File(path: "/var/spool/postern"),
///     delivery: (process_interval_secs: 10),
///     control: (socket: "/run/postern.sock"),
///     routes: [(host: "example.com", remote_host: Some("relay.example.net"))],
///     users: [(login: "alice", password: "secret", relay_allowed: true)],
///     rcpt_hosts: ["example.org"],
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Postern {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    delivery: DeliveryProcessor,
    #[serde(default)]
    control: ControlConfig,
    #[serde(default, alias = "route")]
    routes: Vec<RouteSpec>,
    #[serde(default, alias = "user")]
    users: Vec<UserSeed>,
    #[serde(default)]
    rcpt_hosts: Vec<String>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `POSTERN_CONFIG` environment variable
/// 2. ./postern.config.ron (current working directory)
/// 3. /etc/postern/postern.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if `POSTERN_CONFIG` names a missing file, or no default
/// location holds one
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    find_config_file_from(std::env::var("POSTERN_CONFIG").ok())
}

fn find_config_file_from(env_path: Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(env_path) = env_path {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "POSTERN_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./postern.config.ron"),
        PathBuf::from("/etc/postern/postern.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - POSTERN_CONFIG environment variable\n{paths_tried}"
    )
}

impl Postern {
    /// Load the configuration found by [`find_config_file`]
    ///
    /// # Errors
    ///
    /// Returns an error if no file is found or it fails to parse
    pub fn load() -> anyhow::Result<Self> {
        Self::from_file(&find_config_file()?)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// # Errors
    ///
    /// Returns an error if `content` is not a valid configuration
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    /// Use `resolver` for MX fallback instead of the system DNS resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn MxResolver>) -> Self {
        self.delivery = self.delivery.with_resolver(resolver);
        self
    }

    /// Report delivery lifecycle events to `sink`
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.delivery = self.delivery.with_event_sink(sink);
        self
    }

    #[must_use]
    pub fn control_socket(&self) -> &str {
        &self.control.socket
    }

    /// Open the store, seed routes and the directory, and prepare the
    /// delivery processor and control server
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened, a seed entry is
    /// invalid, or the delivery or control configuration is rejected
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn init(self, transport: Arc<dyn Transport>) -> anyhow::Result<Instance> {
        let store = self
            .store
            .open()
            .await
            .context("Failed to open message store")?;

        let routes = Arc::new(RouteTable::from_specs(self.routes).context("Invalid route")?);
        let directory = Arc::new(
            Directory::seeded(&self.users, &self.rcpt_hosts).context("Invalid directory seed")?,
        );

        let mut delivery = self.delivery;
        delivery.init(store, Arc::clone(&routes), transport)?;
        let queue = delivery.queue_control()?;

        let handler = PosternControlHandler::new(
            Arc::clone(&directory),
            Arc::new(queue.clone()),
            Arc::clone(&routes),
        );
        let control = ControlServer::new(self.control.socket, Arc::new(handler))?;

        internal!(
            level = INFO,
            "Loaded {} route(s), {} smtpd user(s), {} rcpt host(s)",
            routes.list().len(),
            directory.list_users().len(),
            directory.list_rcpt_hosts().len()
        );

        Ok(Instance {
            delivery,
            control,
            queue,
            routes,
            directory,
        })
    }

    /// Run this controller, and everything it controls, until a termination
    /// signal arrives
    ///
    /// # Errors
    ///
    /// This function will return an error if anything fails to initialise,
    /// or a service stops with an error.
    pub async fn run(self, transport: Arc<dyn Transport>) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let instance = self.init(transport).await?;

        let ret = tokio::select! {
            r = instance.serve(&SHUTDOWN_BROADCAST) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}

/// An initialised controller, ready to serve
pub struct Instance {
    delivery: DeliveryProcessor,
    control: ControlServer,
    queue: QueueControl,
    routes: Arc<RouteTable>,
    directory: Arc<Directory>,
}

impl Instance {
    /// Inbound hand-off and operator queue operations
    pub const fn queue(&self) -> &QueueControl {
        &self.queue
    }

    pub const fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub const fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Serve deliveries and the control socket until `shutdown` broadcasts
    ///
    /// Both services subscribe before this returns, so a signal sent any time
    /// after the call is seen.
    ///
    /// # Errors
    ///
    /// Returns the first error either service stops with
    pub fn serve(
        self,
        shutdown: &broadcast::Sender<Signal>,
    ) -> impl Future<Output = anyhow::Result<()>> + use<> {
        let delivery_shutdown = shutdown.subscribe();
        let control_shutdown = shutdown.subscribe();

        async move {
            let Self {
                delivery, control, ..
            } = self;

            let deliveries = async {
                delivery
                    .serve(delivery_shutdown)
                    .await
                    .map_err(anyhow::Error::from)
            };
            let control_socket = async {
                control
                    .serve(control_shutdown)
                    .await
                    .map_err(anyhow::Error::from)
            };

            tokio::try_join!(deliveries, control_socket)?;
            Ok(())
        }
    }
}
