//! Control server implementation

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use postern_common::Signal;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, Result,
    frame::{MAX_REQUEST_SIZE, read_frame, write_frame},
};

/// Handler trait for processing control requests
///
/// The server checks framing and protocol version; the handler only ever
/// sees well-formed requests.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a request and return a response
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be processed. The server turns
    /// it into an error response.
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

/// Control server for managing postern via Unix domain socket
pub struct ControlServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
    timeout: Duration,
}

impl ControlServer {
    /// Create a new control server
    ///
    /// # Errors
    ///
    /// Returns an error if the socket path is empty
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.trim().is_empty() {
            return Err(ControlError::InvalidSocketPath(
                "socket path is empty".to_string(),
            ));
        }

        Ok(Self {
            socket_path,
            handler,
            timeout: Duration::from_secs(30),
        })
    }

    /// Per-connection read and write timeout. Default: 30 seconds
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start the control server
    ///
    /// This function runs until a shutdown signal is received.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another running instance owns the socket
    /// - The socket cannot be bound
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let socket_path = Path::new(&self.socket_path);
        if socket_path.exists() {
            if UnixStream::connect(socket_path).await.is_ok() {
                return Err(ControlError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Socket already in use by running instance: {}",
                        self.socket_path
                    ),
                )));
            }
            info!("Removing stale socket file: {}", self.socket_path);
            tokio::fs::remove_file(socket_path).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            let metadata = tokio::fs::metadata(&self.socket_path).await?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms).await?;
        }
        info!("Control server listening on: {}", self.socket_path);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let timeout = self.timeout;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, timeout).await {
                                    error!("Error handling control connection: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting control connection: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("Control server shutting down");
                            break;
                        }
                        Err(e) => {
                            error!("Control server shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if socket_path.exists() {
            debug!("Removing socket file: {}", self.socket_path);
            let _ = tokio::fs::remove_file(socket_path).await;
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        mut stream: UnixStream,
        handler: Arc<dyn CommandHandler>,
        timeout: Duration,
    ) -> Result<()> {
        let request = tokio::time::timeout(
            timeout,
            read_frame::<Request, _>(&mut stream, MAX_REQUEST_SIZE),
        )
        .await
        .map_err(|_| ControlError::Timeout)?;

        let response = match request {
            Ok(request) if !request.is_version_compatible() => {
                warn!(
                    client = request.version,
                    server = PROTOCOL_VERSION,
                    "Rejecting request with incompatible protocol version"
                );
                Response::error(
                    ControlError::VersionMismatch {
                        peer: request.version,
                        local: PROTOCOL_VERSION,
                    }
                    .to_string(),
                )
            }
            Ok(request) => {
                trace!("Received request: {request:?}");
                match handler.handle_request(request).await {
                    Ok(response) => response,
                    Err(ControlError::ServerError(message)) => {
                        debug!("Request refused: {message}");
                        Response::error(message)
                    }
                    Err(e) => {
                        warn!("Error handling request: {e}");
                        Response::error(e.to_string())
                    }
                }
            }
            Err(ControlError::ConnectionClosed) => return Ok(()),
            Err(e @ (ControlError::FrameTooLarge { .. } | ControlError::ProtocolDeserialization(_))) => {
                warn!("Rejecting malformed control request: {e}");
                Response::error(e.to_string())
            }
            Err(e) => return Err(e),
        };

        trace!("Sending response: {response:?}");

        tokio::time::timeout(timeout, write_frame(&mut stream, &response))
            .await
            .map_err(|_| ControlError::Timeout)??;

        Ok(())
    }
}
