//! Unix socket listener for operator commands
//!
//! One request and one response per connection. The socket is owner-only
//! (`0600`) and is removed again when the server stops.

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{io, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::Signal;
use tokio::{
    net::{UnixListener, UnixStream},
    sync::broadcast,
};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, Result,
    codec::{MAX_REQUEST_SIZE, read_frame, write_frame},
};

/// Time a client has to send its request, and to read the response
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns a decoded request into a response
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error is sent back to the client as an error response.
    async fn handle_request(&self, request: Request) -> Result<Response>;
}

pub struct ControlServer {
    socket_path: String,
    handler: Arc<dyn CommandHandler>,
}

impl ControlServer {
    /// # Errors
    ///
    /// If `socket_path` is empty.
    pub fn new(socket_path: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let socket_path = socket_path.into();
        if socket_path.is_empty() {
            return Err(ControlError::InvalidSocketPath(
                "socket path is empty".to_string(),
            ));
        }

        Ok(Self {
            socket_path,
            handler,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Accept connections until a [`Signal`] arrives
    ///
    /// Each connection is served on its own task, so a slow client never
    /// holds up another.
    ///
    /// # Errors
    ///
    /// If another live process is already listening on the socket, or the
    /// socket cannot be bound.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        let listener = self.bind().await?;
        tracing::info!(socket = %self.socket_path, "Control socket listening");

        loop {
            tokio::select! {
                biased;

                signal = shutdown.recv() => {
                    if let Err(e) = signal {
                        tracing::warn!(error = %e, "Shutdown channel failed, stopping control socket");
                    }
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&self.handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler.as_ref()).await {
                                tracing::warn!(error = %e, "Control connection failed");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to accept control connection"),
                },
            }
        }

        drop(listener);
        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(socket = %self.socket_path, error = %e, "Could not remove control socket");
        }
        tracing::info!("Control socket closed");

        Ok(())
    }

    /// Take over the socket path and bind it, owner-only
    async fn bind(&self) -> Result<UnixListener> {
        let path = Path::new(&self.socket_path);

        if path.exists() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is owned by a running instance", self.socket_path),
                )
                .into());
            }

            tracing::info!(socket = %self.socket_path, "Replacing stale control socket");
            tokio::fs::remove_file(path).await?;
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;

        Ok(listener)
    }
}

async fn serve_connection(mut stream: UnixStream, handler: &dyn CommandHandler) -> Result<()> {
    let request: Request = tokio::time::timeout(IO_TIMEOUT, read_frame(&mut stream, MAX_REQUEST_SIZE))
        .await
        .map_err(|_| ControlError::Timeout)??;

    let response = respond(handler, request).await;

    tokio::time::timeout(IO_TIMEOUT, write_frame(&mut stream, &response))
        .await
        .map_err(|_| ControlError::Timeout)?
}

async fn respond(handler: &dyn CommandHandler, request: Request) -> Response {
    if !request.is_version_compatible() {
        let mismatch = ControlError::IncompatibleVersion {
            peer: request.version,
            local: PROTOCOL_VERSION,
        };
        tracing::warn!(error = %mismatch, "Rejecting control request");
        return Response::error(mismatch.to_string());
    }

    tracing::trace!(command = ?request.command, "Control request");

    match handler.handle_request(request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "Control request failed");
            Response::error(e.to_string())
        }
    }
}
