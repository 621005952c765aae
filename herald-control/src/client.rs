//! Operator side of the control socket

use std::{path::Path, time::Duration};

use tokio::net::UnixStream;

use crate::{
    ControlError, PROTOCOL_VERSION, Request, RequestCommand, Response, ResponsePayload, Result,
    codec::{MAX_RESPONSE_SIZE, read_frame, write_frame},
    protocol::ResponseData,
};

/// Client for communicating with the herald control server
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: String,
    timeout: Duration,
    token: Option<String>,
}

impl ControlClient {
    #[must_use]
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
            token: None,
        }
    }

    /// Bound on connecting, sending and reading the reply
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach a bearer token to every request
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Send a command with this client's token
    ///
    /// Returns the response data, or `None` for a bare success.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_request`].
    pub async fn execute(&self, command: RequestCommand) -> Result<Option<ResponseData>> {
        let request = match &self.token {
            Some(token) => Request::with_token(command, token.clone()),
            None => Request::new(command),
        };

        match self.send_request(request).await?.payload {
            ResponsePayload::Data(data) => Ok(Some(*data)),
            ResponsePayload::Ok | ResponsePayload::Error(_) => Ok(None),
        }
    }

    /// Send a request and receive a response
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Connection fails
    /// - Protocol error occurs
    /// - Request times out
    /// - Server returns an error
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.round_trip(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    async fn round_trip(&self, request: Request) -> Result<Response> {
        tracing::debug!(socket = %self.socket_path, "Connecting to control socket");
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        write_frame(&mut stream, &request).await?;
        let response: Response = read_frame(&mut stream, MAX_RESPONSE_SIZE).await?;

        if !response.is_version_compatible() {
            return Err(ControlError::IncompatibleVersion {
                peer: response.version,
                local: PROTOCOL_VERSION,
            });
        }

        if let ResponsePayload::Error(err) = response.payload {
            return Err(ControlError::ServerError(err));
        }

        Ok(response)
    }

    /// Fail early, with a readable message, when herald is not running
    ///
    /// # Errors
    ///
    /// If nothing exists at the socket path.
    pub fn check_socket_exists(&self) -> Result<()> {
        if !Path::new(&self.socket_path).exists() {
            return Err(ControlError::InvalidSocketPath(format!(
                "{} does not exist; is herald running?",
                self.socket_path
            )));
        }
        Ok(())
    }
}
