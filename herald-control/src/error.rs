use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed control frame: {0}")]
    ProtocolDeserialization(#[from] bincode::error::DecodeError),

    #[error("Could not encode control frame: {0}")]
    ProtocolSerialization(#[from] bincode::error::EncodeError),

    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Peer speaks protocol v{peer}, this build speaks v{local}")]
    IncompatibleVersion { peer: u32, local: u32 },

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    /// The server handled the request and reported a failure
    #[error("{0}")]
    ServerError(String),

    /// Peer hung up before a whole frame arrived
    #[error("Control connection closed mid-frame")]
    ConnectionClosed,

    #[error("Timed out waiting on the control socket")]
    Timeout,

    #[error("Unusable control socket path: {0}")]
    InvalidSocketPath(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;
