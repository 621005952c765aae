//! Length-prefixed bincode framing shared by client and server
//!
//! Every frame is a big-endian `u32` length followed by that many bytes of
//! bincode (legacy configuration).

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

/// Largest request the server will read (1MB)
pub const MAX_REQUEST_SIZE: u32 = 1_000_000;

/// Largest response the client will read (10MB)
pub const MAX_RESPONSE_SIZE: u32 = 10_000_000;

/// Read one frame, rejecting anything over `max` bytes
///
/// # Errors
///
/// [`ControlError::ConnectionClosed`] if the peer hung up before a frame
/// started, [`ControlError::FrameTooLarge`] for an oversized frame, or any
/// I/O or decode error.
pub async fn read_frame<T, R>(reader: &mut R, max: u32) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let size = u32::from_be_bytes(len_buf);
    if size > max {
        return Err(ControlError::FrameTooLarge { size, max });
    }

    let mut bytes = vec![0u8; size as usize];
    reader.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}

/// Write one frame and flush
///
/// # Errors
///
/// Any encode or I/O error.
pub async fn write_frame<T, W>(writer: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let size = u32::try_from(bytes.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    writer.write_all(&size.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;

    Ok(())
}
