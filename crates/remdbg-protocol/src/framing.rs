//! Length-prefixed transport for the one structured message on the wire.
//!
//! A frame is a `u32` little-endian length followed by exactly that many
//! payload bytes (a JSON-serialised [`TerminalConfig`]). Everything after
//! the frame, in both directions, is raw terminal I/O.

use std::io::Write;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::TerminalConfig;
use crate::errors::ProtocolError;

/// Sanity cap on the frame length header. A real config is a few hundred
/// bytes; anything near this is a confused or hostile peer.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

/// Write one framed config. Used by the client right after connecting.
pub fn send_config<W: Write>(writer: &mut W, config: &TerminalConfig) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(config)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::Malformed("config payload too large".to_string()))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed config from an async stream. Used by the server accept
/// path. Consumes exactly `4 + len` bytes.
pub async fn read_config<R>(reader: &mut R) -> Result<TerminalConfig, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_exact_or_truncated(reader, &mut header).await?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame(len));
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_or_truncated(reader, &mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Blocking counterpart of [`read_config`], for callers outside the loop.
pub fn recv_config<R: std::io::Read>(reader: &mut R) -> Result<TerminalConfig, ProtocolError> {
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .map_err(map_unexpected_eof)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::OversizedFrame(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(map_unexpected_eof)?;
    Ok(serde_json::from_slice(&payload)?)
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }
    Ok(())
}

fn map_unexpected_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(e)
    }
}
