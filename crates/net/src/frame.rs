//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [1-byte kind tag][4-byte big-endian length][payload]
//! Maximum frame size: 16MB (images travel as single frames)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameKind};

/// Maximum allowed frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read exactly one frame from a stream.
///
/// Blocks until a complete frame has been accumulated; a partial frame
/// is never returned. EOF before or inside a frame maps to
/// `Error::ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await.map_err(map_eof)?;

    let kind = FrameKind::from_tag(header[0])
        .ok_or_else(|| Error::Protocol(format!("Unknown frame tag: {:#04x}", header[0])))?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    // Sanity checks
    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    Ok(Frame { kind, payload })
}

/// Write one frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = frame.payload.len() as u32;
    if len == 0 {
        return Err(Error::Protocol("Refusing to write empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&[frame.kind.tag()]).await?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&frame.payload).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}
