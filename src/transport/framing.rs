//! Length-prefixed framing for the TCP byte stream
//!
//! ```text
//! [len: u32 big-endian][body: len bytes of UTF-8 JSON]
//! ```
//!
//! The declared length is checked against the configured bound before any
//! buffer is allocated for the body.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard upper bound on a frame body
pub const MAX_FRAME_LEN: usize = 1_000_000;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Framing errors; any of these ends the connection
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared length is zero or above the bound
    #[error("invalid frame length {len} (allowed 1..={max})")]
    InvalidLength { len: u64, max: usize },

    /// The stream ended cleanly between frames
    #[error("connection closed by peer")]
    Closed,

    /// The stream ended inside a length prefix or body
    #[error("truncated frame: expected {expected} bytes, stream ended early")]
    Truncated { expected: usize },

    /// Any other socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

fn check_len(len: u64, max: usize) -> Result<usize, FrameError> {
    if len == 0 || len > max as u64 {
        return Err(FrameError::InvalidLength { len, max });
    }
    Ok(len as usize)
}

/// Prefix `body` with its length
pub fn encode_frame(body: &[u8], max: usize) -> Result<Bytes, FrameError> {
    let len = check_len(body.len() as u64, max)?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
    buf.put_u32(len as u32);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Read one frame body from `reader`
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                FrameError::Closed
            } else {
                FrameError::Truncated {
                    expected: LENGTH_PREFIX_LEN,
                }
            });
        }
        filled += n;
    }

    let len = check_len(u32::from_be_bytes(prefix) as u64, max)?;

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(FrameError::Truncated { expected: len })
        }
        Err(e) => Err(e.into()),
    }
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(body, max)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
