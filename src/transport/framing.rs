//! Length-prefixed framing for stream sockets.
//!
//! Each frame is a 4-byte little-endian length followed by that many bytes.

use crate::error::MessagingError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on a single frame write before the peer is considered stalled.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read one frame from the stream
pub async fn read_frame<R>(stream: &mut R, max_frame_size: usize) -> Result<Vec<u8>, MessagingError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > max_frame_size {
        return Err(MessagingError::Transport(format!(
            "Frame too large: {} bytes",
            frame_len
        )));
    }

    let mut frame = vec![0u8; frame_len];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Write one frame to the stream
///
/// A write that cannot complete within [`WRITE_TIMEOUT`] is reported as
/// [`MessagingError::BackpressureTimeout`].
pub async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> Result<(), MessagingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame_within(stream, bytes, WRITE_TIMEOUT).await
}

/// Write one frame, giving up after `limit`.
///
/// On timeout the stream may hold a partial frame and must not be reused.
pub async fn write_frame_within<W>(
    stream: &mut W,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), MessagingError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame_len = u32::try_from(bytes.len()).map_err(|_| {
        MessagingError::Transport(format!("Frame too large: {} bytes", bytes.len()))
    })?;

    let write_fut = async {
        stream.write_all(&frame_len.to_le_bytes()).await?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(()) as Result<(), std::io::Error>
    };

    match timeout(limit, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MessagingError::Io(e)),
        Err(_) => Err(MessagingError::BackpressureTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();

        assert_eq!(read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap(), b"hello");
        assert!(read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0u8; 64]).await.unwrap();

        let err = read_frame(&mut server, 32).await.unwrap_err();
        assert!(err.to_string().contains("Frame too large"));
    }

    #[tokio::test]
    async fn test_stalled_reader_is_a_backpressure_timeout() {
        let (mut client, _server) = tokio::io::duplex(16);

        let err = write_frame_within(&mut client, &[7u8; 256], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::BackpressureTimeout));
    }

    #[tokio::test]
    async fn test_closed_stream_is_an_io_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server, MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, MessagingError::Io(_)));
    }
}
