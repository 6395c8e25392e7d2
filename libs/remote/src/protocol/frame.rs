//! Length-Prefixed Frame Codec
//!
//! Each frame is a big-endian `u32` length followed by the bincode encoding
//! of one `RemoteMessage`. Works over any split async byte stream, so the
//! TCP transport and in-memory duplex pipes share the same codec.

use super::RemoteMessage;
use crate::{RemoteError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Default upper bound for one frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Writes framed `RemoteMessage`s
pub struct FrameWriter<W> {
    inner: W,
    /// Reusable write buffer
    buffer: BytesMut,
    max_frame_size: usize,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_frame_size(inner, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
            frames_written: 0,
        }
    }

    /// Encode and write one frame, flushing it to the stream
    pub async fn write_frame(&mut self, message: &RemoteMessage) -> Result<()> {
        let data = bincode::serialize(message)?;
        if data.len() > self.max_frame_size {
            return Err(RemoteError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        self.buffer.clear();
        self.buffer.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.buffer.extend_from_slice(&data);

        // Single write call
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        self.frames_written += 1;

        trace!(kind = message.kind(), bytes = data.len(), "Wrote frame");
        Ok(())
    }

    /// Close the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

/// Reads framed `RemoteMessage`s
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_size(inner, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Read the next frame. `Ok(None)` is a clean end of stream at a frame
    /// boundary; EOF inside a frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<RemoteMessage>> {
        let limit = self.max_frame_size;
        self.read_frame_limited(limit).await
    }

    /// Read the next frame with a tighter size bound (handshake frames)
    pub async fn read_frame_limited(&mut self, limit: usize) -> Result<Option<RemoteMessage>> {
        let mut len_bytes = [0u8; 4];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = self.inner.read(&mut len_bytes[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(RemoteError::protocol("Stream ended inside frame length"));
            }
            filled += n;
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > limit {
            return Err(RemoteError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame_len, limit
            )));
        }

        self.buffer.clear();
        self.buffer.resize(frame_len, 0);
        self.inner.read_exact(&mut self.buffer).await?;

        let message: RemoteMessage = bincode::deserialize(&self.buffer)?;
        trace!(kind = message.kind(), bytes = frame_len, "Read frame");
        Ok(Some(message))
    }
}
