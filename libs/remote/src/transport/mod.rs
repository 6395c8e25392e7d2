//! Endpoint Transport
//!
//! A connection is a split pair: a `FrameSink` owned by whoever writes
//! (the endpoint writer) and a `FrameSource` owned by whoever reads (the
//! writer's background listener, or the inbound reader). `Connector` dials an
//! address and returns such a pair; it is injectable so a TLS or HTTP/2
//! transport can replace the built-in cleartext TCP one.

use crate::protocol::{FrameReader, FrameWriter, RemoteMessage};
use crate::{RemoteError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod tcp;

pub use tcp::TcpConnector;

/// Write half of an endpoint stream
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&mut self, message: &RemoteMessage) -> Result<()>;

    /// Close the write half; the peer observes end of stream
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an endpoint stream
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Next frame, `None` on clean end of stream
    async fn recv(&mut self) -> Result<Option<RemoteMessage>>;

    /// Next frame with a tighter size bound
    async fn recv_limited(&mut self, limit: usize) -> Result<Option<RemoteMessage>>;
}

/// Dials remote endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Connection>;

    /// Whether the connector carries TLS
    fn is_secure(&self) -> bool {
        false
    }
}

/// Split bidirectional endpoint stream
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// Remote side, for logging
    pub peer: String,
}

impl Connection {
    /// Frame any async byte stream
    pub fn from_stream<S>(stream: S, peer: impl Into<String>, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::from_halves(read, write, peer, max_frame_size)
    }

    pub fn from_halves<R, W>(read: R, write: W, peer: impl Into<String>, max_frame_size: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            sink: Box::new(FrameWriter::with_max_frame_size(write, max_frame_size)),
            source: Box::new(FrameReader::with_max_frame_size(read, max_frame_size)),
            peer: peer.into(),
        }
    }

    /// Bound every send by `timeout`
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            self.sink = Box::new(TimedSink {
                inner: self.sink,
                timeout,
            });
        }
        self
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> FrameSink for FrameWriter<W> {
    async fn send(&mut self, message: &RemoteMessage) -> Result<()> {
        self.write_frame(message).await
    }

    async fn close(&mut self) -> Result<()> {
        self.shutdown().await
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + Sync> FrameSource for FrameReader<R> {
    async fn recv(&mut self) -> Result<Option<RemoteMessage>> {
        self.read_frame().await
    }

    async fn recv_limited(&mut self, limit: usize) -> Result<Option<RemoteMessage>> {
        self.read_frame_limited(limit).await
    }
}

/// Sink whose sends fail after a bounded wait
struct TimedSink {
    inner: Box<dyn FrameSink>,
    timeout: Duration,
}

#[async_trait]
impl FrameSink for TimedSink {
    async fn send(&mut self, message: &RemoteMessage) -> Result<()> {
        tokio::time::timeout(self.timeout, self.inner.send(message))
            .await
            .map_err(|_| RemoteError::timeout("frame write", self.timeout.as_millis() as u64))?
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConnectResponse;

    #[tokio::test]
    async fn test_duplex_connection_pair() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Connection::from_stream(a, "left", 1024);
        let mut right = Connection::from_stream(b, "right", 1024);

        let frame = RemoteMessage::ConnectResponse(ConnectResponse {
            member_id: "sys-b".to_string(),
            blocked: false,
        });
        left.sink.send(&frame).await.unwrap();
        assert_eq!(right.source.recv().await.unwrap(), Some(frame));

        left.sink.close().await.unwrap();
        assert_eq!(right.source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_timeout_fires_on_stalled_peer() {
        // Peer never reads and the pipe holds less than one frame
        let (a, _b) = tokio::io::duplex(8);
        let mut conn = Connection::from_stream(a, "stalled", 1024).with_write_timeout(Some(Duration::from_millis(20)));

        let result = conn.sink.send(&RemoteMessage::DisconnectRequest).await;
        let result = match result {
            Ok(()) => conn
                .sink
                .send(&RemoteMessage::ConnectResponse(ConnectResponse {
                    member_id: "x".repeat(64),
                    blocked: false,
                }))
                .await,
            err => err,
        };
        assert!(matches!(result, Err(RemoteError::Timeout { .. })));
    }
}
