//! Cleartext TCP Connector

use super::{Connection, Connector};
use crate::config::RemoteConfig;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::{RemoteError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Dials `host:port` over plain TCP
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    write_timeout: Option<Duration>,
    max_frame_size: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            write_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            connect_timeout: config.client.connect_timeout(),
            write_timeout: config.client.write_byte_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

/// Frame an accepted or dialed TCP stream
pub fn tcp_connection(stream: TcpStream, peer: impl Into<String>, max_frame_size: usize) -> Connection {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (read, write) = stream.into_split();
    Connection::from_halves(read, write, peer, max_frame_size)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        debug!(address = %address, "Dialing endpoint");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| RemoteError::timeout("TCP connect", self.connect_timeout.as_millis() as u64))?
            .map_err(|e| RemoteError::connect_with_source(address, "TCP connect failed", e))?;

        Ok(tcp_connection(stream, address, self.max_frame_size).with_write_timeout(self.write_timeout))
    }
}
