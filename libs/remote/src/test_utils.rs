//! Test doubles for the remoting core
//!
//! Used by this crate's unit and integration tests and available to
//! downstream crates that drive a `Remote` in their own tests.

use crate::backoff::RetryBackoff;
use crate::config::RemoteConfig;
use crate::events::RemoteEvent;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::registry::{LocalDispatcher, LocalEnvelope};
use crate::serialization::BINCODE_SERIALIZER_ID;
use crate::system::SystemHandle;
use crate::transport::{Connection, Connector};
use crate::{RemoteError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::warn;

/// Wire type name of `TestMessage`
pub const TEST_MESSAGE_TYPE: &str = "test.TestMessage";

/// Simple serializable message registered by `test_system`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestMessage {
    pub text: String,
}

impl TestMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Local dispatcher that records every envelope
#[derive(Default)]
pub struct RecordingDispatcher {
    delivered: Mutex<Vec<LocalEnvelope>>,
    notify: Notify,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything recorded so far
    pub fn take(&self) -> Vec<LocalEnvelope> {
        std::mem::take(&mut *self.delivered.lock())
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.lock().is_empty()
    }

    /// Wait until at least `count` envelopes are recorded or `timeout`
    /// elapses, then return a snapshot
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<LocalEnvelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let delivered = self.delivered.lock();
                if delivered.len() >= count {
                    return delivered.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.delivered.lock().clone();
            }
        }
    }
}

impl LocalDispatcher for RecordingDispatcher {
    fn dispatch(&self, envelope: LocalEnvelope) {
        self.delivered.lock().push(envelope);
        self.notify.notify_waiters();
    }
}

/// System with a fixed id, a recording dispatcher and `TestMessage`
/// registered with the bincode serializer
pub fn test_system(id: &str) -> (SystemHandle, Arc<RecordingDispatcher>) {
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let system = SystemHandle::with_id(id, dispatcher.clone());
    if let Err(e) = system
        .serializers()
        .register_type::<TestMessage>(BINCODE_SERIALIZER_ID, TEST_MESSAGE_TYPE)
    {
        warn!(error = %e, "Failed to register TestMessage");
    }
    (system, dispatcher)
}

/// Loopback config with fast retries and short timeouts
pub fn test_config() -> RemoteConfig {
    let mut config = RemoteConfig::new("127.0.0.1", 0)
        .with_max_retry_count(2)
        .with_retry_backoff(RetryBackoff::Fixed { delay_ms: 5 })
        .with_shutdown_timeout(Duration::from_secs(2));
    config.client.connect_timeout_ms = 1_000;
    config.client.read_idle_timeout_ms = 1_000;
    config
}

/// Drain every event currently buffered on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<RemoteEvent>) -> Vec<RemoteEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Connector whose every attempt fails
#[derive(Debug, Default)]
pub struct FailingConnector {
    attempts: AtomicU32,
}

impl FailingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RemoteError::connect(address, "connection refused"))
    }
}

/// Connector backed by in-memory pipes; the far end of every connection is
/// handed to the test through the receiver returned by `new`
pub struct DuplexConnector {
    peers: mpsc::UnboundedSender<Connection>,
    attempts: AtomicU32,
    buffer: usize,
    max_frame_size: usize,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        Self::with_limits(64 * 1024, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_buffer(buffer: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        Self::with_limits(buffer, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Both ends refuse frames larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        Self::with_limits(64 * 1024, max_frame_size)
    }

    fn with_limits(buffer: usize, max_frame_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Connection>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers,
            attempts: AtomicU32::new(0),
            buffer,
            max_frame_size,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, address: &str) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (near, far) = tokio::io::duplex(self.buffer);
        self.peers
            .send(Connection::from_stream(far, "writer", self.max_frame_size))
            .map_err(|_| RemoteError::connect(address, "no peer listening"))?;
        Ok(Connection::from_stream(near, address, self.max_frame_size))
    }
}
