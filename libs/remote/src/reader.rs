//! Endpoint Reader
//!
//! Serves one inbound endpoint stream: handshake, block list check, then
//! batches decoded and delivered to the local actor runtime until the peer
//! goes away or the server shuts down.
//!
//! While suspended (graceful shutdown in progress) the reader refuses new
//! streams and drops inbound batches.

use crate::block_list::BlockList;
use crate::config::RemoteConfig;
use crate::protocol::{ConnectResponse, MessageBatch, RemoteMessage};
use crate::registry::LocalEnvelope;
use crate::system::SystemHandle;
use crate::transport::{Connection, FrameSink};
use crate::{RemoteError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Inbound stream handler shared by every accepted connection
pub struct EndpointReader {
    system: SystemHandle,
    config: Arc<RemoteConfig>,
    block_list: BlockList,
    suspended: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl EndpointReader {
    pub fn new(
        system: SystemHandle,
        config: Arc<RemoteConfig>,
        block_list: BlockList,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            system,
            config,
            block_list,
            suspended: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn suspend(&self, suspended: bool) {
        info!(suspended, "Endpoint reader suspend state changed");
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Serve one accepted connection to completion
    pub async fn serve(&self, connection: Connection) -> Result<()> {
        let Connection {
            mut sink,
            mut source,
            peer,
        } = connection;

        if self.is_suspended() {
            warn!(peer = %peer, "Endpoint reader suspended, refusing stream");
            let _ = sink.close().await;
            return Ok(());
        }

        let header_timeout = self.config.server.read_header_timeout();
        let first = tokio::time::timeout(header_timeout, source.recv_limited(self.config.server.max_header_bytes))
            .await
            .map_err(|_| RemoteError::timeout("connect request", header_timeout.as_millis() as u64))??;

        let request = match first {
            Some(RemoteMessage::ConnectRequest(request)) => request,
            Some(other) => {
                let _ = sink.close().await;
                return Err(RemoteError::protocol(format!(
                    "expected ConnectRequest, got {}",
                    other.kind()
                )));
            }
            None => {
                debug!(peer = %peer, "Stream closed before handshake");
                return Ok(());
            }
        };

        let blocked = self.block_list.contains(&request.system_id);
        let response = RemoteMessage::ConnectResponse(ConnectResponse {
            member_id: self.system.id().to_string(),
            blocked,
        });
        self.write(sink.as_mut(), &response).await?;

        if blocked {
            info!(system_id = %request.system_id, address = %request.address, "Refused blocked system");
            let _ = sink.close().await;
            return Ok(());
        }
        info!(system_id = %request.system_id, address = %request.address, "Accepted endpoint stream");

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            self.disconnect(sink.as_mut(), &request.address).await;
            return Ok(());
        }

        loop {
            let frame = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.disconnect(sink.as_mut(), &request.address).await;
                        return Ok(());
                    }
                    continue;
                }

                frame = Self::next_frame(source.as_mut(), self.config.server.read_timeout()) => frame,
            };

            match frame {
                Ok(Some(RemoteMessage::MessageBatch(batch))) => self.deliver(batch),
                Ok(Some(RemoteMessage::DisconnectRequest)) => {
                    debug!(address = %request.address, "Peer requested disconnect");
                    break;
                }
                Ok(Some(other)) => {
                    warn!(address = %request.address, kind = other.kind(), "Unexpected frame on endpoint stream");
                }
                Ok(None) => {
                    debug!(address = %request.address, "Endpoint stream completed");
                    break;
                }
                Err(e) => {
                    warn!(address = %request.address, error = %e, "Endpoint stream failed");
                    break;
                }
            }
        }

        let _ = sink.close().await;
        Ok(())
    }

    async fn next_frame(
        source: &mut dyn crate::transport::FrameSource,
        idle: Option<std::time::Duration>,
    ) -> Result<Option<RemoteMessage>> {
        match idle {
            Some(idle) => tokio::time::timeout(idle, source.recv())
                .await
                .map_err(|_| RemoteError::timeout("endpoint stream read", idle.as_millis() as u64))?,
            None => source.recv().await,
        }
    }

    async fn write(&self, sink: &mut dyn FrameSink, message: &RemoteMessage) -> Result<()> {
        match self.config.server.write_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, sink.send(message))
                .await
                .map_err(|_| RemoteError::timeout("endpoint stream write", timeout.as_millis() as u64))?,
            None => sink.send(message).await,
        }
    }

    async fn disconnect(&self, sink: &mut dyn FrameSink, address: &str) {
        debug!(address = %address, "Sending DisconnectRequest");
        if let Err(e) = self.write(sink, &RemoteMessage::DisconnectRequest).await {
            debug!(address = %address, error = %e, "Failed to send DisconnectRequest");
        }
        let _ = sink.close().await;
    }

    /// Decode a batch and hand each message to the local runtime
    fn deliver(&self, batch: MessageBatch) {
        if self.is_suspended() {
            warn!(envelopes = batch.len(), "Endpoint reader suspended, dropping batch");
            return;
        }

        let envelopes = match batch.resolve() {
            Ok(envelopes) => envelopes,
            Err(e) => {
                error!(error = %e, "Dropping malformed message batch");
                return;
            }
        };

        let serializers = self.system.serializers();
        let registry = self.system.registry();
        for envelope in envelopes {
            let message =
                match serializers.deserialize(&envelope.type_name, &envelope.message_data, envelope.serializer_id) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(
                            type_name = %envelope.type_name,
                            target_pid = %envelope.target,
                            error = %e,
                            "Failed to deserialize message, skipping"
                        );
                        continue;
                    }
                };

            registry.dispatch_local(LocalEnvelope {
                target: envelope.target,
                sender: envelope.sender,
                header: envelope.header,
                message,
            });
        }
    }
}
