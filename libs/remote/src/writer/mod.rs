//! Endpoint Writer
//!
//! One writer per remote address. It owns the outbound stream to that
//! address and processes its mailbox strictly sequentially:
//!
//! ```text
//!  Starting ──▶ Connecting ──(handshake ok)──▶ Connected ──▶ Stopping ──▶ Stopped
//!                   │                             │  ▲
//!                   │ retries exhausted           │  └─ batches sent in order
//!                   ▼                             ▼
//!            Terminated event,            send failure: requeue batch,
//!            dead-letter mailbox          exit for supervisor restart
//! ```
//!
//! Requests inherited from a failed predecessor are sent first, in batches
//! of at most `endpoint_writer_batch_size`. A batch whose frame exceeds the
//! frame size limit is split in half until it fits; a single message that
//! still does not fit is dead-lettered and the writer carries on.
//!
//! The connect loop blocks this writer (only this address) for all
//! attempts including backoff delays. Once connected, a background listener
//! watches the read half and publishes `EndpointTerminated` when the stream
//! ends, errors or the peer sends `DisconnectRequest`. The listener only
//! talks to the event stream, never to the writer. Terminated events carry
//! the writer's generation so a stale event cannot stop its replacement.
//!
//! The writer's run loop returns a `WriterExit` instead of panicking; the
//! endpoint manager decides whether a fresh writer replaces it.

use crate::backoff::BackoffPolicy;
use crate::config::RemoteConfig;
use crate::encoder::{self, BatchEncoder, BatchItem, Prepared};
use crate::events::{EventStream, RemoteEvent};
use crate::protocol::{ConnectRequest, DeliverRequest, RemoteMessage};
use crate::system::SystemHandle;
use crate::transport::{Connection, Connector, FrameSink, FrameSource};
use crate::{RemoteError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
mod tests;

/// Mailbox entries a writer accepts
#[derive(Debug)]
pub enum WriterMessage {
    Deliver(DeliverRequest),
    /// The endpoint for this address was reported terminated
    Terminated,
    /// Fail this writer instance so the supervisor replaces it
    RestartAfterConnectFailure(String),
    Stop,
}

/// Writer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    Starting,
    Connecting,
    Connected,
    Failed,
    Stopping,
    Stopped,
}

/// How a writer's run loop ended
#[derive(Debug)]
pub enum WriterExit {
    /// Clean stop; anything unsent was dead-lettered
    Stopped,
    /// A batch write failed; `requeued` holds the failed batch followed by
    /// the undelivered mailbox, in submission order. `sent` counts the
    /// batches this instance wrote before the failure.
    SendFailed {
        requeued: Vec<DeliverRequest>,
        sent: u64,
    },
    /// Terminal failure of this instance
    Failed {
        error: RemoteError,
        pending: Vec<DeliverRequest>,
    },
}

/// Rejected delivery, handing the request back
#[derive(Debug)]
pub enum DeliverError {
    Full(DeliverRequest),
    Closed(DeliverRequest),
}

/// Sending side of a writer's mailbox
#[derive(Debug, Clone)]
pub struct WriterHandle {
    address: String,
    sender: mpsc::Sender<WriterMessage>,
}

impl WriterHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn try_deliver(&self, request: DeliverRequest) -> std::result::Result<(), DeliverError> {
        match self.sender.try_reserve() {
            Ok(permit) => {
                permit.send(WriterMessage::Deliver(request));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(DeliverError::Full(request)),
            Err(mpsc::error::TrySendError::Closed(())) => Err(DeliverError::Closed(request)),
        }
    }

    /// Returns false if the writer is already gone
    pub fn terminate(&self) -> bool {
        self.sender.try_send(WriterMessage::Terminated).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.sender.try_send(WriterMessage::Stop).is_ok()
    }

    pub fn restart_after_connect_failure(&self, reason: impl Into<String>) -> bool {
        self.sender
            .try_send(WriterMessage::RestartAfterConnectFailure(reason.into()))
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

enum Step {
    Continue,
    Exit(WriterExit),
}

/// Per-address outbound endpoint
pub struct EndpointWriter {
    address: String,
    system: SystemHandle,
    config: Arc<RemoteConfig>,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffPolicy>,
    mailbox: mpsc::Receiver<WriterMessage>,
    /// Stamped on this instance's terminated events
    generation: u64,
    /// Wait before the first connect attempt
    start_delay: Option<Duration>,
    /// Requests inherited from a failed predecessor, sent first
    seed: VecDeque<DeliverRequest>,
    /// Control message drained while collecting a batch
    held: Option<WriterMessage>,
    sink: Option<Box<dyn FrameSink>>,
    listener: Option<JoinHandle<()>>,
    status: WriterStatus,
    batches_sent: u64,
}

impl EndpointWriter {
    pub fn new(
        address: impl Into<String>,
        system: SystemHandle,
        config: Arc<RemoteConfig>,
        connector: Arc<dyn Connector>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> (Self, WriterHandle) {
        let address = address.into();
        let (sender, mailbox) = mpsc::channel(config.endpoint_writer_queue_size.max(1));
        let writer = Self {
            address: address.clone(),
            system,
            config,
            connector,
            backoff,
            mailbox,
            generation: 0,
            start_delay: None,
            seed: VecDeque::new(),
            held: None,
            sink: None,
            listener: None,
            status: WriterStatus::Starting,
            batches_sent: 0,
        };
        (writer, WriterHandle { address, sender })
    }

    pub fn with_seed(mut self, seed: Vec<DeliverRequest>) -> Self {
        self.seed = seed.into();
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Hold off connecting; used when restarts keep failing
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay).filter(|d| !d.is_zero());
        self
    }

    pub fn status(&self) -> WriterStatus {
        self.status
    }

    pub fn spawn(self) -> JoinHandle<WriterExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> WriterExit {
        if let Some(delay) = self.start_delay {
            debug!(address = %self.address, delay_ms = delay.as_millis() as u64, "Delaying endpoint writer start");
            tokio::time::sleep(delay).await;
        }
        self.status = WriterStatus::Connecting;

        if let Err(e) = self.connect_with_retry().await {
            error!(
                address = %self.address,
                attempts = self.config.max_retry_count,
                error = %e,
                "Endpoint writer exhausted connect attempts"
            );
            self.status = WriterStatus::Failed;
            self.system.event_stream().publish(RemoteEvent::EndpointTerminated {
                address: self.address.clone(),
                generation: Some(self.generation),
            });
            return self.stop(Vec::new()).await;
        }

        if !self.seed.is_empty() {
            debug!(address = %self.address, count = self.seed.len(), "Sending requeued requests");
        }
        let limit = self.config.endpoint_writer_batch_size.max(1);
        while !self.seed.is_empty() {
            let take = limit.min(self.seed.len());
            let chunk: Vec<DeliverRequest> = self.seed.drain(..take).collect();
            if let Step::Exit(exit) = self.send_requests(chunk).await {
                return exit;
            }
        }

        loop {
            let message = match self.held.take() {
                Some(message) => message,
                None => match self.mailbox.recv().await {
                    Some(message) => message,
                    None => return self.stop(Vec::new()).await,
                },
            };

            let step = match message {
                WriterMessage::Deliver(request) => {
                    let items = self.drain_batch(request);
                    self.process(items).await
                }
                WriterMessage::Terminated => {
                    info!(address = %self.address, "Endpoint writer received terminated event, stopping");
                    Step::Exit(self.stop(Vec::new()).await)
                }
                WriterMessage::Stop => Step::Exit(self.stop(Vec::new()).await),
                WriterMessage::RestartAfterConnectFailure(reason) => {
                    debug!(address = %self.address, reason = %reason, "Endpoint writer failing for restart");
                    Step::Exit(self.fail(RemoteError::RestartAfterConnectFailure { reason }).await)
                }
            };

            if let Step::Exit(exit) = step {
                return exit;
            }
        }
    }

    async fn connect_with_retry(&mut self) -> Result<()> {
        let started = Instant::now();
        let max_attempts = self.config.max_retry_count.max(1);
        info!(address = %self.address, "Started endpoint writer, connecting");

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.connect_once().await {
                Ok(connection) => {
                    self.install(connection);
                    info!(
                        address = %self.address,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Endpoint writer connected"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(address = %self.address, retry = attempt, error = %e, "Endpoint writer failed to connect");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RemoteError::connect(self.address.as_str(), "no connect attempt made")))
    }

    /// Dial, send `ConnectRequest` and require a non-blocked `ConnectResponse`
    async fn connect_once(&self) -> Result<Connection> {
        let mut connection = self.connector.connect(&self.address).await?;

        let request = RemoteMessage::ConnectRequest(ConnectRequest {
            system_id: self.system.id().to_string(),
            address: self.system.registry().address(),
        });
        connection.sink.send(&request).await?;

        let reply = match self.config.client.read_idle_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, connection.source.recv())
                .await
                .map_err(|_| RemoteError::timeout("connect response", timeout.as_millis() as u64))??,
            None => connection.source.recv().await?,
        };

        match reply {
            Some(RemoteMessage::ConnectResponse(response)) if response.blocked => Err(RemoteError::connect(
                self.address.as_str(),
                format!("blocked by remote system {}", response.member_id),
            )),
            Some(RemoteMessage::ConnectResponse(response)) => {
                debug!(address = %self.address, member_id = %response.member_id, "Received connect response");
                Ok(connection)
            }
            Some(other) => Err(RemoteError::protocol(format!(
                "invalid connect response: expected ConnectResponse, got {}",
                other.kind()
            ))),
            None => Err(RemoteError::stream(
                self.address.as_str(),
                "stream closed before connect response",
            )),
        }
    }

    fn install(&mut self, connection: Connection) {
        let Connection { sink, source, .. } = connection;
        let events = self.system.event_stream().clone();

        self.sink = Some(sink);
        self.status = WriterStatus::Connected;
        events.publish(RemoteEvent::EndpointConnected {
            address: self.address.clone(),
        });
        self.listener = Some(tokio::spawn(watch_stream(
            self.address.clone(),
            self.generation,
            source,
            events,
        )));
    }

    /// Collect up to one batch of consecutive deliveries
    fn drain_batch(&mut self, first: DeliverRequest) -> Vec<BatchItem> {
        let limit = self.config.endpoint_writer_batch_size.max(1);
        let mut items = vec![BatchItem::Deliver(first)];

        while items.len() < limit {
            match self.mailbox.try_recv() {
                Ok(WriterMessage::Deliver(request)) => items.push(BatchItem::Deliver(request)),
                Ok(WriterMessage::Terminated) => {
                    items.push(BatchItem::Terminated);
                    break;
                }
                Ok(other) => {
                    self.held = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        items
    }

    async fn process(&mut self, items: Vec<BatchItem>) -> Step {
        match encoder::prepare(items) {
            Prepared::Terminate { unsent } => {
                debug!(address = %self.address, "Handling batched terminate event");
                Step::Exit(self.stop(unsent).await)
            }
            Prepared::Deliver(requests) => self.send_requests(requests).await,
        }
    }

    async fn send_requests(&mut self, requests: Vec<DeliverRequest>) -> Step {
        if self.sink.is_none() {
            self.redirect(requests);
            return Step::Continue;
        }

        let mut chunks = VecDeque::from([requests]);
        while let Some(chunk) = chunks.pop_front() {
            let encoded = BatchEncoder::new(self.system.serializers()).encode(chunk);
            if encoded.is_empty() {
                continue;
            }

            let envelopes = encoded.batch.len();
            let frame = RemoteMessage::MessageBatch(encoded.batch);
            let result = match self.sink.as_mut() {
                Some(sink) => sink.send(&frame).await,
                None => Err(RemoteError::send(self.address.as_str(), "stream released")),
            };

            match result {
                Ok(()) => {
                    self.batches_sent += 1;
                    trace!(address = %self.address, envelopes, "Sent message batch");
                }
                // Rejected before any byte hit the stream, so the stream is still usable
                Err(RemoteError::FrameTooLarge { size, max }) => {
                    let mut head = encoded.encoded;
                    if head.len() <= 1 {
                        warn!(address = %self.address, size, max, "Message exceeds maximum frame size, dead-lettering");
                        self.redirect(head);
                    } else {
                        debug!(address = %self.address, envelopes, size, max, "Batch exceeds maximum frame size, splitting");
                        let tail = head.split_off(head.len() / 2);
                        chunks.push_front(tail);
                        chunks.push_front(head);
                    }
                }
                Err(e) => {
                    warn!(address = %self.address, envelopes, error = %e, "Failed to send message batch, stopping writer");
                    let mut requeued = encoded.encoded;
                    requeued.extend(chunks.into_iter().flatten());
                    requeued.extend(self.drain_pending());
                    self.status = WriterStatus::Stopping;
                    self.release().await;
                    self.status = WriterStatus::Stopped;
                    return Step::Exit(WriterExit::SendFailed {
                        requeued,
                        sent: self.batches_sent,
                    });
                }
            }
        }
        Step::Continue
    }

    /// Dead-letter requests that cannot be written: a response to the
    /// sender if there is one, otherwise a dead-letter event
    fn redirect(&self, requests: Vec<DeliverRequest>) {
        if requests.is_empty() {
            return;
        }
        debug!(address = %self.address, count = requests.len(), "Redirecting undeliverable requests to dead letters");
        let registry = self.system.registry();
        for request in requests {
            registry.dead_letter(request);
        }
    }

    /// Close the mailbox and take every unsent request: the rest of the
    /// seed, then the mailbox
    fn drain_pending(&mut self) -> Vec<DeliverRequest> {
        self.mailbox.close();

        let mut pending: Vec<DeliverRequest> = std::mem::take(&mut self.seed).into();
        if let Some(WriterMessage::Deliver(request)) = self.held.take() {
            pending.push(request);
        }
        while let Ok(message) = self.mailbox.try_recv() {
            if let WriterMessage::Deliver(request) = message {
                pending.push(request);
            }
        }
        pending
    }

    /// Abort the listener before closing the stream so a self-initiated
    /// close never publishes a terminated event
    async fn release(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            info!(address = %self.address, "Endpoint writer closing client connection");
            if let Err(e) = sink.close().await {
                debug!(address = %self.address, error = %e, "Error closing endpoint stream");
            }
        }
    }

    async fn stop(&mut self, unsent: Vec<DeliverRequest>) -> WriterExit {
        if self.status == WriterStatus::Stopped {
            return WriterExit::Stopped;
        }
        self.status = WriterStatus::Stopping;

        let mut unsent = unsent;
        unsent.extend(self.drain_pending());
        self.release().await;
        self.redirect(unsent);

        self.status = WriterStatus::Stopped;
        debug!(address = %self.address, "Endpoint writer stopped");
        WriterExit::Stopped
    }

    async fn fail(&mut self, error: RemoteError) -> WriterExit {
        self.status = WriterStatus::Failed;
        let pending = self.drain_pending();
        self.release().await;
        WriterExit::Failed { error, pending }
    }
}

/// Background listener on the writer's read half
async fn watch_stream(address: String, generation: u64, mut source: Box<dyn FrameSource>, events: EventStream) {
    loop {
        match source.recv().await {
            Ok(None) => {
                debug!(address = %address, "Endpoint writer stream completed");
                break;
            }
            Ok(Some(RemoteMessage::DisconnectRequest)) => {
                info!(address = %address, "Endpoint writer got DisconnectRequest from remote");
                break;
            }
            Ok(Some(other)) => {
                trace!(address = %address, kind = other.kind(), "Ignoring frame on writer stream");
            }
            Err(e) => {
                error!(address = %address, error = %e, "Endpoint writer lost connection");
                break;
            }
        }
    }

    events.publish(RemoteEvent::EndpointTerminated {
        address,
        generation: Some(generation),
    });
}
