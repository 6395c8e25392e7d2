//! Endpoint Manager
//!
//! Owns one `EndpointWriter` per remote address. Outbound deliveries flow
//! through a bounded queue into a single dispatch task, which routes them to
//! the writer for their target address, creating writers lazily:
//!
//! ```text
//! remote_deliver ──▶ [manager queue] ──▶ dispatch task ──▶ writer(addr A)
//!                                          ▲    │     └──▶ writer(addr B)
//!             writer exits (supervision) ──┘    │
//!             EndpointTerminated events ────────┘
//! ```
//!
//! All routing table changes happen on the dispatch task, so per-address
//! submission order is preserved. Writer exits are supervised:
//! - `Stopped` → forget the writer; the next delivery creates a fresh one
//! - `SendFailed` → replace it, seeded with the requeued batch. The first
//!   replacement starts immediately; further ones in a row that wrote
//!   nothing wait out the retry backoff before connecting.
//! - `Failed` → replace it immediately, seeded with its pending mailbox
//!
//! Terminated events name the writer generation they came from; an event
//! from an earlier generation is ignored.

use crate::backoff::BackoffPolicy;
use crate::config::RemoteConfig;
use crate::events::RemoteEvent;
use crate::protocol::DeliverRequest;
use crate::registry::RemoteRoute;
use crate::system::SystemHandle;
use crate::transport::Connector;
use crate::writer::{DeliverError, EndpointWriter, WriterExit, WriterHandle};
use crate::{RemoteError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Live writer for one address
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    pub generation: u64,
    pub writer: WriterHandle,
}

enum ManagerCommand {
    WriterExited {
        address: String,
        generation: u64,
        exit: WriterExit,
    },
    Restart {
        address: String,
        reason: String,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

struct Channels {
    deliveries: mpsc::Sender<DeliverRequest>,
    commands: mpsc::UnboundedSender<ManagerCommand>,
}

/// Supervises the per-address endpoint writers
pub struct EndpointManager {
    system: SystemHandle,
    config: Arc<RemoteConfig>,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffPolicy>,
    endpoints: Arc<DashMap<String, EndpointHandle>>,
    channels: Mutex<Option<Channels>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl EndpointManager {
    pub fn new(system: SystemHandle, config: Arc<RemoteConfig>, connector: Arc<dyn Connector>) -> Self {
        let backoff = config.backoff_policy();
        Self {
            system,
            config,
            connector,
            backoff,
            endpoints: Arc::new(DashMap::new()),
            channels: Mutex::new(None),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start the dispatch task. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RemoteError::Stopped);
        }
        let mut channels = self.channels.lock();
        if channels.is_some() {
            return Ok(());
        }

        let (deliveries, delivery_rx) = mpsc::channel(self.config.endpoint_manager_queue_size.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let events = self.system.event_stream().subscribe();

        let dispatcher = Dispatcher {
            system: self.system.clone(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            backoff: self.backoff.clone(),
            endpoints: self.endpoints.clone(),
            commands: commands.clone(),
            next_generation: 0,
            send_failures: HashMap::new(),
        };
        *self.task.lock() = Some(tokio::spawn(dispatcher.run(delivery_rx, command_rx, events)));
        *channels = Some(Channels { deliveries, commands });

        info!("Started endpoint manager");
        Ok(())
    }

    /// Queue a delivery for its target's endpoint. Never fails: a request
    /// that cannot be queued is dead-lettered.
    pub fn remote_deliver(&self, request: DeliverRequest) {
        let sender = self.channels.lock().as_ref().map(|c| c.deliveries.clone());
        let Some(sender) = sender else {
            debug!(target_pid = %request.target, "Endpoint manager not running");
            self.system.registry().dead_letter(request);
            return;
        };

        match sender.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(target_pid = %request.target, "Endpoint manager queue full, dropping to dead letters");
                self.system.registry().dead_letter(request);
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                self.system.registry().dead_letter(request);
            }
        }
    }

    /// Fail the writer for `address` so it is replaced by a fresh instance
    pub fn restart_endpoint(&self, address: impl Into<String>, reason: impl Into<String>) {
        if let Some(channels) = self.channels.lock().as_ref() {
            let _ = channels.commands.send(ManagerCommand::Restart {
                address: address.into(),
                reason: reason.into(),
            });
        }
    }

    /// Addresses with a live writer
    pub fn endpoints(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn is_running(&self) -> bool {
        self.channels.lock().is_some()
    }

    /// Stop every writer and the dispatch task. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let channels = self.channels.lock().take();
        let Some(channels) = channels else {
            return;
        };

        info!("Stopping endpoint manager");
        let (done, done_rx) = oneshot::channel();
        if channels.commands.send(ManagerCommand::Stop { done }).is_ok() {
            let _ = done_rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Endpoint manager task failed");
            }
        }
        info!("Stopped endpoint manager");
    }
}

impl RemoteRoute for EndpointManager {
    fn route(&self, request: DeliverRequest) {
        self.remote_deliver(request);
    }
}

/// State owned by the dispatch task
struct Dispatcher {
    system: SystemHandle,
    config: Arc<RemoteConfig>,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffPolicy>,
    endpoints: Arc<DashMap<String, EndpointHandle>>,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    next_generation: u64,
    /// Consecutive send-failure restarts per address with nothing written
    send_failures: HashMap<String, u32>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut deliveries: mpsc::Receiver<DeliverRequest>,
        mut commands: mpsc::UnboundedReceiver<ManagerCommand>,
        mut events: broadcast::Receiver<RemoteEvent>,
    ) {
        let batch_size = self.config.endpoint_manager_batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size.min(1024));

        loop {
            tokio::select! {
                biased;

                Some(command) = commands.recv() => {
                    if let ManagerCommand::Stop { done } = command {
                        self.shutdown(&mut deliveries);
                        let _ = done.send(());
                        break;
                    }
                    self.handle_command(command);
                }

                event = events.recv() => match event {
                    Ok(RemoteEvent::EndpointTerminated { address, generation }) => {
                        self.handle_terminated(&address, generation)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Endpoint manager lagged behind event stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },

                received = deliveries.recv_many(&mut batch, batch_size) => {
                    if received == 0 {
                        break;
                    }
                    for request in batch.drain(..) {
                        self.route(request);
                    }
                }
            }
        }
        debug!("Endpoint manager dispatch loop finished");
    }

    fn route(&mut self, request: DeliverRequest) {
        let address = request.target.address.clone();
        let handle = self.writer_for(&address);

        let request = match handle.writer.try_deliver(request) {
            Ok(()) => return,
            Err(DeliverError::Full(request)) => {
                warn!(address = %address, "Endpoint writer queue full, dropping to dead letters");
                self.system.registry().dead_letter(request);
                return;
            }
            Err(DeliverError::Closed(request)) => request,
        };

        // The writer is on its way out; its exit will be supervised
        // separately, new traffic goes to a fresh instance
        self.endpoints.remove(&address);
        let handle = self.spawn_writer(&address, Vec::new(), Duration::ZERO);
        if let Err(DeliverError::Full(request) | DeliverError::Closed(request)) = handle.writer.try_deliver(request) {
            self.system.registry().dead_letter(request);
        }
    }

    fn writer_for(&mut self, address: &str) -> EndpointHandle {
        if let Some(handle) = self.endpoints.get(address) {
            return handle.clone();
        }
        self.spawn_writer(address, Vec::new(), Duration::ZERO)
    }

    fn spawn_writer(&mut self, address: &str, seed: Vec<DeliverRequest>, delay: Duration) -> EndpointHandle {
        self.next_generation += 1;
        let generation = self.next_generation;

        let (writer, handle) = EndpointWriter::new(
            address,
            self.system.clone(),
            self.config.clone(),
            self.connector.clone(),
            self.backoff.clone(),
        );
        let join = writer
            .with_seed(seed)
            .with_generation(generation)
            .with_start_delay(delay)
            .spawn();

        let endpoint = EndpointHandle {
            generation,
            writer: handle,
        };
        self.endpoints.insert(address.to_string(), endpoint.clone());
        debug!(address = %address, generation, "Spawned endpoint writer");

        let commands = self.commands.clone();
        let system = self.system.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            let exit = match join.await {
                Ok(exit) => exit,
                Err(e) => WriterExit::Failed {
                    error: RemoteError::stream(address.as_str(), format!("endpoint writer task failed: {}", e)),
                    pending: Vec::new(),
                },
            };
            let command = ManagerCommand::WriterExited {
                address,
                generation,
                exit,
            };
            if let Err(mpsc::error::SendError(command)) = commands.send(command) {
                // Manager already gone; nothing will restart this endpoint
                if let ManagerCommand::WriterExited { exit, .. } = command {
                    dead_letter_exit(&system, exit);
                }
            }
        });

        endpoint
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::WriterExited {
                address,
                generation,
                exit,
            } => self.handle_exit(address, generation, exit),
            ManagerCommand::Restart { address, reason } => {
                if let Some(handle) = self.endpoints.get(&address) {
                    handle.writer.restart_after_connect_failure(reason);
                }
            }
            ManagerCommand::Stop { .. } => {}
        }
    }

    fn handle_exit(&mut self, address: String, generation: u64, exit: WriterExit) {
        let current = self
            .endpoints
            .get(&address)
            .map(|h| h.generation == generation)
            .unwrap_or(false);

        let (carried, delay) = match exit {
            WriterExit::Stopped => {
                debug!(address = %address, generation, "Endpoint writer stopped");
                if current {
                    self.endpoints.remove(&address);
                    self.send_failures.remove(&address);
                }
                return;
            }
            WriterExit::SendFailed { requeued, sent } => {
                let failures = self.send_failures.entry(address.clone()).or_insert(0);
                if sent > 0 {
                    *failures = 0;
                }
                *failures += 1;
                let delay = restart_delay(self.backoff.as_ref(), *failures);
                info!(
                    address = %address,
                    generation,
                    requeued = requeued.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Restarting endpoint writer after send failure"
                );
                (requeued, delay)
            }
            WriterExit::Failed { error, pending } => {
                warn!(address = %address, generation, error = %error, "Endpoint writer failed, restarting");
                (pending, Duration::ZERO)
            }
        };

        match self.endpoints.get(&address).map(|h| h.clone()) {
            Some(handle) if !current => {
                // A newer writer already serves this address
                for request in carried {
                    if let Err(DeliverError::Full(request) | DeliverError::Closed(request)) =
                        handle.writer.try_deliver(request)
                    {
                        self.system.registry().dead_letter(request);
                    }
                }
            }
            _ => {
                self.spawn_writer(&address, carried, delay);
            }
        }
    }

    fn handle_terminated(&mut self, address: &str, generation: Option<u64>) {
        let Some(handle) = self.endpoints.get(address) else {
            return;
        };
        if matches!(generation, Some(g) if g != handle.generation) {
            debug!(address = %address, stale = ?generation, current = handle.generation, "Ignoring terminated event from replaced writer");
            return;
        }
        info!(address = %address, generation = handle.generation, "Endpoint terminated, stopping writer");
        handle.writer.terminate();
    }

    fn shutdown(&mut self, deliveries: &mut mpsc::Receiver<DeliverRequest>) {
        for endpoint in self.endpoints.iter() {
            endpoint.writer.stop();
        }
        self.endpoints.clear();
        self.send_failures.clear();

        deliveries.close();
        let mut leftovers = 0;
        while let Ok(request) = deliveries.try_recv() {
            self.system.registry().dead_letter(request);
            leftovers += 1;
        }
        if leftovers > 0 {
            debug!(count = leftovers, "Dead-lettered queued deliveries on stop");
        }
    }
}

/// Delay before the `failures`-th consecutive send-failure restart
fn restart_delay(backoff: &dyn BackoffPolicy, failures: u32) -> Duration {
    match failures {
        0 | 1 => Duration::ZERO,
        n => backoff.delay(n - 1),
    }
}

fn dead_letter_exit(system: &SystemHandle, exit: WriterExit) {
    let requests = match exit {
        WriterExit::Stopped => return,
        WriterExit::SendFailed { requeued, .. } => requeued,
        WriterExit::Failed { pending, .. } => pending,
    };
    for request in requests {
        system.registry().dead_letter(request);
    }
}
