//! Remote Endpoint Server
//!
//! `Remote` is the facade of the remoting core. `start` binds the listener,
//! publishes the advertised address to the process registry, starts the
//! endpoint manager (outbound) and the endpoint reader (inbound) and serves
//! accepted streams until `shutdown`.
//!
//! ## Shutdown
//! - graceful: suspend the reader, stop the manager, signal every inbound
//!   stream to disconnect, then wait up to `shutdown_timeout` for the accept
//!   loop and its streams to finish; past the deadline they are aborted and
//!   the outcome is `Forced`
//! - not graceful: abort everything immediately (`Killed`)

use crate::block_list::BlockList;
use crate::config::RemoteConfig;
use crate::manager::EndpointManager;
use crate::protocol::{DeliverRequest, MessageHeader, Pid};
use crate::reader::EndpointReader;
use crate::registry::RemoteRoute;
use crate::serialization::Payload;
use crate::system::SystemHandle;
use crate::transport::tcp::tcp_connection;
use crate::transport::{Connector, TcpConnector};
use crate::{RemoteError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// How a `shutdown` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Everything finished within the timeout
    Graceful,
    /// The timeout elapsed and the transport was force-closed
    Forced,
    /// Non-graceful shutdown
    Killed,
    /// The server was already shut down
    AlreadyStopped,
}

struct Running {
    local_addr: SocketAddr,
    manager: Arc<EndpointManager>,
    reader: Arc<EndpointReader>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

enum ServerState {
    Idle,
    Running(Running),
    Stopped,
}

/// Remoting facade for one actor system
pub struct Remote {
    system: SystemHandle,
    config: Arc<RemoteConfig>,
    block_list: BlockList,
    connector: Arc<dyn Connector>,
    custom_connector: bool,
    state: Mutex<ServerState>,
}

impl Remote {
    pub fn new(system: SystemHandle, config: RemoteConfig) -> Self {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self {
            system,
            config: Arc::new(config),
            block_list: BlockList::new(),
            connector,
            custom_connector: false,
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Replace the built-in cleartext TCP connector
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self.custom_connector = true;
        self
    }

    pub fn system(&self) -> &SystemHandle {
        &self.system
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn block_list(&self) -> &BlockList {
        &self.block_list
    }

    /// Advertised address once started
    pub async fn address(&self) -> Option<String> {
        match &*self.state.lock().await {
            ServerState::Running(_) => Some(self.system.registry().address()),
            _ => None,
        }
    }

    /// Bind and serve. Returns the bound socket address; a second call
    /// returns the address already bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match &*state {
            ServerState::Running(running) => return Ok(running.local_addr),
            ServerState::Stopped => return Err(RemoteError::Stopped),
            ServerState::Idle => {}
        }

        self.config.validate()?;
        if self.config.server.tls.is_some() {
            return Err(RemoteError::configuration(
                "built-in listener is cleartext; terminate TLS in front of it",
                Some("server.tls"),
            ));
        }
        if !self.config.scheme.allows_cleartext() && !self.connector.is_secure() {
            return Err(RemoteError::configuration(
                "https scheme requires a TLS-capable connector",
                Some("scheme"),
            ));
        }
        if self.custom_connector {
            debug!("Using injected connector");
        }

        let listener = TcpListener::bind(self.config.address()).await.map_err(|e| {
            RemoteError::connect_with_source(self.config.address(), "failed to bind listener", e)
        })?;
        let local_addr = listener.local_addr()?;
        let advertised = self
            .config
            .advertised_host
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let registry = self.system.registry();
        registry.set_address(advertised.clone());

        let manager = Arc::new(EndpointManager::new(
            self.system.clone(),
            self.config.clone(),
            self.connector.clone(),
        ));
        manager.start()?;
        registry.register_remote_route(manager.clone() as Arc<dyn RemoteRoute>);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = Arc::new(EndpointReader::new(
            self.system.clone(),
            self.config.clone(),
            self.block_list.clone(),
            shutdown_rx.clone(),
        ));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            reader.clone(),
            shutdown_rx,
            self.config.max_frame_size,
        ));

        info!(
            address = %advertised,
            bound = %local_addr,
            system_id = %self.system.id(),
            "Starting remote server"
        );

        *state = ServerState::Running(Running {
            local_addr,
            manager,
            reader,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop serving. Calling it before `start` is an error; calling it
    /// again after a shutdown returns `AlreadyStopped`.
    pub async fn shutdown(&self, graceful: bool) -> Result<ShutdownOutcome> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, ServerState::Stopped) {
            ServerState::Running(running) => running,
            ServerState::Idle => {
                *state = ServerState::Idle;
                return Err(RemoteError::NotStarted);
            }
            ServerState::Stopped => return Ok(ShutdownOutcome::AlreadyStopped),
        };

        let Running {
            manager,
            reader,
            shutdown,
            mut accept_task,
            ..
        } = running;
        self.system.registry().clear_remote_route();

        if !graceful {
            accept_task.abort();
            let _ = shutdown.send(true);
            manager.stop().await;
            info!("Remote server killed");
            return Ok(ShutdownOutcome::Killed);
        }

        reader.suspend(true);
        manager.stop().await;
        let _ = shutdown.send(true);

        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut accept_task).await {
            Ok(Ok(())) => {
                info!("Remote server shut down gracefully");
                Ok(ShutdownOutcome::Graceful)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Accept loop failed during shutdown");
                Ok(ShutdownOutcome::Graceful)
            }
            Err(_) => {
                accept_task.abort();
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Remote server shutdown timeout, forced close"
                );
                Ok(ShutdownOutcome::Forced)
            }
        }
    }

    /// Fire-and-forget send. Undeliverable messages become dead letters;
    /// nothing is reported to the caller.
    pub fn send_message(
        &self,
        target: Pid,
        header: Option<MessageHeader>,
        message: Payload,
        sender: Option<Pid>,
        serializer_id: i32,
    ) {
        let mut request = DeliverRequest::new(target, message, serializer_id);
        request.header = header;
        request.sender = sender;
        self.system.registry().send(request);
    }
}

/// Accept streams until shutdown, then let every stream finish
async fn accept_loop(
    listener: TcpListener,
    reader: Arc<EndpointReader>,
    mut shutdown: watch::Receiver<bool>,
    max_frame_size: usize,
) {
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    let reader = reader.clone();
                    let connection = tcp_connection(stream, peer.to_string(), max_frame_size);
                    streams.spawn(async move {
                        if let Err(e) = reader.serve(connection).await {
                            warn!(peer = %peer, error = %e, "Endpoint stream ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },

            Some(joined) = streams.join_next(), if !streams.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Endpoint stream task failed");
                }
            }
        }
    }

    drop(listener);
    debug!(streams = streams.len(), "Listener closed, draining endpoint streams");
    while let Some(joined) = streams.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Endpoint stream task failed");
        }
    }
}
