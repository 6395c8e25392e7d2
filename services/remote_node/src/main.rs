//! Standalone remote node
//!
//! Usage:
//!   remote-node --config config/remote.toml
//!   remote-node --port 8090 --ping 127.0.0.1:8091
//!
//! Every node answers `Ping` with `Pong`, so two nodes pinging each other
//! exercise both directions of the remoting core.

use actor_remote::{
    LocalDispatcher, LocalEnvelope, Pid, Remote, RemoteConfig, ShutdownOutcome, SystemHandle,
    JSON_SERIALIZER_ID,
};
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NODE_ACTOR: &str = "node";

#[derive(Parser, Debug)]
#[command(name = "remote-node")]
#[command(about = "Actor remoting endpoint server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Address of a node to ping periodically
    #[arg(long)]
    ping: Option<String>,

    /// Ping interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    ping_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pong {
    seq: u64,
}

/// Hands every local delivery to the main loop
struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<LocalEnvelope>,
}

impl LocalDispatcher for ChannelDispatcher {
    fn dispatch(&self, envelope: LocalEnvelope) {
        if self.tx.send(envelope).is_err() {
            warn!("Node inbox closed, dropping delivery");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    info!(address = %config.address(), scheme = ?config.scheme, "Starting remote node");

    let (tx, mut inbox) = mpsc::unbounded_channel();
    let system = SystemHandle::new(Arc::new(ChannelDispatcher { tx }));
    system
        .serializers()
        .register_type::<Ping>(JSON_SERIALIZER_ID, "remote_node.Ping")
        .context("Failed to register Ping")?;
    system
        .serializers()
        .register_type::<Pong>(JSON_SERIALIZER_ID, "remote_node.Pong")
        .context("Failed to register Pong")?;

    let remote = Arc::new(Remote::new(system, config));
    let bound = remote.start().await.context("Failed to start remote server")?;
    let me = Pid::new(remote.system().registry().address(), NODE_ACTOR);
    info!(bound = %bound, system_id = %remote.system().id(), "Remote node ready");

    if let Some(peer) = args.ping.clone() {
        let remote = remote.clone();
        let me = me.clone();
        let interval = Duration::from_millis(args.ping_interval_ms.max(1));
        tokio::spawn(async move {
            let target = Pid::new(peer, NODE_ACTOR);
            let mut ticker = tokio::time::interval(interval);
            let mut seq = 0u64;
            loop {
                ticker.tick().await;
                seq += 1;
                remote.send_message(target.clone(), None, Arc::new(Ping { seq }), Some(me.clone()), JSON_SERIALIZER_ID);
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            Some(envelope) = inbox.recv() => handle(&remote, &me, envelope),
        }
    }

    match remote.shutdown(true).await {
        Ok(ShutdownOutcome::Forced) => warn!("Shutdown timed out, connections were force-closed"),
        Ok(outcome) => info!(outcome = ?outcome, "Remote node stopped"),
        Err(e) => error!(error = %e, "Shutdown failed"),
    }
    Ok(())
}

fn handle(remote: &Remote, me: &Pid, envelope: LocalEnvelope) {
    if let Some(ping) = envelope.message.downcast_ref::<Ping>() {
        info!(seq = ping.seq, from = ?envelope.sender, "Received ping");
        if let Some(sender) = envelope.sender {
            remote.send_message(sender, None, Arc::new(Pong { seq: ping.seq }), Some(me.clone()), JSON_SERIALIZER_ID);
        }
    } else if let Some(pong) = envelope.message.downcast_ref::<Pong>() {
        info!(seq = pong.seq, from = ?envelope.sender, "Received pong");
    } else {
        info!(target_pid = %envelope.target, sender = ?envelope.sender, "Received message");
    }
}

fn load_config(args: &Args) -> Result<RemoteConfig> {
    let mut config = match &args.config {
        Some(path) => RemoteConfig::load(path)?,
        None => RemoteConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate().context("Invalid remote configuration")?;
    Ok(config)
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
