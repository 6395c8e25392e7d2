//! Remote Configuration
//!
//! Immutable snapshot of remoting tunables, built once at startup and shared
//! read-only (`Arc<RemoteConfig>`) by the server, the endpoint manager and
//! every writer.
//!
//! Loaded from TOML with `REMOTE_` environment overrides, or assembled in
//! code with the `with_*` builders:
//!
//! ```rust
//! use actor_remote::RemoteConfig;
//!
//! let config = RemoteConfig::new("127.0.0.1", 8090)
//!     .with_advertised_host("node-a.internal:8090")
//!     .with_max_retry_count(3);
//! assert_eq!(config.address(), "127.0.0.1:8090");
//! ```

use crate::backoff::{BackoffPolicy, RetryBackoff};
use crate::{RemoteError, Result};
use anyhow::Context;
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Transport scheme for outbound endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Cleartext
    Http,
    /// TLS; requires client TLS material and a TLS-capable connector
    Https,
}

impl Scheme {
    pub fn allows_cleartext(&self) -> bool {
        matches!(self, Scheme::Http)
    }
}

/// PEM material for one side of a TLS connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

/// Inbound side timeouts and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Bound on receiving the handshake frame
    pub read_header_timeout_ms: u64,
    /// Idle bound between inbound frames, 0 disables
    pub read_timeout_ms: u64,
    /// Bound on each outbound frame written by the reader, 0 disables
    pub write_timeout_ms: u64,
    /// Size limit of the handshake frame
    pub max_header_bytes: usize,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_header_timeout_ms: 1_000,
            read_timeout_ms: 5 * 60 * 1_000,
            write_timeout_ms: 5 * 60 * 1_000,
            max_header_bytes: 8 * 1024, // 8KiB
            tls: None,
        }
    }
}

impl ServerOptions {
    pub fn read_header_timeout(&self) -> Duration {
        Duration::from_millis(self.read_header_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        non_zero(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero(self.write_timeout_ms)
    }
}

/// Outbound side timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Bound on dialing the remote address
    pub connect_timeout_ms: u64,
    /// Bound on awaiting the `ConnectResponse`, 0 disables
    pub read_idle_timeout_ms: u64,
    /// Bound on each batch write, 0 disables
    pub write_byte_timeout_ms: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_idle_timeout_ms: 15_000,
            write_byte_timeout_ms: 0,
            tls: None,
        }
    }
}

impl ClientOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Option<Duration> {
        non_zero(self.read_idle_timeout_ms)
    }

    pub fn write_byte_timeout(&self) -> Option<Duration> {
        non_zero(self.write_byte_timeout_ms)
    }
}

/// Cross-origin policy handed to HTTP front-ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsPolicy {
    /// `*` allows every origin
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["HEAD", "GET", "POST", "PUT", "PATCH", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: vec!["*".to_string()],
            exposed_headers: [
                "Accept",
                "Accept-Encoding",
                "Accept-Post",
                "Connect-Accept-Encoding",
                "Connect-Content-Encoding",
                "Content-Encoding",
                "Grpc-Accept-Encoding",
                "Grpc-Encoding",
                "Grpc-Message",
                "Grpc-Status",
                "Grpc-Status-Details-Bin",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            max_age_secs: 2 * 60 * 60,
        }
    }
}

impl CorsPolicy {
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }
}

/// Remoting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable `host:port`, overrides the bound address
    pub advertised_host: Option<String>,
    pub endpoint_writer_batch_size: usize,
    pub endpoint_writer_queue_size: usize,
    pub endpoint_manager_batch_size: usize,
    pub endpoint_manager_queue_size: usize,
    pub max_retry_count: u32,
    pub retry_backoff: RetryBackoff,
    pub scheme: Scheme,
    /// Bounded wait for an orderly server shutdown
    pub shutdown_timeout_ms: u64,
    pub max_frame_size: usize,
    pub server: ServerOptions,
    pub client: ClientOptions,
    pub cors: CorsPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            advertised_host: None,
            endpoint_writer_batch_size: 1_000,
            endpoint_writer_queue_size: 1_000_000,
            endpoint_manager_batch_size: 1_000,
            endpoint_manager_queue_size: 1_000_000,
            max_retry_count: 5,
            retry_backoff: RetryBackoff::default(),
            scheme: Scheme::Http,
            shutdown_timeout_ms: 10_000,
            max_frame_size: crate::protocol::DEFAULT_MAX_FRAME_SIZE,
            server: ServerOptions::default(),
            client: ClientOptions::default(),
            cors: CorsPolicy::default(),
        }
    }
}

impl RemoteConfig {
    /// Defaults bound to `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Load from a TOML file with `REMOTE_` environment overrides
    /// (nested keys use `__`, e.g. `REMOTE_CLIENT__CONNECT_TIMEOUT_MS`)
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading remote configuration");

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("REMOTE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build remote configuration")?;

        let config: RemoteConfig = config
            .try_deserialize()
            .context("Failed to deserialize remote configuration")?;
        config.validate().context("Invalid remote configuration")?;
        Ok(config)
    }

    /// Bind address as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RemoteError::configuration("host must not be empty", Some("host")));
        }
        let sizes = [
            ("endpoint_writer_batch_size", self.endpoint_writer_batch_size),
            ("endpoint_writer_queue_size", self.endpoint_writer_queue_size),
            ("endpoint_manager_batch_size", self.endpoint_manager_batch_size),
            ("endpoint_manager_queue_size", self.endpoint_manager_queue_size),
            ("max_frame_size", self.max_frame_size),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(RemoteError::configuration(format!("{} must be positive", field), Some(field)));
            }
        }
        if self.max_retry_count == 0 {
            return Err(RemoteError::configuration(
                "max_retry_count must be at least 1",
                Some("max_retry_count"),
            ));
        }
        if self.server.max_header_bytes == 0 {
            return Err(RemoteError::configuration(
                "max_header_bytes must be positive",
                Some("server.max_header_bytes"),
            ));
        }
        if self.scheme == Scheme::Https && self.client.tls.is_none() {
            return Err(RemoteError::configuration(
                "https scheme requires client TLS material",
                Some("client.tls"),
            ));
        }
        if let Some(advertised) = &self.advertised_host {
            if advertised.is_empty() {
                return Err(RemoteError::configuration(
                    "advertised_host must not be empty when set",
                    Some("advertised_host"),
                ));
            }
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn backoff_policy(&self) -> Arc<dyn BackoffPolicy> {
        self.retry_backoff.build()
    }

    pub fn with_advertised_host(mut self, advertised_host: impl Into<String>) -> Self {
        self.advertised_host = Some(advertised_host.into());
        self
    }

    pub fn with_endpoint_writer_batch_size(mut self, batch_size: usize) -> Self {
        self.endpoint_writer_batch_size = batch_size;
        self
    }

    pub fn with_endpoint_writer_queue_size(mut self, queue_size: usize) -> Self {
        self.endpoint_writer_queue_size = queue_size;
        self
    }

    pub fn with_endpoint_manager_batch_size(mut self, batch_size: usize) -> Self {
        self.endpoint_manager_batch_size = batch_size;
        self
    }

    pub fn with_endpoint_manager_queue_size(mut self, queue_size: usize) -> Self {
        self.endpoint_manager_queue_size = queue_size;
        self
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: RetryBackoff) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_server_options(mut self, options: ServerOptions) -> Self {
        self.server = options;
        self
    }

    pub fn with_client_options(mut self, options: ClientOptions) -> Self {
        self.client = options;
        self
    }

    pub fn with_server_tls(mut self, tls: TlsConfig) -> Self {
        self.server.tls = Some(tls);
        self
    }

    pub fn with_client_tls(mut self, tls: TlsConfig) -> Self {
        self.client.tls = Some(tls);
        self
    }

    pub fn with_cors(mut self, cors: CorsPolicy) -> Self {
        self.cors = cors;
        self
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
