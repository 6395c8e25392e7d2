//! Remoting Error Types
//!
//! Error taxonomy for the endpoint lifecycle and the batched wire protocol.
//! None of these ever reach the caller of `Remote::send_message`: connect and
//! stream failures surface as published endpoint events, per-message failures
//! are logged and skipped, and undeliverable requests become dead letters.

use thiserror::Error;

/// Main remoting error type
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Dial or handshake failure for an outbound endpoint
    #[error("Connect error: {message} (address: {address})")]
    Connect {
        address: String,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected frame or malformed batch
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Read/write failure on an established stream
    #[error("Stream error: {message} (address: {address})")]
    Stream { address: String, message: String },

    /// Outbound frame over the size limit; nothing was written
    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Batch write failure
    #[error("Send error: {message} (address: {address})")]
    Send { address: String, message: String },

    /// Per-message serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Operation exceeded its bounded wait
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// Lifecycle call made before `start`
    #[error("Remote has not been started")]
    NotStarted,

    /// Lifecycle call made after `shutdown`
    #[error("Remote has been shut down")]
    Stopped,

    /// Writer was asked to restart after exhausting its connect attempts
    #[error("Restart requested after connect failure: {reason}")]
    RestartAfterConnectFailure { reason: String },
}

/// Result type alias for remoting operations
pub type Result<T> = std::result::Result<T, RemoteError>;

impl RemoteError {
    /// Create a connect error
    pub fn connect(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            address: address.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connect error with source
    pub fn connect_with_source(
        address: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connect {
            address: address.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a stream error
    pub fn stream(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a send error
    pub fn send(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Send {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Whether the error counts as a failed connect attempt
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect { .. }
                | RemoteError::Protocol { .. }
                | RemoteError::Timeout { .. }
                | RemoteError::Io { .. }
                | RemoteError::Stream { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RemoteError::Connect { .. } => "connect",
            RemoteError::Protocol { .. } | RemoteError::FrameTooLarge { .. } => "protocol",
            RemoteError::Stream { .. } => "stream",
            RemoteError::Send { .. } => "send",
            RemoteError::Serialization(_) => "serialization",
            RemoteError::Configuration { .. } => "configuration",
            RemoteError::Timeout { .. } => "timeout",
            RemoteError::Io { .. } => "io",
            RemoteError::NotStarted | RemoteError::Stopped => "lifecycle",
            RemoteError::RestartAfterConnectFailure { .. } => "restart",
        }
    }
}

/// Convert standard I/O errors to remoting errors
impl From<std::io::Error> for RemoteError {
    fn from(error: std::io::Error) -> Self {
        RemoteError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert frame-level bincode errors to protocol errors
impl From<bincode::Error> for RemoteError {
    fn from(error: bincode::Error) -> Self {
        RemoteError::protocol(format!("Frame decoding failed: {}", error))
    }
}

/// Per-message serialization failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("No serializer registered for id {0}")]
    UnknownSerializer(i32),

    #[error("Message type {0} is not registered with serializer {1}")]
    UnregisteredType(String, i32),

    #[error("Type name '{0}' is not known to serializer {1}")]
    UnknownTypeName(String, i32),

    #[error("Failed to encode {type_name}: {message}")]
    Encode { type_name: String, message: String },

    #[error("Failed to decode {type_name}: {message}")]
    Decode { type_name: String, message: String },
}
