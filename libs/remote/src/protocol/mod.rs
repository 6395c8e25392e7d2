//! Remoting Wire Protocol
//!
//! Frames exchanged over one bidirectional endpoint stream. The first frame
//! in each direction is the handshake (`ConnectRequest` from the dialing
//! side, `ConnectResponse` back); after that both sides exchange
//! `MessageBatch` frames until either sends `DisconnectRequest` or drops the
//! stream.
//!
//! ```text
//! writer                               reader
//!   │ ── ConnectRequest{system_id} ──▶   │  block list check
//!   │ ◀── ConnectResponse{blocked} ───   │
//!   │ ── MessageBatch ──────────────▶    │  resolve + deliver locally
//!   │ ── MessageBatch ──────────────▶    │
//!   │ ◀── DisconnectRequest ──────────   │  orderly shutdown
//! ```

pub mod envelope;
pub mod frame;
pub mod pid;

pub use envelope::{DeliverRequest, InboundEnvelope, MessageBatch, MessageEnvelope, MessageHeader};
pub use frame::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
pub use pid::{Pid, PidKey};

use serde::{Deserialize, Serialize};

/// Handshake sent by the dialing node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Actor system id of the dialing node
    pub system_id: String,
    /// Advertised address of the dialing node
    pub address: String,
}

/// Handshake reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Actor system id of the accepting node
    pub member_id: String,
    /// The dialing system is on the accepting node's block list
    pub blocked: bool,
}

/// Every frame that can travel on an endpoint stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    MessageBatch(MessageBatch),
    DisconnectRequest,
}

impl RemoteMessage {
    /// Frame kind for logging
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteMessage::ConnectRequest(_) => "ConnectRequest",
            RemoteMessage::ConnectResponse(_) => "ConnectResponse",
            RemoteMessage::MessageBatch(_) => "MessageBatch",
            RemoteMessage::DisconnectRequest => "DisconnectRequest",
        }
    }
}
