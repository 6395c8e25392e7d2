//! Actor Remoting Core
//!
//! Moves actor messages between nodes over long-lived framed streams.
//!
//! ```text
//! send ──► ProcessRegistry ──► EndpointManager ──► EndpointWriter (one per address)
//!                │                                       │ MessageBatch frames
//!                ▼                                       ▼
//!          local dispatch ◄── EndpointReader ◄── accepted stream (Remote server)
//! ```
//!
//! Outbound messages are grouped per destination address, interned into
//! compact batches and written by a dedicated writer task. Inbound streams
//! are handshaked, checked against the block list and decoded back into
//! local deliveries. Connection lifecycle changes are published on the
//! system's event stream.

pub mod backoff;
pub mod block_list;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod serialization;
pub mod server;
pub mod system;
pub mod test_utils;
pub mod transport;
pub mod writer;

// Re-export commonly used types
pub use block_list::BlockList;
pub use config::{RemoteConfig, Scheme};
pub use error::{RemoteError, Result, SerializationError};
pub use events::{EventStream, RemoteEvent};
pub use protocol::{DeliverRequest, MessageHeader, Pid};
pub use registry::{LocalDispatcher, LocalEnvelope, ProcessRegistry};
pub use serialization::{Payload, SerializerRegistry, BINCODE_SERIALIZER_ID, JSON_SERIALIZER_ID};
pub use server::{Remote, ShutdownOutcome};
pub use system::SystemHandle;
