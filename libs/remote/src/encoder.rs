//! Interning Batch Encoder
//!
//! Turns a run of `DeliverRequest`s into one `MessageBatch`. Type names,
//! targets and senders are interned into three append-only tables so each
//! distinct value crosses the wire once per batch:
//!
//! ```text
//! requests                          batch
//! ┌──────────────────────────┐      type_names: [Ping, Pong]
//! │ Ping → b/echo  from a/c1 │      targets:    [b/echo, b/log]
//! │ Pong → b/echo            │ ──▶  senders:    [a/c1]
//! │ Ping → b/log   from a/c1 │      envelopes:  (0,0,1) (1,0,0) (0,1,1)
//! └──────────────────────────┘
//! ```
//!
//! Table entries are normalized (request id zero); the original request ids
//! ride on each envelope. Sender index 0 means "no sender".

use crate::protocol::{DeliverRequest, MessageBatch, MessageEnvelope, Pid, PidKey};
use crate::serialization::SerializerRegistry;
use std::collections::HashMap;
use tracing::error;

/// One drained mailbox entry
#[derive(Debug, Clone)]
pub enum BatchItem {
    Deliver(DeliverRequest),
    /// The endpoint was reported terminated
    Terminated,
}

/// Result of scanning a drained run for a terminate signal
#[derive(Debug)]
pub enum Prepared {
    /// Deliveries to encode, in submission order
    Deliver(Vec<DeliverRequest>),
    /// A terminate signal was present; nothing may be sent and these
    /// requests were left unsent
    Terminate { unsent: Vec<DeliverRequest> },
}

/// Split a drained run into deliveries, aborting on any terminate signal
pub fn prepare(items: Vec<BatchItem>) -> Prepared {
    let terminated = items.iter().any(|item| matches!(item, BatchItem::Terminated));
    let requests = items
        .into_iter()
        .filter_map(|item| match item {
            BatchItem::Deliver(request) => Some(request),
            BatchItem::Terminated => None,
        })
        .collect();

    if terminated {
        Prepared::Terminate { unsent: requests }
    } else {
        Prepared::Deliver(requests)
    }
}

/// Encoded batch plus the requests that made it into it
#[derive(Debug)]
pub struct EncodedBatch {
    pub batch: MessageBatch,
    /// Requests behind `batch.envelopes`, same order
    pub encoded: Vec<DeliverRequest>,
    /// Requests dropped for serialization failures
    pub skipped: usize,
}

impl EncodedBatch {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Append-only value → index table backed by the wire sequence
struct InternTable<K, V> {
    index: HashMap<K, i32>,
    values: Vec<V>,
}

impl<K: std::hash::Hash + Eq, V> InternTable<K, V> {
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            values: Vec::new(),
        }
    }

    fn intern(&mut self, key: K, value: impl FnOnce() -> V) -> i32 {
        if let Some(&i) = self.index.get(&key) {
            return i;
        }
        let i = self.values.len() as i32;
        self.values.push(value());
        self.index.insert(key, i);
        i
    }

    fn into_values(self) -> Vec<V> {
        self.values
    }
}

/// Encodes request runs against a serializer registry
pub struct BatchEncoder<'a> {
    serializers: &'a SerializerRegistry,
}

impl<'a> BatchEncoder<'a> {
    pub fn new(serializers: &'a SerializerRegistry) -> Self {
        Self { serializers }
    }

    /// Encode `requests` in order. A message that fails to serialize is
    /// logged and left out; the rest of the run is still encoded.
    pub fn encode(&self, requests: Vec<DeliverRequest>) -> EncodedBatch {
        let mut type_names: InternTable<String, String> = InternTable::new();
        let mut targets: InternTable<PidKey, Pid> = InternTable::new();
        let mut senders: InternTable<PidKey, Pid> = InternTable::new();
        let mut envelopes = Vec::with_capacity(requests.len());
        let mut encoded = Vec::with_capacity(requests.len());
        let mut skipped = 0;

        for request in requests {
            let serialized = match self.serializers.serialize(request.message.as_ref(), request.serializer_id) {
                Ok(serialized) => serialized,
                Err(e) => {
                    error!(
                        target_pid = %request.target,
                        serializer_id = request.serializer_id,
                        error = %e,
                        "Failed to serialize message, skipping"
                    );
                    skipped += 1;
                    continue;
                }
            };

            let type_id = type_names.intern(serialized.type_name.clone(), || serialized.type_name.clone());
            let target = targets.intern(request.target.key(), || request.target.normalized());
            let (sender, sender_request_id) = match &request.sender {
                Some(pid) => (senders.intern(pid.key(), || pid.normalized()) + 1, pid.request_id),
                None => (0, 0),
            };

            envelopes.push(MessageEnvelope {
                message_header: request.wire_header(),
                message_data: serialized.bytes,
                type_id,
                target,
                sender,
                serializer_id: request.serializer_id,
                target_request_id: request.target.request_id,
                sender_request_id,
            });
            encoded.push(request);
        }

        EncodedBatch {
            batch: MessageBatch {
                type_names: type_names.into_values(),
                targets: targets.into_values(),
                senders: senders.into_values(),
                envelopes,
            },
            encoded,
            skipped,
        }
    }
}
