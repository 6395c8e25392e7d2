//! Delivery Requests and Wire Envelopes
//!
//! `DeliverRequest` is the in-memory form of one outbound message; the
//! encoder turns a run of them into a `MessageBatch` whose envelopes refer to
//! three interning tables by index.
//!
//! ## Index conventions
//! - `type_id` and `target` index directly into `type_names` / `targets`
//! - `sender == 0` means no sender; otherwise `senders[sender - 1]`
//! - table entries are normalized (request id zero); the request ids travel
//!   on the envelope itself

use super::pid::Pid;
use crate::serialization::Payload;
use crate::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered string headers attached to a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub header_data: BTreeMap<String, String>,
}

impl MessageHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.header_data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.header_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header_data.is_empty()
    }
}

/// One outbound message addressed to a remote actor
#[derive(Clone)]
pub struct DeliverRequest {
    pub header: Option<MessageHeader>,
    pub message: Payload,
    pub target: Pid,
    pub sender: Option<Pid>,
    pub serializer_id: i32,
}

impl DeliverRequest {
    pub fn new(target: Pid, message: Payload, serializer_id: i32) -> Self {
        Self {
            header: None,
            message,
            target,
            sender: None,
            serializer_id,
        }
    }

    pub fn with_sender(mut self, sender: Pid) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_header(mut self, header: MessageHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Header as it goes on the wire: empty headers are omitted
    pub(crate) fn wire_header(&self) -> Option<MessageHeader> {
        self.header.as_ref().filter(|h| !h.is_empty()).cloned()
    }
}

impl fmt::Debug for DeliverRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverRequest")
            .field("target", &self.target)
            .field("sender", &self.sender)
            .field("serializer_id", &self.serializer_id)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Wire form of one message inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_header: Option<MessageHeader>,
    pub message_data: Vec<u8>,
    pub type_id: i32,
    pub target: i32,
    /// 0 = no sender, otherwise 1 + index into `senders`
    pub sender: i32,
    pub serializer_id: i32,
    pub target_request_id: u32,
    pub sender_request_id: u32,
}

/// Batched wire frame with its interning tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    pub type_names: Vec<String>,
    pub targets: Vec<Pid>,
    pub senders: Vec<Pid>,
    pub envelopes: Vec<MessageEnvelope>,
}

/// Envelope with every index resolved against its batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub header: Option<MessageHeader>,
    pub target: Pid,
    pub sender: Option<Pid>,
    pub type_name: String,
    pub serializer_id: i32,
    pub message_data: Vec<u8>,
}

impl MessageBatch {
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Resolve every envelope against the tables, restoring request ids.
    ///
    /// Any out-of-range index invalidates the whole batch.
    pub fn resolve(self) -> Result<Vec<InboundEnvelope>> {
        let MessageBatch {
            type_names,
            targets,
            senders,
            envelopes,
        } = self;

        envelopes
            .into_iter()
            .enumerate()
            .map(|(position, envelope)| {
                let type_name = lookup(&type_names, envelope.type_id, "type_id", position)?.clone();
                let target = lookup(&targets, envelope.target, "target", position)?
                    .clone()
                    .with_request_id(envelope.target_request_id);
                // Sender indices are shifted by one; 0 means no sender
                let sender = match envelope.sender {
                    0 => None,
                    index => {
                        let slot = index.checked_sub(1).unwrap_or(-1);
                        Some(
                            lookup(&senders, slot, "sender", position)?
                                .clone()
                                .with_request_id(envelope.sender_request_id),
                        )
                    }
                };

                Ok(InboundEnvelope {
                    header: envelope.message_header,
                    target,
                    sender,
                    type_name,
                    serializer_id: envelope.serializer_id,
                    message_data: envelope.message_data,
                })
            })
            .collect()
    }
}

fn lookup<'a, T>(table: &'a [T], index: i32, field: &str, position: usize) -> Result<&'a T> {
    usize::try_from(index)
        .ok()
        .and_then(|i| table.get(i))
        .ok_or_else(|| {
            RemoteError::protocol(format!(
                "Envelope {} has {} index {} outside table of {} entries",
                position,
                field,
                index,
                table.len()
            ))
        })
}
