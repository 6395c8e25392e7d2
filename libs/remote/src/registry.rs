//! Process Registry
//!
//! Resolves whether a PID lives on this node and routes deliveries
//! accordingly: local PIDs go to the local dispatcher, remote PIDs go to the
//! registered remote route (the endpoint manager once the server is
//! started). With no route registered, remote deliveries become dead
//! letters.

use crate::events::{EventStream, RemoteEvent};
use crate::protocol::{DeliverRequest, MessageHeader, Pid};
use crate::serialization::{Payload, BINCODE_SERIALIZER_ID};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Address used before the server has bound one
pub const NO_HOST: &str = "nonhost";

/// Wire type name of `DeadLetterResponse`
pub const DEAD_LETTER_RESPONSE_TYPE: &str = "actor.DeadLetterResponse";

/// Reply sent to a sender whose message could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterResponse {
    pub target: Pid,
}

/// One message handed to the local actor runtime
#[derive(Clone)]
pub struct LocalEnvelope {
    pub target: Pid,
    pub sender: Option<Pid>,
    pub header: Option<MessageHeader>,
    pub message: Payload,
}

impl fmt::Debug for LocalEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEnvelope")
            .field("target", &self.target)
            .field("sender", &self.sender)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Local actor runtime entry point
pub trait LocalDispatcher: Send + Sync {
    fn dispatch(&self, envelope: LocalEnvelope);
}

/// Outbound route for PIDs owned by other nodes
pub trait RemoteRoute: Send + Sync {
    fn route(&self, request: DeliverRequest);
}

/// Address resolution and delivery routing for one actor system
pub struct ProcessRegistry {
    address: RwLock<String>,
    local: Arc<dyn LocalDispatcher>,
    remote: RwLock<Option<Arc<dyn RemoteRoute>>>,
    event_stream: EventStream,
}

impl ProcessRegistry {
    pub fn new(local: Arc<dyn LocalDispatcher>, event_stream: EventStream) -> Self {
        Self {
            address: RwLock::new(NO_HOST.to_string()),
            local,
            remote: RwLock::new(None),
            event_stream,
        }
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    pub fn set_address(&self, address: impl Into<String>) {
        *self.address.write() = address.into();
    }

    /// Install the resolver for non-local PIDs
    pub fn register_remote_route(&self, route: Arc<dyn RemoteRoute>) {
        *self.remote.write() = Some(route);
    }

    pub fn clear_remote_route(&self) {
        *self.remote.write() = None;
    }

    pub fn is_local(&self, pid: &Pid) -> bool {
        pid.address == NO_HOST || *self.address.read() == pid.address
    }

    /// Route one delivery by target address
    pub fn send(&self, request: DeliverRequest) {
        if self.is_local(&request.target) {
            trace!(target_pid = %request.target, "Dispatching locally");
            self.local.dispatch(LocalEnvelope {
                target: request.target,
                sender: request.sender,
                header: request.header,
                message: request.message,
            });
            return;
        }

        let route = self.remote.read().clone();
        match route {
            Some(route) => route.route(request),
            None => {
                debug!(target_pid = %request.target, "No remote route registered");
                self.dead_letter(request);
            }
        }
    }

    /// Hand a message straight to the local runtime
    pub fn dispatch_local(&self, envelope: LocalEnvelope) {
        self.local.dispatch(envelope);
    }

    /// Terminal handling for an undeliverable request: a `DeadLetterResponse`
    /// to the sender if there is one, otherwise a `DeadLetter` event
    pub fn dead_letter(&self, request: DeliverRequest) {
        match request.sender {
            Some(sender) => {
                debug!(sender = %sender, target_pid = %request.target, "Sending dead letter response");
                let response = DeadLetterResponse {
                    target: request.target,
                };
                self.send(DeliverRequest::new(sender, Arc::new(response), BINCODE_SERIALIZER_ID));
            }
            None => self.event_stream.publish(RemoteEvent::DeadLetter {
                message: request.message,
                sender: None,
                target: request.target,
            }),
        }
    }
}
