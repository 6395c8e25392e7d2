//! Endpoint Event Stream
//!
//! Process-wide broadcast of endpoint lifecycle and dead-letter events.
//! Publishing is fire-and-forget: with no subscribers the event is dropped,
//! and a lagging subscriber loses the oldest events rather than blocking the
//! publisher.

use crate::protocol::Pid;
use crate::serialization::Payload;
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Default broadcast buffer per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events published by the remoting core
#[derive(Clone)]
pub enum RemoteEvent {
    /// Handshake with `address` completed
    EndpointConnected { address: String },
    /// Connection to `address` is gone (retry exhaustion, stream end or error).
    /// `generation` names the writer instance that lost it; `None` applies
    /// to whichever writer currently serves the address.
    EndpointTerminated {
        address: String,
        generation: Option<u64>,
    },
    /// A message could not be delivered and had no sender to notify
    DeadLetter {
        message: Payload,
        sender: Option<Pid>,
        target: Pid,
    },
}

impl RemoteEvent {
    /// Address carried by endpoint events
    pub fn address(&self) -> Option<&str> {
        match self {
            RemoteEvent::EndpointConnected { address } | RemoteEvent::EndpointTerminated { address, .. } => {
                Some(address)
            }
            RemoteEvent::DeadLetter { .. } => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, RemoteEvent::EndpointTerminated { .. })
    }
}

impl fmt::Debug for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteEvent::EndpointConnected { address } => {
                f.debug_struct("EndpointConnected").field("address", address).finish()
            }
            RemoteEvent::EndpointTerminated { address, generation } => f
                .debug_struct("EndpointTerminated")
                .field("address", address)
                .field("generation", generation)
                .finish(),
            RemoteEvent::DeadLetter { sender, target, .. } => f
                .debug_struct("DeadLetter")
                .field("sender", sender)
                .field("target", target)
                .finish_non_exhaustive(),
        }
    }
}

/// Broadcast surface shared by writers, the manager and supervisors
#[derive(Clone)]
pub struct EventStream {
    sender: broadcast::Sender<RemoteEvent>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: RemoteEvent) {
        trace!(event = ?event, "Publishing remote event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let stream = EventStream::new();
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();

        stream.publish(RemoteEvent::EndpointConnected {
            address: "node-b:2".to_string(),
        });

        assert_eq!(a.recv().await.unwrap().address(), Some("node-b:2"));
        assert_eq!(b.recv().await.unwrap().address(), Some("node-b:2"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let stream = EventStream::new();
        stream.publish(RemoteEvent::EndpointTerminated {
            address: "node-b:2".to_string(),
            generation: None,
        });
        assert_eq!(stream.subscriber_count(), 0);
    }
}
