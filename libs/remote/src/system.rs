//! Actor System Handle
//!
//! The collaborators the remoting core needs from its actor system, passed
//! explicitly to the server, manager, writers and reader. Cheap to clone.

use crate::events::EventStream;
use crate::registry::{LocalDispatcher, ProcessRegistry, DEAD_LETTER_RESPONSE_TYPE, DeadLetterResponse};
use crate::serialization::{SerializerRegistry, BINCODE_SERIALIZER_ID};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

struct SystemInner {
    id: String,
    event_stream: EventStream,
    registry: ProcessRegistry,
    serializers: SerializerRegistry,
}

/// Shared handle to one actor system's remoting collaborators
#[derive(Clone)]
pub struct SystemHandle {
    inner: Arc<SystemInner>,
}

impl SystemHandle {
    /// System with a random id and the default serializers
    pub fn new(local: Arc<dyn LocalDispatcher>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), local)
    }

    pub fn with_id(id: impl Into<String>, local: Arc<dyn LocalDispatcher>) -> Self {
        Self::with_serializers(id, local, SerializerRegistry::with_defaults())
    }

    pub fn with_serializers(id: impl Into<String>, local: Arc<dyn LocalDispatcher>, serializers: SerializerRegistry) -> Self {
        // Dead letter responses must always be able to cross the wire
        if let Err(e) = serializers.register_type::<DeadLetterResponse>(BINCODE_SERIALIZER_ID, DEAD_LETTER_RESPONSE_TYPE) {
            warn!(error = %e, "Dead letter responses cannot be serialized for remote senders");
        }

        let event_stream = EventStream::new();
        let registry = ProcessRegistry::new(local, event_stream.clone());
        Self {
            inner: Arc::new(SystemInner {
                id: id.into(),
                event_stream,
                registry,
                serializers,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn event_stream(&self) -> &EventStream {
        &self.inner.event_stream
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.inner.serializers
    }
}

impl std::fmt::Debug for SystemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemHandle")
            .field("id", &self.inner.id)
            .field("address", &self.inner.registry.address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Pid;
    use crate::test_utils::RecordingDispatcher;

    #[test]
    fn test_default_system_serializes_dead_letter_responses() {
        let system = SystemHandle::with_id("sys-a", Arc::new(RecordingDispatcher::new()));
        let response = DeadLetterResponse {
            target: Pid::new("node-b:2", "echo"),
        };

        let serialized = system.serializers().serialize(&response, BINCODE_SERIALIZER_ID).unwrap();
        assert_eq!(serialized.type_name, DEAD_LETTER_RESPONSE_TYPE);
    }

    #[test]
    fn test_registry_without_bincode_still_builds() {
        // Registration fails and is logged; the system stays usable
        let system = SystemHandle::with_serializers("sys-a", Arc::new(RecordingDispatcher::new()), SerializerRegistry::new());
        assert_eq!(system.id(), "sys-a");
        assert!(system.serializers().serialize(&1u32, BINCODE_SERIALIZER_ID).is_err());
    }
}
