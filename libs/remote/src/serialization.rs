//! Message Serialization
//!
//! Serializers are keyed by a serializer id carried on every envelope. Each
//! serializer maps between an in-memory message and `(bytes, type_name)`;
//! the type name is what the batch encoder interns.
//!
//! Two typed serializers ship with the crate:
//! - id `0`: bincode
//! - id `1`: JSON
//!
//! Message types must be registered with a serializer before they can cross
//! the wire:
//!
//! ```rust
//! use actor_remote::serialization::{SerializerRegistry, BINCODE_SERIALIZER_ID};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Ping { seq: u64 }
//!
//! let registry = SerializerRegistry::with_defaults();
//! registry.register_type::<Ping>(BINCODE_SERIALIZER_ID, "example.Ping").unwrap();
//! ```

use crate::error::SerializationError;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque in-memory message
pub type Payload = Arc<dyn Any + Send + Sync>;

pub const BINCODE_SERIALIZER_ID: i32 = 0;
pub const JSON_SERIALIZER_ID: i32 = 1;

/// Serialized message ready for an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedMessage {
    pub bytes: Vec<u8>,
    pub type_name: String,
}

/// Pluggable codec keyed by serializer id
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &(dyn Any + Send + Sync)) -> Result<SerializedMessage, SerializationError>;

    fn deserialize(&self, type_name: &str, bytes: &[u8]) -> Result<Payload, SerializationError>;
}

/// Wire format used by a `TypedSerializer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Bincode,
    Json,
}

type EncodeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Payload, String> + Send + Sync>;

struct TypeBinding {
    type_name: String,
    encode: EncodeFn,
}

#[derive(Default)]
struct TypeTable {
    by_type: HashMap<TypeId, TypeBinding>,
    by_name: HashMap<String, DecodeFn>,
}

/// Serializer for serde types registered under explicit type names
pub struct TypedSerializer {
    id: i32,
    format: WireFormat,
    types: RwLock<TypeTable>,
}

impl TypedSerializer {
    pub fn new(id: i32, format: WireFormat) -> Self {
        Self {
            id,
            format,
            types: RwLock::new(TypeTable::default()),
        }
    }

    pub fn bincode() -> Self {
        Self::new(BINCODE_SERIALIZER_ID, WireFormat::Bincode)
    }

    pub fn json() -> Self {
        Self::new(JSON_SERIALIZER_ID, WireFormat::Json)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Register `T` under `type_name`. Re-registering replaces the binding.
    pub fn register<T>(&self, type_name: impl Into<String>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let format = self.format;

        let encode: EncodeFn = Box::new(move |message| {
            let value = message
                .downcast_ref::<T>()
                .ok_or_else(|| "payload type does not match binding".to_string())?;
            match format {
                WireFormat::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
                WireFormat::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            }
        });
        let decode: DecodeFn = Box::new(move |bytes| {
            let value: T = match format {
                WireFormat::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string())?,
                WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string())?,
            };
            Ok(Arc::new(value) as Payload)
        });

        let mut types = self.types.write();
        types.by_type.insert(
            TypeId::of::<T>(),
            TypeBinding {
                type_name: type_name.clone(),
                encode,
            },
        );
        types.by_name.insert(type_name, decode);
    }
}

impl Serializer for TypedSerializer {
    fn serialize(&self, message: &(dyn Any + Send + Sync)) -> Result<SerializedMessage, SerializationError> {
        let types = self.types.read();
        let binding = types
            .by_type
            .get(&message.type_id())
            .ok_or_else(|| SerializationError::UnregisteredType(format!("{:?}", message.type_id()), self.id))?;

        let bytes = (binding.encode)(message).map_err(|message| SerializationError::Encode {
            type_name: binding.type_name.clone(),
            message,
        })?;

        Ok(SerializedMessage {
            bytes,
            type_name: binding.type_name.clone(),
        })
    }

    fn deserialize(&self, type_name: &str, bytes: &[u8]) -> Result<Payload, SerializationError> {
        let types = self.types.read();
        let decode = types
            .by_name
            .get(type_name)
            .ok_or_else(|| SerializationError::UnknownTypeName(type_name.to_string(), self.id))?;

        decode(bytes).map_err(|message| SerializationError::Decode {
            type_name: type_name.to_string(),
            message,
        })
    }
}

/// Serializers indexed by serializer id
pub struct SerializerRegistry {
    serializers: RwLock<HashMap<i32, Arc<dyn Serializer>>>,
    typed: RwLock<HashMap<i32, Arc<TypedSerializer>>>,
}

impl SerializerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            serializers: RwLock::new(HashMap::new()),
            typed: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the bincode (0) and JSON (1) serializers installed
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_typed(TypedSerializer::bincode());
        registry.register_typed(TypedSerializer::json());
        registry
    }

    /// Install a custom serializer under `id`
    pub fn register(&self, id: i32, serializer: Arc<dyn Serializer>) {
        self.typed.write().remove(&id);
        self.serializers.write().insert(id, serializer);
    }

    /// Install a typed serializer under its own id
    pub fn register_typed(&self, serializer: TypedSerializer) {
        let id = serializer.id();
        let serializer = Arc::new(serializer);
        self.serializers.write().insert(id, serializer.clone());
        self.typed.write().insert(id, serializer);
    }

    /// Bind `T` to `type_name` on the typed serializer `serializer_id`
    pub fn register_type<T>(&self, serializer_id: i32, type_name: impl Into<String>) -> Result<(), SerializationError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let typed = self.typed.read();
        let serializer = typed
            .get(&serializer_id)
            .ok_or(SerializationError::UnknownSerializer(serializer_id))?;
        serializer.register::<T>(type_name);
        Ok(())
    }

    pub fn serialize(
        &self,
        message: &(dyn Any + Send + Sync),
        serializer_id: i32,
    ) -> Result<SerializedMessage, SerializationError> {
        self.get(serializer_id)?.serialize(message)
    }

    pub fn deserialize(&self, type_name: &str, bytes: &[u8], serializer_id: i32) -> Result<Payload, SerializationError> {
        self.get(serializer_id)?.deserialize(type_name, bytes)
    }

    fn get(&self, serializer_id: i32) -> Result<Arc<dyn Serializer>, SerializationError> {
        self.serializers
            .read()
            .get(&serializer_id)
            .cloned()
            .ok_or(SerializationError::UnknownSerializer(serializer_id))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Unregistered;

    #[test]
    fn test_bincode_type_name_and_inverse() {
        let registry = SerializerRegistry::with_defaults();
        registry.register_type::<Ping>(BINCODE_SERIALIZER_ID, "test.Ping").unwrap();

        let serialized = registry.serialize(&Ping { seq: 7 }, BINCODE_SERIALIZER_ID).unwrap();
        assert_eq!(serialized.type_name, "test.Ping");

        let payload = registry
            .deserialize(&serialized.type_name, &serialized.bytes, BINCODE_SERIALIZER_ID)
            .unwrap();
        assert_eq!(payload.downcast_ref::<Ping>(), Some(&Ping { seq: 7 }));
    }

    #[test]
    fn test_json_bytes_are_json() {
        let registry = SerializerRegistry::with_defaults();
        registry.register_type::<Ping>(JSON_SERIALIZER_ID, "test.Ping").unwrap();

        let serialized = registry.serialize(&Ping { seq: 3 }, JSON_SERIALIZER_ID).unwrap();
        assert_eq!(serialized.bytes, br#"{"seq":3}"#.to_vec());
    }

    #[test]
    fn test_serializers_are_independent() {
        let registry = SerializerRegistry::with_defaults();
        registry.register_type::<Ping>(BINCODE_SERIALIZER_ID, "test.Ping").unwrap();

        let result = registry.serialize(&Ping { seq: 1 }, JSON_SERIALIZER_ID);
        assert!(matches!(result, Err(SerializationError::UnregisteredType(_, JSON_SERIALIZER_ID))));
    }

    #[test]
    fn test_unknown_serializer_and_type() {
        let registry = SerializerRegistry::with_defaults();

        assert_eq!(
            registry.serialize(&Unregistered, 42).unwrap_err(),
            SerializationError::UnknownSerializer(42)
        );
        assert!(registry.serialize(&Unregistered, BINCODE_SERIALIZER_ID).is_err());
        assert_eq!(
            registry.deserialize("nope", &[], BINCODE_SERIALIZER_ID).unwrap_err(),
            SerializationError::UnknownTypeName("nope".to_string(), BINCODE_SERIALIZER_ID)
        );
        assert!(registry.register_type::<Ping>(42, "test.Ping").is_err());
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let registry = SerializerRegistry::with_defaults();
        registry.register_type::<Ping>(JSON_SERIALIZER_ID, "test.Ping").unwrap();

        let result = registry.deserialize("test.Ping", b"not json", JSON_SERIALIZER_ID);
        assert!(matches!(result, Err(SerializationError::Decode { .. })));
    }
}
