//! Message envelope, endpoint identity, and the type registry.
//!
//! This module contains:
//! - `Envelope`: the routed wrapper around a user payload
//! - `EndpointId`: case-insensitive (logical, instance) endpoint identity
//! - `TypeRegistry` / `BusMessage`: the startup-built dispatch table
//! - `HeaderMap`: the typed header set carried by every envelope

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod headers;
pub mod types;

pub use headers::{Header, HeaderError, HeaderMap};
pub use types::{
    BusMessage, HandledTypes, MessageKind, MessageTypeProvider, TypeDescriptor, TypeRegistry,
};

/// Logical endpoint name matching every bound endpoint.
pub const WILDCARD_ENDPOINT: &str = "*";

/// Errors raised when building or unpacking envelopes.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message type not registered: {0}")]
    UnknownType(String),

    #[error("message type already registered: {0}")]
    DuplicateType(String),

    #[error("failed to serialize payload for {type_key}: {source}")]
    Serialize {
        type_key: String,
        source: serde_json::Error,
    },

    #[error("failed to deserialize payload as {type_key}: {source}")]
    Deserialize {
        type_key: String,
        source: serde_json::Error,
    },
}

/// Unique message identity. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Endpoint identity: logical name (role) plus instance name (replica
/// discriminator). Equality and hashing are case-insensitive on both fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointId {
    logical: String,
    instance: String,
}

impl EndpointId {
    pub fn new(logical: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            logical: logical.into(),
            instance: instance.into(),
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Normalized form used as a persistence and topology key.
    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}",
            self.logical.to_ascii_lowercase(),
            self.instance.to_ascii_lowercase()
        )
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.split_once('/')
            .map(|(logical, instance)| Self::new(logical, instance))
    }
}

impl PartialEq for EndpointId {
    fn eq(&self, other: &Self) -> bool {
        self.logical.eq_ignore_ascii_case(&other.logical)
            && self.instance.eq_ignore_ascii_case(&other.instance)
    }
}

impl Eq for EndpointId {}

impl Hash for EndpointId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.logical.to_ascii_lowercase().hash(state);
        self.instance.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.logical, self.instance)
    }
}

/// Envelope around a user payload.
///
/// The id is immutable once assigned; headers are additive and overwritable
/// but never silently dropped. An envelope is cloned per handler invocation
/// so no handler can observe another's header mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    id: MessageId,
    type_key: String,
    dispatch_keys: Vec<String>,
    kind: MessageKind,
    payload: serde_json::Value,
    headers: HeaderMap,
}

impl Envelope {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    /// Contravariant group of the payload type, most derived first.
    pub fn dispatch_keys(&self) -> &[String] {
        &self.dispatch_keys
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.set(header);
        self
    }

    /// Route to a logical endpoint (or [`WILDCARD_ENDPOINT`]).
    pub fn with_target(self, target: impl Into<String>) -> Self {
        self.with_header(Header::TargetEndpoint(target.into()))
    }

    /// Copy handed to one handler invocation: same id and payload, fresh
    /// header set.
    pub fn clone_for_delivery(&self) -> Self {
        self.clone()
    }

    /// Deserialize the payload into its concrete type.
    pub fn payload_as<M: BusMessage>(&self) -> Result<M, MessageError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| MessageError::Deserialize {
            type_key: self.type_key.clone(),
            source,
        })
    }
}

impl TypeRegistry {
    /// Envelope factory. The payload type must be registered; the envelope
    /// is stamped with a fresh id and the type's contravariant group.
    pub fn envelope<M: BusMessage>(&self, message: &M) -> Result<Envelope, MessageError> {
        let descriptor = self
            .descriptor(M::TYPE_KEY)
            .ok_or_else(|| MessageError::UnknownType(M::TYPE_KEY.to_string()))?;
        let payload = serde_json::to_value(message).map_err(|source| MessageError::Serialize {
            type_key: M::TYPE_KEY.to_string(),
            source,
        })?;

        Ok(Envelope {
            id: MessageId::new(),
            type_key: descriptor.key.clone(),
            dispatch_keys: descriptor.group(),
            kind: descriptor.kind,
            payload,
            headers: HeaderMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        seq: u32,
    }

    impl BusMessage for Ping {
        const TYPE_KEY: &'static str = "Ping";
        const KIND: MessageKind = MessageKind::Command;
    }

    fn hash_of(id: &EndpointId) -> u64 {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_endpoint_identity_is_case_insensitive() {
        let a = EndpointId::new("OrdersEndpoint", "Worker-1");
        let b = EndpointId::new("ordersendpoint", "WORKER-1");

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn test_storage_key_roundtrip() {
        let id = EndpointId::new("Orders", "A");
        let back = EndpointId::from_storage_key(&id.storage_key()).unwrap();

        assert_eq!(id, back);
    }

    #[test]
    fn test_envelope_factory_requires_registration() {
        let registry = TypeRegistry::new();

        assert!(matches!(
            registry.envelope(&Ping { seq: 1 }),
            Err(MessageError::UnknownType(_))
        ));
    }

    #[test]
    fn test_envelope_payload_roundtrip() {
        let mut registry = TypeRegistry::new();
        registry.register::<Ping>().unwrap();

        let envelope = registry.envelope(&Ping { seq: 7 }).unwrap();

        assert_eq!(envelope.type_key(), "Ping");
        assert_eq!(envelope.kind(), MessageKind::Command);
        assert_eq!(envelope.payload_as::<Ping>().unwrap(), Ping { seq: 7 });
    }

    #[test]
    fn test_clone_for_delivery_isolates_headers() {
        let mut registry = TypeRegistry::new();
        registry.register::<Ping>().unwrap();

        let original = registry
            .envelope(&Ping { seq: 1 })
            .unwrap()
            .with_target("orders");
        let mut delivery = original.clone_for_delivery();
        delivery.headers_mut().set(Header::RetryCount(5));

        assert_eq!(delivery.id(), original.id());
        assert_eq!(original.headers().retry_count(), 0);
        assert_eq!(delivery.headers().retry_count(), 5);
    }
}
