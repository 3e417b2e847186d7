//! Message type registry: the startup-built dispatch table.
//!
//! Every message type routed through the bus is registered here once, before
//! the topology is bound. A registered type carries its contravariant group
//! (itself plus every base type it may be handled as), so dispatch never
//! inspects payloads at runtime.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::MessageError;

/// Role of a message in the request/response taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Command,
    Event,
    Query,
    Reply,
}

/// A payload type routable through the bus.
///
/// `dispatch_keys` lists every type key the message may be handled as, most
/// derived first. The default is the concrete key alone; types participating
/// in a hierarchy override it to append their base keys.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_KEY: &'static str;
    const KIND: MessageKind;

    fn dispatch_keys() -> Vec<&'static str> {
        vec![Self::TYPE_KEY]
    }
}

/// Registered shape of a message type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub key: String,
    /// Base type keys this type is assignable to, excluding `key` itself.
    pub parents: Vec<String>,
    pub kind: MessageKind,
}

impl TypeDescriptor {
    /// The contravariant group: the type itself followed by its bases.
    pub fn group(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.parents.len() + 1);
        keys.push(self.key.clone());
        keys.extend(self.parents.iter().cloned());
        keys
    }
}

/// Supplies the destination type keys a handler is bound to.
pub trait MessageTypeProvider: Send + Sync {
    fn handled_types(&self) -> Vec<String>;
}

/// Plain list of handled type keys.
pub struct HandledTypes(pub Vec<String>);

impl HandledTypes {
    pub fn of<M: BusMessage>() -> Self {
        Self(vec![M::TYPE_KEY.to_string()])
    }

    pub fn and<M: BusMessage>(mut self) -> Self {
        self.0.push(M::TYPE_KEY.to_string());
        self
    }
}

impl MessageTypeProvider for HandledTypes {
    fn handled_types(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// Type key → descriptor table, populated once at startup.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_key: HashMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type. Registering the same key twice is a
    /// configuration error.
    pub fn register<M: BusMessage>(&mut self) -> Result<(), MessageError> {
        let keys = M::dispatch_keys();
        let parents = keys
            .iter()
            .filter(|k| **k != M::TYPE_KEY)
            .map(|k| k.to_string())
            .collect();
        self.register_descriptor(TypeDescriptor {
            key: M::TYPE_KEY.to_string(),
            parents,
            kind: M::KIND,
        })
    }

    pub fn register_descriptor(&mut self, descriptor: TypeDescriptor) -> Result<(), MessageError> {
        if self.by_key.contains_key(&descriptor.key) {
            return Err(MessageError::DuplicateType(descriptor.key));
        }
        self.by_key.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn descriptor(&self, key: &str) -> Option<&TypeDescriptor> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.by_key.contains_key(key)
    }

    /// All registered type keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.by_key.keys().map(String::as_str)
    }

    /// Whether a message of `source` type may be handled as `destination`.
    pub fn assignable(&self, source: &str, destination: &str) -> bool {
        if source == destination {
            return true;
        }
        self.by_key
            .get(source)
            .map(|d| d.parents.iter().any(|p| p == destination))
            .unwrap_or(false)
    }
}
