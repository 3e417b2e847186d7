//! Typed message headers.
//!
//! Headers are a closed set of kinds rather than a free-form string bag.
//! Required headers are read through accessors that fail with a named
//! error instead of surfacing a missing-value fault at the use site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EndpointId;

/// Errors raised by header accessors.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("required header missing: {0}")]
    Missing(&'static str),
}

/// The closed set of header kinds an envelope can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Header {
    /// Correlates every message produced while handling a conversation root.
    ConversationId(Uuid),
    /// Endpoint that produced the message.
    SentFrom(EndpointId),
    /// Logical endpoint name the message is routed to, or `"*"` for all.
    TargetEndpoint(String),
    /// Number of delivery attempts already consumed by the retry policy.
    RetryCount(u32),
    /// Do not deliver before this instant.
    DeferredUntil(DateTime<Utc>),
    /// Stamped by the transport when the message is handed to a handler.
    DeliveredAt(DateTime<Utc>),
    /// Endpoint a query reply should be routed back to.
    ReplyTo(EndpointId),
    /// Endpoint instance that handled the message.
    HandledBy(EndpointId),
    /// Set when a handler replied to the message.
    Replied(bool),
    /// Why the message was rejected by the error-handling step.
    RejectReason(String),
}

impl Header {
    /// Stable name used to match a header kind when overwriting.
    pub fn name(&self) -> &'static str {
        match self {
            Header::ConversationId(_) => "conversation-id",
            Header::SentFrom(_) => "sent-from",
            Header::TargetEndpoint(_) => "target-endpoint",
            Header::RetryCount(_) => "retry-count",
            Header::DeferredUntil(_) => "deferred-until",
            Header::DeliveredAt(_) => "delivered-at",
            Header::ReplyTo(_) => "reply-to",
            Header::HandledBy(_) => "handled-by",
            Header::Replied(_) => "replied",
            Header::RejectReason(_) => "reject-reason",
        }
    }
}

/// Ordered header set.
///
/// Setting a header kind that is already present overwrites it in place,
/// keeping its original position; headers are never silently dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a header.
    pub fn set(&mut self, header: Header) {
        match self.entries.iter_mut().find(|h| h.name() == header.name()) {
            Some(slot) => *slot = header,
            None => self.entries.push(header),
        }
    }

    fn find(&self, name: &str) -> Option<&Header> {
        self.entries.iter().find(|h| h.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Conversation id is required on every routed message.
    pub fn conversation_id(&self) -> Result<Uuid, HeaderError> {
        match self.find("conversation-id") {
            Some(Header::ConversationId(id)) => Ok(*id),
            _ => Err(HeaderError::Missing("conversation-id")),
        }
    }

    /// Target endpoint is required before a message can be dispatched.
    pub fn target_endpoint(&self) -> Result<&str, HeaderError> {
        match self.find("target-endpoint") {
            Some(Header::TargetEndpoint(name)) => Ok(name),
            _ => Err(HeaderError::Missing("target-endpoint")),
        }
    }

    pub fn sent_from(&self) -> Option<&EndpointId> {
        match self.find("sent-from") {
            Some(Header::SentFrom(id)) => Some(id),
            _ => None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self.find("retry-count") {
            Some(Header::RetryCount(n)) => *n,
            _ => 0,
        }
    }

    pub fn deferred_until(&self) -> Option<DateTime<Utc>> {
        match self.find("deferred-until") {
            Some(Header::DeferredUntil(at)) => Some(*at),
            _ => None,
        }
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        match self.find("delivered-at") {
            Some(Header::DeliveredAt(at)) => Some(*at),
            _ => None,
        }
    }

    pub fn reply_to(&self) -> Option<&EndpointId> {
        match self.find("reply-to") {
            Some(Header::ReplyTo(id)) => Some(id),
            _ => None,
        }
    }

    pub fn handled_by(&self) -> Option<&EndpointId> {
        match self.find("handled-by") {
            Some(Header::HandledBy(id)) => Some(id),
            _ => None,
        }
    }

    pub fn replied(&self) -> bool {
        matches!(self.find("replied"), Some(Header::Replied(true)))
    }

    pub fn reject_reason(&self) -> Option<&str> {
        match self.find("reject-reason") {
            Some(Header::RejectReason(reason)) => Some(reason),
            _ => None,
        }
    }
}
