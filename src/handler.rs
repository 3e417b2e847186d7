//! Handler functions and the context handed to each invocation.
//!
//! A handler is a type-erased async closure bound into the topology. The
//! `HandlerContext` is its only way to produce follow-up messages; everything
//! it sends is buffered and only reaches the transport when the owning unit
//! of work commits.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::message::{
    BusMessage, EndpointId, Envelope, Header, MessageError, TypeRegistry, WILDCARD_ENDPOINT,
};

/// Errors surfaced by handler bodies and the message-producing helpers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("reply requested but message carries no reply-to endpoint")]
    NoReplyTo,
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Type-erased handler bound into the topology.
pub type HandlerFn = Arc<dyn Fn(Envelope, HandlerContext) -> HandlerFuture + Send + Sync>;

/// Callback invoked when a delivery to an endpoint fails.
pub type ErrorHandlerFn = Arc<dyn Fn(Envelope, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-invocation context: identifies the handling endpoint and collects the
/// messages the handler produces.
#[derive(Clone)]
pub struct HandlerContext {
    endpoint: EndpointId,
    types: Arc<TypeRegistry>,
    conversation: Uuid,
    reply_to: Option<EndpointId>,
    outgoing: Arc<Mutex<Vec<Envelope>>>,
    replied: Arc<AtomicBool>,
}

impl HandlerContext {
    pub(crate) fn new(endpoint: EndpointId, types: Arc<TypeRegistry>, message: &Envelope) -> Self {
        let conversation = message
            .headers()
            .conversation_id()
            .unwrap_or_else(|_| message.id().as_uuid());
        Self {
            endpoint,
            types,
            conversation,
            reply_to: message.headers().reply_to().cloned(),
            outgoing: Arc::new(Mutex::new(Vec::new())),
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation
    }

    /// Send a message to one logical endpoint.
    pub fn send<M: BusMessage>(&self, target: &str, message: &M) -> Result<(), HandlerError> {
        let envelope = self.types.envelope(message)?;
        self.buffer(envelope, target.to_string());
        Ok(())
    }

    /// Publish a message to every endpoint bound to its type.
    pub fn publish<M: BusMessage>(&self, message: &M) -> Result<(), HandlerError> {
        let envelope = self.types.envelope(message)?;
        self.buffer(envelope, WILDCARD_ENDPOINT.to_string());
        Ok(())
    }

    /// Send a query, directing the reply back to this endpoint.
    pub fn request<M: BusMessage>(&self, target: &str, message: &M) -> Result<(), HandlerError> {
        let envelope = self
            .types
            .envelope(message)?
            .with_header(Header::ReplyTo(self.endpoint.clone()));
        self.buffer(envelope, target.to_string());
        Ok(())
    }

    /// Reply to the message being handled. Requires a reply-to endpoint on
    /// the incoming message.
    pub fn reply<M: BusMessage>(&self, message: &M) -> Result<(), HandlerError> {
        let reply_to = self.reply_to.clone().ok_or(HandlerError::NoReplyTo)?;
        let envelope = self
            .types
            .envelope(message)?
            .with_header(Header::Replied(true))
            .with_header(Header::HandledBy(self.endpoint.clone()));
        self.buffer(envelope, reply_to.logical().to_string());
        self.replied.store(true, Ordering::Release);
        Ok(())
    }

    /// Send a message scheduled for delivery no earlier than `until`.
    pub fn defer<M: BusMessage>(
        &self,
        target: &str,
        until: DateTime<Utc>,
        message: &M,
    ) -> Result<(), HandlerError> {
        let envelope = self
            .types
            .envelope(message)?
            .with_header(Header::DeferredUntil(until));
        self.buffer(envelope, target.to_string());
        Ok(())
    }

    fn buffer(&self, envelope: Envelope, target: String) {
        let envelope = envelope
            .with_header(Header::ConversationId(self.conversation))
            .with_header(Header::SentFrom(self.endpoint.clone()))
            .with_target(target);
        self.outgoing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(envelope);
    }

    pub(crate) fn take_outgoing(&self) -> Vec<Envelope> {
        std::mem::take(
            &mut *self
                .outgoing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub(crate) fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }
}

/// Adapt a typed async function into a [`HandlerFn`].
///
/// The payload is deserialized into `M` before the function runs; a payload
/// that does not parse surfaces as a handler failure.
pub fn handler_fn<M, F, Fut>(f: F) -> HandlerFn
where
    M: BusMessage,
    F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |envelope, ctx| {
        let fut: HandlerFuture = match envelope.payload_as::<M>() {
            Ok(message) => Box::pin(f(message, ctx)),
            Err(e) => Box::pin(async move { Err(HandlerError::Message(e)) }),
        };
        fut
    })
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::MessageKind;

    #[derive(Serialize, Deserialize)]
    struct Priced {
        amount: u32,
    }

    impl BusMessage for Priced {
        const TYPE_KEY: &'static str = "Priced";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Serialize, Deserialize)]
    struct PriceQuery;

    impl BusMessage for PriceQuery {
        const TYPE_KEY: &'static str = "PriceQuery";
        const KIND: MessageKind = MessageKind::Query;
    }

    fn registry() -> Arc<TypeRegistry> {
        let mut types = TypeRegistry::new();
        types.register::<Priced>().unwrap();
        types.register::<PriceQuery>().unwrap();
        Arc::new(types)
    }

    fn incoming(types: &TypeRegistry, reply_to: Option<EndpointId>) -> Envelope {
        let mut envelope = types
            .envelope(&PriceQuery)
            .unwrap()
            .with_target("billing");
        if let Some(endpoint) = reply_to {
            envelope = envelope.with_header(Header::ReplyTo(endpoint));
        }
        envelope
    }

    #[test]
    fn test_sent_messages_carry_conversation_and_origin() {
        let types = registry();
        let endpoint = EndpointId::new("billing", "a");
        let message = incoming(&types, None);
        let ctx = HandlerContext::new(endpoint.clone(), Arc::clone(&types), &message);

        ctx.send("orders", &Priced { amount: 10 }).unwrap();

        let outgoing = ctx.take_outgoing();
        assert_eq!(outgoing.len(), 1);
        let headers = outgoing[0].headers();
        assert_eq!(headers.conversation_id().unwrap(), message.id().as_uuid());
        assert_eq!(headers.sent_from(), Some(&endpoint));
        assert_eq!(headers.target_endpoint().unwrap(), "orders");
    }

    #[test]
    fn test_publish_targets_wildcard() {
        let types = registry();
        let message = incoming(&types, None);
        let ctx = HandlerContext::new(EndpointId::new("billing", "a"), types, &message);

        ctx.publish(&Priced { amount: 3 }).unwrap();

        let outgoing = ctx.take_outgoing();
        assert_eq!(
            outgoing[0].headers().target_endpoint().unwrap(),
            WILDCARD_ENDPOINT
        );
    }

    #[test]
    fn test_reply_requires_reply_to() {
        let types = registry();
        let message = incoming(&types, None);
        let ctx = HandlerContext::new(EndpointId::new("billing", "a"), types, &message);

        assert!(matches!(
            ctx.reply(&Priced { amount: 1 }),
            Err(HandlerError::NoReplyTo)
        ));
        assert!(!ctx.has_replied());
    }

    #[test]
    fn test_reply_routes_to_reply_to_and_marks_replied() {
        let types = registry();
        let requester = EndpointId::new("Gateway", "g1");
        let message = incoming(&types, Some(requester.clone()));
        let ctx = HandlerContext::new(EndpointId::new("billing", "a"), types, &message);

        ctx.reply(&Priced { amount: 9 }).unwrap();

        assert!(ctx.has_replied());
        let outgoing = ctx.take_outgoing();
        assert_eq!(
            outgoing[0].headers().target_endpoint().unwrap(),
            requester.logical()
        );
        assert!(outgoing[0].headers().replied());
    }

    #[tokio::test]
    async fn test_handler_fn_surfaces_payload_mismatch() {
        let types = registry();
        let message = incoming(&types, None);
        let ctx = HandlerContext::new(EndpointId::new("billing", "a"), Arc::clone(&types), &message);

        // A PriceQuery payload does not deserialize into Priced.
        let handler = handler_fn(|_: Priced, _ctx| async { Ok(()) });
        let result = handler(message, ctx).await;

        assert!(matches!(result, Err(HandlerError::Message(_))));
    }
}
