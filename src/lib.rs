//! Huginn - in-process message bus
//!
//! Routes typed messages between logical endpoints, executes registered
//! handlers through a composable processing pipeline, and guarantees
//! at-least-once delivery with a transactional outbox/inbox.
//!
//! The moving parts:
//! - `message`: envelopes, typed headers, endpoint identity, type registry
//! - `topology`: routing table with contravariant type matching
//! - `queue`: FIFO and deferred-delivery run loops
//! - `pipeline`: unit of work → reply validation → retry → handler
//! - `outbox`: post-commit delivery and the background sweep
//! - `storage`: inbox/outbox persistence (memory, sqlite)
//! - `transport`: the façade tying it all together

pub mod config;
pub mod handler;
pub mod message;
pub mod outbox;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod topology;
pub mod transport;

pub use config::BusConfig;
pub use handler::{handler_fn, ErrorHandlerFn, HandlerContext, HandlerError, HandlerFn};
pub use message::{
    BusMessage, EndpointId, Envelope, HandledTypes, Header, HeaderMap, MessageId, MessageKind,
    TypeRegistry, WILDCARD_ENDPOINT,
};
pub use pipeline::{ProcessingOutcome, RetryDecision, RetryPolicy};
pub use storage::{init_storage, MessageStore};
pub use transport::{MessageReceived, StatusChanged, Transport, TransportStatus};
