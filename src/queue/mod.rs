//! Single-consumer queues feeding the transport dispatch loop.
//!
//! - `MessageQueue`: unbounded FIFO with a signal-driven run-loop
//! - `DeferredQueue`: due-time ordered queue that reinjects messages when
//!   their scheduled delivery time arrives

pub mod deferred;
pub mod fifo;

pub use deferred::DeferredQueue;
pub use fifo::MessageQueue;
