//! Async coordination primitives used by the queue run-loops.

pub mod event;
pub mod heap;
pub mod wait_group;

pub use event::{AutoResetEvent, ManualResetEvent};
pub use heap::DelayHeap;
pub use wait_group::WaitGroup;
