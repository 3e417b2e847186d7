//! Unbounded FIFO queue with a blocking pop loop.

use std::collections::VecDeque;
use std::future::Future;

use tokio::sync::{watch, Mutex};

use crate::sync::AutoResetEvent;

/// Unbounded FIFO feeding a single run-loop.
///
/// `enqueue` never blocks and always succeeds. `run` delivers elements to
/// the callback in strict enqueue order, sequentially; only one run-loop may
/// be active at a time, a second caller waits for the first to exit.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: AutoResetEvent,
    run_guard: Mutex<()>,
}

impl<T: Send> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            signal: AutoResetEvent::new(),
            run_guard: Mutex::new(()),
        }
    }

    pub async fn enqueue(&self, item: T) {
        self.items.lock().await.push_back(item);
        self.signal.set();
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    async fn pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Drive the consumer loop until the shutdown signal fires.
    pub async fn run<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut callback: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _active = self.run_guard.lock().await;

        loop {
            if *shutdown.borrow() {
                return;
            }

            while let Some(item) = self.pop().await {
                callback(item).await;
                if *shutdown.borrow() {
                    return;
                }
            }

            tokio::select! {
                _ = self.signal.wait() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

impl<T: Send> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
