//! Due-time ordered delivery queue.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::sync::{AutoResetEvent, DelayHeap};

/// Holds elements until their scheduled delivery time, then hands them to a
/// reinjection callback.
///
/// The heap itself is not thread-safe; it is touched only by the run-loop
/// and the enqueue path, each under the internal lock. An element whose due
/// time is already in the past is reinjected immediately.
pub struct DeferredQueue<T> {
    heap: Mutex<DelayHeap<T>>,
    reschedule: AutoResetEvent,
    run_guard: Mutex<()>,
}

impl<T: Send> DeferredQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(DelayHeap::new()),
            reschedule: AutoResetEvent::new(),
            run_guard: Mutex::new(()),
        }
    }

    pub async fn enqueue(&self, due: chrono::DateTime<Utc>, item: T) {
        self.heap.lock().await.push(due, item);
        // Wake the loop in case this entry is due earlier than what it is
        // currently sleeping for.
        self.reschedule.set();
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    /// Drive the scheduling loop until the shutdown signal fires.
    pub async fn run<F, Fut>(&self, mut shutdown: watch::Receiver<bool>, mut reinject: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _active = self.run_guard.lock().await;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let (due_items, next_due) = {
                let mut heap = self.heap.lock().await;
                let now = Utc::now();
                let mut due_items = Vec::new();
                while let Some(item) = heap.pop_due(now) {
                    due_items.push(item);
                }
                (due_items, heap.peek_due())
            };

            for item in due_items {
                reinject(item).await;
            }

            match next_due {
                Some(due) => {
                    let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.reschedule.wait() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.reschedule.wait() => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<T: Send> Default for DeferredQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
