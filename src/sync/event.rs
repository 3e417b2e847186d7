//! Reset events for producer/consumer handoff and readiness gating.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{watch, Notify};

/// Single-slot signal.
///
/// `set` is sticky until exactly one waiter consumes it; setting an already
/// set event is a no-op. Multiple producers may signal, but each signal wakes
/// at most one `wait`.
#[derive(Debug, Default)]
pub struct AutoResetEvent {
    set: AtomicBool,
    notify: Notify,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Suspend until the event is set, consuming the signal.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // `set` between the check and the await is not lost.
            let notified = self.notify.notified();
            if self.set.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

/// Broadcast gate.
///
/// Once set, every current and future `wait` resolves immediately until the
/// event is reset.
#[derive(Debug)]
pub struct ManualResetEvent {
    state: watch::Sender<bool>,
}

impl ManualResetEvent {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    pub fn set(&self) {
        // `send_replace` updates the watched value unconditionally; plain
        // `send` drops the update when no receiver currently exists, which
        // would lose a `set` issued before the first `wait` subscribes.
        let _ = self.state.send_replace(true);
    }

    pub fn reset(&self) {
        let _ = self.state.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Suspend until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so `changed` cannot fail here.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_auto_reset_wakes_single_waiter() {
        let event = Arc::new(AutoResetEvent::new());

        event.set();
        event.wait().await;

        // Signal was consumed; a second wait must block.
        let second = tokio::time::timeout(Duration::from_millis(20), event.wait()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_auto_reset_set_before_wait_is_not_lost() {
        let event = Arc::new(AutoResetEvent::new());
        event.set();
        event.set();

        tokio::time::timeout(Duration::from_millis(50), event.wait())
            .await
            .expect("signal should be pending");
    }

    #[tokio::test]
    async fn test_auto_reset_wakes_waiter_across_tasks() {
        let event = Arc::new(AutoResetEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set();

        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_reset_releases_all_waiters() {
        let gate = Arc::new(ManualResetEvent::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(100), waiter)
                .await
                .expect("gated task should be released")
                .unwrap();
        }

        // Still open for late arrivals.
        tokio::time::timeout(Duration::from_millis(50), gate.wait())
            .await
            .expect("open gate should not block");
    }

    #[tokio::test]
    async fn test_manual_reset_closes_again() {
        let gate = ManualResetEvent::new();
        gate.set();
        gate.reset();

        let blocked = tokio::time::timeout(Duration::from_millis(20), gate.wait()).await;
        assert!(blocked.is_err());
    }
}
