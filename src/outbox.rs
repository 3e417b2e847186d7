//! Post-commit outbox delivery and the background sweep.
//!
//! Messages produced during handling are persisted as unsent outbox rows in
//! the owning transaction. After that transaction commits the dispatcher
//! attempts immediate delivery and marks accepted rows sent in a follow-up
//! write. Anything left unsent is recovered by a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::message::Envelope;
use crate::storage::{MessageStore, OutboxRecord, StoreError};

/// Submission side of the transport: routes an envelope toward its target.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Submit a message for routing. Returns whether it was accepted.
    async fn deliver(&self, envelope: Envelope) -> bool;
}

/// Backoff for the follow-up mark-sent write.
fn mark_sent_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Delivers committed outbox rows to the transport and marks them sent.
pub struct OutboxDispatcher {
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn DeliverySink>,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn MessageStore>, sink: Arc<dyn DeliverySink>) -> Self {
        Self { store, sink }
    }

    pub fn sink(&self) -> &Arc<dyn DeliverySink> {
        &self.sink
    }

    /// Deliver freshly committed records.
    ///
    /// Failures here are never fatal: a row the transport does not accept,
    /// or whose mark-sent write fails, stays unsent and is retried by the
    /// sweep.
    pub async fn deliver(&self, records: &[OutboxRecord]) {
        for record in records {
            self.deliver_one(record).await;
        }
    }

    async fn deliver_one(&self, record: &OutboxRecord) -> bool {
        if !self.sink.deliver(record.envelope.clone_for_delivery()).await {
            debug!(
                outbox_id = %record.id,
                message_id = %record.envelope.id(),
                "Transport did not accept outbox message, leaving for sweep"
            );
            return false;
        }

        let mark = || async { self.store.mark_outbox_sent(&record.id).await };
        match mark.retry(mark_sent_backoff()).await {
            Ok(()) => {
                debug!(outbox_id = %record.id, "Outbox message delivered and marked sent");
                true
            }
            Err(e) => {
                warn!(
                    outbox_id = %record.id,
                    error = %e,
                    "Failed to mark outbox message sent, sweep will re-deliver"
                );
                false
            }
        }
    }

    /// One sweep pass: re-deliver unsent rows older than the delivery
    /// interval.
    pub async fn sweep(&self, config: &OutboxConfig) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(config.delivery_interval_secs as i64);
        let pending = self.store.unsent_outbox(cutoff, config.sweep_batch).await?;

        let mut redelivered = 0u32;
        for record in &pending {
            if self.deliver_one(record).await {
                redelivered += 1;
            }
        }

        if redelivered > 0 {
            info!(redelivered, "Re-delivered unsent outbox messages");
        }
        Ok(redelivered)
    }
}

/// Handle to a running sweep task.
pub struct SweepHandle {
    cancel: watch::Sender<bool>,
}

impl SweepHandle {
    /// Signal the sweep task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn the background task that periodically re-delivers unsent outbox
/// rows. Returns a handle that can be used to stop it.
pub fn spawn_outbox_sweep(dispatcher: Arc<OutboxDispatcher>, config: OutboxConfig) -> SweepHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        let interval = Duration::from_secs(config.sweep_interval_secs);
        info!(
            interval_secs = config.sweep_interval_secs,
            "Outbox sweep started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = dispatcher.sweep(&config).await {
                        error!(error = %e, "Outbox sweep failed");
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        info!("Outbox sweep stopped");
                        break;
                    }
                }
            }
        }
    });

    SweepHandle { cancel: cancel_tx }
}
