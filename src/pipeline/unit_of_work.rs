//! Unit-of-work wrapper: transaction boundary, inbox dedupe, outbox capture.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::message::Header;
use crate::outbox::OutboxDispatcher;
use crate::storage::{InboxRecord, MessageStore, OutboxRecord};

use super::{
    Next, PipelineError, PipelineStep, ProcessingContext, Resolution, Result, StepDescriptor,
};

/// Outermost pipeline step.
///
/// Opens the persistence transaction for one handler invocation, skips the
/// body when the inbox already records the message as handled or failed, and
/// on success commits the inbox update together with the outbox snapshot of
/// everything the handler produced. On rollback the buffered messages are
/// discarded and the inbox row stays absent so a redelivery can run the
/// handler again.
pub struct UnitOfWorkStep {
    store: Arc<dyn MessageStore>,
    dispatcher: Arc<OutboxDispatcher>,
}

impl UnitOfWorkStep {
    pub fn new(store: Arc<dyn MessageStore>, dispatcher: Arc<OutboxDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Record a rejected message in its own transaction. The dedicated
    /// error write keeps a redelivered failing message from being
    /// reprocessed forever.
    async fn mark_rejected(&self, ctx: &ProcessingContext, reason: &str) -> Result<()> {
        let record = InboxRecord::rejected(&ctx.message, &ctx.endpoint, reason);
        let mut tx = self.store.begin().await?;
        tx.upsert_inbox_error(&record).await?;
        tx.commit().await?;

        debug!(
            message_id = %ctx.message.id(),
            endpoint = %ctx.endpoint,
            reason = %reason,
            "Message rejected and recorded in inbox"
        );
        Ok(())
    }

    /// Re-enqueue a retried message with its bumped retry counter and due
    /// time.
    async fn requeue_retry(
        &self,
        ctx: &ProcessingContext,
        due: chrono::DateTime<Utc>,
        attempt: u32,
    ) {
        let mut retried = ctx.message.clone_for_delivery();
        retried.headers_mut().set(Header::RetryCount(attempt));
        retried.headers_mut().set(Header::DeferredUntil(due));

        if !self.dispatcher.sink().deliver(retried).await {
            warn!(
                message_id = %ctx.message.id(),
                endpoint = %ctx.endpoint,
                attempt,
                "Transport did not accept retried message"
            );
        }
    }
}

#[async_trait]
impl PipelineStep for UnitOfWorkStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor::new("unit-of-work")
            .before("reply-validation")
            .before("error-handling")
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next) -> Result<()> {
        let mut tx = self.store.begin().await?;

        match tx.find_inbox(ctx.message.id(), &ctx.endpoint).await? {
            Some(record) if record.handled || record.is_error => {
                debug!(
                    message_id = %ctx.message.id(),
                    endpoint = %ctx.endpoint,
                    handled = record.handled,
                    is_error = record.is_error,
                    "Skipping redelivery of already processed message"
                );
                tx.rollback().await?;
                ctx.skipped = true;
                return Ok(());
            }
            Some(_) => {}
            None => {
                tx.insert_inbox(&InboxRecord::first_seen(&ctx.message, &ctx.endpoint))
                    .await?;
            }
        }

        let inner = next.run(ctx).await;

        match inner {
            Ok(()) if ctx.resolution.is_none() => {
                tx.set_inbox_handled(ctx.message.id(), &ctx.endpoint).await?;

                let records: Vec<OutboxRecord> = ctx
                    .outgoing
                    .iter()
                    .map(|envelope| OutboxRecord::pending(envelope, &ctx.endpoint))
                    .collect();
                for record in &records {
                    tx.insert_outbox(record).await?;
                }

                tx.commit().await?;

                // Only after the transaction closed: hand the snapshot to
                // the transport. Failures are recovered by the sweep.
                self.dispatcher.deliver(&records).await;
                Ok(())
            }
            Ok(()) => {
                tx.rollback().await?;
                ctx.outgoing.clear();

                match ctx.resolution.clone() {
                    Some(Resolution::Retry { due, attempt }) => {
                        self.requeue_retry(ctx, due, attempt).await;
                    }
                    Some(Resolution::Reject { reason }) => {
                        self.mark_rejected(ctx, &reason).await?;
                    }
                    None => {}
                }
                Ok(())
            }
            Err(e) => {
                tx.rollback().await?;
                ctx.outgoing.clear();

                // A contract violation is a permanent failure; anything
                // else (storage faults, a failing retry policy) leaves the
                // inbox untouched so the message stays redeliverable.
                if let PipelineError::QueryNotReplied { .. } = &e {
                    ctx.resolution = Some(Resolution::Reject {
                        reason: e.to_string(),
                    });
                    self.mark_rejected(ctx, &e.to_string()).await?;
                    return Ok(());
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio::sync::Mutex;

    use super::*;
    use crate::handler::{HandlerContext, HandlerError, HandlerFn};
    use crate::message::{BusMessage, EndpointId, Envelope, MessageKind, TypeRegistry};
    use crate::outbox::DeliverySink;
    use crate::pipeline::{
        ErrorHandlingStep, HandlerInvocationStep, NoRetryPolicy, Pipeline, PipelineBuilder,
        ProcessingOutcome, ReplyValidationStep,
    };
    use crate::storage::MemoryStore;

    #[derive(Serialize, Deserialize)]
    struct Audit;

    impl BusMessage for Audit {
        const TYPE_KEY: &'static str = "Audit";
        const KIND: MessageKind = MessageKind::Command;
    }

    #[derive(Serialize, Deserialize)]
    struct Audited;

    impl BusMessage for Audited {
        const TYPE_KEY: &'static str = "Audited";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn deliver(&self, envelope: Envelope) -> bool {
            self.delivered.lock().await.push(envelope);
            true
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        pipeline: Pipeline,
        types: Arc<TypeRegistry>,
    }

    fn fixture(handler: HandlerFn) -> (Fixture, ProcessingContext) {
        let mut types = TypeRegistry::new();
        types.register::<Audit>().unwrap();
        types.register::<Audited>().unwrap();
        let types = Arc::new(types);

        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Arc::new(OutboxDispatcher::new(
            store.clone() as Arc<dyn MessageStore>,
            sink.clone(),
        ));

        let pipeline = PipelineBuilder::new()
            .step(Arc::new(UnitOfWorkStep::new(
                store.clone() as Arc<dyn MessageStore>,
                dispatcher,
            )))
            .step(Arc::new(ReplyValidationStep))
            .step(Arc::new(ErrorHandlingStep::new(Arc::new(NoRetryPolicy))))
            .terminal(Arc::new(HandlerInvocationStep))
            .build()
            .unwrap();

        let envelope = types.envelope(&Audit).unwrap().with_target("audit");
        let ctx = ProcessingContext::new(
            envelope,
            EndpointId::new("audit", "a"),
            handler,
            Arc::clone(&types),
        );

        (
            Fixture {
                store,
                sink,
                pipeline,
                types,
            },
            ctx,
        )
    }

    #[tokio::test]
    async fn test_commit_records_inbox_and_delivers_outbox() {
        let handler: HandlerFn = Arc::new(|_, ctx: HandlerContext| {
            Box::pin(async move {
                ctx.publish(&Audited)?;
                Ok(())
            })
        });
        let (fixture, mut ctx) = fixture(handler);

        let outcome = fixture.pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Committed);

        let inbox = fixture
            .store
            .find_inbox(ctx.message.id(), &ctx.endpoint)
            .await
            .unwrap()
            .unwrap();
        assert!(inbox.handled);

        let outbox = fixture.store.outbox_records().await;
        assert_eq!(outbox.len(), 1);
        assert!(outbox[0].sent);
        assert_eq!(fixture.sink.delivered.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_of_handled_message_skips_handler() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let handler: HandlerFn = {
            let invocations = Arc::clone(&invocations);
            Arc::new(move |_, _| {
                let invocations = Arc::clone(&invocations);
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        let (fixture, mut ctx) = fixture(handler.clone());

        fixture.pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let inbox_before = fixture.store.inbox_records().await;

        // Same envelope id delivered again.
        let mut redelivery = ProcessingContext::new(
            ctx.message.clone_for_delivery(),
            ctx.endpoint.clone(),
            handler,
            Arc::clone(&fixture.types),
        );
        let outcome = fixture.pipeline.execute(&mut redelivery).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Skipped);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // Inbox unchanged by the redelivery.
        let inbox_after = fixture.store.inbox_records().await;
        assert_eq!(inbox_before.len(), inbox_after.len());
        assert!(inbox_after.iter().all(|r| r.handled && !r.is_error));
    }

    #[tokio::test]
    async fn test_rollback_discards_produced_messages() {
        let handler: HandlerFn = Arc::new(|_, ctx: HandlerContext| {
            Box::pin(async move {
                ctx.publish(&Audited)?;
                Err(HandlerError::Failed("after publish".to_string()))
            })
        });
        let (fixture, mut ctx) = fixture(handler);

        let outcome = fixture.pipeline.execute(&mut ctx).await.unwrap();

        assert!(matches!(outcome, ProcessingOutcome::Rejected { .. }));
        // Nothing produced inside the rolled-back transaction was delivered.
        assert!(fixture.store.outbox_records().await.is_empty());
        assert!(fixture.sink.delivered.lock().await.is_empty());
        assert!(ctx.outgoing.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_marks_inbox_error() {
        let handler: HandlerFn =
            Arc::new(|_, _| Box::pin(async { Err(HandlerError::Failed("broken".to_string())) }));
        let (fixture, mut ctx) = fixture(handler);

        let outcome = fixture.pipeline.execute(&mut ctx).await.unwrap();

        assert!(matches!(outcome, ProcessingOutcome::Rejected { .. }));
        let inbox = fixture
            .store
            .find_inbox(ctx.message.id(), &ctx.endpoint)
            .await
            .unwrap()
            .unwrap();
        assert!(inbox.is_error);
        assert!(!inbox.handled);
        assert!(inbox
            .envelope
            .headers()
            .reject_reason()
            .is_some_and(|r| r.contains("broken")));
    }

    #[tokio::test]
    async fn test_rejected_message_is_skipped_on_redelivery() {
        let handler: HandlerFn =
            Arc::new(|_, _| Box::pin(async { Err(HandlerError::Failed("broken".to_string())) }));
        let (fixture, mut ctx) = fixture(handler.clone());

        fixture.pipeline.execute(&mut ctx).await.unwrap();

        let mut redelivery = ProcessingContext::new(
            ctx.message.clone_for_delivery(),
            ctx.endpoint.clone(),
            handler,
            Arc::clone(&fixture.types),
        );
        let outcome = fixture.pipeline.execute(&mut redelivery).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_unanswered_query_rejects_and_marks_error() {
        #[derive(Serialize, Deserialize)]
        struct Peek;

        impl BusMessage for Peek {
            const TYPE_KEY: &'static str = "Peek";
            const KIND: MessageKind = MessageKind::Query;
        }

        let handler: HandlerFn = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        let (fixture, _) = fixture(handler.clone());

        let mut types = TypeRegistry::new();
        types.register::<Peek>().unwrap();
        let types = Arc::new(types);
        let envelope = types.envelope(&Peek).unwrap().with_target("audit");
        let mut ctx = ProcessingContext::new(
            envelope,
            EndpointId::new("audit", "a"),
            handler,
            types,
        );

        let outcome = fixture.pipeline.execute(&mut ctx).await.unwrap();

        match outcome {
            ProcessingOutcome::Rejected { reason } => {
                assert!(reason.contains("must reply"));
            }
            other => panic!("Expected rejection, got {:?}", other),
        }

        let inbox = fixture
            .store
            .find_inbox(ctx.message.id(), &ctx.endpoint)
            .await
            .unwrap()
            .unwrap();
        assert!(inbox.is_error);
    }
}
