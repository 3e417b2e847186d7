//! Query/reply contract validation.

use async_trait::async_trait;

use crate::message::MessageKind;

use super::{Next, PipelineError, PipelineStep, ProcessingContext, Result, StepDescriptor};

/// Raises a contract violation when a query completes without a reply.
///
/// The check runs after the inner chain; a failure the retry policy already
/// consumed is not double-reported.
pub struct ReplyValidationStep;

#[async_trait]
impl PipelineStep for ReplyValidationStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor::new("reply-validation")
            .after("unit-of-work")
            .before("error-handling")
    }

    async fn process(&self, ctx: &mut ProcessingContext, next: Next) -> Result<()> {
        next.run(ctx).await?;

        if ctx.message.kind() == MessageKind::Query
            && !ctx.replied
            && !ctx.skipped
            && ctx.resolution.is_none()
        {
            return Err(PipelineError::QueryNotReplied {
                type_key: ctx.message.type_key().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::handler::{HandlerContext, HandlerFn};
    use crate::message::{BusMessage, EndpointId, TypeRegistry};
    use crate::pipeline::{HandlerInvocationStep, PipelineBuilder, ProcessingOutcome};

    #[derive(Serialize, Deserialize)]
    struct Lookup;

    impl BusMessage for Lookup {
        const TYPE_KEY: &'static str = "Lookup";
        const KIND: MessageKind = MessageKind::Query;
    }

    #[derive(Serialize, Deserialize)]
    struct Found;

    impl BusMessage for Found {
        const TYPE_KEY: &'static str = "Found";
        const KIND: MessageKind = MessageKind::Reply;
    }

    fn query_context(handler: HandlerFn) -> ProcessingContext {
        let mut types = TypeRegistry::new();
        types.register::<Lookup>().unwrap();
        types.register::<Found>().unwrap();
        let types = Arc::new(types);

        let requester = EndpointId::new("gateway", "g");
        let envelope = types
            .envelope(&Lookup)
            .unwrap()
            .with_target("catalog")
            .with_header(crate::message::Header::ReplyTo(requester));

        ProcessingContext::new(envelope, EndpointId::new("catalog", "a"), handler, types)
    }

    fn validated_pipeline() -> crate::pipeline::Pipeline {
        PipelineBuilder::new()
            .step(Arc::new(ReplyValidationStep))
            .terminal(Arc::new(HandlerInvocationStep))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unanswered_query_is_contract_violation() {
        let handler: HandlerFn = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        let mut ctx = query_context(handler);

        let result = validated_pipeline().execute(&mut ctx).await;

        assert!(matches!(
            result,
            Err(PipelineError::QueryNotReplied { type_key }) if type_key == "Lookup"
        ));
    }

    #[tokio::test]
    async fn test_answered_query_passes() {
        let handler: HandlerFn = Arc::new(|_, ctx: HandlerContext| {
            Box::pin(async move {
                ctx.reply(&Found)?;
                Ok(())
            })
        });
        let mut ctx = query_context(handler);

        let outcome = validated_pipeline().execute(&mut ctx).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Committed);
    }
}
