//! Message processing pipeline.
//!
//! Every handler invocation runs through an ordered middleware chain,
//! outermost to innermost: unit of work → reply validation → error handling
//! → handler invocation. Steps declare ordering constraints as
//! before/after tags and the builder resolves them with a topological sort
//! at composition time; a cycle is a configuration error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use crate::handler::{HandlerContext, HandlerError, HandlerFn};
use crate::message::{EndpointId, Envelope, TypeRegistry};
use crate::storage::StoreError;

pub mod error_handling;
pub mod reply_validation;
pub mod unit_of_work;

pub use error_handling::{
    ErrorHandlingStep, ExponentialBackoffPolicy, NoRetryPolicy, RetryDecision, RetryPolicy,
};
pub use reply_validation::ReplyValidationStep;
pub use unit_of_work::UnitOfWorkStep;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors escaping a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("handler must reply to a query ({type_key})")]
    QueryNotReplied { type_key: String },

    #[error("handler failed: {0}")]
    Handler(#[source] HandlerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("pipeline composition failed: {0}")]
    Composition(String),
}

/// How the error-handling step resolved a handler failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-enqueue the message with an incremented retry counter once `due`
    /// arrives.
    Retry { due: DateTime<Utc>, attempt: u32 },
    /// Mark the message permanently failed.
    Reject { reason: String },
}

/// Terminal state of one message-processing run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// Handler ran, unit of work committed, outbox handed off.
    Committed,
    /// Inbox already recorded the message as handled or failed.
    Skipped,
    /// Rolled back and re-enqueued for a later attempt.
    Retried { due: DateTime<Utc>, attempt: u32 },
    /// Rolled back and recorded as permanently failed.
    Rejected { reason: String },
}

/// Mutable state threaded through one pipeline run.
pub struct ProcessingContext {
    pub message: Envelope,
    pub endpoint: EndpointId,
    pub(crate) handler: HandlerFn,
    pub(crate) types: Arc<TypeRegistry>,
    /// Messages produced by the handler, buffered until commit.
    pub outgoing: Vec<Envelope>,
    /// Whether the handler replied to the message.
    pub replied: bool,
    /// Set when the inbox dedupe check short-circuits the run.
    pub skipped: bool,
    /// Set by the error-handling step when it consumed a failure.
    pub resolution: Option<Resolution>,
}

impl ProcessingContext {
    pub fn new(
        message: Envelope,
        endpoint: EndpointId,
        handler: HandlerFn,
        types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            message,
            endpoint,
            handler,
            types,
            outgoing: Vec::new(),
            replied: false,
            skipped: false,
            resolution: None,
        }
    }

    fn outcome(&self) -> ProcessingOutcome {
        if self.skipped {
            return ProcessingOutcome::Skipped;
        }
        match &self.resolution {
            None => ProcessingOutcome::Committed,
            Some(Resolution::Retry { due, attempt }) => ProcessingOutcome::Retried {
                due: *due,
                attempt: *attempt,
            },
            Some(Resolution::Reject { reason }) => ProcessingOutcome::Rejected {
                reason: reason.clone(),
            },
        }
    }
}

/// Ordering tags declared by a pipeline step.
///
/// `before`/`after` reference other step ids; a tag naming a step that is
/// not part of the pipeline is ignored.
pub struct StepDescriptor {
    pub id: &'static str,
    pub before: Vec<&'static str>,
    pub after: Vec<&'static str>,
}

impl StepDescriptor {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn before(mut self, id: &'static str) -> Self {
        self.before.push(id);
        self
    }

    pub fn after(mut self, id: &'static str) -> Self {
        self.after.push(id);
        self
    }
}

/// One middleware step wrapping the rest of the chain.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn descriptor(&self) -> StepDescriptor;

    async fn process(&self, ctx: &mut ProcessingContext, next: Next) -> Result<()>;
}

/// Continuation over the remaining steps of the chain.
pub struct Next {
    steps: Arc<[Arc<dyn PipelineStep>]>,
    index: usize,
}

impl Next {
    pub fn run<'a>(self, ctx: &'a mut ProcessingContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.steps.get(self.index).cloned() {
                Some(step) => {
                    let next = Next {
                        steps: self.steps,
                        index: self.index + 1,
                    };
                    step.process(ctx, next).await
                }
                None => Ok(()),
            }
        })
    }
}

/// Composed middleware chain.
pub struct Pipeline {
    steps: Arc<[Arc<dyn PipelineStep>]>,
}

impl Pipeline {
    /// Run one message through the chain and report how it ended.
    pub async fn execute(&self, ctx: &mut ProcessingContext) -> Result<ProcessingOutcome> {
        let next = Next {
            steps: Arc::clone(&self.steps),
            index: 0,
        };
        next.run(ctx).await?;
        Ok(ctx.outcome())
    }
}

/// Builds a [`Pipeline`] from steps with declared ordering constraints.
pub struct PipelineBuilder {
    steps: Vec<Arc<dyn PipelineStep>>,
    terminal: Option<Arc<dyn PipelineStep>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            terminal: None,
        }
    }

    pub fn step(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// The innermost step, always placed last.
    pub fn terminal(mut self, step: Arc<dyn PipelineStep>) -> Self {
        self.terminal = Some(step);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let mut ordered = topo_sort(self.steps)?;
        if let Some(terminal) = self.terminal {
            ordered.push(terminal);
        }

        debug!(
            order = ?ordered.iter().map(|s| s.descriptor().id).collect::<Vec<_>>(),
            "Pipeline composed"
        );

        Ok(Pipeline {
            steps: ordered.into(),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable topological sort over the declared before/after edges.
fn topo_sort(steps: Vec<Arc<dyn PipelineStep>>) -> Result<Vec<Arc<dyn PipelineStep>>> {
    let descriptors: Vec<StepDescriptor> = steps.iter().map(|s| s.descriptor()).collect();
    let index_of: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id, i))
        .collect();

    // edges[a] contains b when a must run before (outside of) b
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut indegree: Vec<usize> = vec![0; steps.len()];

    for (i, descriptor) in descriptors.iter().enumerate() {
        for other in &descriptor.before {
            if let Some(&j) = index_of.get(other) {
                edges[i].push(j);
                indegree[j] += 1;
            }
        }
        for other in &descriptor.after {
            if let Some(&j) = index_of.get(other) {
                edges[j].push(i);
                indegree[i] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut ready: Vec<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();

    while let Some(i) = ready.first().copied() {
        ready.remove(0);
        order.push(i);
        for &j in &edges[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.push(j);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = descriptors
            .iter()
            .enumerate()
            .filter(|(i, _)| !order.contains(i))
            .map(|(_, d)| d.id)
            .collect();
        return Err(PipelineError::Composition(format!(
            "ordering cycle among steps: {}",
            stuck.join(", ")
        )));
    }

    let mut steps: Vec<Option<Arc<dyn PipelineStep>>> = steps.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| steps[i].take())
        .collect())
}

/// Innermost step: invoke the bound handler with a cloned message and
/// collect what it produced.
pub struct HandlerInvocationStep;

#[async_trait]
impl PipelineStep for HandlerInvocationStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor::new("handler-invocation")
    }

    async fn process(&self, ctx: &mut ProcessingContext, _next: Next) -> Result<()> {
        if ctx.skipped {
            return Ok(());
        }

        let handler_ctx = HandlerContext::new(
            ctx.endpoint.clone(),
            Arc::clone(&ctx.types),
            &ctx.message,
        );

        let invocation = (ctx.handler)(ctx.message.clone_for_delivery(), handler_ctx.clone());
        match invocation.await {
            Ok(()) => {
                ctx.outgoing.extend(handler_ctx.take_outgoing());
                ctx.replied = handler_ctx.has_replied();
                Ok(())
            }
            Err(e) => Err(PipelineError::Handler(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::{BusMessage, MessageKind};

    #[derive(Serialize, Deserialize)]
    struct Traced;

    impl BusMessage for Traced {
        const TYPE_KEY: &'static str = "Traced";
        const KIND: MessageKind = MessageKind::Command;
    }

    struct RecordingStep {
        id: &'static str,
        before: Vec<&'static str>,
        after: Vec<&'static str>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PipelineStep for RecordingStep {
        fn descriptor(&self) -> StepDescriptor {
            StepDescriptor {
                id: self.id,
                before: self.before.clone(),
                after: self.after.clone(),
            }
        }

        async fn process(&self, ctx: &mut ProcessingContext, next: Next) -> Result<()> {
            self.log.lock().unwrap().push(self.id);
            next.run(ctx).await
        }
    }

    fn context() -> ProcessingContext {
        let mut types = TypeRegistry::new();
        types.register::<Traced>().unwrap();
        let types = Arc::new(types);
        let envelope = types.envelope(&Traced).unwrap().with_target("anywhere");
        let handler: HandlerFn = Arc::new(|_, _| Box::pin(async { Ok(()) }));
        ProcessingContext::new(envelope, EndpointId::new("anywhere", "a"), handler, types)
    }

    #[tokio::test]
    async fn test_steps_run_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PipelineBuilder::new()
            .step(Arc::new(RecordingStep {
                id: "inner",
                before: vec![],
                after: vec!["outer"],
                log: Arc::clone(&log),
            }))
            .step(Arc::new(RecordingStep {
                id: "outer",
                before: vec![],
                after: vec![],
                log: Arc::clone(&log),
            }))
            .step(Arc::new(RecordingStep {
                id: "middle",
                before: vec!["inner"],
                after: vec!["outer"],
                log: Arc::clone(&log),
            }))
            .terminal(Arc::new(HandlerInvocationStep))
            .build()
            .unwrap();

        let mut ctx = context();
        let outcome = pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::Committed);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "middle", "inner"]);
    }

    #[tokio::test]
    async fn test_cycle_is_composition_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = PipelineBuilder::new()
            .step(Arc::new(RecordingStep {
                id: "a",
                before: vec!["b"],
                after: vec![],
                log: Arc::clone(&log),
            }))
            .step(Arc::new(RecordingStep {
                id: "b",
                before: vec!["a"],
                after: vec![],
                log: Arc::clone(&log),
            }))
            .build();

        assert!(matches!(result, Err(PipelineError::Composition(_))));
    }

    #[tokio::test]
    async fn test_constraint_on_absent_step_is_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PipelineBuilder::new()
            .step(Arc::new(RecordingStep {
                id: "only",
                before: vec!["not-installed"],
                after: vec![],
                log: Arc::clone(&log),
            }))
            .build()
            .unwrap();

        let mut ctx = context();
        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["only"]);
    }

    #[tokio::test]
    async fn test_handler_invocation_collects_outgoing() {
        let mut types = TypeRegistry::new();
        types.register::<Traced>().unwrap();
        let types = Arc::new(types);
        let envelope = types.envelope(&Traced).unwrap().with_target("anywhere");

        let handler: HandlerFn = Arc::new(|_, ctx: HandlerContext| {
            Box::pin(async move {
                ctx.publish(&Traced)?;
                Ok(())
            })
        });

        let mut ctx = ProcessingContext::new(
            envelope,
            EndpointId::new("anywhere", "a"),
            handler,
            types,
        );
        let pipeline = PipelineBuilder::new()
            .terminal(Arc::new(HandlerInvocationStep))
            .build()
            .unwrap();

        pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.outgoing.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_surfaces_as_pipeline_error() {
        let mut types = TypeRegistry::new();
        types.register::<Traced>().unwrap();
        let types = Arc::new(types);
        let envelope = types.envelope(&Traced).unwrap().with_target("anywhere");

        let handler: HandlerFn =
            Arc::new(|_, _| Box::pin(async { Err(HandlerError::Failed("boom".to_string())) }));

        let mut ctx = ProcessingContext::new(
            envelope,
            EndpointId::new("anywhere", "a"),
            handler,
            types,
        );
        let pipeline = PipelineBuilder::new()
            .terminal(Arc::new(HandlerInvocationStep))
            .build()
            .unwrap();

        let result = pipeline.execute(&mut ctx).await;
        assert!(matches!(result, Err(PipelineError::Handler(_))));
    }
}
