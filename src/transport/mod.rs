//! Integration transport: the façade over queues, topology and pipeline.
//!
//! The transport accepts enqueue requests once it is running, parks deferred
//! messages until they are due, drives the dispatch loop that resolves
//! handlers through the topology, and runs every matched handler through the
//! processing pipeline. Status changes and delivery attempts are published
//! on broadcast channels for observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::BusConfig;
use crate::handler::{ErrorHandlerFn, HandlerFn};
use crate::message::{
    EndpointId, Envelope, Header, MessageTypeProvider, TypeRegistry,
};
use crate::outbox::{spawn_outbox_sweep, DeliverySink, OutboxDispatcher, SweepHandle};
use crate::pipeline::{
    ErrorHandlingStep, ExponentialBackoffPolicy, HandlerInvocationStep, NoRetryPolicy, Pipeline,
    PipelineBuilder, ProcessingContext, ProcessingOutcome, ReplyValidationStep, RetryPolicy,
    UnitOfWorkStep,
};
use crate::queue::{DeferredQueue, MessageQueue};
use crate::storage::MessageStore;
use crate::sync::{ManualResetEvent, WaitGroup};
use crate::topology::{DispatchError, HashSelector, InstanceSelector, TopologyRegistry};

/// Broadcast capacity for status and delivery notifications.
const EVENT_CAPACITY: usize = 1024;

/// Transport lifecycle. Transitions are irreversible per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Stopped,
    Starting,
    Running,
}

/// Notification fired on every status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChanged {
    pub previous: TransportStatus,
    pub current: TransportStatus,
}

/// Notification fired for every attempted delivery, success or failure.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub message: Envelope,
    pub error: Option<String>,
    pub outcome: Option<ProcessingOutcome>,
}

/// Errors raised by the transport façade.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("background message processing already started")]
    AlreadyStarted,

    #[error(transparent)]
    Topology(#[from] crate::topology::TopologyError),

    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("shutdown drain exceeded {0:?} with handlers still in flight")]
    DrainTimeout(Duration),
}

/// Routes accepted envelopes onto the right queue, gated on readiness.
struct Router {
    ready: ManualResetEvent,
    queue: Arc<MessageQueue<Envelope>>,
    deferred: Arc<DeferredQueue<Envelope>>,
    cancel: watch::Receiver<bool>,
}

#[async_trait]
impl DeliverySink for Router {
    async fn deliver(&self, envelope: Envelope) -> bool {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return false;
        }

        tokio::select! {
            _ = self.ready.wait() => {}
            cancelled = cancel.wait_for(|stop| *stop) => {
                let _ = cancelled;
                return false;
            }
        }

        match envelope.headers().deferred_until() {
            Some(due) if due > Utc::now() => {
                debug!(
                    message_id = %envelope.id(),
                    due = %due,
                    "Message parked until its delivery time"
                );
                self.deferred.enqueue(due, envelope).await;
            }
            _ => self.queue.enqueue(envelope).await,
        }
        true
    }
}

/// The message bus façade.
pub struct Transport {
    config: BusConfig,
    types: Arc<TypeRegistry>,
    topology: Arc<TopologyRegistry>,
    pipeline: Pipeline,
    store: Arc<dyn MessageStore>,
    queue: Arc<MessageQueue<Envelope>>,
    deferred: Arc<DeferredQueue<Envelope>>,
    router: Arc<Router>,
    dispatcher: Arc<OutboxDispatcher>,
    status: watch::Sender<TransportStatus>,
    status_events: broadcast::Sender<StatusChanged>,
    deliveries: broadcast::Sender<MessageReceived>,
    cancel: watch::Sender<bool>,
    in_flight: WaitGroup,
    started: AtomicBool,
    sweep: Mutex<Option<SweepHandle>>,
}

impl Transport {
    /// Create a transport with the default instance selection (consistent
    /// hash) and the retry policy derived from configuration.
    pub fn new(
        config: BusConfig,
        types: Arc<TypeRegistry>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Arc<Self>, TransportError> {
        let policy: Arc<dyn RetryPolicy> = if config.retry.max_retries == 0 {
            Arc::new(NoRetryPolicy)
        } else {
            Arc::new(ExponentialBackoffPolicy::from_config(&config.retry))
        };
        Self::with_options(config, types, store, Arc::new(HashSelector), policy)
    }

    pub fn with_options(
        config: BusConfig,
        types: Arc<TypeRegistry>,
        store: Arc<dyn MessageStore>,
        selector: Arc<dyn InstanceSelector>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Result<Arc<Self>, TransportError> {
        let queue = Arc::new(MessageQueue::new());
        let deferred = Arc::new(DeferredQueue::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let (status, _) = watch::channel(TransportStatus::Stopped);
        let (status_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (deliveries, _) = broadcast::channel(EVENT_CAPACITY);

        let router = Arc::new(Router {
            ready: ManualResetEvent::new(),
            queue: Arc::clone(&queue),
            deferred: Arc::clone(&deferred),
            cancel: cancel_rx,
        });

        let dispatcher = Arc::new(OutboxDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&router) as Arc<dyn DeliverySink>,
        ));

        let pipeline = PipelineBuilder::new()
            .step(Arc::new(UnitOfWorkStep::new(
                Arc::clone(&store),
                Arc::clone(&dispatcher),
            )))
            .step(Arc::new(ReplyValidationStep))
            .step(Arc::new(ErrorHandlingStep::new(policy)))
            .terminal(Arc::new(HandlerInvocationStep))
            .build()?;

        let topology = Arc::new(TopologyRegistry::new(Arc::clone(&types), selector));

        Ok(Arc::new(Self {
            config,
            types,
            topology,
            pipeline,
            store,
            queue,
            deferred,
            router,
            dispatcher,
            status,
            status_events,
            deliveries,
            cancel,
            in_flight: WaitGroup::new(),
            started: AtomicBool::new(false),
            sweep: Mutex::new(None),
        }))
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Subscribe to status transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChanged> {
        self.status_events.subscribe()
    }

    /// Subscribe to delivery notifications.
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<MessageReceived> {
        self.deliveries.subscribe()
    }

    /// Register a handler on an endpoint for the message types the provider
    /// names. Must precede [`Transport::start_background_message_processing`].
    pub async fn bind(
        &self,
        identity: EndpointId,
        handler: HandlerFn,
        messages: &dyn MessageTypeProvider,
    ) -> Result<(), TransportError> {
        self.topology
            .bind(identity, handler, &messages.handled_types())
            .await?;
        Ok(())
    }

    /// Register an error handler invoked when deliveries to the endpoint
    /// fail.
    pub async fn bind_error_handler(
        &self,
        identity: EndpointId,
        handler: ErrorHandlerFn,
    ) -> Result<(), TransportError> {
        self.topology.bind_error_handler(identity, handler).await?;
        Ok(())
    }

    /// Submit a message for routing.
    ///
    /// Suspends until the transport is running, then places the message on
    /// the immediate or deferred queue. Returns whether it was accepted; a
    /// cancelled transport accepts nothing.
    pub async fn enqueue(&self, envelope: Envelope) -> bool {
        self.router.deliver(envelope).await
    }

    /// Transition to `Running` and drive both queue loops concurrently.
    ///
    /// Resolves only after both loops exit, which happens on shutdown.
    pub async fn start_background_message_processing(
        self: &Arc<Self>,
    ) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        self.transition(TransportStatus::Starting);
        self.topology.lock_all().await;

        let sweep = spawn_outbox_sweep(Arc::clone(&self.dispatcher), self.config.outbox.clone());
        *self.sweep.lock().await = Some(sweep);

        self.transition(TransportStatus::Running);
        self.router.ready.set();
        info!("Background message processing started");

        let queue = Arc::clone(&self.queue);
        let deferred = Arc::clone(&self.deferred);
        let inner_queue = Arc::clone(&self.queue);
        let transport = Arc::clone(self);

        let dispatch_loop = queue.run(self.cancel.subscribe(), move |envelope| {
            let transport = Arc::clone(&transport);
            async move {
                transport.process_delivery(envelope).await;
            }
        });

        let deferred_loop = deferred.run(self.cancel.subscribe(), move |envelope| {
            let queue = Arc::clone(&inner_queue);
            async move {
                queue.enqueue(envelope).await;
            }
        });

        tokio::join!(dispatch_loop, deferred_loop);
        info!("Background message processing stopped");
        Ok(())
    }

    /// Stop accepting work and wait for in-flight handlers to drain,
    /// bounded by the configured deadline.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let _ = self.cancel.send(true);
        if let Some(sweep) = self.sweep.lock().await.take() {
            sweep.stop();
        }

        match self.config.shutdown.drain_timeout_secs {
            Some(secs) => {
                let deadline = Duration::from_secs(secs);
                tokio::time::timeout(deadline, self.in_flight.wait())
                    .await
                    .map_err(|_| TransportError::DrainTimeout(deadline))?;
            }
            None => self.in_flight.wait().await,
        }

        info!("Transport drained and stopped");
        Ok(())
    }

    fn transition(&self, next: TransportStatus) {
        let previous = self.status.send_replace(next);
        let _ = self.status_events.send(StatusChanged {
            previous,
            current: next,
        });
        info!(previous = ?previous, current = ?next, "Transport status changed");
    }

    fn notify_delivery(
        &self,
        message: Envelope,
        error: Option<String>,
        outcome: Option<ProcessingOutcome>,
    ) {
        let _ = self.deliveries.send(MessageReceived {
            message,
            error,
            outcome,
        });
    }

    /// Process one element popped from the dispatch loop: resolve handlers,
    /// run each through the pipeline, route failures to error handlers.
    async fn process_delivery(&self, envelope: Envelope) {
        let _guard = self.in_flight.enter();

        let matches = match self.topology.dispatch(&envelope).await {
            Ok(matches) => matches,
            Err(e) => {
                // Routing failures take the same error path as handler
                // failures.
                warn!(
                    message_id = %envelope.id(),
                    type_key = %envelope.type_key(),
                    error = %e,
                    "Dispatch failed"
                );
                self.notify_delivery(envelope.clone(), Some(e.to_string()), None);
                self.route_dispatch_failure(&envelope, &e).await;
                return;
            }
        };

        for matched in matches {
            let mut delivery = envelope.clone_for_delivery();
            delivery.headers_mut().set(Header::DeliveredAt(Utc::now()));
            delivery
                .headers_mut()
                .set(Header::HandledBy(matched.endpoint.clone()));

            let mut ctx = ProcessingContext::new(
                delivery,
                matched.endpoint.clone(),
                Arc::clone(&matched.handler),
                Arc::clone(&self.types),
            );

            match self.pipeline.execute(&mut ctx).await {
                Ok(outcome) => {
                    debug!(
                        message_id = %ctx.message.id(),
                        endpoint = %matched.endpoint,
                        outcome = ?outcome,
                        "Delivery processed"
                    );
                    if let ProcessingOutcome::Rejected { reason } = &outcome {
                        self.route_error(&matched.endpoint, &ctx.message, reason.clone())
                            .await;
                    }
                    self.notify_delivery(ctx.message, None, Some(outcome));
                }
                Err(e) => {
                    // One failing delivery must not halt the others.
                    error!(
                        message_id = %ctx.message.id(),
                        endpoint = %matched.endpoint,
                        error = %e,
                        "Delivery failed"
                    );
                    self.route_error(&matched.endpoint, &ctx.message, e.to_string())
                        .await;
                    self.notify_delivery(ctx.message, Some(e.to_string()), None);
                }
            }
        }
    }

    /// A message whose target cannot be resolved is handed to the error
    /// handlers of the endpoint that sent it, when one is known.
    async fn route_dispatch_failure(&self, envelope: &Envelope, failure: &DispatchError) {
        match envelope.headers().sent_from() {
            Some(origin) => {
                let origin = origin.clone();
                self.route_error(&origin, envelope, failure.to_string()).await;
            }
            None => {
                error!(
                    message_id = %envelope.id(),
                    error = %failure,
                    "Undeliverable message has no origin endpoint"
                );
            }
        }
    }

    async fn route_error(&self, endpoint: &EndpointId, envelope: &Envelope, reason: String) {
        match self.topology.error_handlers(endpoint).await {
            Ok(handlers) if !handlers.is_empty() => {
                for handler in handlers {
                    handler(envelope.clone_for_delivery(), reason.clone()).await;
                }
            }
            Ok(_) => {
                error!(
                    endpoint = %endpoint,
                    message_id = %envelope.id(),
                    error = %reason,
                    "Message failed and no error handler is bound"
                );
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Error-handler lookup failed");
            }
        }
    }
}
