//! Topology registry: message types to bound handlers per endpoint.
//!
//! Binding expands every `(source, destination)` pair where the destination
//! is one of the handler's declared types and is assignable from a registered
//! source type, so a handler bound to a base event type also receives derived
//! instances. The registry is mutable only before `lock`; dispatch against an
//! unlocked identity fails loudly instead of silently no-op-ing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::handler::{ErrorHandlerFn, HandlerFn};
use crate::message::{
    EndpointId, Envelope, HeaderError, TypeRegistry, WILDCARD_ENDPOINT,
};

pub mod selector;

pub use selector::{HashSelector, InstanceSelector, RoundRobinSelector};

pub type Result<T> = std::result::Result<T, TopologyError>;

/// Configuration errors raised while building the topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("endpoint '{0}' is locked, binding is forbidden after lock")]
    Locked(String),

    #[error("message type not registered: {0}")]
    UnknownType(String),

    #[error("no message types declared for binding on endpoint '{0}'")]
    NoTypes(String),
}

/// Failures raised while resolving handlers for a message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("topology not locked for endpoint '{endpoint}'")]
    NotLocked { endpoint: String },

    #[error("target endpoint not found: '{target}' has no handler for {type_key}")]
    TargetNotFound { target: String, type_key: String },

    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// One resolved delivery: the bound handler, the physical endpoint chosen
/// for it, and the destination type it was matched under.
#[derive(Clone)]
pub struct MatchedHandler {
    pub handler: HandlerFn,
    pub endpoint: EndpointId,
    pub destination: String,
}

struct Binding {
    identity: EndpointId,
    handler: HandlerFn,
}

#[derive(Default)]
struct Inner {
    /// source type → destination type → logical name (normalized) →
    /// instance name (normalized) → binding
    routes: HashMap<String, HashMap<String, HashMap<String, HashMap<String, Binding>>>>,
    error_handlers: HashMap<String, Vec<ErrorHandlerFn>>,
    locked: HashSet<String>,
}

/// Routing table from message types to bound handlers per endpoint.
pub struct TopologyRegistry {
    types: Arc<TypeRegistry>,
    selector: Arc<dyn InstanceSelector>,
    inner: RwLock<Inner>,
}

impl TopologyRegistry {
    pub fn new(types: Arc<TypeRegistry>, selector: Arc<dyn InstanceSelector>) -> Self {
        Self {
            types,
            selector,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Register `handler` on `identity` for every registered source type
    /// assignable to one of `destinations`.
    pub async fn bind(
        &self,
        identity: EndpointId,
        handler: HandlerFn,
        destinations: &[String],
    ) -> Result<()> {
        if destinations.is_empty() {
            return Err(TopologyError::NoTypes(identity.to_string()));
        }

        let mut inner = self.inner.write().await;
        if inner.locked.contains(&identity.storage_key()) {
            return Err(TopologyError::Locked(identity.to_string()));
        }

        for destination in destinations {
            if !self.types.contains(destination) {
                return Err(TopologyError::UnknownType(destination.clone()));
            }
        }

        let sources: Vec<String> = self.types.keys().map(str::to_string).collect();
        let logical = identity.logical().to_ascii_lowercase();
        let instance = identity.instance().to_ascii_lowercase();

        for source in sources {
            for destination in destinations {
                if !self.types.assignable(&source, destination) {
                    continue;
                }
                debug!(
                    source = %source,
                    destination = %destination,
                    endpoint = %identity,
                    "Topology route bound"
                );
                inner
                    .routes
                    .entry(source.clone())
                    .or_default()
                    .entry(destination.clone())
                    .or_default()
                    .entry(logical.clone())
                    .or_default()
                    .insert(
                        instance.clone(),
                        Binding {
                            identity: identity.clone(),
                            handler: Arc::clone(&handler),
                        },
                    );
            }
        }

        Ok(())
    }

    /// Register an error handler invoked when a delivery to `identity` fails.
    pub async fn bind_error_handler(
        &self,
        identity: EndpointId,
        handler: ErrorHandlerFn,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.locked.contains(&identity.storage_key()) {
            return Err(TopologyError::Locked(identity.to_string()));
        }
        inner
            .error_handlers
            .entry(identity.storage_key())
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Freeze binding for one endpoint identity.
    pub async fn lock(&self, identity: &EndpointId) {
        self.inner.write().await.locked.insert(identity.storage_key());
    }

    /// Freeze binding for every identity seen so far. Called by the
    /// transport before background processing starts.
    pub async fn lock_all(&self) {
        let mut inner = self.inner.write().await;
        let mut keys: HashSet<String> = HashSet::new();
        for by_dest in inner.routes.values() {
            for by_logical in by_dest.values() {
                for by_instance in by_logical.values() {
                    for binding in by_instance.values() {
                        keys.insert(binding.identity.storage_key());
                    }
                }
            }
        }
        keys.extend(inner.error_handlers.keys().cloned());
        inner.locked.extend(keys);
    }

    pub async fn is_locked(&self, identity: &EndpointId) -> bool {
        self.inner.read().await.locked.contains(&identity.storage_key())
    }

    /// Resolve the handlers for a message.
    ///
    /// Matches bindings whose logical endpoint name equals the message's
    /// target header, or every bound endpoint when the target is `"*"`.
    /// Among several instances of one logical endpoint the configured
    /// selection strategy picks the physical instance.
    pub async fn dispatch(
        &self,
        envelope: &Envelope,
    ) -> std::result::Result<Vec<MatchedHandler>, DispatchError> {
        let target = envelope.headers().target_endpoint()?.to_string();
        let inner = self.inner.read().await;

        let mut matched: Vec<MatchedHandler> = Vec::new();

        if let Some(by_dest) = inner.routes.get(envelope.type_key()) {
            for (destination, by_logical) in by_dest {
                for (logical, by_instance) in by_logical {
                    if target != WILDCARD_ENDPOINT && !logical.eq_ignore_ascii_case(&target) {
                        continue;
                    }

                    let mut candidates: Vec<EndpointId> = by_instance
                        .values()
                        .map(|b| b.identity.clone())
                        .collect();
                    candidates.sort_by(|a, b| a.instance().cmp(b.instance()));

                    for candidate in &candidates {
                        if !inner.locked.contains(&candidate.storage_key()) {
                            return Err(DispatchError::NotLocked {
                                endpoint: candidate.to_string(),
                            });
                        }
                    }

                    let chosen = self.selector.select(envelope, &candidates);
                    if let Some(binding) =
                        by_instance.get(&chosen.instance().to_ascii_lowercase())
                    {
                        matched.push(MatchedHandler {
                            handler: Arc::clone(&binding.handler),
                            endpoint: binding.identity.clone(),
                            destination: destination.clone(),
                        });
                    }
                }
            }
        }

        // A handler bound to several compatible destinations still receives
        // one delivery per message.
        let mut deduped: Vec<MatchedHandler> = Vec::with_capacity(matched.len());
        for candidate in matched {
            let duplicate = deduped.iter().any(|kept| {
                kept.endpoint == candidate.endpoint
                    && Arc::ptr_eq(&kept.handler, &candidate.handler)
            });
            if !duplicate {
                deduped.push(candidate);
            }
        }

        if deduped.is_empty() {
            return Err(DispatchError::TargetNotFound {
                target,
                type_key: envelope.type_key().to_string(),
            });
        }

        Ok(deduped)
    }

    /// Error handlers bound for `identity`. Fails when the identity has not
    /// been locked yet.
    pub async fn error_handlers(
        &self,
        identity: &EndpointId,
    ) -> std::result::Result<Vec<ErrorHandlerFn>, DispatchError> {
        let inner = self.inner.read().await;
        if !inner.locked.contains(&identity.storage_key()) {
            return Err(DispatchError::NotLocked {
                endpoint: identity.to_string(),
            });
        }
        Ok(inner
            .error_handlers
            .get(&identity.storage_key())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::{BusMessage, MessageKind};

    #[derive(Serialize, Deserialize)]
    struct OrderEvent;

    impl BusMessage for OrderEvent {
        const TYPE_KEY: &'static str = "OrderEvent";
        const KIND: MessageKind = MessageKind::Event;
    }

    #[derive(Serialize, Deserialize)]
    struct OrderPlaced;

    impl BusMessage for OrderPlaced {
        const TYPE_KEY: &'static str = "OrderPlaced";
        const KIND: MessageKind = MessageKind::Event;

        fn dispatch_keys() -> Vec<&'static str> {
            vec!["OrderPlaced", "OrderEvent"]
        }
    }

    fn registry() -> (TopologyRegistry, Arc<TypeRegistry>) {
        let mut types = TypeRegistry::new();
        types.register::<OrderEvent>().unwrap();
        types.register::<OrderPlaced>().unwrap();
        let types = Arc::new(types);
        (
            TopologyRegistry::new(Arc::clone(&types), Arc::new(HashSelector)),
            types,
        )
    }

    fn noop_handler() -> HandlerFn {
        Arc::new(|_, _| Box::pin(async { Ok(()) }))
    }

    fn counting_handler(count: Arc<AtomicUsize>) -> HandlerFn {
        Arc::new(move |_, _| {
            let count = Arc::clone(&count);
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_base_type_binding_receives_derived_message() {
        let (topology, types) = registry();
        let endpoint = EndpointId::new("orders", "a");
        topology
            .bind(
                endpoint.clone(),
                noop_handler(),
                &["OrderEvent".to_string()],
            )
            .await
            .unwrap();
        topology.lock(&endpoint).await;

        let envelope = types.envelope(&OrderPlaced).unwrap().with_target("orders");
        let matched = topology.dispatch(&envelope).await.unwrap();

        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].destination, "OrderEvent");
    }

    #[tokio::test]
    async fn test_bind_after_lock_is_configuration_error() {
        let (topology, _) = registry();
        let endpoint = EndpointId::new("orders", "a");
        topology.lock(&endpoint).await;

        let bound = topology
            .bind(endpoint.clone(), noop_handler(), &["OrderEvent".to_string()])
            .await;
        assert!(matches!(bound, Err(TopologyError::Locked(_))));

        let error_bound = topology
            .bind_error_handler(endpoint, Arc::new(|_, _| Box::pin(async {})))
            .await;
        assert!(matches!(error_bound, Err(TopologyError::Locked(_))));
    }

    #[tokio::test]
    async fn test_dispatch_before_lock_fails_loudly() {
        let (topology, types) = registry();
        let endpoint = EndpointId::new("orders", "a");
        topology
            .bind(endpoint, noop_handler(), &["OrderEvent".to_string()])
            .await
            .unwrap();

        let envelope = types.envelope(&OrderPlaced).unwrap().with_target("orders");
        let result = topology.dispatch(&envelope).await;

        assert!(matches!(result, Err(DispatchError::NotLocked { .. })));
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let (topology, types) = registry();
        let endpoint = EndpointId::new("orders", "a");
        topology
            .bind(endpoint.clone(), noop_handler(), &["OrderEvent".to_string()])
            .await
            .unwrap();
        topology.lock(&endpoint).await;

        let envelope = types.envelope(&OrderPlaced).unwrap().with_target("billing");
        let result = topology.dispatch(&envelope).await;

        assert!(matches!(result, Err(DispatchError::TargetNotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_destination_type_rejected_at_bind() {
        let (topology, _) = registry();
        let result = topology
            .bind(
                EndpointId::new("orders", "a"),
                noop_handler(),
                &["NoSuchType".to_string()],
            )
            .await;

        assert!(matches!(result, Err(TopologyError::UnknownType(_))));
    }

    #[tokio::test]
    async fn test_wildcard_matches_all_logical_endpoints() {
        let (topology, types) = registry();
        for name in ["orders", "audit"] {
            let endpoint = EndpointId::new(name, "a");
            topology
                .bind(endpoint.clone(), noop_handler(), &["OrderEvent".to_string()])
                .await
                .unwrap();
        }
        topology.lock_all().await;

        let envelope = types
            .envelope(&OrderPlaced)
            .unwrap()
            .with_target(WILDCARD_ENDPOINT);
        let matched = topology.dispatch(&envelope).await.unwrap();

        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn test_one_instance_selected_among_replicas() {
        let (topology, types) = registry();
        for instance in ["a", "b", "c"] {
            topology
                .bind(
                    EndpointId::new("orders", instance),
                    noop_handler(),
                    &["OrderEvent".to_string()],
                )
                .await
                .unwrap();
        }
        topology.lock_all().await;

        let envelope = types.envelope(&OrderPlaced).unwrap().with_target("orders");
        let matched = topology.dispatch(&envelope).await.unwrap();

        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_bound_to_both_base_and_derived_matches_once() {
        let (topology, types) = registry();
        let endpoint = EndpointId::new("orders", "a");
        let count = Arc::new(AtomicUsize::new(0));
        topology
            .bind(
                endpoint.clone(),
                counting_handler(Arc::clone(&count)),
                &["OrderEvent".to_string(), "OrderPlaced".to_string()],
            )
            .await
            .unwrap();
        topology.lock(&endpoint).await;

        let envelope = types.envelope(&OrderPlaced).unwrap().with_target("orders");
        let matched = topology.dispatch(&envelope).await.unwrap();

        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_matching_is_case_insensitive() {
        let (topology, types) = registry();
        let endpoint = EndpointId::new("OrdersEndpoint", "A");
        topology
            .bind(endpoint.clone(), noop_handler(), &["OrderEvent".to_string()])
            .await
            .unwrap();
        topology.lock(&endpoint).await;

        let envelope = types
            .envelope(&OrderPlaced)
            .unwrap()
            .with_target("ordersendpoint");
        let matched = topology.dispatch(&envelope).await.unwrap();

        assert_eq!(matched.len(), 1);
    }
}
