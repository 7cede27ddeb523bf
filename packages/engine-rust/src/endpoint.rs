//! Endpoint resolution and the in-process `direct:` endpoint.
//!
//! URIs resolve to endpoints in two ways: an endpoint registered under its
//! exact URI, or a [`Component`] registered for the URI's scheme that
//! creates the endpoint on first use. Created endpoints are cached so a
//! producer and a consumer on the same URI share one instance.

use std::sync::Arc;

use anyhow::bail;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use routeflow_core::{
    Completion, Consumer, Endpoint, Exchange, Processor, Producer, SharedProcessor,
};
use tracing::debug;

use crate::error::{CompileError, CompileResult, DirectConsumerNotAvailableError};

/// Scheme of the built-in in-process endpoint.
pub const DIRECT_SCHEME: &str = "direct";

/// Creates endpoints for one URI scheme.
pub trait Component: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if `uri` is malformed for this component.
    fn create_endpoint(&self, uri: &str) -> anyhow::Result<Arc<dyn Endpoint>>;
}

impl<F> Component for F
where
    F: Fn(&str) -> anyhow::Result<Arc<dyn Endpoint>> + Send + Sync,
{
    fn create_endpoint(&self, uri: &str) -> anyhow::Result<Arc<dyn Endpoint>> {
        self(uri)
    }
}

// ---------------------------------------------------------------------------
// EndpointRegistry
// ---------------------------------------------------------------------------

pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    components: DashMap<String, Arc<dyn Component>>,
}

impl EndpointRegistry {
    /// Creates a registry with the `direct` component installed.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            endpoints: DashMap::new(),
            components: DashMap::new(),
        };
        registry.register_component(
            DIRECT_SCHEME,
            |uri: &str| -> anyhow::Result<Arc<dyn Endpoint>> { Ok(Arc::new(DirectEndpoint::new(uri))) },
        );
        registry
    }

    /// Installs (or replaces) the component for `scheme`.
    pub fn register_component(&self, scheme: impl Into<String>, component: impl Component + 'static) {
        self.components.insert(scheme.into(), Arc::new(component));
    }

    /// Registers an endpoint under its own URI, replacing any cached one.
    pub fn register_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.uri().to_string(), endpoint);
    }

    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.endpoints.contains_key(uri)
    }

    /// Returns the endpoint for `uri`, creating it through its scheme's
    /// component if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::UnknownEndpoint`] if the URI has no
    /// registered endpoint or component, and [`CompileError::Endpoint`] if
    /// the component fails to create it.
    pub fn resolve(&self, uri: &str) -> CompileResult<Arc<dyn Endpoint>> {
        if let Some(endpoint) = self.endpoints.get(uri) {
            return Ok(Arc::clone(endpoint.value()));
        }
        let unknown = || CompileError::UnknownEndpoint {
            uri: uri.to_string(),
        };
        let (scheme, _) = uri.split_once(':').ok_or_else(unknown)?;
        let component = self
            .components
            .get(scheme)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(unknown)?;
        let created = component
            .create_endpoint(uri)
            .map_err(|source| CompileError::Endpoint {
                uri: uri.to_string(),
                source,
            })?;
        debug!(uri, "created endpoint");
        // A concurrent resolve may have won; every caller gets the same one.
        let endpoint = self.endpoints.entry(uri.to_string()).or_insert(created);
        Ok(Arc::clone(endpoint.value()))
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut schemes: Vec<String> = self.components.iter().map(|e| e.key().clone()).collect();
        schemes.sort();
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("schemes", &schemes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// direct:
// ---------------------------------------------------------------------------

/// Synchronous in-process hand-off: a producer on `direct:x` calls the
/// processor of the route consuming from `direct:x` on the caller's thread.
///
/// At most one consumer may be started at a time.
pub struct DirectEndpoint {
    shared: Arc<DirectShared>,
}

struct DirectShared {
    uri: String,
    active: ArcSwapOption<ActiveConsumer>,
    lifecycle: Mutex<()>,
}

struct ActiveConsumer {
    processor: SharedProcessor,
}

impl DirectEndpoint {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(DirectShared {
                uri: uri.into(),
                active: ArcSwapOption::empty(),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Whether a consumer is currently started.
    #[must_use]
    pub fn has_consumer(&self) -> bool {
        self.shared.active.load().is_some()
    }
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.shared.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Producer>> {
        Ok(Arc::new(DirectProducer {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn create_consumer(&self, processor: SharedProcessor) -> anyhow::Result<Box<dyn Consumer>> {
        Ok(Box::new(DirectConsumer {
            shared: Arc::clone(&self.shared),
            target: Arc::new(ActiveConsumer { processor }),
        }))
    }
}

struct DirectProducer {
    shared: Arc<DirectShared>,
}

impl Processor for DirectProducer {
    fn process(&self, mut exchange: Exchange) -> Completion {
        match self.shared.active.load_full() {
            Some(consumer) => consumer.processor.process(exchange),
            None => {
                exchange.fail(DirectConsumerNotAvailableError {
                    uri: self.shared.uri.clone(),
                });
                Completion::Done(exchange)
            }
        }
    }
}

impl Producer for DirectProducer {
    fn endpoint_uri(&self) -> &str {
        &self.shared.uri
    }
}

struct DirectConsumer {
    shared: Arc<DirectShared>,
    target: Arc<ActiveConsumer>,
}

#[async_trait]
impl Consumer for DirectConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.shared.uri
    }

    async fn start(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lifecycle.lock();
        if let Some(current) = self.shared.active.load_full() {
            if Arc::ptr_eq(&current, &self.target) {
                return Ok(());
            }
            bail!("endpoint '{}' already has a started consumer", self.shared.uri);
        }
        self.shared.active.store(Some(Arc::clone(&self.target)));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lifecycle.lock();
        let ours = self
            .shared
            .active
            .load_full()
            .is_some_and(|current| Arc::ptr_eq(&current, &self.target));
        if ours {
            self.shared.active.store(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use routeflow_core::{processor_fn, Value};

    use super::*;
    use crate::testing::MockEndpoint;

    #[tokio::test]
    async fn direct_hands_off_to_started_consumer() {
        let registry = EndpointRegistry::new();
        let endpoint = registry.resolve("direct:orders").unwrap();
        let producer = endpoint.create_producer().unwrap();

        let idle = producer.process_sync(Exchange::new(()));
        assert!(idle
            .failure()
            .and_then(|f| f.downcast_ref::<DirectConsumerNotAvailableError>())
            .is_some());

        let consumer = registry
            .resolve("direct:orders")
            .unwrap()
            .create_consumer(processor_fn("upper", |ex| {
                let upper = ex.body().to_string().to_uppercase();
                ex.set_body(upper);
                Ok(())
            }))
            .unwrap();
        consumer.start().await.unwrap();
        let handled = producer.process_sync(Exchange::new("abc"));
        assert_eq!(handled.body(), &Value::from("ABC"));

        consumer.stop().await.unwrap();
        assert!(producer.process_sync(Exchange::new(())).is_failed());
    }

    #[tokio::test]
    async fn direct_allows_one_started_consumer() {
        let endpoint = DirectEndpoint::new("direct:one");
        let first = endpoint.create_consumer(processor_fn("a", |_| Ok(()))).unwrap();
        let second = endpoint.create_consumer(processor_fn("b", |_| Ok(()))).unwrap();
        first.start().await.unwrap();
        first.start().await.unwrap();
        assert!(second.start().await.is_err());
        second.stop().await.unwrap();
        assert!(endpoint.has_consumer());
        first.stop().await.unwrap();
        assert!(!endpoint.has_consumer());
        second.start().await.unwrap();
    }

    #[test]
    fn unknown_scheme_and_component_failure() {
        let registry = EndpointRegistry::new();
        assert!(matches!(
            registry.resolve("kafka:topic"),
            Err(CompileError::UnknownEndpoint { .. })
        ));
        assert!(matches!(
            registry.resolve("no-scheme"),
            Err(CompileError::UnknownEndpoint { .. })
        ));
        registry.register_component("bad", |_: &str| -> anyhow::Result<Arc<dyn Endpoint>> {
            bail!("bad uri")
        });
        assert!(matches!(
            registry.resolve("bad:x"),
            Err(CompileError::Endpoint { .. })
        ));
    }

    #[test]
    fn resolved_endpoints_are_cached_and_registered_ones_win() {
        let registry = EndpointRegistry::new();
        let a = registry.resolve("direct:a").unwrap();
        let again = registry.resolve("direct:a").unwrap();
        assert!(Arc::ptr_eq(&a, &again));

        let mock = MockEndpoint::new("mock:out");
        registry.register_endpoint(Arc::clone(&mock) as Arc<dyn Endpoint>);
        assert!(registry.contains("mock:out"));
        assert_eq!(registry.resolve("mock:out").unwrap().uri(), "mock:out");
    }
}
