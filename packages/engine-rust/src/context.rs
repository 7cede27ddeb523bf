//! The engine context: registries, worker pools and routes.

use std::sync::Arc;

use parking_lot::RwLock;
use routeflow_core::{Producer, PropertiesResolver};
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::definition::{ErrorHandlerDefinition, RouteDefinition};
use crate::endpoint::EndpointRegistry;
use crate::error::{CompileError, EngineError, EngineResult};
use crate::executor::ExecutorRegistry;
use crate::registry::BeanRegistry;
use crate::reifier::{CompileContext, Reifier};
use crate::route::{Route, RouteStatus};

struct RouteEntry {
    auto_startup: bool,
    route: Arc<Route>,
}

/// Owns everything routes need at compile time and at run time.
///
/// Routes are started in the order they were added and stopped in
/// reverse order.
pub struct EngineContext {
    config: EngineConfig,
    handle: Handle,
    // Only set when no runtime was running at construction time.
    _runtime: Option<Runtime>,
    beans: BeanRegistry,
    endpoints: EndpointRegistry,
    executors: ExecutorRegistry,
    reifier: Reifier,
    properties: Box<dyn PropertiesResolver>,
    error_handler: RwLock<ErrorHandlerDefinition>,
    routes: RwLock<Vec<RouteEntry>>,
}

impl EngineContext {
    /// Creates a context on the current Tokio runtime, or on a new
    /// multi-threaded runtime with `config.worker_threads` workers when
    /// called outside one.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Runtime`] if a runtime has to be created and
    /// cannot be.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.worker_threads.max(1))
                    .thread_name(format!("{}-worker", config.name))
                    .enable_all()
                    .build()
                    .map_err(EngineError::Runtime)?;
                (runtime.handle().clone(), Some(runtime))
            }
        };
        let executors = ExecutorRegistry::from_config(handle.clone(), &config);
        let properties = Box::new(config.properties.clone());
        info!(engine = %config.name, pools = config.pools.len() + 1, "engine context created");
        Ok(Self {
            handle,
            _runtime: runtime,
            beans: BeanRegistry::new(),
            endpoints: EndpointRegistry::new(),
            executors,
            reifier: Reifier::with_defaults(),
            properties,
            error_handler: RwLock::new(ErrorHandlerDefinition::default()),
            routes: RwLock::new(Vec::new()),
            config,
        })
    }

    /// Replaces the placeholder source (by default `config.properties`).
    #[must_use]
    pub fn with_properties(mut self, resolver: impl PropertiesResolver + 'static) -> Self {
        self.properties = Box::new(resolver);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle of the runtime the engine's pools spawn onto.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub fn registry(&self) -> &BeanRegistry {
        &self.beans
    }

    #[must_use]
    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    #[must_use]
    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// The reifier used for every route added from now on. Extensions
    /// register their definition kinds here.
    #[must_use]
    pub fn reifier(&self) -> &Reifier {
        &self.reifier
    }

    /// Error handler for routes that do not declare one. Applies to routes
    /// added after the call. Defaults to redelivering with the configured
    /// redelivery settings and keeping the failure once exhausted.
    pub fn set_error_handler(&self, handler: ErrorHandlerDefinition) {
        *self.error_handler.write() = handler;
    }

    /// A compile context over this engine's registries and defaults.
    #[must_use]
    pub fn compile_context(&self) -> CompileContext<'_> {
        CompileContext::new(&self.reifier, &self.beans, &self.endpoints, self.properties.as_ref())
            .with_executors(&self.executors)
            .with_redelivery(self.config.redelivery.to_policy())
            .with_throttle_idle_periods(self.config.throttle_idle_periods)
    }

    // -- routes ------------------------------------------------------------

    /// Compiles `definition` and binds it to its consuming endpoint. The
    /// route is not started.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateRoute`] if the id is taken,
    /// [`EngineError::Compile`] if compilation fails, and
    /// [`EngineError::Consumer`] if the endpoint cannot consume.
    pub fn add_route(&self, definition: RouteDefinition) -> EngineResult<Arc<Route>> {
        if self.route(&definition.id).is_some() {
            return Err(EngineError::DuplicateRoute { id: definition.id });
        }
        let ctx = self.compile_context();
        let from = ctx.resolve(&definition.from)?;
        let endpoint = self.endpoints.resolve(&from)?;
        let fallback = self.error_handler.read().clone();
        let processor = self
            .reifier
            .compile_route(&definition, Some(&fallback), &ctx)?;
        let route = Arc::new(Route::new(definition.id.clone(), processor, endpoint.as_ref())?);

        let mut routes = self.routes.write();
        if routes.iter().any(|entry| entry.route.id() == definition.id) {
            return Err(EngineError::DuplicateRoute { id: definition.id });
        }
        routes.push(RouteEntry {
            auto_startup: definition.auto_startup,
            route: Arc::clone(&route),
        });
        info!(route_id = %definition.id, from = %from, "route added");
        Ok(route)
    }

    /// Adds each definition in order, stopping at the first error.
    ///
    /// # Errors
    ///
    /// See [`EngineContext::add_route`].
    pub fn add_routes(&self, definitions: impl IntoIterator<Item = RouteDefinition>) -> EngineResult<()> {
        for definition in definitions {
            self.add_route(definition)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn route(&self, id: &str) -> Option<Arc<Route>> {
        self.routes
            .read()
            .iter()
            .find(|entry| entry.route.id() == id)
            .map(|entry| Arc::clone(&entry.route))
    }

    /// Every route, in the order added.
    #[must_use]
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().iter().map(|entry| Arc::clone(&entry.route)).collect()
    }

    #[must_use]
    pub fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.route(id).map(|route| route.status())
    }

    fn require(&self, id: &str) -> EngineResult<Arc<Route>> {
        self.route(id).ok_or_else(|| EngineError::UnknownRoute { id: id.to_string() })
    }

    // -- lifecycle ---------------------------------------------------------

    /// Starts every route added with `auto_startup`, in order.
    ///
    /// # Errors
    ///
    /// Returns the first route's start error. Routes started before it
    /// stay started.
    pub async fn start(&self) -> EngineResult<()> {
        let routes: Vec<Arc<Route>> = self
            .routes
            .read()
            .iter()
            .filter(|entry| entry.auto_startup)
            .map(|entry| Arc::clone(&entry.route))
            .collect();
        for route in &routes {
            route.start().await?;
        }
        info!(engine = %self.config.name, routes = routes.len(), "engine started");
        Ok(())
    }

    /// Stops every route in reverse order, each draining for at most the
    /// configured shutdown timeout.
    ///
    /// Returns `true` if every route drained in time.
    ///
    /// # Errors
    ///
    /// Returns the first consumer stop error after attempting every route.
    pub async fn stop(&self) -> EngineResult<bool> {
        let timeout = self.config.shutdown_timeout();
        let mut all_drained = true;
        let mut first_error = None;
        for route in self.routes().iter().rev() {
            match route.stop(timeout).await {
                Ok(drained) => all_drained &= drained,
                Err(err) => {
                    warn!(route_id = route.id(), error = %err, "route failed to stop");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        info!(engine = %self.config.name, drained = all_drained, "engine stopped");
        Ok(all_drained)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::UnknownRoute`] or the route's start error.
    pub async fn start_route(&self, id: &str) -> EngineResult<()> {
        self.require(id)?.start().await
    }

    /// Stops one route, returning whether it drained in time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownRoute`] or the route's stop error.
    pub async fn stop_route(&self, id: &str) -> EngineResult<bool> {
        self.require(id)?.stop(self.config.shutdown_timeout()).await
    }

    /// Stops the route and forgets it, freeing its id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownRoute`] or the route's stop error.
    pub async fn remove_route(&self, id: &str) -> EngineResult<()> {
        self.stop_route(id).await?;
        self.routes.write().retain(|entry| entry.route.id() != id);
        info!(route_id = id, "route removed");
        Ok(())
    }

    /// A producer for `uri`, for feeding exchanges into routes from
    /// outside the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Compile`] if the URI does not resolve or the
    /// endpoint cannot produce.
    pub fn producer(&self, uri: &str) -> EngineResult<Arc<dyn Producer>> {
        let uri = self.compile_context().resolve(uri)?;
        let endpoint = self.endpoints.resolve(&uri)?;
        let producer = endpoint
            .create_producer()
            .map_err(|source| CompileError::Endpoint { uri, source })?;
        Ok(producer)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("name", &self.config.name)
            .field("routes", &self.routes())
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use routeflow_core::expression::{constant, header};
    use routeflow_core::{Endpoint, Exchange, Processor, Value};

    use super::*;
    use crate::definition::{RedeliveryDefinition, RouteBuilder};
    use crate::testing::{self, MockEndpoint};

    fn engine() -> (EngineContext, Arc<MockEndpoint>) {
        let config = EngineConfig {
            properties: HashMap::from([("in".to_string(), "direct:in".to_string())]),
            ..EngineConfig::default()
        };
        let engine = EngineContext::new(config).unwrap();
        let mock = MockEndpoint::new("mock:out");
        engine.endpoints().register_endpoint(Arc::clone(&mock) as Arc<dyn Endpoint>);
        (engine, mock)
    }

    #[tokio::test]
    async fn routes_chain_through_direct_endpoints() {
        let (engine, mock) = engine();
        engine
            .add_routes([
                RouteBuilder::new("a", "{{in}}")
                    .steps(|s| s.set_header("via", constant("a")).to("direct:b"))
                    .build(),
                RouteBuilder::new("b", "direct:b")
                    .steps(|s| s.set_body(header("via")).to("mock:out"))
                    .build(),
            ])
            .unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.route_status("a"), Some(RouteStatus::Started));

        let exchange = engine.producer("direct:in").unwrap().process_sync(Exchange::new(()));
        assert!(!exchange.is_failed());
        assert_eq!(mock.received(), vec![Value::from("a")]);

        assert!(engine.stop().await.unwrap());
        assert!(engine.routes().iter().all(|r| r.status() == RouteStatus::Stopped));
    }

    #[tokio::test]
    async fn duplicate_ids_and_compile_errors_are_rejected() {
        let (engine, _) = engine();
        engine.add_route(RouteBuilder::new("a", "direct:a").build()).unwrap();
        assert!(matches!(
            engine.add_route(RouteBuilder::new("a", "direct:other").build()),
            Err(EngineError::DuplicateRoute { .. })
        ));
        assert!(matches!(
            engine.add_route(RouteBuilder::new("b", "direct:b").steps(|s| s.to("kafka:x")).build()),
            Err(EngineError::Compile(CompileError::UnknownEndpoint { .. }))
        ));
        assert!(matches!(
            engine.add_route(RouteBuilder::new("c", "{{nope}}").build()),
            Err(EngineError::Compile(CompileError::UnresolvedPlaceholder { .. }))
        ));
        assert_eq!(engine.routes().len(), 1);
    }

    #[tokio::test]
    async fn manual_routes_and_removal() {
        let (engine, _) = engine();
        engine
            .add_route(RouteBuilder::new("manual", "direct:m").auto_startup(false).build())
            .unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.route_status("manual"), Some(RouteStatus::Stopped));

        engine.start_route("manual").await.unwrap();
        assert_eq!(engine.route_status("manual"), Some(RouteStatus::Started));
        assert!(matches!(
            engine.start_route("missing").await,
            Err(EngineError::UnknownRoute { .. })
        ));

        engine.remove_route("manual").await.unwrap();
        assert!(engine.route("manual").is_none());
        engine.add_route(RouteBuilder::new("manual", "direct:m").build()).unwrap();
    }

    #[tokio::test]
    async fn engine_error_handler_applies_to_routes_without_one() {
        let (engine, _) = engine();
        let dlq = MockEndpoint::new("mock:dlq");
        engine.endpoints().register_endpoint(Arc::clone(&dlq) as Arc<dyn Endpoint>);
        engine.set_error_handler(
            ErrorHandlerDefinition::dead_letter("mock:dlq")
                .redelivery(RedeliveryDefinition::default().maximum_redeliveries(0_i64)),
        );
        let log = testing::log();
        engine
            .add_route(
                RouteBuilder::new("r", "direct:r")
                    .steps(|s| s.process_shared(testing::failing("work", &log)))
                    .build(),
            )
            .unwrap();
        engine.start().await.unwrap();
        let exchange = engine.producer("direct:r").unwrap().process_sync(Exchange::new("m"));
        assert!(!exchange.is_failed());
        assert_eq!(dlq.received(), vec![Value::from("m")]);
    }

    #[test]
    fn creates_own_runtime_outside_tokio() {
        let config = EngineConfig::from_json(r#"{"name": "standalone", "worker_threads": 1}"#).unwrap();
        let engine = EngineContext::new(config).unwrap();
        engine.add_route(RouteBuilder::new("r", "direct:r").build()).unwrap();
        engine.handle().block_on(async {
            engine.start().await.unwrap();
            assert!(engine.stop().await.unwrap());
        });
        assert_eq!(engine.config().shutdown_timeout(), Duration::from_secs(30));
    }
}
