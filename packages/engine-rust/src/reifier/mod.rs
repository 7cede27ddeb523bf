//! Compiles definition graphs into processor graphs.
//!
//! The [`Reifier`] maps each [`DefinitionKind`] to a factory. Factories get
//! the node and a [`CompileContext`] giving access to the registry, the
//! endpoints, worker pools and placeholder resolution, and compile their
//! children back through [`CompileContext::compile`]. Definitions are only
//! read: a failed compile leaves nothing half-substituted behind.

mod builtins;
pub mod error_handler;
pub mod placeholder;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use routeflow_core::{
    PropertiesResolver, Registry, SharedAggregation, SharedExpression, SharedPredicate,
    SharedProcessor,
};
use tracing::debug;

use crate::definition::{DefinitionKind, Param, ProcessorDefinition, Ref, RouteDefinition};
use crate::definition::ErrorHandlerDefinition;
use crate::endpoint::EndpointRegistry;
use crate::error::{CompileError, CompileResult};
use crate::errorhandler::RedeliveryPolicy;
use crate::executor::{ExecutorRegistry, WorkerPool};
use crate::processor::Pipeline;
use crate::registry;

pub use placeholder::resolve_placeholders;

/// Builds the processor for one definition kind.
pub type ReifierFactory = Arc<
    dyn Fn(&ProcessorDefinition, &CompileContext<'_>) -> CompileResult<SharedProcessor>
        + Send
        + Sync,
>;

// ---------------------------------------------------------------------------
// Reifier
// ---------------------------------------------------------------------------

/// Registry of reifier factories keyed by definition kind.
pub struct Reifier {
    factories: RwLock<HashMap<DefinitionKind, ReifierFactory>>,
}

impl Reifier {
    /// A reifier with no kinds registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A reifier with every built-in kind registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let reifier = Self::new();
        builtins::register_all(&reifier);
        reifier
    }

    /// Registers `factory` for `kind`, returning the factory it replaced.
    pub fn register<F>(&self, kind: DefinitionKind, factory: F) -> Option<ReifierFactory>
    where
        F: Fn(&ProcessorDefinition, &CompileContext<'_>) -> CompileResult<SharedProcessor>
            + Send
            + Sync
            + 'static,
    {
        self.factories.write().insert(kind, Arc::new(factory))
    }

    pub fn unregister(&self, kind: &DefinitionKind) -> Option<ReifierFactory> {
        self.factories.write().remove(kind)
    }

    #[must_use]
    pub fn is_registered(&self, kind: &DefinitionKind) -> bool {
        self.factories.read().contains_key(kind)
    }

    /// Compiles one definition, wrapping it in its node-scoped error
    /// handler when it has one.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::UnsupportedDefinition`] when no factory is
    /// registered for the definition's kind, or any error its factory (or
    /// a child's) reports.
    pub fn compile(
        &self,
        definition: &ProcessorDefinition,
        ctx: &CompileContext<'_>,
    ) -> CompileResult<SharedProcessor> {
        let kind = definition.kind();
        // Cloned out so factories can recurse without holding the lock.
        let factory = self
            .factories
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| CompileError::UnsupportedDefinition {
                kind: kind.to_string(),
            })?;
        let processor = factory(definition, ctx)?;
        match &definition.error_handler {
            Some(handler) => error_handler::wrap(handler, processor, &definition.label(), ctx),
            None => Ok(processor),
        }
    }

    /// Compiles a whole route: every top-level step is wrapped in the
    /// route's error handler (or `fallback` when the route has none) and
    /// the steps are joined in a pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first compile error of any step or of the handler.
    pub fn compile_route(
        &self,
        route: &RouteDefinition,
        fallback: Option<&ErrorHandlerDefinition>,
        ctx: &CompileContext<'_>,
    ) -> CompileResult<SharedProcessor> {
        let handler = route.error_handler.as_ref().or(fallback);
        let mut steps = Vec::with_capacity(route.outputs.len());
        for definition in &route.outputs {
            let step = self.compile(definition, ctx)?;
            let step = match handler {
                Some(handler) => {
                    let label = format!("{}/{}", route.id, definition.label());
                    error_handler::wrap(handler, step, &label, ctx)?
                }
                None => step,
            };
            steps.push(step);
        }
        debug!(route_id = %route.id, nodes = route.node_count(), "compiled route");
        Ok(Arc::new(Pipeline::new(steps)))
    }
}

impl Default for Reifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Reifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<String> = self.factories.read().keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("Reifier").field("kinds", &kinds).finish()
    }
}

// ---------------------------------------------------------------------------
// CompileContext
// ---------------------------------------------------------------------------

/// Everything a factory may consult while compiling.
pub struct CompileContext<'a> {
    reifier: &'a Reifier,
    registry: &'a dyn Registry,
    endpoints: &'a EndpointRegistry,
    properties: &'a dyn PropertiesResolver,
    executors: Option<&'a ExecutorRegistry>,
    redelivery: RedeliveryPolicy,
    throttle_idle_periods: u32,
}

impl<'a> CompileContext<'a> {
    pub fn new(
        reifier: &'a Reifier,
        registry: &'a dyn Registry,
        endpoints: &'a EndpointRegistry,
        properties: &'a dyn PropertiesResolver,
    ) -> Self {
        Self {
            reifier,
            registry,
            endpoints,
            properties,
            executors: None,
            redelivery: RedeliveryPolicy::default(),
            throttle_idle_periods: 10,
        }
    }

    /// Worker pools for parallel and asynchronously delayed nodes. Without
    /// them such nodes fail with [`CompileError::NoRuntime`].
    #[must_use]
    pub fn with_executors(mut self, executors: &'a ExecutorRegistry) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Base policy that error-handler definitions override.
    #[must_use]
    pub fn with_redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    #[must_use]
    pub fn with_throttle_idle_periods(mut self, periods: u32) -> Self {
        self.throttle_idle_periods = periods;
        self
    }

    #[must_use]
    pub fn reifier(&self) -> &Reifier {
        self.reifier
    }

    #[must_use]
    pub fn registry(&self) -> &dyn Registry {
        self.registry
    }

    #[must_use]
    pub fn endpoints(&self) -> &EndpointRegistry {
        self.endpoints
    }

    #[must_use]
    pub fn default_redelivery(&self) -> &RedeliveryPolicy {
        &self.redelivery
    }

    #[must_use]
    pub fn throttle_idle_periods(&self) -> u32 {
        self.throttle_idle_periods
    }

    // -- compilation -------------------------------------------------------

    /// Compiles a child definition through the reifier.
    ///
    /// # Errors
    ///
    /// See [`Reifier::compile`].
    pub fn compile(&self, definition: &ProcessorDefinition) -> CompileResult<SharedProcessor> {
        self.reifier.compile(definition, self)
    }

    /// Compiles each definition, preserving order.
    ///
    /// # Errors
    ///
    /// Returns the first child's error.
    pub fn compile_outputs(&self, definitions: &[ProcessorDefinition]) -> CompileResult<Vec<SharedProcessor>> {
        definitions.iter().map(|d| self.compile(d)).collect()
    }

    /// Compiles definitions into one processor: the single child itself,
    /// or a pipeline over all of them.
    ///
    /// # Errors
    ///
    /// Returns the first child's error.
    pub fn compile_pipeline(&self, definitions: &[ProcessorDefinition]) -> CompileResult<SharedProcessor> {
        let mut steps = self.compile_outputs(definitions)?;
        if steps.len() == 1 {
            if let Some(only) = steps.pop() {
                return Ok(only);
            }
        }
        Ok(Arc::new(Pipeline::new(steps)))
    }

    // -- resolution --------------------------------------------------------

    /// Substitutes placeholders in `text`.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::UnresolvedPlaceholder`] for a placeholder
    /// with no value and no default.
    pub fn resolve(&self, text: &str) -> CompileResult<String> {
        resolve_placeholders(text, self.properties)
    }

    /// Resolves a literal-or-placeholder parameter for `field` of `node`.
    ///
    /// # Errors
    ///
    /// Fails if the placeholder is unresolved or its value does not parse.
    pub fn param<T>(&self, param: &Param<T>, node: &str, field: &str) -> CompileResult<T>
    where
        T: FromStr + Clone,
    {
        param.resolve_with(
            |text| self.resolve(text),
            |resolved| {
                CompileError::invalid(node, format!("'{resolved}' is not a valid value for '{field}'"))
            },
        )
    }

    fn lookup<T: Clone>(
        &self,
        reference: &Ref<T>,
        expected: &'static str,
        find: fn(&dyn Registry, &str) -> Option<T>,
    ) -> CompileResult<T> {
        match reference {
            Ref::Inline(value) => Ok(value.clone()),
            Ref::Named(name) => {
                let name = self.resolve(name)?;
                find(self.registry, &name)
                    .ok_or_else(|| CompileError::unknown_reference(name, expected))
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`CompileError::UnknownReference`] for an unbound name.
    pub fn processor(&self, reference: &Ref<SharedProcessor>) -> CompileResult<SharedProcessor> {
        self.lookup(reference, "processor", registry::processor_ref)
    }

    /// # Errors
    ///
    /// Returns [`CompileError::UnknownReference`] for an unbound name.
    pub fn predicate(&self, reference: &Ref<SharedPredicate>) -> CompileResult<SharedPredicate> {
        self.lookup(reference, "predicate", registry::predicate_ref)
    }

    /// # Errors
    ///
    /// Returns [`CompileError::UnknownReference`] for an unbound name.
    pub fn expression(&self, reference: &Ref<SharedExpression>) -> CompileResult<SharedExpression> {
        self.lookup(reference, "expression", registry::expression_ref)
    }

    /// # Errors
    ///
    /// Returns [`CompileError::UnknownReference`] for an unbound name.
    pub fn strategy(&self, reference: &Ref<SharedAggregation>) -> CompileResult<SharedAggregation> {
        self.lookup(reference, "aggregation strategy", registry::strategy_ref)
    }

    /// The named worker pool, or the default pool when `name` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError::NoRuntime`] when the context has no
    /// executors and [`CompileError::UnknownReference`] for an unknown
    /// pool name.
    pub fn pool(&self, name: Option<&str>, node: &str) -> CompileResult<Arc<WorkerPool>> {
        let executors = self.executors.ok_or_else(|| CompileError::NoRuntime {
            node: node.to_string(),
        })?;
        let name = name.map(|n| self.resolve(n)).transpose()?;
        executors
            .get(name.as_deref())
            .ok_or_else(|| CompileError::unknown_reference(name.unwrap_or_default(), "worker pool"))
    }
}
