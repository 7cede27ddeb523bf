//! Named-object registry used to resolve `*_ref` fields in definitions.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use routeflow_core::{
    AggregationStrategy, Expression, Predicate, Processor, Registry, RegistryExt,
    SharedAggregation, SharedExpression, SharedPredicate, SharedProcessor,
};

// ---------------------------------------------------------------------------
// BeanRegistry
// ---------------------------------------------------------------------------

/// Thread-safe name-to-object registry.
///
/// Values are stored type-erased. Trait objects are wrapped before storage
/// (an `Arc<dyn Processor>` is stored as `Arc<SharedProcessor>`) so typed
/// lookups can downcast to a sized type; the `bind_*`/`*_ref` helpers do the
/// wrapping and unwrapping.
#[derive(Default)]
pub struct BeanRegistry {
    beans: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl BeanRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `value` under `name`, replacing any previous binding.
    pub fn bind<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.beans.insert(name.into(), Arc::new(value));
    }

    pub fn bind_processor(&self, name: impl Into<String>, processor: impl Processor + 'static) {
        let shared: SharedProcessor = Arc::new(processor);
        self.bind(name, shared);
    }

    pub fn bind_strategy(
        &self,
        name: impl Into<String>,
        strategy: impl AggregationStrategy + 'static,
    ) {
        let shared: SharedAggregation = Arc::new(strategy);
        self.bind(name, shared);
    }

    pub fn bind_expression(&self, name: impl Into<String>, expression: impl Expression + 'static) {
        let shared: SharedExpression = Arc::new(expression);
        self.bind(name, shared);
    }

    pub fn bind_predicate(&self, name: impl Into<String>, predicate: impl Predicate + 'static) {
        let shared: SharedPredicate = Arc::new(predicate);
        self.bind(name, shared);
    }

    /// Removes a binding. Returns `true` if one existed.
    pub fn unbind(&self, name: &str) -> bool {
        self.beans.remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.beans.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.beans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl Registry for BeanRegistry {
    fn lookup_any(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.beans.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

impl std::fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.beans.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("BeanRegistry").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Typed lookups for trait objects
// ---------------------------------------------------------------------------

/// Looks up a processor bound with [`BeanRegistry::bind_processor`].
pub fn processor_ref(registry: &dyn Registry, name: &str) -> Option<SharedProcessor> {
    registry.lookup::<SharedProcessor>(name).map(|p| (*p).clone())
}

/// Looks up a strategy bound with [`BeanRegistry::bind_strategy`].
pub fn strategy_ref(registry: &dyn Registry, name: &str) -> Option<SharedAggregation> {
    registry.lookup::<SharedAggregation>(name).map(|s| (*s).clone())
}

/// Looks up an expression bound with [`BeanRegistry::bind_expression`].
pub fn expression_ref(registry: &dyn Registry, name: &str) -> Option<SharedExpression> {
    registry.lookup::<SharedExpression>(name).map(|e| (*e).clone())
}

/// Looks up a predicate bound with [`BeanRegistry::bind_predicate`].
pub fn predicate_ref(registry: &dyn Registry, name: &str) -> Option<SharedPredicate> {
    registry.lookup::<SharedPredicate>(name).map(|p| (*p).clone())
}

#[cfg(test)]
mod tests {
    use routeflow_core::{processor_fn, Exchange, Value};

    use super::*;

    #[test]
    fn bind_and_lookup_plain_values() {
        let registry = BeanRegistry::new();
        registry.bind("limit", 5_u32);
        assert_eq!(registry.lookup::<u32>("limit").as_deref(), Some(&5));
        assert!(registry.lookup::<i64>("limit").is_none());
        assert!(registry.contains("limit"));
        assert!(registry.unbind("limit"));
        assert!(registry.is_empty());
    }

    #[test]
    fn trait_objects_round_trip_through_helpers() {
        let registry = BeanRegistry::new();
        registry.bind_strategy("latest", routeflow_core::expression::UseLatest);
        registry.bind_predicate("gold", |ex: &Exchange| ex.body() == &Value::from("gold"));
        registry.bind_expression("two", |_: &Exchange| Value::Int(2));
        let p = processor_fn("mark", |ex| {
            ex.set_header("marked", true);
            Ok(())
        });
        registry.bind("mark", p);

        assert!(strategy_ref(&registry, "latest").is_some());
        assert!(predicate_ref(&registry, "gold").is_some_and(|p| p.matches(&Exchange::new("gold"))));
        assert_eq!(
            expression_ref(&registry, "two").map(|e| e.evaluate(&Exchange::new(()))),
            Some(Value::Int(2))
        );
        let out = processor_ref(&registry, "mark")
            .expect("bound")
            .process_sync(Exchange::new(()));
        assert_eq!(out.header("marked"), Some(&Value::Bool(true)));
        assert!(processor_ref(&registry, "latest").is_none());
    }

    #[test]
    fn rebinding_replaces_value() {
        let registry = BeanRegistry::new();
        registry.bind("n", 1_i64);
        registry.bind("n", 2_i64);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup::<i64>("n").as_deref(), Some(&2));
    }
}
