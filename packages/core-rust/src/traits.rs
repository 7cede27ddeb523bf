use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor};
use crate::types::Value;

/// Computes a value from an exchange (header lookups, rate limits, keys).
///
/// Evaluation takes the exchange by shared reference and cannot mutate it.
pub trait Expression: Send + Sync {
    fn evaluate(&self, exchange: &Exchange) -> Value;
}

impl<F> Expression for F
where
    F: Fn(&Exchange) -> Value + Send + Sync,
{
    fn evaluate(&self, exchange: &Exchange) -> Value {
        self(exchange)
    }
}

/// Boolean test over an exchange, used by content-based routing and
/// exception policies. Must not mutate the exchange.
pub trait Predicate: Send + Sync {
    fn matches(&self, exchange: &Exchange) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Exchange) -> bool + Send + Sync,
{
    fn matches(&self, exchange: &Exchange) -> bool {
        self(exchange)
    }
}

/// Folds fan-out branch results into a single exchange.
///
/// Invoked incrementally: `existing` is `None` for the first branch to be
/// folded and the previous return value afterwards. Branches may arrive in
/// any order when they run in parallel.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, existing: Option<Exchange>, incoming: Exchange) -> Exchange;
}

impl<F> AggregationStrategy for F
where
    F: Fn(Option<Exchange>, Exchange) -> Exchange + Send + Sync,
{
    fn aggregate(&self, existing: Option<Exchange>, incoming: Exchange) -> Exchange {
        self(existing, incoming)
    }
}

/// Sends exchanges to an external system. Producers follow the same
/// asynchronous contract as every other processor.
pub trait Producer: Processor {
    /// URI of the endpoint this producer sends to.
    fn endpoint_uri(&self) -> &str;
}

/// Message source bound to a route. Creates exchanges and pushes them into
/// the route's processor with [`Processor::process_async`].
#[async_trait]
pub trait Consumer: Send + Sync {
    /// URI of the endpoint this consumer listens on.
    fn endpoint_uri(&self) -> &str;

    /// Starts accepting inbound work.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stops accepting inbound work. In-flight exchanges are not cancelled.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// A URI-addressable connector endpoint.
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    /// Creates a producer sending to this endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot produce (e.g. consume-only).
    fn create_producer(&self) -> anyhow::Result<Arc<dyn Producer>>;

    /// Creates a consumer that feeds inbound exchanges to `processor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot consume (e.g. produce-only).
    fn create_consumer(&self, processor: SharedProcessor) -> anyhow::Result<Box<dyn Consumer>>;
}

/// Name-to-object lookup used to resolve references in route definitions.
pub trait Registry: Send + Sync {
    /// Returns the object bound under `name`, if any.
    fn lookup_any(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Typed lookup on top of [`Registry::lookup_any`].
pub trait RegistryExt: Registry {
    /// Returns the object bound under `name` if it has type `T`.
    fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.lookup_any(name).and_then(|obj| obj.downcast::<T>().ok())
    }
}

impl<R: Registry + ?Sized> RegistryExt for R {}

/// Source of property values for `{{placeholder}}` resolution.
pub trait PropertiesResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<String>;
}

impl PropertiesResolver for std::collections::HashMap<String, String> {
    fn resolve(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}
