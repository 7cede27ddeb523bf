//! Routeflow Engine: route definitions, the reifier, EIP processors,
//! redelivery, worker pools and the route lifecycle.

pub mod config;
pub mod context;
pub mod definition;
pub mod endpoint;
pub mod error;
pub mod errorhandler;
pub mod executor;
pub mod processor;
pub mod registry;
pub mod reifier;
pub mod route;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, PoolConfig, RedeliveryConfig, RejectionPolicy};
pub use context::EngineContext;
pub use definition::{
    DefinitionKind, ErrorHandlerDefinition, ProcessorDefinition, RouteBuilder, RouteDefinition,
    StepsBuilder,
};
pub use endpoint::{Component, DirectEndpoint, EndpointRegistry};
pub use error::{
    CompileError, CompileResult, EngineError, EngineResult, RejectedExecutionError,
    ThrottlerRejectedError,
};
pub use errorhandler::{ExceptionPolicy, RedeliveryErrorHandler, RedeliveryPolicy};
pub use executor::{ExecutorRegistry, WorkerPool};
pub use registry::BeanRegistry;
pub use reifier::{CompileContext, Reifier};
pub use route::{Route, RouteService, RouteStatus};
