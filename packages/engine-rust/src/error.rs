//! Error types for compilation, engine lifecycle and runtime rejections.

use std::time::Duration;

use thiserror::Error;

/// Result type for route compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Errors raised while compiling route definitions. Any of these aborts
/// route startup.
#[derive(Debug, Error)]
pub enum CompileError {
    /// No reifier factory is registered for the definition's kind.
    #[error("no reifier registered for definition kind '{kind}'")]
    UnsupportedDefinition {
        /// The unregistered kind.
        kind: String,
    },

    /// A definition is missing a mandatory field or is otherwise malformed.
    #[error("invalid {node} definition: {reason}")]
    InvalidDefinition {
        /// Kind (and id, when set) of the offending node.
        node: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A `{{placeholder}}` could not be resolved.
    #[error("could not resolve placeholder '{key}' in '{input}'")]
    UnresolvedPlaceholder {
        /// The placeholder key.
        key: String,
        /// The full string being resolved.
        input: String,
    },

    /// A `to` URI did not resolve to a registered endpoint.
    #[error("no endpoint registered for uri '{uri}'")]
    UnknownEndpoint {
        /// The URI after placeholder resolution.
        uri: String,
    },

    /// A reference did not resolve in the registry.
    #[error("no {expected} bound under '{name}' in the registry")]
    UnknownReference {
        /// The reference name.
        name: String,
        /// What the reference should point at.
        expected: &'static str,
    },

    /// A node needs a worker pool but the compile context has no executors.
    #[error("{node} needs a worker pool but no runtime is configured")]
    NoRuntime {
        /// Kind (and id, when set) of the offending node.
        node: String,
    },

    /// An endpoint refused to create a producer or consumer.
    #[error("endpoint '{uri}' failed: {source}")]
    Endpoint {
        /// The endpoint URI.
        uri: String,
        /// The endpoint's error.
        #[source]
        source: anyhow::Error,
    },
}

impl CompileError {
    /// Create an `InvalidDefinition` error.
    #[inline]
    pub fn invalid(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Create an `InvalidDefinition` error for a missing mandatory field.
    #[inline]
    pub fn missing_field(node: impl Into<String>, field: &str) -> Self {
        Self::InvalidDefinition {
            node: node.into(),
            reason: format!("missing mandatory field '{field}'"),
        }
    }

    /// Create an `UnknownReference` error.
    #[inline]
    pub fn unknown_reference(name: impl Into<String>, expected: &'static str) -> Self {
        Self::UnknownReference {
            name: name.into(),
            expected,
        }
    }
}

/// Result type for engine and route lifecycle operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors from engine and route lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("a route with id '{id}' already exists")]
    DuplicateRoute { id: String },

    #[error("no route with id '{id}'")]
    UnknownRoute { id: String },

    #[error("route '{id}' is not started")]
    RouteNotStarted { id: String },

    #[error("consumer for route '{route_id}' failed: {source}")]
    Consumer {
        route_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no Tokio runtime available and none could be created: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Captured on an exchange when a throttle in reject mode is at capacity.
#[derive(Debug, Error)]
#[error("exceeded {max_requests} requests per {period:?} for throttle key '{key}'")]
pub struct ThrottlerRejectedError {
    pub key: String,
    pub max_requests: u32,
    pub period: Duration,
}

/// Captured on an exchange when a worker pool refuses a task.
#[derive(Debug, Error)]
#[error("worker pool '{pool}' rejected the task: all {capacity} workers busy")]
pub struct RejectedExecutionError {
    pub pool: String,
    pub capacity: usize,
}

/// Captured when a task spawned on a worker pool did not produce a result
/// (it panicked or its runtime shut down).
#[derive(Debug, Error)]
#[error("task on worker pool '{pool}' did not complete: {reason}")]
pub struct TaskAbortedError {
    pub pool: String,
    pub reason: String,
}

/// Captured when a producer sends to a `direct:` endpoint with no started
/// consumer.
#[derive(Debug, Error)]
#[error("no consumer available on endpoint '{uri}'")]
pub struct DirectConsumerNotAvailableError {
    pub uri: String,
}

/// Captured when an expression yields a value a node cannot use.
#[derive(Debug, Error)]
#[error("{node}: {reason}")]
pub struct ExpressionError {
    pub node: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_messages_name_node_and_field() {
        let err = CompileError::missing_field("throttle[t1]", "max_requests");
        assert_eq!(
            err.to_string(),
            "invalid throttle[t1] definition: missing mandatory field 'max_requests'"
        );
    }

    #[test]
    fn engine_error_wraps_compile_error() {
        let err: EngineError = CompileError::UnsupportedDefinition {
            kind: "saga".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "no reifier registered for definition kind 'saga'");
    }

    #[test]
    fn rejection_error_reports_key_and_rate() {
        let err = ThrottlerRejectedError {
            key: "acme".to_string(),
            max_requests: 2,
            period: Duration::from_millis(1000),
        };
        assert_eq!(
            err.to_string(),
            "exceeded 2 requests per 1s for throttle key 'acme'"
        );
    }
}
