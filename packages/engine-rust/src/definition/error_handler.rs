//! Error-handler definitions attached to routes or individual nodes.

use routeflow_core::{ErrorMatcher, SharedPredicate};

use super::{Param, ProcessorDefinition, Ref};

/// Which error handler to build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorHandlerKind {
    /// Redelivers; once exhausted the failure stays on the exchange.
    #[default]
    Default,
    /// Redelivers; once exhausted the exchange is sent to `uri` and the
    /// failure is marked handled.
    DeadLetter { uri: String },
    /// No wrapping at all.
    NoErrorHandler,
}

/// Overrides on top of the engine's default redelivery settings. Unset
/// fields keep the default.
#[derive(Debug, Clone, Default)]
pub struct RedeliveryDefinition {
    /// Negative means unlimited.
    pub maximum_redeliveries: Option<Param<i64>>,
    pub redelivery_delay_ms: Option<Param<u64>>,
    pub maximum_redelivery_delay_ms: Option<Param<u64>>,
    pub use_exponential_backoff: Option<bool>,
    pub backoff_multiplier: Option<f64>,
    /// Jitter factor in `(0, 1)` applied to every delay.
    pub collision_avoidance_factor: Option<f64>,
    pub retry_while: Option<Ref<SharedPredicate>>,
    pub async_delayed_redelivery: Option<bool>,
}

impl RedeliveryDefinition {
    #[must_use]
    pub fn maximum_redeliveries(mut self, max: impl Into<Param<i64>>) -> Self {
        self.maximum_redeliveries = Some(max.into());
        self
    }

    #[must_use]
    pub fn redelivery_delay_ms(mut self, delay: impl Into<Param<u64>>) -> Self {
        self.redelivery_delay_ms = Some(delay.into());
        self
    }

    #[must_use]
    pub fn maximum_redelivery_delay_ms(mut self, delay: impl Into<Param<u64>>) -> Self {
        self.maximum_redelivery_delay_ms = Some(delay.into());
        self
    }

    #[must_use]
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.use_exponential_backoff = Some(true);
        self.backoff_multiplier = Some(multiplier);
        self
    }

    #[must_use]
    pub fn collision_avoidance(mut self, factor: f64) -> Self {
        self.collision_avoidance_factor = Some(factor);
        self
    }

    #[must_use]
    pub fn retry_while(mut self, predicate: SharedPredicate) -> Self {
        self.retry_while = Some(Ref::Inline(predicate));
        self
    }

    #[must_use]
    pub fn async_delayed(mut self) -> Self {
        self.async_delayed_redelivery = Some(true);
        self
    }
}

/// Exception-specific policy, matched in declaration order.
#[derive(Debug, Clone, Default)]
pub struct OnExceptionDefinition {
    /// Empty matches any failure.
    pub exceptions: Vec<ErrorMatcher>,
    pub on_when: Option<Ref<SharedPredicate>>,
    /// Replaces the handler's redelivery settings for matching failures.
    pub redelivery: Option<RedeliveryDefinition>,
    /// Clear the failure once `outputs` have run.
    pub handled: bool,
    /// Run when redelivery is exhausted, instead of the dead-letter channel.
    pub outputs: Vec<ProcessorDefinition>,
}

impl OnExceptionDefinition {
    #[must_use]
    pub fn new(exceptions: Vec<ErrorMatcher>) -> Self {
        Self {
            exceptions,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn on_when(mut self, predicate: SharedPredicate) -> Self {
        self.on_when = Some(Ref::Inline(predicate));
        self
    }

    #[must_use]
    pub fn redelivery(mut self, redelivery: RedeliveryDefinition) -> Self {
        self.redelivery = Some(redelivery);
        self
    }

    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    #[must_use]
    pub fn output(mut self, output: ProcessorDefinition) -> Self {
        self.outputs.push(output);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorHandlerDefinition {
    pub kind: ErrorHandlerKind,
    pub redelivery: RedeliveryDefinition,
    pub on_exceptions: Vec<OnExceptionDefinition>,
    /// Hand the dead-letter or on-exception handler the message as it was
    /// when the exchange entered the handler.
    pub use_original_message: bool,
    /// Pool for delayed redelivery when `async_delayed_redelivery` is set.
    pub executor_ref: Option<String>,
}

impl ErrorHandlerDefinition {
    #[must_use]
    pub fn default_handler() -> Self {
        Self::default()
    }

    pub fn dead_letter(uri: impl Into<String>) -> Self {
        Self {
            kind: ErrorHandlerKind::DeadLetter { uri: uri.into() },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn none() -> Self {
        Self {
            kind: ErrorHandlerKind::NoErrorHandler,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn redelivery(mut self, redelivery: RedeliveryDefinition) -> Self {
        self.redelivery = redelivery;
        self
    }

    #[must_use]
    pub fn on_exception(mut self, policy: OnExceptionDefinition) -> Self {
        self.on_exceptions.push(policy);
        self
    }

    #[must_use]
    pub fn use_original_message(mut self) -> Self {
        self.use_original_message = true;
        self
    }

    #[must_use]
    pub fn executor_ref(mut self, name: impl Into<String>) -> Self {
        self.executor_ref = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_fields() {
        let def = ErrorHandlerDefinition::dead_letter("direct:dlq")
            .redelivery(
                RedeliveryDefinition::default()
                    .maximum_redeliveries(3_i64)
                    .redelivery_delay_ms(Param::<u64>::placeholder("{{delay}}"))
                    .exponential_backoff(2.0),
            )
            .on_exception(OnExceptionDefinition::new(vec![ErrorMatcher::any()]).handled(true))
            .use_original_message();
        assert_eq!(
            def.kind,
            ErrorHandlerKind::DeadLetter {
                uri: "direct:dlq".to_string()
            }
        );
        assert_eq!(def.redelivery.maximum_redeliveries, Some(Param::Value(3)));
        assert_eq!(def.redelivery.use_exponential_backoff, Some(true));
        assert!(def.on_exceptions[0].handled);
        assert!(def.use_original_message);
    }

    #[test]
    fn no_error_handler_kind() {
        assert_eq!(ErrorHandlerDefinition::none().kind, ErrorHandlerKind::NoErrorHandler);
        assert_eq!(ErrorHandlerDefinition::default_handler().kind, ErrorHandlerKind::Default);
    }
}
