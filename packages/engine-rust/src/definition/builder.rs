//! Fluent construction of route definitions.
//!
//! ```ignore
//! let route = RouteBuilder::new("orders", "direct:orders")
//!     .steps(|s| {
//!         s.choice(|c| {
//!             c.when(header_equals("tier", "gold"), |s| s.to("direct:gold"))
//!                 .otherwise(|s| s.to("direct:standard"))
//!         })
//!         .to("direct:audit")
//!     })
//!     .build();
//! ```

use std::sync::Arc;

use routeflow_core::{
    ErrorMatcher, Processor, SharedAggregation, SharedExpression, SharedPredicate,
    SharedProcessor,
};

use super::{
    CatchDefinition, ChoiceDefinition, ErrorHandlerDefinition, FinallyDefinition, MaxRequests,
    MulticastDefinition, OtherwiseDefinition, Param, PipelineDefinition, ProcessDefinition,
    ProcessorDefinition, Ref, RouteDefinition, SetBodyDefinition, SetHeaderDefinition,
    ThrottleDefinition, ToDefinition, TryDefinition, WhenDefinition,
};

// ---------------------------------------------------------------------------
// RouteBuilder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RouteBuilder {
    route: RouteDefinition,
}

impl RouteBuilder {
    pub fn new(id: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            route: RouteDefinition::new(id, from),
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.route.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandlerDefinition) -> Self {
        self.route.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.route.auto_startup = auto_startup;
        self
    }

    /// Appends the steps built by `f`.
    #[must_use]
    pub fn steps(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.route.outputs.extend(f(StepsBuilder::new()).build());
        self
    }

    #[must_use]
    pub fn build(self) -> RouteDefinition {
        self.route
    }
}

// ---------------------------------------------------------------------------
// StepsBuilder
// ---------------------------------------------------------------------------

/// An ordered list of steps. `id`, `description` and `error_handler`
/// apply to the most recently added step.
#[derive(Debug, Default)]
pub struct StepsBuilder {
    outputs: Vec<ProcessorDefinition>,
}

impl StepsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an already-built definition.
    #[must_use]
    pub fn node(mut self, definition: ProcessorDefinition) -> Self {
        self.outputs.push(definition);
        self
    }

    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        self.node(ProcessorDefinition::new(ToDefinition { uri: uri.into() }))
    }

    #[must_use]
    pub fn process(self, processor: impl Processor + 'static) -> Self {
        self.process_shared(Arc::new(processor))
    }

    #[must_use]
    pub fn process_shared(self, processor: SharedProcessor) -> Self {
        self.node(ProcessorDefinition::new(ProcessDefinition {
            processor: Some(Ref::Inline(processor)),
        }))
    }

    /// A processor bound in the registry under `name`.
    #[must_use]
    pub fn process_ref(self, name: impl Into<String>) -> Self {
        self.node(ProcessorDefinition::new(ProcessDefinition {
            processor: Some(Ref::named(name)),
        }))
    }

    #[must_use]
    pub fn set_header(self, name: impl Into<String>, expression: SharedExpression) -> Self {
        self.node(ProcessorDefinition::new(SetHeaderDefinition {
            name: name.into(),
            expression: Some(Ref::Inline(expression)),
        }))
    }

    #[must_use]
    pub fn set_body(self, expression: SharedExpression) -> Self {
        self.node(ProcessorDefinition::new(SetBodyDefinition {
            expression: Some(Ref::Inline(expression)),
        }))
    }

    #[must_use]
    pub fn stop(self) -> Self {
        self.node(ProcessorDefinition::stop())
    }

    #[must_use]
    pub fn pipeline(self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.node(ProcessorDefinition::new(PipelineDefinition {
            outputs: f(StepsBuilder::new()).build(),
        }))
    }

    /// Runs the nested steps only when `predicate` matches.
    #[must_use]
    pub fn filter(
        self,
        predicate: SharedPredicate,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.node(ProcessorDefinition::new(WhenDefinition {
            predicate: Some(Ref::Inline(predicate)),
            outputs: f(StepsBuilder::new()).build(),
        }))
    }

    #[must_use]
    pub fn choice(self, f: impl FnOnce(ChoiceBuilder) -> ChoiceBuilder) -> Self {
        self.node(ProcessorDefinition::new(f(ChoiceBuilder::default()).choice))
    }

    #[must_use]
    pub fn multicast(self, f: impl FnOnce(MulticastBuilder) -> MulticastBuilder) -> Self {
        self.node(ProcessorDefinition::new(f(MulticastBuilder::default()).multicast))
    }

    /// At most `max_requests` exchanges per period (one second unless the
    /// builder sets another).
    #[must_use]
    pub fn throttle(
        self,
        max_requests: u32,
        f: impl FnOnce(ThrottleBuilder) -> ThrottleBuilder,
    ) -> Self {
        self.throttle_with(MaxRequests::Fixed(Param::Value(max_requests)), f)
    }

    #[must_use]
    pub fn throttle_with(
        self,
        max_requests: MaxRequests,
        f: impl FnOnce(ThrottleBuilder) -> ThrottleBuilder,
    ) -> Self {
        let builder = ThrottleBuilder {
            throttle: ThrottleDefinition {
                max_requests: Some(max_requests),
                ..ThrottleDefinition::default()
            },
        };
        self.node(ProcessorDefinition::new(f(builder).throttle))
    }

    #[must_use]
    pub fn do_try(self, f: impl FnOnce(TryBuilder) -> TryBuilder) -> Self {
        self.node(ProcessorDefinition::new(f(TryBuilder::default()).definition))
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        if let Some(last) = self.outputs.last_mut() {
            last.id = Some(id.into());
        }
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        if let Some(last) = self.outputs.last_mut() {
            last.description = Some(description.into());
        }
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandlerDefinition) -> Self {
        if let Some(last) = self.outputs.last_mut() {
            last.error_handler = Some(handler);
        }
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<ProcessorDefinition> {
        self.outputs
    }
}

// ---------------------------------------------------------------------------
// ChoiceBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ChoiceBuilder {
    choice: ChoiceDefinition,
}

impl ChoiceBuilder {
    #[must_use]
    pub fn when(
        self,
        predicate: SharedPredicate,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.when_clause(Ref::Inline(predicate), f)
    }

    /// A clause whose predicate is bound in the registry.
    #[must_use]
    pub fn when_ref(
        self,
        name: impl Into<String>,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.when_clause(Ref::named(name), f)
    }

    fn when_clause(
        mut self,
        predicate: Ref<SharedPredicate>,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.choice.whens.push(WhenDefinition {
            predicate: Some(predicate),
            outputs: f(StepsBuilder::new()).build(),
        });
        self
    }

    #[must_use]
    pub fn otherwise(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.choice.otherwise = Some(OtherwiseDefinition {
            outputs: f(StepsBuilder::new()).build(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// MulticastBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MulticastBuilder {
    multicast: MulticastDefinition,
}

impl MulticastBuilder {
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.multicast.parallel = true;
        self
    }

    #[must_use]
    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.multicast.executor_ref = Some(name.into());
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: SharedAggregation) -> Self {
        self.multicast.strategy = Some(Ref::Inline(strategy));
        self
    }

    #[must_use]
    pub fn strategy_ref(mut self, name: impl Into<String>) -> Self {
        self.multicast.strategy = Some(Ref::named(name));
        self
    }

    #[must_use]
    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.multicast.stop_on_exception = stop;
        self
    }

    #[must_use]
    pub fn share_exchange(mut self) -> Self {
        self.multicast.share_exchange = true;
        self
    }

    /// Adds one branch. Several steps become a pipeline.
    #[must_use]
    pub fn branch(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        let mut steps = f(StepsBuilder::new()).build();
        let branch = if steps.len() == 1 {
            steps.remove(0)
        } else {
            ProcessorDefinition::new(PipelineDefinition { outputs: steps })
        };
        self.multicast.outputs.push(branch);
        self
    }

    /// Shorthand for a branch that sends to `uri`.
    #[must_use]
    pub fn to(self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.branch(|s| s.to(uri))
    }
}

// ---------------------------------------------------------------------------
// ThrottleBuilder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ThrottleBuilder {
    throttle: ThrottleDefinition,
}

impl ThrottleBuilder {
    #[must_use]
    pub fn time_period_ms(mut self, period: impl Into<Param<u64>>) -> Self {
        self.throttle.time_period = period.into();
        self
    }

    /// Throttle per value of `key` instead of globally.
    #[must_use]
    pub fn correlate(mut self, key: SharedExpression) -> Self {
        self.throttle.correlation = Some(Ref::Inline(key));
        self
    }

    #[must_use]
    pub fn async_delayed(mut self) -> Self {
        self.throttle.async_delayed = true;
        self
    }

    #[must_use]
    pub fn reject_execution(mut self) -> Self {
        self.throttle.reject_execution = true;
        self
    }

    #[must_use]
    pub fn caller_runs_when_rejected(mut self, caller_runs: bool) -> Self {
        self.throttle.caller_runs_when_rejected = caller_runs;
        self
    }

    #[must_use]
    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.throttle.executor_ref = Some(name.into());
        self
    }

    #[must_use]
    pub fn steps(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.throttle.outputs.extend(f(StepsBuilder::new()).build());
        self
    }
}

// ---------------------------------------------------------------------------
// TryBuilder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TryBuilder {
    definition: TryDefinition,
}

impl TryBuilder {
    /// The guarded body.
    #[must_use]
    pub fn steps(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.definition.outputs.extend(f(StepsBuilder::new()).build());
        self
    }

    /// Catch clause for failures matching any of `exceptions` (all failures
    /// when empty).
    #[must_use]
    pub fn catch(
        self,
        exceptions: Vec<ErrorMatcher>,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.catch_clause(exceptions, None, f)
    }

    /// Catch clause that additionally requires `on_when` to match.
    #[must_use]
    pub fn catch_when(
        self,
        exceptions: Vec<ErrorMatcher>,
        on_when: SharedPredicate,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.catch_clause(exceptions, Some(Ref::Inline(on_when)), f)
    }

    fn catch_clause(
        mut self,
        exceptions: Vec<ErrorMatcher>,
        on_when: Option<Ref<SharedPredicate>>,
        f: impl FnOnce(StepsBuilder) -> StepsBuilder,
    ) -> Self {
        self.definition.catches.push(CatchDefinition {
            exceptions,
            on_when,
            outputs: f(StepsBuilder::new()).build(),
        });
        self
    }

    #[must_use]
    pub fn finally(mut self, f: impl FnOnce(StepsBuilder) -> StepsBuilder) -> Self {
        self.definition.finally = Some(FinallyDefinition {
            outputs: f(StepsBuilder::new()).build(),
        });
        self
    }
}
