//! Declarative route-definition graph.
//!
//! Definitions are plain data: immutable once built, cheap to clone, and
//! compiled into processors by the [`Reifier`](crate::reifier::Reifier).
//! Every node shares the fields on [`ProcessorDefinition`] and carries its
//! kind-specific configuration in a [`Node`] variant.

pub mod builder;
pub mod error_handler;
pub mod route;

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use routeflow_core::{
    ErrorMatcher, SharedAggregation, SharedExpression, SharedPredicate, SharedProcessor,
};

pub use builder::{
    ChoiceBuilder, MulticastBuilder, RouteBuilder, StepsBuilder, ThrottleBuilder, TryBuilder,
};
pub use error_handler::{
    ErrorHandlerDefinition, ErrorHandlerKind, OnExceptionDefinition, RedeliveryDefinition,
};
pub use route::RouteDefinition;

// ---------------------------------------------------------------------------
// DefinitionKind
// ---------------------------------------------------------------------------

/// Tag the reifier dispatches on. Built-in kinds are associated constants;
/// extensions mint their own with [`DefinitionKind::custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinitionKind(Cow<'static, str>);

impl DefinitionKind {
    pub const PIPELINE: DefinitionKind = DefinitionKind(Cow::Borrowed("pipeline"));
    pub const CHOICE: DefinitionKind = DefinitionKind(Cow::Borrowed("choice"));
    pub const WHEN: DefinitionKind = DefinitionKind(Cow::Borrowed("when"));
    pub const OTHERWISE: DefinitionKind = DefinitionKind(Cow::Borrowed("otherwise"));
    pub const MULTICAST: DefinitionKind = DefinitionKind(Cow::Borrowed("multicast"));
    pub const THROTTLE: DefinitionKind = DefinitionKind(Cow::Borrowed("throttle"));
    pub const TRY: DefinitionKind = DefinitionKind(Cow::Borrowed("try"));
    pub const CATCH: DefinitionKind = DefinitionKind(Cow::Borrowed("catch"));
    pub const FINALLY: DefinitionKind = DefinitionKind(Cow::Borrowed("finally"));
    pub const TO: DefinitionKind = DefinitionKind(Cow::Borrowed("to"));
    pub const PROCESS: DefinitionKind = DefinitionKind(Cow::Borrowed("process"));
    pub const SET_HEADER: DefinitionKind = DefinitionKind(Cow::Borrowed("set_header"));
    pub const SET_BODY: DefinitionKind = DefinitionKind(Cow::Borrowed("set_body"));
    pub const STOP: DefinitionKind = DefinitionKind(Cow::Borrowed("stop"));

    /// A kind defined outside the engine.
    pub fn custom(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Param / Ref
// ---------------------------------------------------------------------------

/// A configuration value given either literally or as a `{{placeholder}}`
/// string that is resolved and parsed at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param<T> {
    Value(T),
    Placeholder(String),
}

impl<T> Param<T> {
    pub fn placeholder(text: impl Into<String>) -> Self {
        Param::Placeholder(text.into())
    }
}

impl<T: FromStr> Param<T> {
    /// Returns the literal value, or parses `resolved` when this is a
    /// placeholder. `resolve` receives the raw placeholder text.
    ///
    /// # Errors
    ///
    /// Propagates errors from `resolve`, and returns `Err(text)` wrapped by
    /// `on_parse` if the resolved text does not parse as `T`.
    pub fn resolve_with<E>(
        &self,
        resolve: impl FnOnce(&str) -> Result<String, E>,
        on_parse: impl FnOnce(String) -> E,
    ) -> Result<T, E>
    where
        T: Clone,
    {
        match self {
            Param::Value(value) => Ok(value.clone()),
            Param::Placeholder(text) => {
                let resolved = resolve(text)?;
                resolved.trim().parse::<T>().map_err(|_| on_parse(resolved))
            }
        }
    }
}

impl<T> From<T> for Param<T> {
    fn from(value: T) -> Self {
        Param::Value(value)
    }
}

/// An object given inline or by its registry name.
#[derive(Clone)]
pub enum Ref<T> {
    Inline(T),
    /// Registry name; may contain placeholders.
    Named(String),
}

impl<T> Ref<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Ref::Named(name.into())
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ref::Inline(_) => f.write_str("Inline(..)"),
            Ref::Named(name) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

/// Throttle rate: a fixed number or an expression evaluated per exchange.
#[derive(Debug, Clone)]
pub enum MaxRequests {
    Fixed(Param<u32>),
    Dynamic(Ref<SharedExpression>),
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Definitions with an ordered list of child outputs.
pub trait HasOutputs {
    fn outputs(&self) -> &[ProcessorDefinition];
    fn outputs_mut(&mut self) -> &mut Vec<ProcessorDefinition>;
}

/// Definitions driven by a single expression.
pub trait HasExpression {
    fn expression(&self) -> Option<&Ref<SharedExpression>>;
}

/// Definitions that may run work on a named worker pool.
pub trait HasExecutorRef {
    fn executor_ref(&self) -> Option<&str>;
}

macro_rules! has_outputs {
    ($($ty:ty),* $(,)?) => {
        $(
            impl HasOutputs for $ty {
                fn outputs(&self) -> &[ProcessorDefinition] {
                    &self.outputs
                }

                fn outputs_mut(&mut self) -> &mut Vec<ProcessorDefinition> {
                    &mut self.outputs
                }
            }
        )*
    };
}

// ---------------------------------------------------------------------------
// Node definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct PipelineDefinition {
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct ChoiceDefinition {
    pub whens: Vec<WhenDefinition>,
    pub otherwise: Option<OtherwiseDefinition>,
}

/// A predicate-guarded branch. Inside a choice it is one clause; on its own
/// it compiles to a filter.
#[derive(Debug, Clone, Default)]
pub struct WhenDefinition {
    pub predicate: Option<Ref<SharedPredicate>>,
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct OtherwiseDefinition {
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone)]
pub struct MulticastDefinition {
    pub outputs: Vec<ProcessorDefinition>,
    /// Dispatch branches to a worker pool instead of running them in order.
    pub parallel: bool,
    /// Defaults to keeping the latest branch result.
    pub strategy: Option<Ref<SharedAggregation>>,
    pub executor_ref: Option<String>,
    /// Stop dispatching branches after one fails. A branch failure is
    /// reported on the multicast either way.
    pub stop_on_exception: bool,
    /// Pass the same exchange through every branch. Sequential mode only.
    pub share_exchange: bool,
}

impl Default for MulticastDefinition {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            parallel: false,
            strategy: None,
            executor_ref: None,
            stop_on_exception: true,
            share_exchange: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleDefinition {
    pub max_requests: Option<MaxRequests>,
    /// Window length in milliseconds.
    pub time_period: Param<u64>,
    /// Per-key throttling; `None` throttles every exchange against one slot.
    pub correlation: Option<Ref<SharedExpression>>,
    pub async_delayed: bool,
    pub reject_execution: bool,
    pub caller_runs_when_rejected: bool,
    pub executor_ref: Option<String>,
    pub outputs: Vec<ProcessorDefinition>,
}

impl Default for ThrottleDefinition {
    fn default() -> Self {
        Self {
            max_requests: None,
            time_period: Param::Value(1000),
            correlation: None,
            async_delayed: false,
            reject_execution: false,
            caller_runs_when_rejected: true,
            executor_ref: None,
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TryDefinition {
    pub outputs: Vec<ProcessorDefinition>,
    pub catches: Vec<CatchDefinition>,
    pub finally: Option<FinallyDefinition>,
}

/// Catch clause. An empty `exceptions` list matches any failure.
#[derive(Debug, Clone, Default)]
pub struct CatchDefinition {
    pub exceptions: Vec<ErrorMatcher>,
    pub on_when: Option<Ref<SharedPredicate>>,
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct FinallyDefinition {
    pub outputs: Vec<ProcessorDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct ToDefinition {
    pub uri: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessDefinition {
    pub processor: Option<Ref<SharedProcessor>>,
}

#[derive(Debug, Clone, Default)]
pub struct SetHeaderDefinition {
    pub name: String,
    pub expression: Option<Ref<SharedExpression>>,
}

#[derive(Debug, Clone, Default)]
pub struct SetBodyDefinition {
    pub expression: Option<Ref<SharedExpression>>,
}

/// A node whose kind is registered by an extension. `config` is downcast
/// by the extension's reifier factory.
#[derive(Clone)]
pub struct CustomDefinition {
    pub kind: DefinitionKind,
    pub config: Arc<dyn Any + Send + Sync>,
    pub outputs: Vec<ProcessorDefinition>,
}

impl CustomDefinition {
    pub fn new(kind: DefinitionKind, config: impl Any + Send + Sync) -> Self {
        Self {
            kind,
            config: Arc::new(config),
            outputs: Vec::new(),
        }
    }

    /// The extension config if it has type `T`.
    #[must_use]
    pub fn config<T: Any>(&self) -> Option<&T> {
        self.config.downcast_ref::<T>()
    }
}

impl fmt::Debug for CustomDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomDefinition")
            .field("kind", &self.kind)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

has_outputs!(
    PipelineDefinition,
    WhenDefinition,
    OtherwiseDefinition,
    MulticastDefinition,
    ThrottleDefinition,
    TryDefinition,
    CatchDefinition,
    FinallyDefinition,
    CustomDefinition,
);

impl HasExpression for SetHeaderDefinition {
    fn expression(&self) -> Option<&Ref<SharedExpression>> {
        self.expression.as_ref()
    }
}

impl HasExpression for SetBodyDefinition {
    fn expression(&self) -> Option<&Ref<SharedExpression>> {
        self.expression.as_ref()
    }
}

impl HasExpression for ThrottleDefinition {
    /// The correlation expression.
    fn expression(&self) -> Option<&Ref<SharedExpression>> {
        self.correlation.as_ref()
    }
}

impl HasExecutorRef for MulticastDefinition {
    fn executor_ref(&self) -> Option<&str> {
        self.executor_ref.as_deref()
    }
}

impl HasExecutorRef for ThrottleDefinition {
    fn executor_ref(&self) -> Option<&str> {
        self.executor_ref.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Kind-specific part of a definition.
#[derive(Debug, Clone)]
pub enum Node {
    Pipeline(PipelineDefinition),
    Choice(ChoiceDefinition),
    When(WhenDefinition),
    Otherwise(OtherwiseDefinition),
    Multicast(MulticastDefinition),
    Throttle(ThrottleDefinition),
    Try(TryDefinition),
    Catch(CatchDefinition),
    Finally(FinallyDefinition),
    To(ToDefinition),
    Process(ProcessDefinition),
    SetHeader(SetHeaderDefinition),
    SetBody(SetBodyDefinition),
    Stop,
    Custom(CustomDefinition),
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> DefinitionKind {
        match self {
            Node::Pipeline(_) => DefinitionKind::PIPELINE,
            Node::Choice(_) => DefinitionKind::CHOICE,
            Node::When(_) => DefinitionKind::WHEN,
            Node::Otherwise(_) => DefinitionKind::OTHERWISE,
            Node::Multicast(_) => DefinitionKind::MULTICAST,
            Node::Throttle(_) => DefinitionKind::THROTTLE,
            Node::Try(_) => DefinitionKind::TRY,
            Node::Catch(_) => DefinitionKind::CATCH,
            Node::Finally(_) => DefinitionKind::FINALLY,
            Node::To(_) => DefinitionKind::TO,
            Node::Process(_) => DefinitionKind::PROCESS,
            Node::SetHeader(_) => DefinitionKind::SET_HEADER,
            Node::SetBody(_) => DefinitionKind::SET_BODY,
            Node::Stop => DefinitionKind::STOP,
            Node::Custom(custom) => custom.kind.clone(),
        }
    }

    /// Child outputs, for nodes that have them.
    #[must_use]
    pub fn as_outputs(&self) -> Option<&dyn HasOutputs> {
        match self {
            Node::Pipeline(d) => Some(d),
            Node::When(d) => Some(d),
            Node::Otherwise(d) => Some(d),
            Node::Multicast(d) => Some(d),
            Node::Throttle(d) => Some(d),
            Node::Try(d) => Some(d),
            Node::Catch(d) => Some(d),
            Node::Finally(d) => Some(d),
            Node::Custom(d) => Some(d),
            Node::Choice(_)
            | Node::To(_)
            | Node::Process(_)
            | Node::SetHeader(_)
            | Node::SetBody(_)
            | Node::Stop => None,
        }
    }

    pub fn as_outputs_mut(&mut self) -> Option<&mut dyn HasOutputs> {
        match self {
            Node::Pipeline(d) => Some(d),
            Node::When(d) => Some(d),
            Node::Otherwise(d) => Some(d),
            Node::Multicast(d) => Some(d),
            Node::Throttle(d) => Some(d),
            Node::Try(d) => Some(d),
            Node::Catch(d) => Some(d),
            Node::Finally(d) => Some(d),
            Node::Custom(d) => Some(d),
            Node::Choice(_)
            | Node::To(_)
            | Node::Process(_)
            | Node::SetHeader(_)
            | Node::SetBody(_)
            | Node::Stop => None,
        }
    }
}

macro_rules! node_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Node {
                fn from(definition: $ty) -> Self {
                    Node::$variant(definition)
                }
            }
        )*
    };
}

node_from!(
    Pipeline(PipelineDefinition),
    Choice(ChoiceDefinition),
    When(WhenDefinition),
    Otherwise(OtherwiseDefinition),
    Multicast(MulticastDefinition),
    Throttle(ThrottleDefinition),
    Try(TryDefinition),
    Catch(CatchDefinition),
    Finally(FinallyDefinition),
    To(ToDefinition),
    Process(ProcessDefinition),
    SetHeader(SetHeaderDefinition),
    SetBody(SetBodyDefinition),
    Custom(CustomDefinition),
);

// ---------------------------------------------------------------------------
// ProcessorDefinition
// ---------------------------------------------------------------------------

/// One node of a route definition.
#[derive(Debug, Clone)]
pub struct ProcessorDefinition {
    pub id: Option<String>,
    pub description: Option<String>,
    /// Node-scoped error handler; the compiled node is wrapped in it.
    pub error_handler: Option<ErrorHandlerDefinition>,
    pub node: Node,
}

impl ProcessorDefinition {
    pub fn new(node: impl Into<Node>) -> Self {
        Self {
            id: None,
            description: None,
            error_handler: None,
            node: node.into(),
        }
    }

    /// A `stop` leaf.
    #[must_use]
    pub fn stop() -> Self {
        Self::new(Node::Stop)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn kind(&self) -> DefinitionKind {
        self.node.kind()
    }

    /// `kind[id]`, or just the kind when no id is set. Used in errors and
    /// as the failing-node label.
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.id, &self.node) {
            (Some(id), _) => format!("{}[{id}]", self.kind()),
            (None, Node::To(to)) => format!("to[{}]", to.uri),
            (None, _) => self.kind().to_string(),
        }
    }

    /// Child outputs, empty for leaves.
    #[must_use]
    pub fn outputs(&self) -> &[ProcessorDefinition] {
        self.node.as_outputs().map_or(&[][..], |node| node.outputs())
    }
}

impl From<Node> for ProcessorDefinition {
    fn from(node: Node) -> Self {
        Self::new(node)
    }
}
