//! The exchange: the unit of work that flows through a route.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::failure::{CapturedFailure, FailureHistory};
use crate::message::Message;
use crate::types::{ExchangePattern, Value};

/// Well-known exchange property keys written by the engine.
pub mod properties {
    /// The failure a catch clause or error handler is currently handling,
    /// rendered as a string. The failure itself is available through
    /// [`Exchange::caught_failure`](super::Exchange::caught_failure).
    pub const EXCEPTION_CAUGHT: &str = "routeflow.exception_caught";
    /// Set to `true` once an error handler has handled the failure.
    pub const FAILURE_HANDLED: &str = "routeflow.failure_handled";
    /// Label of the node that raised the handled failure.
    pub const FAILURE_ENDPOINT: &str = "routeflow.failure_endpoint";
    /// Redelivery attempt counter (1 on the first redelivery).
    pub const REDELIVERY_COUNTER: &str = "routeflow.redelivery_counter";
    /// Configured maximum redeliveries, when bounded.
    pub const REDELIVERY_MAX_COUNTER: &str = "routeflow.redelivery_max_counter";
    /// `true` once the exchange has been redelivered at least once.
    pub const REDELIVERED: &str = "routeflow.redelivered";
    /// Zero-based branch index on multicast copies.
    pub const MULTICAST_INDEX: &str = "routeflow.multicast_index";
    /// `true` on the copy sent to the last multicast branch.
    pub const MULTICAST_COMPLETE: &str = "routeflow.multicast_complete";
    /// Set by an error handler that gave up without handling the failure, so
    /// enclosing handlers pass it through instead of retrying again.
    pub const REDELIVERY_EXHAUSTED: &str = "routeflow.redelivery_exhausted";
    /// Whether the last filter's predicate matched.
    pub const FILTER_MATCHED: &str = "routeflow.filter_matched";

    /// Properties cleared before each redelivery attempt.
    pub const TRANSIENT: &[&str] = &[EXCEPTION_CAUGHT, FAILURE_HANDLED, FAILURE_ENDPOINT];
}

/// The in-flight unit of work.
///
/// An exchange is owned by value and moved from processor to processor, so
/// exactly one logical thread of control can mutate it at a time. Fan-out
/// processors hand each branch an independent copy
/// ([`Exchange::copy_for_branch`]).
#[derive(Debug, Clone)]
pub struct Exchange {
    id: String,
    pattern: ExchangePattern,
    input: Message,
    output: Option<Message>,
    properties: HashMap<String, Value>,
    transient_keys: HashSet<String>,
    failure: Option<CapturedFailure>,
    caught: Option<CapturedFailure>,
    history: Option<FailureHistory>,
    stopped: bool,
    route_id: Option<String>,
    created_at_ms: u64,
}

impl Exchange {
    /// Creates an `InOnly` exchange carrying `body`.
    pub fn new(body: impl Into<Value>) -> Self {
        Self::with_message(Message::new(body))
    }

    /// Creates an `InOnly` exchange around an existing message.
    #[must_use]
    pub fn with_message(input: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: ExchangePattern::InOnly,
            input,
            output: None,
            properties: HashMap::new(),
            transient_keys: HashSet::new(),
            failure: None,
            caught: None,
            history: None,
            stopped: false,
            route_id: None,
            created_at_ms: now_millis(),
        }
    }

    /// Sets the exchange pattern (builder style).
    #[must_use]
    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    /// Milliseconds since the Unix epoch when the exchange was created.
    #[must_use]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    // -- messages ----------------------------------------------------------

    #[must_use]
    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    #[must_use]
    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    /// Returns the output message, creating an empty one if absent.
    pub fn output_mut(&mut self) -> &mut Message {
        self.output.get_or_insert_with(Message::default)
    }

    pub fn set_output(&mut self, message: Message) {
        self.output = Some(message);
    }

    #[must_use]
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// The message a reply should be built from: the output if one was set,
    /// otherwise the input.
    #[must_use]
    pub fn result_message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    /// Moves an output message (if any) into the input slot. Called between
    /// pipeline steps so each step reads what the previous one produced.
    pub fn promote_output(&mut self) {
        if let Some(output) = self.output.take() {
            self.input = output;
        }
    }

    /// Shorthand for the input body.
    #[must_use]
    pub fn body(&self) -> &Value {
        self.input.body()
    }

    /// Shorthand for setting the input body.
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.input.set_body(body);
    }

    /// Shorthand for an input header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.input.header(key)
    }

    /// Shorthand for setting an input header.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.input.set_header(key, value);
    }

    // -- properties --------------------------------------------------------

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Sets a property that is cleared before every redelivery attempt.
    pub fn set_transient_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.transient_keys.insert(key.clone());
        self.properties.insert(key, value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// Replaces this exchange's properties with a copy of `other`'s.
    pub fn copy_properties_from(&mut self, other: &Exchange) {
        self.properties.clone_from(&other.properties);
        self.transient_keys.clone_from(&other.transient_keys);
    }

    /// Removes engine-defined and user-marked transient properties.
    pub fn reset_transient(&mut self) {
        for key in properties::TRANSIENT {
            self.properties.remove(*key);
        }
        for key in self.transient_keys.drain() {
            self.properties.remove(&key);
        }
        self.caught = None;
    }

    // -- failure -----------------------------------------------------------

    #[must_use]
    pub fn failure(&self) -> Option<&CapturedFailure> {
        self.failure.as_ref()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Records a failure, replacing any previous one.
    pub fn set_failure(&mut self, failure: CapturedFailure) {
        self.failure = Some(failure);
    }

    /// Records an error raised by the named node.
    pub fn fail_at(&mut self, error: impl Into<anyhow::Error>, node: impl Into<String>) {
        self.failure = Some(CapturedFailure::at(error, node));
    }

    /// Records an error with no node information.
    pub fn fail(&mut self, error: impl Into<anyhow::Error>) {
        self.failure = Some(CapturedFailure::new(error));
    }

    /// Clears and returns the captured failure.
    pub fn take_failure(&mut self) -> Option<CapturedFailure> {
        self.failure.take()
    }

    /// Moves the captured failure into the "caught" slot so a handler can run
    /// with routing enabled while still being able to inspect what failed.
    pub fn catch_failure(&mut self) -> Option<&CapturedFailure> {
        let failure = self.failure.take()?;
        self.properties.remove(properties::REDELIVERY_EXHAUSTED);
        self.properties.insert(
            properties::EXCEPTION_CAUGHT.to_string(),
            Value::String(failure.to_string()),
        );
        if let Some(node) = failure.failed_at() {
            self.properties.insert(
                properties::FAILURE_ENDPOINT.to_string(),
                Value::String(node.to_string()),
            );
        }
        self.caught = Some(failure);
        self.caught.as_ref()
    }

    /// The failure currently being handled by a catch clause or error handler.
    #[must_use]
    pub fn caught_failure(&self) -> Option<&CapturedFailure> {
        self.caught.as_ref()
    }

    #[must_use]
    pub fn failure_history(&self) -> Option<&FailureHistory> {
        self.history.as_ref()
    }

    /// Appends `failure` to the redelivery failure history.
    pub fn record_failure_history(&mut self, failure: &CapturedFailure) {
        match &mut self.history {
            Some(history) => history.record(failure.clone()),
            None => self.history = Some(FailureHistory::new(failure.clone())),
        }
    }

    // -- routing state -----------------------------------------------------

    /// Returns `true` once routing has been stopped for this exchange.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    /// Whether a composite node may route this exchange to its next child:
    /// no captured failure and not stopped.
    #[must_use]
    pub fn should_continue(&self) -> bool {
        self.failure.is_none() && !self.stopped
    }

    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn set_route_id(&mut self, route_id: impl Into<String>) {
        self.route_id = Some(route_id.into());
    }

    // -- copies ------------------------------------------------------------

    /// Creates an independent copy for a fan-out branch.
    ///
    /// The copy gets a fresh id, shares no mutable state with `self`, carries
    /// messages and properties over, and starts with no failure and routing
    /// enabled.
    #[must_use]
    pub fn copy_for_branch(&self, index: usize) -> Exchange {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.failure = None;
        copy.caught = None;
        copy.stopped = false;
        copy.created_at_ms = now_millis();
        copy.properties.insert(
            properties::MULTICAST_INDEX.to_string(),
            Value::Int(i64::try_from(index).unwrap_or(i64::MAX)),
        );
        copy
    }

    /// Copies the outcome of `result` (messages, properties, failure, stop
    /// flag) onto this exchange while keeping this exchange's identity.
    pub fn copy_results_from(&mut self, result: &Exchange) {
        self.input = result.input.clone();
        self.output.clone_from(&result.output);
        self.copy_properties_from(result);
        self.properties.remove(properties::MULTICAST_INDEX);
        self.properties.remove(properties::MULTICAST_COMPLETE);
        self.failure.clone_from(&result.failure);
        self.stopped = result.stopped;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
