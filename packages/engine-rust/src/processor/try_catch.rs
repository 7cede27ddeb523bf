//! Try / catch / finally scoping.

use std::sync::Arc;

use routeflow_core::{
    Completion, ErrorMatcher, Exchange, Processor, SharedPredicate, SharedProcessor,
};
use tracing::debug;

/// One catch clause: matchers (empty means "any"), an optional guard, and
/// the processor that handles the caught failure.
pub struct CatchClause {
    matchers: Vec<ErrorMatcher>,
    on_when: Option<SharedPredicate>,
    output: SharedProcessor,
}

impl CatchClause {
    #[must_use]
    pub fn new(
        matchers: Vec<ErrorMatcher>,
        on_when: Option<SharedPredicate>,
        output: SharedProcessor,
    ) -> Self {
        Self {
            matchers,
            on_when,
            output,
        }
    }

    fn matches(&self, exchange: &Exchange) -> bool {
        let Some(failure) = exchange.failure() else {
            return false;
        };
        let type_match =
            self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(failure));
        type_match
            && self
                .on_when
                .as_ref()
                .map_or(true, |predicate| predicate.matches(exchange))
    }
}

pub struct TryProcessor {
    inner: Arc<TryInner>,
}

struct TryInner {
    body: SharedProcessor,
    catches: Vec<CatchClause>,
    finally: Option<SharedProcessor>,
}

impl TryProcessor {
    #[must_use]
    pub fn new(
        body: SharedProcessor,
        catches: Vec<CatchClause>,
        finally: Option<SharedProcessor>,
    ) -> Self {
        Self {
            inner: Arc::new(TryInner {
                body,
                catches,
                finally,
            }),
        }
    }
}

impl Processor for TryProcessor {
    fn process(&self, exchange: Exchange) -> Completion {
        let catching = Arc::clone(&self.inner);
        let finishing = Arc::clone(&self.inner);
        self.inner
            .body
            .process(exchange)
            .and_then(move |exchange| catching.handle_failure(exchange))
            .and_then(move |exchange| finishing.run_finally(exchange))
    }
}

impl TryInner {
    fn handle_failure(&self, mut exchange: Exchange) -> Completion {
        if !exchange.is_failed() {
            return Completion::Done(exchange);
        }
        let Some(index) = self.catches.iter().position(|c| c.matches(&exchange)) else {
            debug!(exchange_id = exchange.id(), "no catch clause matched");
            return Completion::Done(exchange);
        };
        debug!(exchange_id = exchange.id(), clause = index, "catch clause matched");
        exchange.catch_failure();
        self.catches[index].output.process(exchange)
    }

    /// Runs the finally block with the pending failure and stop flag set
    /// aside. They come back afterwards unless the block fails.
    fn run_finally(&self, mut exchange: Exchange) -> Completion {
        let Some(finally) = &self.finally else {
            return Completion::Done(exchange);
        };
        let pending = exchange.take_failure();
        let stopped = exchange.is_stopped();
        exchange.set_stopped(false);
        finally.process(exchange).map(move |mut exchange| {
            if !exchange.is_failed() {
                if let Some(failure) = pending {
                    exchange.set_failure(failure);
                }
                exchange.set_stopped(stopped || exchange.is_stopped());
            }
            exchange
        })
    }
}
