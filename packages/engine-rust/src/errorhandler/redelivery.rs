//! Redelivering error handler.
//!
//! Each exchange moves through a small state machine:
//!
//! ```text
//! Attempt -> Succeeded
//!         -> Retry(delay) -> Attempt
//!         -> Exhausted -> on-exception handler | dead letter | failure kept
//! ```
//!
//! Attempts that complete synchronously loop on the calling thread. The
//! first attempt that suspends (or an asynchronously delayed retry) moves
//! the rest of the state machine into one future, which waits out later
//! delays without holding a runtime worker.

use std::sync::Arc;
use std::time::Duration;

use routeflow_core::{
    properties, Completion, Exchange, Message, Processor, SharedProcessor, Value,
};
use tracing::{debug, error, warn};

use super::policy::{ExceptionPolicy, RedeliveryPolicy};
use crate::executor::{pause, WorkerPool};
use crate::telemetry;

/// Wraps a processor with redelivery and exhausted-failure handling.
pub struct RedeliveryErrorHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    label: String,
    output: SharedProcessor,
    policy: RedeliveryPolicy,
    exception_policies: Vec<ExceptionPolicy>,
    dead_letter: Option<SharedProcessor>,
    use_original_message: bool,
    pool: Option<Arc<WorkerPool>>,
}

enum Step {
    Attempt(Exchange),
    Retry {
        exchange: Exchange,
        delay: Duration,
        async_delayed: bool,
    },
    Exhausted {
        exchange: Exchange,
        policy: Option<usize>,
    },
    Finished(Exchange),
}

/// Per-exchange bookkeeping carried across attempts.
struct Delivery {
    redeliveries: u32,
    original: Option<Message>,
}

impl RedeliveryErrorHandler {
    pub fn new(label: impl Into<String>, output: SharedProcessor, policy: RedeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                label: label.into(),
                output,
                policy,
                exception_policies: Vec::new(),
                dead_letter: None,
                use_original_message: false,
                pool: None,
            }),
        }
    }

    fn inner_mut(&mut self) -> Option<&mut HandlerInner> {
        Arc::get_mut(&mut self.inner)
    }

    /// Adds `on_exception` policies, matched in the given order.
    #[must_use]
    pub fn with_exception_policies(mut self, policies: Vec<ExceptionPolicy>) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.exception_policies = policies;
        }
        self
    }

    /// Sends exhausted exchanges to `processor` and marks them handled.
    #[must_use]
    pub fn with_dead_letter(mut self, processor: SharedProcessor) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.dead_letter = Some(processor);
        }
        self
    }

    #[must_use]
    pub fn use_original_message(mut self, enabled: bool) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.use_original_message = enabled;
        }
        self
    }

    /// Pool used to wait out asynchronously delayed redeliveries.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        if let Some(inner) = self.inner_mut() {
            inner.pool = Some(pool);
        }
        self
    }
}

impl Processor for RedeliveryErrorHandler {
    fn process(&self, exchange: Exchange) -> Completion {
        let delivery = Delivery {
            redeliveries: 0,
            original: self
                .inner
                .use_original_message
                .then(|| exchange.input().clone()),
        };
        HandlerInner::drive(&self.inner, Step::Attempt(exchange), delivery)
    }
}

impl HandlerInner {
    /// Runs the state machine on the calling thread until it finishes or
    /// something suspends.
    fn drive(this: &Arc<Self>, mut step: Step, mut delivery: Delivery) -> Completion {
        loop {
            step = match step {
                Step::Attempt(exchange) => match this.output.process(exchange) {
                    Completion::Done(exchange) => this.assess(exchange, &mut delivery),
                    Completion::Pending(future) => {
                        let inner = Arc::clone(this);
                        return Completion::pending(async move {
                            let exchange = future.await;
                            let next = inner.assess(exchange, &mut delivery);
                            inner.drive_async(next, delivery).await
                        });
                    }
                },
                Step::Retry {
                    exchange,
                    delay,
                    async_delayed,
                } => {
                    if delay.is_zero() {
                        Step::Attempt(exchange)
                    } else if let Some(pool) = this.pool.as_ref().filter(|_| async_delayed) {
                        let wait = pool.delay(delay);
                        let inner = Arc::clone(this);
                        return Completion::pending(async move {
                            wait.await;
                            inner.drive_async(Step::Attempt(exchange), delivery).await
                        });
                    } else {
                        std::thread::sleep(delay);
                        Step::Attempt(exchange)
                    }
                }
                Step::Exhausted { exchange, policy } => {
                    return this.exhausted(exchange, &delivery, policy);
                }
                Step::Finished(exchange) => return Completion::Done(exchange),
            };
        }
    }

    async fn drive_async(self: Arc<Self>, mut step: Step, mut delivery: Delivery) -> Exchange {
        loop {
            step = match step {
                Step::Attempt(exchange) => {
                    let exchange = self.output.process(exchange).await;
                    self.assess(exchange, &mut delivery)
                }
                Step::Retry {
                    exchange,
                    delay,
                    async_delayed,
                } => {
                    match self.pool.as_ref().filter(|_| async_delayed) {
                        Some(pool) => pool.delay(delay).await,
                        None => pause(delay).await,
                    }
                    Step::Attempt(exchange)
                }
                Step::Exhausted { exchange, policy } => {
                    return self.exhausted(exchange, &delivery, policy).await;
                }
                Step::Finished(exchange) => return exchange,
            };
        }
    }

    /// Decides what follows an attempt.
    fn assess(&self, mut exchange: Exchange, delivery: &mut Delivery) -> Step {
        let Some(failure) = exchange.failure().cloned() else {
            if delivery.redeliveries > 0 {
                debug!(
                    exchange_id = exchange.id(),
                    node = %self.label,
                    redeliveries = delivery.redeliveries,
                    "delivered after redelivery"
                );
            }
            return Step::Finished(exchange);
        };
        if exchange.property(properties::REDELIVERY_EXHAUSTED) == Some(&Value::Bool(true)) {
            // An inner handler already gave up on this failure.
            return Step::Finished(exchange);
        }

        exchange.record_failure_history(&failure);
        let matched = self
            .exception_policies
            .iter()
            .position(|policy| policy.matches(&exchange));
        let policy = matched
            .and_then(|i| self.exception_policies[i].redelivery.as_ref())
            .unwrap_or(&self.policy);

        let attempt = delivery.redeliveries + 1;
        if !policy.should_redeliver(&exchange, attempt) {
            error!(
                exchange_id = exchange.id(),
                node = %self.label,
                attempts = attempt,
                error = %failure,
                "delivery failed, redelivery exhausted"
            );
            return Step::Exhausted {
                exchange,
                policy: matched,
            };
        }

        delivery.redeliveries = attempt;
        let delay = policy.delay_for(attempt);
        warn!(
            exchange_id = exchange.id(),
            node = %self.label,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure,
            "redelivering"
        );
        metrics::counter!(
            telemetry::REDELIVERIES_TOTAL,
            "route" => exchange.route_id().unwrap_or_default().to_string()
        )
        .increment(1);

        exchange.take_failure();
        exchange.reset_transient();
        exchange.set_property(properties::REDELIVERY_COUNTER, attempt);
        exchange.set_property(properties::REDELIVERED, true);
        if let Some(max) = policy.maximum_redeliveries {
            exchange.set_property(properties::REDELIVERY_MAX_COUNTER, max);
        }
        Step::Retry {
            exchange,
            delay,
            async_delayed: policy.async_delayed_redelivery,
        }
    }

    /// Hands an exhausted exchange to the matching on-exception handler or
    /// the dead-letter processor. Without either, the failure stays.
    fn exhausted(&self, mut exchange: Exchange, delivery: &Delivery, policy: Option<usize>) -> Completion {
        let policy = policy.map(|i| &self.exception_policies[i]);
        let (handler, handled) = match policy {
            Some(ExceptionPolicy {
                handler: Some(handler),
                handled,
                ..
            }) => (Some(Arc::clone(handler)), *handled),
            Some(ExceptionPolicy { handled: true, .. }) => (None, true),
            _ => (self.dead_letter.clone(), self.dead_letter.is_some()),
        };

        let Some(handler) = handler else {
            if handled {
                exchange.catch_failure();
                exchange.set_property(properties::FAILURE_HANDLED, true);
            } else {
                exchange.set_property(properties::REDELIVERY_EXHAUSTED, true);
            }
            return Completion::Done(exchange);
        };

        if let Some(original) = &delivery.original {
            exchange.promote_output();
            *exchange.input_mut() = original.clone();
        }
        let failure = exchange.failure().cloned();
        exchange.catch_failure();
        handler.process(exchange).map(move |mut exchange| {
            if exchange.is_failed() {
                exchange.set_property(properties::REDELIVERY_EXHAUSTED, true);
            } else if handled {
                exchange.set_property(properties::FAILURE_HANDLED, true);
            } else if let Some(failure) = failure {
                exchange.set_failure(failure);
                exchange.set_property(properties::REDELIVERY_EXHAUSTED, true);
            }
            exchange
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use routeflow_core::{processor_fn, ErrorMatcher};

    use super::*;
    use crate::config::PoolConfig;
    use crate::testing::{self, Boom, Deferred, Flaky, TimedOut};

    fn immediate(max: Option<u32>) -> RedeliveryPolicy {
        RedeliveryPolicy {
            maximum_redeliveries: max,
            redelivery_delay: Duration::ZERO,
            ..RedeliveryPolicy::default()
        }
    }

    #[test]
    fn max_three_redeliveries_means_four_invocations() {
        let flaky = Flaky::new(u32::MAX);
        let handler = RedeliveryErrorHandler::new("h", flaky.clone(), immediate(Some(3)));
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(flaky.calls(), 4);
        assert!(exchange.is_failed());
        assert_eq!(exchange.property(properties::REDELIVERY_COUNTER), Some(&Value::Int(3)));
        assert_eq!(exchange.property(properties::REDELIVERY_MAX_COUNTER), Some(&Value::Int(3)));
        assert_eq!(exchange.failure_history().map(|h| h.attempts), Some(4));
        assert_eq!(
            exchange.property(properties::REDELIVERY_EXHAUSTED),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let flaky = Flaky::new(2);
        let handler = RedeliveryErrorHandler::new("h", flaky.clone(), immediate(Some(5)));
        let exchange = handler.process_sync(Exchange::new(()));
        assert!(!exchange.is_failed());
        assert_eq!(flaky.calls(), 3);
        assert_eq!(exchange.property(properties::REDELIVERED), Some(&Value::Bool(true)));
        assert_eq!(exchange.header("calls"), Some(&Value::Int(3)));
    }

    #[test]
    fn transient_properties_reset_between_attempts() {
        let seen = testing::log();
        let log = Arc::clone(&seen);
        let output = processor_fn("scratch", move |ex| {
            log.lock().push(format!("{:?}", ex.property("scratch").is_some()));
            ex.set_transient_property("scratch", 1);
            ex.set_property("durable", 1);
            Err(Boom.into())
        });
        let handler = RedeliveryErrorHandler::new("h", output, immediate(Some(2)));
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&seen), vec!["false", "false", "false"]);
        assert_eq!(exchange.property("durable"), Some(&Value::Int(1)));
    }

    #[test]
    fn dead_letter_receives_exhausted_exchange() {
        let log = testing::log();
        let dead_letter = testing::recorder("dlq", &log);
        let handler = RedeliveryErrorHandler::new("h", Flaky::new(u32::MAX), immediate(Some(1)))
            .with_dead_letter(dead_letter);
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["dlq"]);
        assert!(!exchange.is_failed());
        assert_eq!(exchange.property(properties::FAILURE_HANDLED), Some(&Value::Bool(true)));
        assert!(exchange.caught_failure().is_some());
        assert!(exchange.property(properties::EXCEPTION_CAUGHT).is_some());
    }

    #[test]
    fn original_message_goes_to_dead_letter() {
        let mutate_then_fail = processor_fn("mutate", |ex| {
            ex.set_body("mutated");
            Err(Boom.into())
        });
        let seen = testing::log();
        let log = Arc::clone(&seen);
        let dead_letter = processor_fn("dlq", move |ex| {
            log.lock().push(ex.body().to_string());
            Ok(())
        });
        let handler = RedeliveryErrorHandler::new("h", mutate_then_fail, immediate(Some(0)))
            .with_dead_letter(dead_letter)
            .use_original_message(true);
        handler.process_sync(Exchange::new("original"));
        assert_eq!(testing::entries(&seen), vec!["original"]);
    }

    #[test]
    fn exception_policy_overrides_redelivery_and_handles() {
        let flaky = Flaky::new(u32::MAX);
        let log = testing::log();
        let policy = ExceptionPolicy {
            matchers: vec![ErrorMatcher::of::<Boom>()],
            on_when: None,
            redelivery: Some(immediate(Some(1))),
            handled: true,
            handler: Some(testing::recorder("on-boom", &log)),
        };
        let handler = RedeliveryErrorHandler::new("h", flaky.clone(), immediate(Some(5)))
            .with_exception_policies(vec![policy]);
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(flaky.calls(), 2);
        assert_eq!(testing::entries(&log), vec!["on-boom"]);
        assert!(!exchange.is_failed());
    }

    #[test]
    fn unhandled_policy_keeps_failure_after_handler() {
        let log = testing::log();
        let policy = ExceptionPolicy {
            matchers: vec![ErrorMatcher::of::<Boom>()],
            on_when: None,
            redelivery: None,
            handled: false,
            handler: Some(testing::recorder("notify", &log)),
        };
        let handler = RedeliveryErrorHandler::new("h", Flaky::new(u32::MAX), immediate(Some(0)))
            .with_exception_policies(vec![policy]);
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["notify"]);
        assert!(exchange.failure().is_some_and(|f| f.downcast_ref::<Boom>().is_some()));
    }

    #[test]
    fn non_matching_policy_uses_handler_defaults() {
        let flaky = Flaky::new(u32::MAX);
        let policy = ExceptionPolicy {
            matchers: vec![ErrorMatcher::of::<TimedOut>()],
            on_when: None,
            redelivery: Some(immediate(Some(10))),
            handled: true,
            handler: None,
        };
        let handler = RedeliveryErrorHandler::new("h", flaky.clone(), immediate(Some(1)))
            .with_exception_policies(vec![policy]);
        let exchange = handler.process_sync(Exchange::new(()));
        assert_eq!(flaky.calls(), 2);
        assert!(exchange.is_failed());
    }

    #[test]
    fn nested_handlers_do_not_multiply_attempts() {
        let flaky = Flaky::new(u32::MAX);
        let inner: SharedProcessor = Arc::new(RedeliveryErrorHandler::new(
            "inner",
            flaky.clone(),
            immediate(Some(2)),
        ));
        let outer = RedeliveryErrorHandler::new("outer", inner, immediate(Some(2)));
        let exchange = outer.process_sync(Exchange::new(()));
        assert_eq!(flaky.calls(), 3);
        assert!(exchange.is_failed());
    }

    #[test]
    fn pending_attempts_continue_asynchronously() {
        let flaky = Flaky::new(2);
        let output = Deferred::wrap(flaky.clone(), Duration::from_millis(5));
        let handler = RedeliveryErrorHandler::new("h", output, immediate(Some(3)));
        let completion = handler.process(Exchange::new(()));
        assert!(!completion.is_done());
        let exchange = completion.block();
        assert!(!exchange.is_failed());
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delays_after_a_suspended_attempt_do_not_block_the_runtime() {
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });
        let flaky = Flaky::new(3);
        let policy = RedeliveryPolicy {
            maximum_redeliveries: Some(3),
            redelivery_delay: Duration::from_millis(50),
            ..RedeliveryPolicy::default()
        };
        let handler = RedeliveryErrorHandler::new(
            "h",
            Deferred::wrap(flaky.clone(), Duration::from_millis(1)),
            policy,
        );
        let start = Instant::now();
        let exchange = handler.process(Exchange::new(())).await;
        ticker.abort();
        assert!(!exchange.is_failed());
        assert_eq!(flaky.calls(), 4);
        assert!(start.elapsed() >= Duration::from_millis(150));
        // Three 50ms delays leave room for roughly fifteen ticks.
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn async_delayed_redelivery_waits_on_pool() {
        let pool = Arc::new(WorkerPool::new(
            "redelivery",
            tokio::runtime::Handle::current(),
            PoolConfig::default(),
        ));
        let flaky = Flaky::new(1);
        let policy = RedeliveryPolicy {
            maximum_redeliveries: Some(1),
            redelivery_delay: Duration::from_millis(40),
            async_delayed_redelivery: true,
            ..RedeliveryPolicy::default()
        };
        let handler = RedeliveryErrorHandler::new("h", flaky.clone(), policy).with_pool(pool);
        let start = Instant::now();
        let completion = handler.process(Exchange::new(()));
        assert!(!completion.is_done());
        let exchange = completion.await;
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!exchange.is_failed());
        assert_eq!(flaky.calls(), 2);
    }
}
