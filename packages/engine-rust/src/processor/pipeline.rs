use std::sync::Arc;

use routeflow_core::{Completion, Exchange, Processor, SharedProcessor};
use tracing::trace;

/// Runs its steps strictly in order.
///
/// Stops early once the exchange carries a failure or has been stopped.
/// Between steps an output message becomes the next step's input.
pub struct Pipeline {
    steps: Arc<[SharedProcessor]>,
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<SharedProcessor>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// `true` if the next step may run; promotes the previous step's output.
fn prepare_step(exchange: &mut Exchange, index: usize) -> bool {
    if !exchange.should_continue() {
        trace!(
            exchange_id = exchange.id(),
            step = index,
            failed = exchange.is_failed(),
            stopped = exchange.is_stopped(),
            "pipeline short-circuit"
        );
        return false;
    }
    if index > 0 {
        exchange.promote_output();
    }
    true
}

impl Processor for Pipeline {
    fn process(&self, mut exchange: Exchange) -> Completion {
        for (index, step) in self.steps.iter().enumerate() {
            if !prepare_step(&mut exchange, index) {
                break;
            }
            match step.process(exchange) {
                Completion::Done(next) => exchange = next,
                Completion::Pending(future) => {
                    let steps = Arc::clone(&self.steps);
                    return Completion::pending(async move {
                        let mut exchange = future.await;
                        for (index, step) in steps.iter().enumerate().skip(index + 1) {
                            if !prepare_step(&mut exchange, index) {
                                break;
                            }
                            exchange = step.process(exchange).await;
                        }
                        exchange
                    });
                }
            }
        }
        Completion::Done(exchange)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;
    use routeflow_core::{processor_fn, Value};

    use super::*;
    use crate::testing::{self, Deferred};

    #[test]
    fn runs_steps_in_order() {
        let log = testing::log();
        let pipeline = Pipeline::new(vec![
            testing::recorder("a", &log),
            testing::recorder("b", &log),
            testing::recorder("c", &log),
        ]);
        let completion = pipeline.process(Exchange::new(()));
        assert!(completion.is_done());
        assert_eq!(testing::entries(&log), vec!["a", "b", "c"]);
    }

    #[test]
    fn failure_short_circuits() {
        let log = testing::log();
        let pipeline = Pipeline::new(vec![
            testing::recorder("a", &log),
            testing::failing("b", &log),
            testing::recorder("c", &log),
        ]);
        let exchange = pipeline.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["a", "b"]);
        assert_eq!(exchange.failure().and_then(|f| f.failed_at()), Some("b"));
    }

    #[test]
    fn stop_short_circuits_without_failure() {
        let log = testing::log();
        let stop = processor_fn("stop", |ex| {
            ex.set_stopped(true);
            Ok(())
        });
        let pipeline = Pipeline::new(vec![stop, testing::recorder("after", &log)]);
        let exchange = pipeline.process_sync(Exchange::new(()));
        assert!(testing::entries(&log).is_empty());
        assert!(exchange.is_stopped());
        assert!(!exchange.is_failed());
    }

    #[test]
    fn output_is_promoted_between_steps() {
        let reply = processor_fn("reply", |ex| {
            ex.output_mut().set_body("reply");
            Ok(())
        });
        let seen = testing::log();
        let log = Arc::clone(&seen);
        let read = processor_fn("read", move |ex| {
            log.lock().push(ex.body().to_string());
            Ok(())
        });
        Pipeline::new(vec![reply, read]).process_sync(Exchange::new("request"));
        assert_eq!(testing::entries(&seen), vec!["reply"]);
    }

    #[test]
    fn resumes_after_pending_step_in_order() {
        let log = testing::log();
        let pipeline = Pipeline::new(vec![
            testing::recorder("a", &log),
            Deferred::wrap(testing::recorder("b", &log), Duration::from_millis(10)),
            testing::recorder("c", &log),
            Deferred::wrap(testing::failing("d", &log), Duration::from_millis(5)),
            testing::recorder("e", &log),
        ]);
        let completion = pipeline.process(Exchange::new(()));
        assert!(!completion.is_done());
        let exchange = completion.block();
        assert_eq!(testing::entries(&log), vec!["a", "b", "c", "d"]);
        assert!(exchange.is_failed());
    }

    #[test]
    fn empty_pipeline_is_a_no_op() {
        let exchange = Pipeline::new(Vec::new()).process_sync(Exchange::new(1));
        assert_eq!(exchange.body(), &Value::Int(1));
    }

    proptest! {
        #[test]
        fn steps_before_first_failure_run_in_order(fail_at in proptest::option::of(0_usize..8), len in 1_usize..8) {
            let log = testing::log();
            let steps = (0..len)
                .map(|i| {
                    let label = i.to_string();
                    if fail_at == Some(i) {
                        testing::failing(&label, &log)
                    } else {
                        testing::recorder(&label, &log)
                    }
                })
                .collect();
            let exchange = Pipeline::new(steps).process_sync(Exchange::new(()));
            let ran = fail_at.map_or(len, |f| (f + 1).min(len));
            let expected: Vec<String> = (0..ran).map(|i| i.to_string()).collect();
            prop_assert_eq!(testing::entries(&log), expected);
            prop_assert_eq!(exchange.is_failed(), fail_at.is_some_and(|f| f < len));
        }
    }
}
