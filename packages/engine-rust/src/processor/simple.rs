//! Leaf processors: send to an endpoint, set a header or the body, stop.

use std::sync::Arc;

use routeflow_core::{Completion, Exchange, Processor, Producer, SharedExpression};

/// Hands the exchange to an endpoint's producer.
///
/// A failure the producer records without naming a node is attributed to
/// this step.
pub struct SendProcessor {
    label: String,
    producer: Arc<dyn Producer>,
}

impl SendProcessor {
    #[must_use]
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            label: format!("to[{}]", producer.endpoint_uri()),
            producer,
        }
    }

    #[must_use]
    pub fn endpoint_uri(&self) -> &str {
        self.producer.endpoint_uri()
    }
}

impl Processor for SendProcessor {
    fn process(&self, exchange: Exchange) -> Completion {
        let label = self.label.clone();
        self.producer.process(exchange).map(move |mut exchange| {
            if let Some(failure) = exchange.take_failure() {
                exchange.set_failure(failure.or_at(label));
            }
            exchange
        })
    }
}

pub struct SetHeaderProcessor {
    name: String,
    expression: SharedExpression,
}

impl SetHeaderProcessor {
    #[must_use]
    pub fn new(name: impl Into<String>, expression: SharedExpression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

impl Processor for SetHeaderProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let value = self.expression.evaluate(&exchange);
        exchange.set_header(self.name.clone(), value);
        Completion::Done(exchange)
    }
}

pub struct SetBodyProcessor {
    expression: SharedExpression,
}

impl SetBodyProcessor {
    #[must_use]
    pub fn new(expression: SharedExpression) -> Self {
        Self { expression }
    }
}

impl Processor for SetBodyProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let value = self.expression.evaluate(&exchange);
        exchange.set_body(value);
        Completion::Done(exchange)
    }
}

/// Marks the exchange as stopped. Enclosing composites route it no further.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopProcessor;

impl Processor for StopProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        exchange.set_stopped(true);
        Completion::Done(exchange)
    }
}

#[cfg(test)]
mod tests {
    use routeflow_core::expression::{constant, header};
    use routeflow_core::Value;

    use super::*;
    use crate::testing::Boom;

    struct FailingProducer;

    impl Processor for FailingProducer {
        fn process(&self, mut exchange: Exchange) -> Completion {
            exchange.fail(Boom);
            Completion::Done(exchange)
        }
    }

    impl Producer for FailingProducer {
        fn endpoint_uri(&self) -> &str {
            "mock:broken"
        }
    }

    #[test]
    fn send_attributes_unlabelled_failures_to_itself() {
        let send = SendProcessor::new(Arc::new(FailingProducer));
        let exchange = send.process_sync(Exchange::new(()));
        assert_eq!(exchange.failure().and_then(|f| f.failed_at()), Some("to[mock:broken]"));
    }

    #[test]
    fn set_header_and_body_evaluate_against_exchange() {
        let mut exchange = Exchange::new("payload");
        exchange.set_header("source", "api");
        let exchange = SetHeaderProcessor::new("copied", header("source")).process_sync(exchange);
        let exchange = SetBodyProcessor::new(constant(42)).process_sync(exchange);
        assert_eq!(exchange.header("copied"), Some(&Value::from("api")));
        assert_eq!(exchange.body(), &Value::Int(42));
    }

    #[test]
    fn stop_sets_flag_without_failure() {
        let exchange = StopProcessor.process_sync(Exchange::new(()));
        assert!(exchange.is_stopped());
        assert!(!exchange.is_failed());
    }
}
