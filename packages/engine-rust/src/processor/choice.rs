use routeflow_core::{properties, Completion, Exchange, Processor, SharedPredicate, SharedProcessor};
use tracing::debug;

/// Content-based router: the first clause whose predicate matches handles
/// the exchange, else the `otherwise` branch, else nothing.
///
/// Predicates are evaluated in order, each at most once, stopping at the
/// first match.
pub struct ChoiceProcessor {
    whens: Vec<(SharedPredicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl ChoiceProcessor {
    #[must_use]
    pub fn new(
        whens: Vec<(SharedPredicate, SharedProcessor)>,
        otherwise: Option<SharedProcessor>,
    ) -> Self {
        Self { whens, otherwise }
    }
}

impl Processor for ChoiceProcessor {
    fn process(&self, exchange: Exchange) -> Completion {
        let selected = self
            .whens
            .iter()
            .position(|(predicate, _)| predicate.matches(&exchange));
        match selected {
            Some(index) => {
                debug!(exchange_id = exchange.id(), clause = index, "choice matched");
                self.whens[index].1.process(exchange)
            }
            None => match &self.otherwise {
                Some(otherwise) => {
                    debug!(exchange_id = exchange.id(), "choice fell through to otherwise");
                    otherwise.process(exchange)
                }
                None => Completion::Done(exchange),
            },
        }
    }
}

/// Runs its output only when the predicate matches. Records the outcome in
/// the filter-matched property.
pub struct FilterProcessor {
    predicate: SharedPredicate,
    output: SharedProcessor,
}

impl FilterProcessor {
    #[must_use]
    pub fn new(predicate: SharedPredicate, output: SharedProcessor) -> Self {
        Self { predicate, output }
    }
}

impl Processor for FilterProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let matched = self.predicate.matches(&exchange);
        exchange.set_property(properties::FILTER_MATCHED, matched);
        if matched {
            self.output.process(exchange)
        } else {
            Completion::Done(exchange)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use routeflow_core::expression::header_equals;
    use routeflow_core::Value;

    use super::*;
    use crate::testing;

    fn counting(counter: &Arc<AtomicU32>, result: bool) -> SharedPredicate {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Exchange| {
            counter.fetch_add(1, Ordering::SeqCst);
            result
        })
    }

    #[test]
    fn first_match_wins_and_later_predicates_are_skipped() {
        let log = testing::log();
        let evaluations = [
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        ];
        let choice = ChoiceProcessor::new(
            vec![
                (counting(&evaluations[0], false), testing::recorder("first", &log)),
                (counting(&evaluations[1], true), testing::recorder("second", &log)),
                (counting(&evaluations[2], true), testing::recorder("third", &log)),
            ],
            Some(testing::recorder("otherwise", &log)),
        );
        choice.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["second"]);
        let counts: Vec<u32> = evaluations.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, vec![1, 1, 0]);
    }

    #[test]
    fn otherwise_runs_when_nothing_matches() {
        let log = testing::log();
        let choice = ChoiceProcessor::new(
            vec![(header_equals("kind", "gold"), testing::recorder("gold", &log))],
            Some(testing::recorder("otherwise", &log)),
        );
        let mut exchange = Exchange::new(());
        exchange.set_header("kind", "silver");
        choice.process_sync(exchange);
        assert_eq!(testing::entries(&log), vec!["otherwise"]);
    }

    #[test]
    fn empty_choice_completes_synchronously() {
        let choice = ChoiceProcessor::new(Vec::new(), None);
        let completion = choice.process(Exchange::new(7));
        assert!(completion.is_done());
        assert_eq!(completion.block().body(), &Value::Int(7));
    }

    #[test]
    fn filter_records_match() {
        let log = testing::log();
        let filter = FilterProcessor::new(header_equals("go", true), testing::recorder("out", &log));
        let skipped = filter.process_sync(Exchange::new(()));
        assert_eq!(skipped.property(properties::FILTER_MATCHED), Some(&Value::Bool(false)));
        let mut exchange = Exchange::new(());
        exchange.set_header("go", true);
        let passed = filter.process_sync(exchange);
        assert_eq!(passed.property(properties::FILTER_MATCHED), Some(&Value::Bool(true)));
        assert_eq!(testing::entries(&log), vec!["out"]);
    }
}
