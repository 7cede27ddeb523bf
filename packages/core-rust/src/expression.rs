//! Ready-made expressions, predicates and aggregation strategies.

use std::sync::Arc;

use crate::exchange::Exchange;
use crate::traits::{AggregationStrategy, Expression, Predicate};
use crate::types::Value;

pub type SharedExpression = Arc<dyn Expression>;
pub type SharedPredicate = Arc<dyn Predicate>;
pub type SharedAggregation = Arc<dyn AggregationStrategy>;

/// Always evaluates to `value`.
pub fn constant(value: impl Into<Value>) -> SharedExpression {
    let value = value.into();
    Arc::new(move |_: &Exchange| value.clone())
}

/// Evaluates to the named input header, or `Null` when absent.
pub fn header(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    Arc::new(move |ex: &Exchange| ex.header(&name).cloned().unwrap_or_default())
}

/// Evaluates to the named exchange property, or `Null` when absent.
pub fn property(name: impl Into<String>) -> SharedExpression {
    let name = name.into();
    Arc::new(move |ex: &Exchange| ex.property(&name).cloned().unwrap_or_default())
}

/// Evaluates to the input body.
#[must_use]
pub fn body() -> SharedExpression {
    Arc::new(|ex: &Exchange| ex.body().clone())
}

/// Matches when the named header equals `value`.
pub fn header_equals(name: impl Into<String>, value: impl Into<Value>) -> SharedPredicate {
    let name = name.into();
    let value = value.into();
    Arc::new(move |ex: &Exchange| ex.header(&name) == Some(&value))
}

/// Matches when the named header is present.
pub fn has_header(name: impl Into<String>) -> SharedPredicate {
    let name = name.into();
    Arc::new(move |ex: &Exchange| ex.input().headers().contains(&name))
}

/// Matches when the input body equals `value`.
pub fn body_equals(value: impl Into<Value>) -> SharedPredicate {
    let value = value.into();
    Arc::new(move |ex: &Exchange| ex.body() == &value)
}

/// Negates a predicate.
#[must_use]
pub fn not(inner: SharedPredicate) -> SharedPredicate {
    Arc::new(move |ex: &Exchange| !inner.matches(ex))
}

/// Matches when every predicate matches. Short-circuits left to right.
#[must_use]
pub fn all_of(predicates: Vec<SharedPredicate>) -> SharedPredicate {
    Arc::new(move |ex: &Exchange| predicates.iter().all(|p| p.matches(ex)))
}

/// Matches when any predicate matches. Short-circuits left to right.
#[must_use]
pub fn any_of(predicates: Vec<SharedPredicate>) -> SharedPredicate {
    Arc::new(move |ex: &Exchange| predicates.iter().any(|p| p.matches(ex)))
}

/// Keeps the most recently folded branch result.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, _existing: Option<Exchange>, incoming: Exchange) -> Exchange {
        incoming
    }
}

/// Keeps the first folded branch result and ignores the rest, except that
/// a failure on any later branch is carried over.
#[derive(Debug, Clone, Copy, Default)]
pub struct UseFirst;

impl AggregationStrategy for UseFirst {
    fn aggregate(&self, existing: Option<Exchange>, incoming: Exchange) -> Exchange {
        match existing {
            None => incoming,
            Some(mut first) => {
                if first.failure().is_none() {
                    if let Some(failure) = incoming.failure() {
                        first.set_failure(failure.clone());
                    }
                }
                first
            }
        }
    }
}

/// Collects branch result bodies into a [`Value::Array`] in fold order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectBodies;

impl AggregationStrategy for CollectBodies {
    fn aggregate(&self, existing: Option<Exchange>, incoming: Exchange) -> Exchange {
        let item = incoming.result_message().body().clone();
        match existing {
            None => {
                let mut first = incoming;
                first.promote_output();
                first.set_body(Value::Array(vec![item]));
                first
            }
            Some(mut acc) => {
                match acc.input_mut().take_body() {
                    Value::Array(mut items) => {
                        items.push(item);
                        acc.set_body(Value::Array(items));
                    }
                    other => acc.set_body(Value::Array(vec![other, item])),
                }
                if acc.failure().is_none() {
                    if let Some(failure) = incoming.failure() {
                        acc.set_failure(failure.clone());
                    }
                }
                acc
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn header_and_property_expressions() {
        let mut ex = Exchange::new("b");
        ex.set_header("Tenant", "acme");
        ex.set_property("rate", 4);
        assert_eq!(header("tenant").evaluate(&ex), Value::from("acme"));
        assert_eq!(property("rate").evaluate(&ex), Value::Int(4));
        assert_eq!(header("missing").evaluate(&ex), Value::Null);
        assert_eq!(body().evaluate(&ex), Value::from("b"));
        assert_eq!(constant(9).evaluate(&ex), Value::Int(9));
    }

    #[test]
    fn predicate_combinators() {
        let mut ex = Exchange::new("x");
        ex.set_header("kind", "gold");
        let gold = header_equals("kind", "gold");
        let has = has_header("KIND");
        assert!(gold.matches(&ex));
        assert!(has.matches(&ex));
        assert!(!not(Arc::clone(&gold)).matches(&ex));
        assert!(all_of(vec![Arc::clone(&gold), body_equals("x")]).matches(&ex));
        assert!(!all_of(vec![Arc::clone(&gold), body_equals("y")]).matches(&ex));
        assert!(any_of(vec![body_equals("y"), gold]).matches(&ex));
    }

    #[test]
    fn use_first_keeps_first_but_carries_failure() {
        let first = Exchange::new(1);
        let mut second = Exchange::new(2);
        second.fail(anyhow::anyhow!("branch failed"));
        let agg = UseFirst.aggregate(None, first);
        let agg = UseFirst.aggregate(Some(agg), second);
        assert_eq!(agg.body(), &Value::Int(1));
        assert!(agg.is_failed());
    }

    proptest! {
        #[test]
        fn collect_bodies_folds_every_branch(values in proptest::collection::vec(any::<i64>(), 1..20)) {
            let mut acc: Option<Exchange> = None;
            for v in &values {
                acc = Some(CollectBodies.aggregate(acc, Exchange::new(*v)));
            }
            let result = acc.expect("at least one branch");
            let expected: Vec<Value> = values.iter().copied().map(Value::Int).collect();
            prop_assert_eq!(result.body(), &Value::Array(expected));
        }
    }
}
