//! Fan-out to several branches with result aggregation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use routeflow_core::{
    properties, CapturedFailure, Completion, Exchange, Processor, SharedAggregation,
    SharedProcessor,
};
use tracing::debug;

use crate::config::RejectionPolicy;
use crate::executor::{Submission, WorkerPool};

/// How branches are run.
#[derive(Clone)]
pub enum MulticastMode {
    /// One after another on the calling thread, each on its own copy.
    Sequential,
    /// One after another, all on the same exchange.
    SharedExchange,
    /// All at once on the given pool, each on its own copy.
    Parallel(Arc<WorkerPool>),
}

pub struct MulticastProcessor {
    inner: Arc<MulticastInner>,
}

struct MulticastInner {
    label: String,
    branches: Vec<SharedProcessor>,
    strategy: SharedAggregation,
    mode: MulticastMode,
    stop_on_exception: bool,
}

impl MulticastProcessor {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        branches: Vec<SharedProcessor>,
        strategy: SharedAggregation,
        mode: MulticastMode,
        stop_on_exception: bool,
    ) -> Self {
        Self {
            inner: Arc::new(MulticastInner {
                label: label.into(),
                branches,
                strategy,
                mode,
                stop_on_exception,
            }),
        }
    }
}

impl Processor for MulticastProcessor {
    fn process(&self, exchange: Exchange) -> Completion {
        if self.inner.branches.is_empty() {
            return Completion::Done(exchange);
        }
        match &self.inner.mode {
            MulticastMode::Sequential => MulticastInner::sequential(&self.inner, exchange),
            MulticastMode::SharedExchange => MulticastInner::shared(&self.inner, exchange),
            MulticastMode::Parallel(pool) => {
                MulticastInner::parallel(&self.inner, Arc::clone(pool), exchange)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Fold {
    aggregate: Option<Exchange>,
    first_failure: Option<CapturedFailure>,
}

impl Fold {
    /// Folds one branch result. Returns `true` if that branch failed.
    fn add(&mut self, strategy: &SharedAggregation, result: Exchange) -> bool {
        let failure = result.failure().cloned();
        self.aggregate = Some(strategy.aggregate(self.aggregate.take(), result));
        let failed = failure.is_some();
        if self.first_failure.is_none() {
            self.first_failure = failure;
        }
        failed
    }

    /// Copies the aggregate onto the original exchange. If the strategy
    /// dropped every branch failure, the first one becomes the multicast's
    /// own whether or not the remaining branches were stopped.
    fn finish(self, mut original: Exchange) -> Exchange {
        if let Some(aggregate) = &self.aggregate {
            original.copy_results_from(aggregate);
        }
        if !original.is_failed() {
            if let Some(failure) = self.first_failure {
                original.set_failure(failure);
            }
        }
        original
    }
}

fn branch_copy(original: &Exchange, index: usize, total: usize) -> Exchange {
    let mut copy = original.copy_for_branch(index);
    if index + 1 == total {
        copy.set_property(properties::MULTICAST_COMPLETE, true);
    }
    copy
}

async fn run_branch(
    branch: SharedProcessor,
    copy: Exchange,
    halt: Arc<AtomicBool>,
    stop_on_exception: bool,
) -> Option<Exchange> {
    if stop_on_exception && halt.load(Ordering::Acquire) {
        return None;
    }
    let result = branch.process(copy).await;
    if stop_on_exception && result.is_failed() {
        halt.store(true, Ordering::Release);
    }
    Some(result)
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

impl MulticastInner {
    fn sequential(this: &Arc<Self>, original: Exchange) -> Completion {
        let total = this.branches.len();
        let mut fold = Fold::default();
        for (index, branch) in this.branches.iter().enumerate() {
            let copy = branch_copy(&original, index, total);
            match branch.process(copy) {
                Completion::Done(result) => {
                    if fold.add(&this.strategy, result) && this.stop_on_exception {
                        debug!(exchange_id = original.id(), branch = index, "multicast stopping after failure");
                        break;
                    }
                }
                Completion::Pending(future) => {
                    let inner = Arc::clone(this);
                    return Completion::pending(async move {
                        let failed = fold.add(&inner.strategy, future.await);
                        if !(failed && inner.stop_on_exception) {
                            for (index, branch) in inner.branches.iter().enumerate().skip(index + 1) {
                                let result = branch.process(branch_copy(&original, index, total)).await;
                                if fold.add(&inner.strategy, result) && inner.stop_on_exception {
                                    break;
                                }
                            }
                        }
                        fold.finish(original)
                    });
                }
            }
        }
        Completion::Done(fold.finish(original))
    }

    fn shared(this: &Arc<Self>, mut exchange: Exchange) -> Completion {
        for (index, branch) in this.branches.iter().enumerate() {
            if index > 0 && !exchange.should_continue() {
                break;
            }
            exchange.set_property(properties::MULTICAST_INDEX, Self::index_value(index));
            match branch.process(exchange) {
                Completion::Done(next) => exchange = next,
                Completion::Pending(future) => {
                    let inner = Arc::clone(this);
                    return Completion::pending(async move {
                        let mut exchange = future.await;
                        for (index, branch) in inner.branches.iter().enumerate().skip(index + 1) {
                            if !exchange.should_continue() {
                                break;
                            }
                            exchange.set_property(properties::MULTICAST_INDEX, Self::index_value(index));
                            exchange = branch.process(exchange).await;
                        }
                        exchange.remove_property(properties::MULTICAST_INDEX);
                        exchange
                    });
                }
            }
        }
        exchange.remove_property(properties::MULTICAST_INDEX);
        Completion::Done(exchange)
    }

    fn parallel(this: &Arc<Self>, pool: Arc<WorkerPool>, original: Exchange) -> Completion {
        let inner = Arc::clone(this);
        Completion::pending(async move {
            let total = inner.branches.len();
            let soe = inner.stop_on_exception;
            let halt = Arc::new(AtomicBool::new(false));
            let mut running: FuturesUnordered<BoxFuture<'static, Option<Exchange>>> =
                FuturesUnordered::new();
            let mut fold = Fold::default();

            for (index, branch) in inner.branches.iter().enumerate() {
                if soe && halt.load(Ordering::Acquire) {
                    debug!(
                        exchange_id = original.id(),
                        skipped = total - index,
                        "multicast skipping undispatched branches"
                    );
                    break;
                }
                let copy = branch_copy(&original, index, total);
                let mut snapshot = copy.clone();
                let task = run_branch(Arc::clone(branch), copy, Arc::clone(&halt), soe);
                match pool.submit(task) {
                    Submission::Accepted(spawned) => {
                        let label = inner.label.clone();
                        running.push(
                            async move {
                                match spawned.await {
                                    Ok(result) => result,
                                    Err(aborted) => {
                                        snapshot.fail_at(aborted, label);
                                        Some(snapshot)
                                    }
                                }
                            }
                            .boxed(),
                        );
                    }
                    Submission::Rejected(task) => match pool.rejection() {
                        RejectionPolicy::Abort => {
                            snapshot.fail_at(pool.rejected(), inner.label.clone());
                            fold.add(&inner.strategy, snapshot);
                            halt.store(true, Ordering::Release);
                        }
                        RejectionPolicy::CallerRuns | RejectionPolicy::Queue => {
                            if let Some(result) = task.await {
                                fold.add(&inner.strategy, result);
                            }
                        }
                    },
                }
            }

            while let Some(result) = running.next().await {
                if let Some(result) = result {
                    fold.add(&inner.strategy, result);
                }
            }
            fold.finish(original)
        })
    }

    fn index_value(index: usize) -> i64 {
        i64::try_from(index).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use routeflow_core::expression::{CollectBodies, UseLatest};
    use routeflow_core::{processor_fn, AsyncCallback, Value};
    use tokio::runtime::Handle;

    use super::*;
    use crate::config::PoolConfig;
    use crate::error::RejectedExecutionError;
    use crate::testing::{self, Boom, Deferred};

    fn body_setter(body: i64, delay_ms: u64) -> SharedProcessor {
        let set = testing::set_body(body);
        if delay_ms == 0 {
            set
        } else {
            Deferred::wrap(set, Duration::from_millis(delay_ms))
        }
    }

    fn pool(size: usize, rejection: RejectionPolicy) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            "multicast",
            Handle::current(),
            PoolConfig {
                pool_size: size,
                rejection,
            },
        ))
    }

    #[test]
    fn sequential_aggregates_in_declared_order() {
        let multicast = MulticastProcessor::new(
            "m",
            vec![body_setter(1, 0), body_setter(2, 0), body_setter(3, 0)],
            Arc::new(CollectBodies),
            MulticastMode::Sequential,
            true,
        );
        let exchange = multicast.process_sync(Exchange::new(0));
        assert_eq!(
            exchange.body(),
            &Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert!(exchange.property(properties::MULTICAST_INDEX).is_none());
    }

    #[test]
    fn branches_get_independent_copies() {
        let seen = testing::log();
        let log = Arc::clone(&seen);
        let writer = processor_fn("writer", |ex| {
            ex.set_header("touched", true);
            Ok(())
        });
        let reader = processor_fn("reader", move |ex| {
            log.lock().push(format!(
                "touched={} complete={}",
                ex.header("touched").is_some(),
                ex.property(properties::MULTICAST_COMPLETE).is_some()
            ));
            Ok(())
        });
        let original = Exchange::new(());
        let id = original.id().to_string();
        let multicast = MulticastProcessor::new(
            "m",
            vec![writer, reader],
            Arc::new(UseLatest),
            MulticastMode::Sequential,
            true,
        );
        let exchange = multicast.process_sync(original);
        assert_eq!(testing::entries(&seen), vec!["touched=false complete=true"]);
        assert_eq!(exchange.id(), id);
    }

    #[test]
    fn sequential_stop_on_exception_skips_remaining() {
        let log = testing::log();
        let multicast = MulticastProcessor::new(
            "m",
            vec![
                testing::recorder("a", &log),
                testing::failing("b", &log),
                testing::recorder("c", &log),
            ],
            Arc::new(UseLatest),
            MulticastMode::Sequential,
            true,
        );
        let exchange = multicast.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["a", "b"]);
        assert!(exchange.is_failed());
    }

    #[test]
    fn sequential_without_stop_runs_everything() {
        let log = testing::log();
        let multicast = MulticastProcessor::new(
            "m",
            vec![
                testing::failing("a", &log),
                testing::recorder("b", &log),
                Deferred::wrap(testing::recorder("c", &log), Duration::from_millis(5)),
            ],
            Arc::new(UseLatest),
            MulticastMode::Sequential,
            false,
        );
        let exchange = multicast.process_sync(Exchange::new(()));
        assert_eq!(testing::entries(&log), vec!["a", "b", "c"]);
        // The latest result succeeded, but the failure of "a" still surfaces.
        let failure = exchange.failure().expect("branch failure propagates");
        assert!(failure.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn shared_exchange_threads_one_exchange_through_branches() {
        let append = |suffix: &'static str| {
            processor_fn(suffix, move |ex| {
                let body = format!("{}{suffix}", ex.body());
                ex.set_body(body);
                Ok(())
            })
        };
        let multicast = MulticastProcessor::new(
            "m",
            vec![append("a"), append("b")],
            Arc::new(UseLatest),
            MulticastMode::SharedExchange,
            true,
        );
        let exchange = multicast.process_sync(Exchange::new(">"));
        assert_eq!(exchange.body(), &Value::from(">ab"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_five_branches_signal_once_after_all() {
        let branches = (1..=5).map(|i| body_setter(i, 10 * (6 - i as u64))).collect();
        let multicast = MulticastProcessor::new(
            "m",
            branches,
            Arc::new(CollectBodies),
            MulticastMode::Parallel(pool(5, RejectionPolicy::Queue)),
            true,
        );
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let sync = multicast.process_async(
            Exchange::new(0),
            AsyncCallback::new(move |ex| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(ex.body().clone());
            }),
        );
        assert!(!sync);
        let Value::Array(mut bodies) = rx.await.unwrap() else {
            panic!("expected collected bodies");
        };
        bodies.sort_by_key(|v| v.as_i64());
        assert_eq!(bodies, (1..=5).map(Value::Int).collect::<Vec<_>>());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_stop_on_exception_skips_branches_not_yet_begun() {
        let log = testing::log();
        let multicast = MulticastProcessor::new(
            "m",
            vec![
                testing::failing("a", &log),
                testing::recorder("b", &log),
                testing::recorder("c", &log),
            ],
            Arc::new(UseLatest),
            MulticastMode::Parallel(pool(1, RejectionPolicy::Queue)),
            true,
        );
        let exchange = multicast.process(Exchange::new(())).await;
        assert_eq!(testing::entries(&log), vec!["a"]);
        assert!(exchange.is_failed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_without_stop_still_reports_branch_failure() {
        let log = testing::log();
        let multicast = MulticastProcessor::new(
            "m",
            vec![
                testing::failing("a", &log),
                Deferred::wrap(testing::recorder("b", &log), Duration::from_millis(20)),
            ],
            Arc::new(UseLatest),
            MulticastMode::Parallel(pool(2, RejectionPolicy::Queue)),
            false,
        );
        let exchange = multicast.process(Exchange::new(())).await;
        assert_eq!(testing::entries(&log), vec!["a", "b"]);
        assert!(exchange.failure().is_some_and(|f| f.downcast_ref::<Boom>().is_some()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abort_policy_records_rejection_on_branch() {
        let multicast = MulticastProcessor::new(
            "m",
            vec![body_setter(1, 50), body_setter(2, 0), body_setter(3, 0)],
            Arc::new(UseLatest),
            MulticastMode::Parallel(pool(1, RejectionPolicy::Abort)),
            true,
        );
        let exchange = multicast.process(Exchange::new(0)).await;
        let failure = exchange.failure().expect("rejection propagated");
        assert!(failure.downcast_ref::<RejectedExecutionError>().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn caller_runs_policy_executes_rejected_branch_inline() {
        let multicast = MulticastProcessor::new(
            "m",
            vec![body_setter(1, 50), body_setter(2, 0)],
            Arc::new(CollectBodies),
            MulticastMode::Parallel(pool(1, RejectionPolicy::CallerRuns)),
            true,
        );
        let exchange = multicast.process(Exchange::new(0)).await;
        assert!(!exchange.is_failed());
        let Value::Array(bodies) = exchange.body() else {
            panic!("expected array body");
        };
        assert_eq!(bodies.len(), 2);
    }
}
