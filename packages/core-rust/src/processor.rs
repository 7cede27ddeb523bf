//! The asynchronous execution contract shared by every runtime node.
//!
//! A processor receives an [`Exchange`] by value and returns a
//! [`Completion`]: either the exchange itself (the work finished before
//! returning, so the caller continues on the same thread) or a future that
//! yields the exchange exactly once when the work finishes elsewhere.
//! Failures are recorded on the exchange, never returned as errors.
//!
//! [`Processor::process_async`] adapts this to the callback form used by
//! consumers: it returns `true` when the callback already ran, `false` when
//! the callback will run later from whichever thread finishes the work.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{Either, Ready};

use crate::exchange::Exchange;

/// Boxed future resolving to the exchange once processing has finished.
pub type ExchangeFuture = Pin<Box<dyn Future<Output = Exchange> + Send + 'static>>;

/// Shared handle to a compiled processor.
pub type SharedProcessor = Arc<dyn Processor>;

/// Explicit continuation value returned by [`Processor::process`].
#[must_use = "a completion carries the exchange; dropping it loses the exchange"]
pub enum Completion {
    /// Processing finished before `process` returned.
    Done(Exchange),
    /// Processing suspended; the future resolves exactly once.
    Pending(ExchangeFuture),
}

impl Completion {
    /// Wraps a future as a pending completion.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Exchange> + Send + 'static,
    {
        Completion::Pending(Box::pin(future))
    }

    /// `true` if processing finished synchronously.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done(_))
    }

    /// Runs `next` after this completion finishes.
    ///
    /// `next` never starts before this completion has fully finished,
    /// whatever state the exchange is in. When this completion is already
    /// done, `next` runs immediately on the calling thread.
    pub fn and_then<F>(self, next: F) -> Completion
    where
        F: FnOnce(Exchange) -> Completion + Send + 'static,
    {
        match self {
            Completion::Done(exchange) => next(exchange),
            Completion::Pending(future) => {
                Completion::pending(async move { next(future.await).await })
            }
        }
    }

    /// Applies a synchronous transformation once this completion finishes.
    pub fn map<F>(self, f: F) -> Completion
    where
        F: FnOnce(Exchange) -> Exchange + Send + 'static,
    {
        match self {
            Completion::Done(exchange) => Completion::Done(f(exchange)),
            Completion::Pending(future) => Completion::pending(async move { f(future.await) }),
        }
    }

    /// Blocks the calling thread until the exchange is available.
    ///
    /// Suspended work inside the engine is always spawned onto a worker
    /// pool, so this is safe to call from any thread, including one outside
    /// a Tokio runtime. It must not be called from a single-threaded runtime
    /// whose only worker would be the one blocked here.
    pub fn block(self) -> Exchange {
        match self {
            Completion::Done(exchange) => exchange,
            Completion::Pending(future) => futures::executor::block_on(future),
        }
    }
}

impl IntoFuture for Completion {
    type Output = Exchange;
    type IntoFuture = Either<Ready<Exchange>, ExchangeFuture>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Completion::Done(exchange) => Either::Left(futures::future::ready(exchange)),
            Completion::Pending(future) => Either::Right(future),
        }
    }
}

/// Completion callback for [`Processor::process_async`].
///
/// Invoked exactly once with mutable access to the finished exchange. The
/// exchange is released when the callback returns.
pub struct AsyncCallback(Box<dyn FnOnce(&mut Exchange) + Send + 'static>);

impl AsyncCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut Exchange) + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// A callback that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Signals completion.
    pub fn done(self, exchange: &mut Exchange) {
        (self.0)(exchange);
    }

    /// Chains `next` after this callback. This callback runs to completion
    /// before `next` begins, whether or not the exchange carries a failure.
    #[must_use]
    pub fn then(self, next: AsyncCallback) -> AsyncCallback {
        AsyncCallback::new(move |exchange| {
            self.done(exchange);
            next.done(exchange);
        })
    }
}

impl std::fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncCallback")
    }
}

/// A runtime node in a compiled route.
///
/// Implementations must hold no per-exchange mutable state: one compiled
/// graph is shared by every exchange traversing the route concurrently.
pub trait Processor: Send + Sync {
    /// Begins processing and returns the continuation.
    fn process(&self, exchange: Exchange) -> Completion;

    /// Callback form of [`Processor::process`].
    ///
    /// Returns `true` if processing completed synchronously, in which case
    /// `callback` has already been invoked. Returns `false` if `callback`
    /// will be invoked later, exactly once.
    fn process_async(&self, exchange: Exchange, callback: AsyncCallback) -> bool {
        match self.process(exchange) {
            Completion::Done(mut exchange) => {
                callback.done(&mut exchange);
                true
            }
            Completion::Pending(future) => {
                spawn_callback(future, callback);
                false
            }
        }
    }

    /// Processes the exchange, blocking until it has finished.
    fn process_sync(&self, exchange: Exchange) -> Exchange {
        self.process(exchange).block()
    }
}

impl<P: Processor + ?Sized> Processor for Arc<P> {
    fn process(&self, exchange: Exchange) -> Completion {
        (**self).process(exchange)
    }
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn process(&self, exchange: Exchange) -> Completion {
        (**self).process(exchange)
    }
}

/// Drives a pending completion and fires the callback when it resolves.
fn spawn_callback(future: ExchangeFuture, callback: AsyncCallback) {
    let task = async move {
        let mut exchange = future.await;
        callback.done(&mut exchange);
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            // Detached: the callback is the only completion signal.
            drop(handle.spawn(task));
        }
        Err(_) => {
            tracing::trace!("no runtime on this thread, driving completion on a helper thread");
            std::thread::spawn(move || futures::executor::block_on(task));
        }
    }
}

/// Synchronous processor built from a closure.
///
/// An `Err` returned by the closure is captured on the exchange under the
/// processor's label.
pub struct FnProcessor<F> {
    label: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, mut exchange: Exchange) -> Completion {
        if let Err(err) = (self.f)(&mut exchange) {
            exchange.fail_at(err, self.label.clone());
        }
        Completion::Done(exchange)
    }
}

/// Builds a shared synchronous processor from a closure.
pub fn processor_fn<F>(label: impl Into<String>, f: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnProcessor::new(label, f))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::types::Value;

    /// Completes on a separate thread after a short delay.
    struct Deferred;

    impl Processor for Deferred {
        fn process(&self, mut exchange: Exchange) -> Completion {
            let (tx, rx) = futures::channel::oneshot::channel();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                exchange.set_body("deferred");
                let _ = tx.send(exchange);
            });
            Completion::pending(async move { rx.await.expect("sender kept alive") })
        }
    }

    #[test]
    fn fn_processor_completes_synchronously() {
        let p = processor_fn("upper", |ex| {
            let upper = ex.body().as_str().unwrap_or_default().to_uppercase();
            ex.set_body(upper);
            Ok(())
        });
        let done = p.process(Exchange::new("abc"));
        assert!(done.is_done());
        assert_eq!(done.block().body(), &Value::from("ABC"));
    }

    #[test]
    fn fn_processor_captures_error() {
        let p = processor_fn("fails", |_| Err(anyhow::anyhow!("nope")));
        let exchange = p.process_sync(Exchange::new(()));
        let failure = exchange.failure().expect("captured");
        assert_eq!(failure.failed_at(), Some("fails"));
    }

    #[test]
    fn process_async_reports_sync_completion() {
        let p = processor_fn("noop", |_| Ok(()));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let sync = p.process_async(
            Exchange::new(()),
            AsyncCallback::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(sync);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_async_fires_callback_once_when_deferred() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sync = Deferred.process_async(
            Exchange::new(()),
            AsyncCallback::new(move |ex| {
                tx.send(ex.body().clone()).expect("receiver alive");
            }),
        );
        assert!(!sync);
        let body = rx.recv_timeout(Duration::from_secs(2)).expect("callback fired");
        assert_eq!(body, Value::from("deferred"));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn process_async_inside_runtime_spawns_on_runtime() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let sync = Deferred.process_async(
            Exchange::new(()),
            AsyncCallback::new(move |ex| {
                let _ = tx.send(ex.body().clone());
            }),
        );
        assert!(!sync);
        assert_eq!(rx.await.expect("callback fired"), Value::from("deferred"));
    }

    #[test]
    fn callbacks_chain_in_order_even_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first_log = Arc::clone(&log);
        let second_log = Arc::clone(&log);
        let chained = AsyncCallback::new(move |ex| {
            first_log.lock().expect("lock").push(format!("first:{}", ex.is_failed()));
        })
        .then(AsyncCallback::new(move |_| {
            second_log.lock().expect("lock").push("second".to_string());
        }));

        let p = processor_fn("fails", |_| Err(anyhow::anyhow!("x")));
        assert!(p.process_async(Exchange::new(()), chained));
        assert_eq!(*log.lock().expect("lock"), vec!["first:true", "second"]);
    }

    #[test]
    fn and_then_waits_for_pending_work() {
        let completion = Deferred.process(Exchange::new(())).and_then(|mut ex| {
            let seen = ex.body().clone();
            ex.set_property("seen", seen);
            Completion::Done(ex)
        });
        assert!(!completion.is_done());
        let exchange = completion.block();
        assert_eq!(exchange.property("seen"), Some(&Value::from("deferred")));
    }

    #[test]
    fn map_applies_after_completion() {
        let exchange = Completion::Done(Exchange::new(1))
            .map(|mut ex| {
                ex.set_body(2);
                ex
            })
            .block();
        assert_eq!(exchange.body(), &Value::Int(2));
    }
}
