//! Processors and errors shared by the crate's unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use routeflow_core::{
    processor_fn, Completion, Consumer, Endpoint, Exchange, Processor, Producer, SharedProcessor,
    Value,
};

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn entries(log: &Log) -> Vec<String> {
    log.lock().clone()
}

#[derive(Debug, thiserror::Error)]
#[error("boom")]
pub(crate) struct Boom;

#[derive(Debug, thiserror::Error)]
#[error("timed out")]
pub(crate) struct TimedOut;

/// Appends `label` to `log` and passes the exchange on unchanged.
pub(crate) fn recorder(label: &str, log: &Log) -> SharedProcessor {
    let log = Arc::clone(log);
    let name = label.to_string();
    processor_fn(label, move |_| {
        log.lock().push(name.clone());
        Ok(())
    })
}

/// Appends `label` to `log`, then fails with [`Boom`].
pub(crate) fn failing(label: &str, log: &Log) -> SharedProcessor {
    let log = Arc::clone(log);
    let name = label.to_string();
    processor_fn(label, move |_| {
        log.lock().push(name.clone());
        Err(Boom.into())
    })
}

/// Sets the body to `body`.
pub(crate) fn set_body(body: impl Into<Value>) -> SharedProcessor {
    let body = body.into();
    processor_fn("set-body", move |ex| {
        ex.set_body(body.clone());
        Ok(())
    })
}

/// Fails the first `failures` calls, then succeeds.
pub(crate) struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

impl Flaky {
    pub(crate) fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for Flaky {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            exchange.fail_at(Boom, "flaky");
        } else {
            exchange.set_header("calls", call);
        }
        Completion::Done(exchange)
    }
}

/// Runs `inner` on a separate thread after `delay`, completing
/// asynchronously.
pub(crate) struct Deferred {
    inner: SharedProcessor,
    delay: Duration,
}

impl Deferred {
    pub(crate) fn wrap(inner: SharedProcessor, delay: Duration) -> SharedProcessor {
        Arc::new(Self { inner, delay })
    }
}

impl Processor for Deferred {
    fn process(&self, exchange: Exchange) -> Completion {
        let (tx, rx) = futures::channel::oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            let _ = tx.send(inner.process_sync(exchange));
        });
        Completion::pending(async move { rx.await.expect("deferred worker dropped the exchange") })
    }
}

/// Endpoint that records the body of every exchange sent to it.
pub(crate) struct MockEndpoint {
    uri: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockEndpoint {
    pub(crate) fn new(uri: &str) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.to_string(),
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }
}

struct MockProducer {
    uri: String,
    received: Arc<Mutex<Vec<Value>>>,
}

impl Processor for MockProducer {
    fn process(&self, exchange: Exchange) -> Completion {
        self.received.lock().push(exchange.body().clone());
        Completion::Done(exchange)
    }
}

impl Producer for MockProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> anyhow::Result<Arc<dyn Producer>> {
        Ok(Arc::new(MockProducer {
            uri: self.uri.clone(),
            received: Arc::clone(&self.received),
        }))
    }

    fn create_consumer(&self, _processor: SharedProcessor) -> anyhow::Result<Box<dyn Consumer>> {
        anyhow::bail!("{} is produce-only", self.uri)
    }
}

/// Recorder that keeps the name and labels of every counter registered
/// through it. Install with [`metrics::with_local_recorder`].
#[derive(Default)]
pub(crate) struct CapturedCounters {
    registered: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl CapturedCounters {
    /// Labels of every registration of the counter `name`.
    pub(crate) fn labels(&self, name: &str) -> Vec<Vec<(String, String)>> {
        self.registered
            .lock()
            .iter()
            .filter(|(registered, _)| registered == name)
            .map(|(_, labels)| labels.clone())
            .collect()
    }
}

impl metrics::Recorder for CapturedCounters {
    fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

    fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
        let labels = key
            .labels()
            .map(|label| (label.key().to_string(), label.value().to_string()))
            .collect();
        self.registered.lock().push((key.name().to_string(), labels));
        metrics::Counter::noop()
    }

    fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
        metrics::Gauge::noop()
    }

    fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
        metrics::Histogram::noop()
    }
}
