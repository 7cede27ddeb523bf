//! Runtime routes: a compiled processor graph bound to one consumer.
//!
//! A route moves through `Stopped -> Starting -> Started -> Stopping ->
//! Stopped`. Every exchange entering the route holds an in-flight guard
//! until its completion finishes, so stopping can drain without cancelling
//! anything mid-flight.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use routeflow_core::{
    properties, Completion, Consumer, Endpoint, Exchange, Processor, SharedProcessor, Value,
};
use tower::Service;
use tracing::{info, info_span, warn, Instrument};

use crate::error::{EngineError, EngineResult};
use crate::telemetry;

/// Lifecycle state of a [`Route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// Decrements the route's in-flight counter when dropped.
#[derive(Debug)]
struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl InFlightGuard {
    fn enter(in_flight: &Arc<AtomicU64>) -> Self {
        in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Entry processor of a route: stamps the route id, tracks the exchange as
/// in flight, and records the outcome.
struct RouteProcessor {
    route_id: Arc<str>,
    inner: SharedProcessor,
    in_flight: Arc<AtomicU64>,
}

impl RouteProcessor {
    fn outcome(exchange: &Exchange) -> &'static str {
        if exchange.is_failed() {
            "failed"
        } else if exchange.property(properties::FAILURE_HANDLED) == Some(&Value::Bool(true)) {
            "handled"
        } else {
            "completed"
        }
    }
}

impl Processor for RouteProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let guard = InFlightGuard::enter(&self.in_flight);
        exchange.set_route_id(self.route_id.as_ref());
        let span = info_span!("exchange", route_id = %self.route_id, exchange_id = exchange.id());
        let started = Instant::now();

        let completion = match span.in_scope(|| self.inner.process(exchange)) {
            Completion::Pending(future) => Completion::pending(future.instrument(span)),
            done => done,
        };
        let route_id = Arc::clone(&self.route_id);
        completion.map(move |exchange| {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::counter!(
                telemetry::EXCHANGES_TOTAL,
                "route" => route_id.to_string(),
                "outcome" => Self::outcome(&exchange)
            )
            .increment(1);
            metrics::histogram!(telemetry::EXCHANGE_DURATION_MS, "route" => route_id.to_string())
                .record(elapsed_ms);
            drop(guard);
            exchange
        })
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

pub struct Route {
    id: String,
    from: String,
    processor: SharedProcessor,
    consumer: Box<dyn Consumer>,
    status: Arc<ArcSwap<RouteStatus>>,
    in_flight: Arc<AtomicU64>,
}

impl Route {
    /// Binds `processor` to a consumer on `endpoint`. The route starts out
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Consumer`] if the endpoint cannot consume.
    pub fn new(
        id: impl Into<String>,
        processor: SharedProcessor,
        endpoint: &dyn Endpoint,
    ) -> EngineResult<Self> {
        let id = id.into();
        let in_flight = Arc::new(AtomicU64::new(0));
        let processor: SharedProcessor = Arc::new(RouteProcessor {
            route_id: Arc::from(id.as_str()),
            inner: processor,
            in_flight: Arc::clone(&in_flight),
        });
        let consumer = endpoint
            .create_consumer(Arc::clone(&processor))
            .map_err(|source| EngineError::Consumer {
                route_id: id.clone(),
                source,
            })?;
        Ok(Self {
            id,
            from: endpoint.uri().to_string(),
            processor,
            consumer,
            status: Arc::new(ArcSwap::from_pointee(RouteStatus::Stopped)),
            in_flight,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// URI of the consuming endpoint.
    #[must_use]
    pub fn from_uri(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        **self.status.load()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The route's entry processor. Exchanges pushed through it are
    /// tracked like those from the consumer, whatever the route status.
    #[must_use]
    pub fn processor(&self) -> SharedProcessor {
        Arc::clone(&self.processor)
    }

    /// A Tower service that feeds exchanges into this route while it is
    /// started.
    #[must_use]
    pub fn service(&self) -> RouteService {
        RouteService {
            route_id: self.id.clone(),
            processor: Arc::clone(&self.processor),
            status: Arc::clone(&self.status),
        }
    }

    /// Starts the consumer. Starting a started route does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Consumer`] if the consumer fails to start;
    /// the route is left stopped.
    pub async fn start(&self) -> EngineResult<()> {
        if self.status() == RouteStatus::Started {
            return Ok(());
        }
        self.status.store(Arc::new(RouteStatus::Starting));
        if let Err(source) = self.consumer.start().await {
            self.status.store(Arc::new(RouteStatus::Stopped));
            return Err(EngineError::Consumer {
                route_id: self.id.clone(),
                source,
            });
        }
        self.status.store(Arc::new(RouteStatus::Started));
        info!(route_id = %self.id, from = %self.from, "route started");
        Ok(())
    }

    /// Stops the consumer, then waits up to `timeout` for in-flight
    /// exchanges to finish.
    ///
    /// Returns `true` if the route drained. On timeout the route is still
    /// marked stopped; the remaining exchanges run to completion on their
    /// own.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Consumer`] if the consumer fails to stop.
    pub async fn stop(&self, timeout: Duration) -> EngineResult<bool> {
        if self.status() == RouteStatus::Stopped {
            return Ok(true);
        }
        self.status.store(Arc::new(RouteStatus::Stopping));
        self.consumer
            .stop()
            .await
            .map_err(|source| EngineError::Consumer {
                route_id: self.id.clone(),
                source,
            })?;
        let drained = self.wait_for_drain(timeout).await;
        if !drained {
            warn!(
                route_id = %self.id,
                in_flight = self.in_flight(),
                "route stopped before in-flight exchanges drained"
            );
        }
        self.status.store(Arc::new(RouteStatus::Stopped));
        info!(route_id = %self.id, drained, "route stopped");
        Ok(drained)
    }

    async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("status", &self.status())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RouteService
// ---------------------------------------------------------------------------

type RouteFuture = Pin<Box<dyn Future<Output = Result<Exchange, EngineError>> + Send>>;

/// `tower::Service` adapter over a route.
///
/// Responds with the finished exchange; a failure captured on the exchange
/// is part of the response, not a service error. Calls fail with
/// [`EngineError::RouteNotStarted`] while the route is not started.
#[derive(Clone)]
pub struct RouteService {
    route_id: String,
    processor: SharedProcessor,
    status: Arc<ArcSwap<RouteStatus>>,
}

impl Service<Exchange> for RouteService {
    type Response = Exchange;
    type Error = EngineError;
    type Future = RouteFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        if **self.status.load() != RouteStatus::Started {
            let id = self.route_id.clone();
            return Box::pin(async move { Err(EngineError::RouteNotStarted { id }) });
        }
        let completion = self.processor.process(exchange);
        Box::pin(async move { Ok(completion.await) })
    }
}

impl std::fmt::Debug for RouteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteService")
            .field("route_id", &self.route_id)
            .finish_non_exhaustive()
    }
}
