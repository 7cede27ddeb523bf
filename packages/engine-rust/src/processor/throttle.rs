//! Rate limiting per correlation key.
//!
//! Each key owns a [`SlidingWindow`]: the instants at which its recent
//! permits were (or will be) used. A permit becomes free again exactly one
//! period after its use, so no window of that length ever admits more than
//! `max` exchanges. When every permit is taken the caller waits until the
//! oldest one frees up. Reservations can run ahead of the clock, so a burst
//! of `n` exchanges over a rate of `max` per period spreads across
//! `ceil(n / max)` periods.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use routeflow_core::{Completion, Exchange, Processor, SharedExpression, SharedProcessor};
use tracing::{debug, warn};

use crate::error::{ExpressionError, ThrottlerRejectedError};
use crate::executor::{pause, Submission, WorkerPool};
use crate::telemetry;

/// Key used when no correlation expression is configured.
const GLOBAL_KEY: &str = "";

/// Where the per-period request limit comes from.
#[derive(Clone)]
pub enum ThrottleRate {
    Fixed(u32),
    /// Evaluated for every exchange.
    Dynamic(SharedExpression),
}

/// Optional throttle behavior.
#[derive(Clone)]
pub struct ThrottleOptions {
    pub correlation: Option<SharedExpression>,
    /// Fail with [`ThrottlerRejectedError`] instead of waiting.
    pub reject_execution: bool,
    /// Wait on this pool instead of sleeping the calling thread.
    pub async_pool: Option<Arc<WorkerPool>>,
    /// When the pool refuses a delayed exchange, wait it out and run it on
    /// the caller's task instead of failing it.
    pub caller_runs_when_rejected: bool,
    /// A key whose window has been closed for this many periods is evicted.
    pub idle_periods: u32,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            correlation: None,
            reject_execution: false,
            async_pool: None,
            caller_runs_when_rejected: true,
            idle_periods: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// SlidingWindow
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SlidingWindow {
    /// Use instants of permits still inside their period, oldest first.
    permits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Reserves one permit under a limit of `max` per `period`.
    ///
    /// Returns how long the caller must wait before using it, or `None`
    /// when `reject` is set and no permit is free now. Permits already
    /// used stay counted if `max` differs from the previous call.
    fn reserve(&mut self, now: Instant, max: u32, period: Duration, reject: bool) -> Option<Duration> {
        while self.permits.front().is_some_and(|used| *used + period <= now) {
            self.permits.pop_front();
        }
        let max = usize::try_from(max.max(1)).unwrap_or(usize::MAX);
        let mut at = self.permits.back().map_or(now, |last| (*last).max(now));
        if self.permits.len() >= max {
            at = at.max(self.permits[self.permits.len() - max] + period);
        }
        if reject && at > now {
            return None;
        }
        self.permits.push_back(at);
        Some(at.saturating_duration_since(now))
    }

    fn idle_since(&self, now: Instant, horizon: Duration) -> bool {
        self.permits.back().is_none_or(|last| *last + horizon <= now)
    }
}

// ---------------------------------------------------------------------------
// ThrottleProcessor
// ---------------------------------------------------------------------------

pub struct ThrottleProcessor {
    label: String,
    output: SharedProcessor,
    rate: ThrottleRate,
    period: Duration,
    options: ThrottleOptions,
    slots: DashMap<String, Arc<Mutex<SlidingWindow>>>,
    last_sweep: Mutex<Instant>,
}

impl ThrottleProcessor {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        output: SharedProcessor,
        rate: ThrottleRate,
        period: Duration,
        options: ThrottleOptions,
    ) -> Self {
        Self {
            label: label.into(),
            output,
            rate,
            period,
            options,
            slots: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.slots.len()
    }

    fn resolve_rate(&self, exchange: &Exchange) -> Result<u32, ExpressionError> {
        let expression = match &self.rate {
            ThrottleRate::Fixed(max) => return Ok(*max),
            ThrottleRate::Dynamic(expression) => expression,
        };
        let value = expression.evaluate(exchange);
        value
            .to_i64_lossless()
            .filter(|max| *max > 0)
            .and_then(|max| u32::try_from(max).ok())
            .ok_or_else(|| ExpressionError {
                node: self.label.clone(),
                reason: format!("max requests must be a positive integer, got '{value}'"),
            })
    }

    fn correlation_key(&self, exchange: &Exchange) -> String {
        self.options
            .correlation
            .as_ref()
            .map_or_else(|| GLOBAL_KEY.to_string(), |e| e.evaluate(exchange).to_string())
    }

    /// Drops keys whose last permit is long enough in the past. Runs at most
    /// once per eviction horizon and never blocks on a concurrent sweep.
    fn evict_idle(&self, now: Instant) {
        let horizon = self.period * self.options.idle_periods.max(1);
        let Some(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if *last + horizon > now {
            return;
        }
        *last = now;
        drop(last);
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.lock().idle_since(now, horizon));
        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            debug!(node = %self.label, evicted, "evicted idle throttle keys");
        }
    }

    fn reserve(&self, key: &str, max: u32, now: Instant) -> Option<Duration> {
        let slot = Arc::clone(
            self.slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::default())))
                .value(),
        );
        let mut slot = slot.lock();
        slot.reserve(now, max, self.period, self.options.reject_execution)
    }

    fn reject(&self, mut exchange: Exchange, key: String, max: u32) -> Completion {
        warn!(
            exchange_id = exchange.id(),
            node = %self.label,
            key = %key,
            max_requests = max,
            "throttle rejected exchange"
        );
        metrics::counter!(
            telemetry::THROTTLE_REJECTIONS_TOTAL,
            "route" => exchange.route_id().unwrap_or_default().to_string(),
            "node" => self.label.clone()
        )
        .increment(1);
        exchange.fail_at(
            ThrottlerRejectedError {
                key,
                max_requests: max,
                period: self.period,
            },
            self.label.clone(),
        );
        Completion::Done(exchange)
    }

    fn delay_on_pool(&self, pool: &WorkerPool, delay: Duration, exchange: Exchange) -> Completion {
        let mut snapshot = exchange.clone();
        let output = Arc::clone(&self.output);
        let task = async move {
            tokio::time::sleep(delay).await;
            output.process(exchange).await
        };
        match pool.submit(task) {
            Submission::Accepted(spawned) => {
                let label = self.label.clone();
                Completion::pending(async move {
                    match spawned.await {
                        Ok(exchange) => exchange,
                        Err(aborted) => {
                            snapshot.fail_at(aborted, label);
                            snapshot
                        }
                    }
                })
            }
            Submission::Rejected(_) if self.options.caller_runs_when_rejected => {
                debug!(exchange_id = snapshot.id(), node = %self.label, "pool busy, delaying on caller");
                let output = Arc::clone(&self.output);
                Completion::pending(async move {
                    pause(delay).await;
                    output.process(snapshot).await
                })
            }
            Submission::Rejected(_) => {
                snapshot.fail_at(pool.rejected(), self.label.clone());
                Completion::Done(snapshot)
            }
        }
    }
}

impl Processor for ThrottleProcessor {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let max = match self.resolve_rate(&exchange) {
            Ok(max) => max,
            Err(err) => {
                exchange.fail_at(err, self.label.clone());
                return Completion::Done(exchange);
            }
        };
        let key = self.correlation_key(&exchange);
        let now = Instant::now();
        self.evict_idle(now);

        let Some(delay) = self.reserve(&key, max, now) else {
            return self.reject(exchange, key, max);
        };
        if delay.is_zero() {
            return self.output.process(exchange);
        }
        debug!(
            exchange_id = exchange.id(),
            node = %self.label,
            key = %key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "throttling"
        );
        match &self.options.async_pool {
            Some(pool) => self.delay_on_pool(pool, delay, exchange),
            None => {
                std::thread::sleep(delay);
                self.output.process(exchange)
            }
        }
    }
}
