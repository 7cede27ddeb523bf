use std::fmt;
use std::time::Duration;

use rand::Rng;
use routeflow_core::{ErrorMatcher, Exchange, SharedPredicate, SharedProcessor};

/// How often, and how far apart, a failed exchange is redelivered.
#[derive(Clone)]
pub struct RedeliveryPolicy {
    /// Redeliveries after the first failure. `None` is unlimited.
    pub maximum_redeliveries: Option<u32>,
    pub redelivery_delay: Duration,
    pub maximum_redelivery_delay: Duration,
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
    /// Randomizes each delay by up to this fraction in either direction.
    pub collision_avoidance_factor: Option<f64>,
    /// Redeliver only while this matches the failed exchange.
    pub retry_while: Option<SharedPredicate>,
    /// Wait on a worker pool instead of sleeping the calling thread.
    pub async_delayed_redelivery: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: Some(0),
            redelivery_delay: Duration::from_secs(1),
            maximum_redelivery_delay: Duration::from_secs(60),
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
            collision_avoidance_factor: None,
            retry_while: None,
            async_delayed_redelivery: false,
        }
    }
}

impl RedeliveryPolicy {
    /// Whether redelivery number `attempt` (1-based) may run for `exchange`.
    #[must_use]
    pub fn should_redeliver(&self, exchange: &Exchange, attempt: u32) -> bool {
        let within_limit = self.maximum_redeliveries.map_or(true, |max| attempt <= max);
        within_limit
            && self
                .retry_while
                .as_ref()
                .map_or(true, |predicate| predicate.matches(exchange))
    }

    /// Delay before redelivery number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.redelivery_delay.as_secs_f64();
        if self.use_exponential_backoff && attempt > 1 {
            let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
            delay *= self.backoff_multiplier.powi(exponent);
        }
        if let Some(factor) = self.collision_avoidance_factor.filter(|f| *f > 0.0) {
            let factor = factor.min(1.0);
            delay *= rand::rng().random_range((1.0 - factor)..=(1.0 + factor));
        }
        let cap = self.maximum_redelivery_delay.as_secs_f64();
        Duration::try_from_secs_f64(delay.min(cap)).unwrap_or(self.maximum_redelivery_delay)
    }
}

impl fmt::Debug for RedeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryPolicy")
            .field("maximum_redeliveries", &self.maximum_redeliveries)
            .field("redelivery_delay", &self.redelivery_delay)
            .field("maximum_redelivery_delay", &self.maximum_redelivery_delay)
            .field("use_exponential_backoff", &self.use_exponential_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("collision_avoidance_factor", &self.collision_avoidance_factor)
            .field("retry_while", &self.retry_while.is_some())
            .field("async_delayed_redelivery", &self.async_delayed_redelivery)
            .finish()
    }
}

/// A compiled `on_exception` clause.
#[derive(Clone)]
pub struct ExceptionPolicy {
    pub matchers: Vec<ErrorMatcher>,
    pub on_when: Option<SharedPredicate>,
    pub redelivery: Option<RedeliveryPolicy>,
    pub handled: bool,
    pub handler: Option<SharedProcessor>,
}

impl ExceptionPolicy {
    /// Matches when the failure satisfies any matcher (or there are none)
    /// and `on_when`, if set, holds.
    #[must_use]
    pub fn matches(&self, exchange: &Exchange) -> bool {
        let Some(failure) = exchange.failure() else {
            return false;
        };
        let type_match =
            self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(failure));
        type_match
            && self
                .on_when
                .as_ref()
                .map_or(true, |predicate| predicate.matches(exchange))
    }
}

impl fmt::Debug for ExceptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionPolicy")
            .field("matchers", &self.matchers)
            .field("handled", &self.handled)
            .field("redelivery", &self.redelivery)
            .finish_non_exhaustive()
    }
}
