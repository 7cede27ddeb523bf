//! Engine-level configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::errorhandler::RedeliveryPolicy;

/// What a worker pool does with a task when every worker is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Refuse the task; the submitting node records a rejection failure.
    Abort,
    /// Hand the task back so the submitting thread runs it itself.
    #[default]
    CallerRuns,
    /// Queue the task until a worker frees up.
    Queue,
}

/// Sizing and overflow behavior of one named worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of tasks running concurrently on the pool.
    pub pool_size: usize,
    /// Behavior when `pool_size` tasks are already running.
    pub rejection: RejectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            rejection: RejectionPolicy::CallerRuns,
        }
    }
}

/// Default redelivery settings for routes that do not declare their own.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Redelivery attempts after the first failure. Negative means unlimited.
    pub maximum_redeliveries: i64,
    /// Delay before the first redelivery, in milliseconds.
    pub redelivery_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub maximum_redelivery_delay_ms: u64,
    /// Multiply the delay by `backoff_multiplier` after each attempt.
    pub use_exponential_backoff: bool,
    pub backoff_multiplier: f64,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay_ms: 1000,
            maximum_redelivery_delay_ms: 60_000,
            use_exponential_backoff: false,
            backoff_multiplier: 2.0,
        }
    }
}

impl RedeliveryConfig {
    /// Converts to the runtime policy.
    #[must_use]
    pub fn to_policy(&self) -> RedeliveryPolicy {
        let maximum = u32::try_from(self.maximum_redeliveries).ok();
        RedeliveryPolicy {
            maximum_redeliveries: maximum,
            redelivery_delay: Duration::from_millis(self.redelivery_delay_ms),
            maximum_redelivery_delay: Duration::from_millis(self.maximum_redelivery_delay_ms),
            use_exponential_backoff: self.use_exponential_backoff,
            backoff_multiplier: self.backoff_multiplier,
            ..RedeliveryPolicy::default()
        }
    }
}

/// Top-level engine configuration.
///
/// Controls worker pools, shutdown draining, default redelivery and the
/// properties used for `{{placeholder}}` resolution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of this engine instance, used in logs.
    pub name: String,
    /// Pool used by nodes that do not reference a named executor.
    pub default_pool: PoolConfig,
    /// Additional named pools, referenced from definitions by name.
    pub pools: HashMap<String, PoolConfig>,
    /// Worker threads when the engine has to create its own runtime.
    pub worker_threads: usize,
    /// Maximum time a stopping route waits for in-flight exchanges, in
    /// milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Redelivery defaults for the engine-wide error handler.
    pub redelivery: RedeliveryConfig,
    /// Throttle key slots idle for longer than this many periods are evicted.
    pub throttle_idle_periods: u32,
    /// Values for `{{key}}` placeholders in route definitions.
    pub properties: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "routeflow".to_string(),
            default_pool: PoolConfig::default(),
            pools: HashMap::new(),
            worker_threads: 4,
            shutdown_timeout_ms: 30_000,
            redelivery: RedeliveryConfig::default(),
            throttle_idle_periods: 10,
            properties: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Parses configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid JSON for this shape.
    pub fn from_json(input: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
