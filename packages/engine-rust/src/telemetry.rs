//! Logging setup and metric names.
//!
//! The engine only emits `tracing` events and `metrics` samples. Installing a
//! subscriber or a metrics recorder is left to the host application;
//! [`init_tracing`] is a convenience for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Counter: exchanges that finished a route, labelled by `route` and `outcome`.
pub const EXCHANGES_TOTAL: &str = "routeflow_exchanges_total";
/// Histogram: end-to-end route duration in milliseconds, labelled by `route`.
pub const EXCHANGE_DURATION_MS: &str = "routeflow_exchange_duration_ms";
/// Counter: redelivery attempts, labelled by `route`.
pub const REDELIVERIES_TOTAL: &str = "routeflow_redeliveries_total";
/// Counter: exchanges rejected by a throttle, labelled by `route` and `node`.
pub const THROTTLE_REJECTIONS_TOTAL: &str = "routeflow_throttle_rejections_total";

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Installs a global `tracing` subscriber filtered by `RUST_LOG`, falling
/// back to `default_filter` when the variable is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_reports_existing_subscriber() {
        let _ = init_tracing("routeflow=debug", LogFormat::Pretty);
        assert!(!init_tracing("routeflow=debug", LogFormat::Json));
    }
}
