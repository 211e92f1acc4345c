//! Metrics emission.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line and
//! metric names live in one place. Nothing is recorded unless a recorder is
//! installed (see [`install_prometheus`]).
//!
//! # Metrics
//! - `mentor_shield_cache_hits_total` (counter): fresh reads, by cache
//! - `mentor_shield_cache_misses_total` (counter): missing or expired reads, by cache
//! - `mentor_shield_cache_stale_served_total` (counter): stale values served after a failed refresh
//! - `mentor_shield_cache_refreshes_total` (counter): upstream refreshes, by cache and outcome
//! - `mentor_shield_breaker_transitions_total` (counter): circuit state changes
//! - `mentor_shield_retry_attempts_total` (counter): retries scheduled, by operation
//! - `mentor_shield_rate_limited_total` (counter): denied requests, by limiter

use telemetry_metrics::counter;

/// Record a fresh cache read
pub fn record_cache_hit(cache: &str) {
    counter!("mentor_shield_cache_hits_total", "cache" => cache.to_owned()).increment(1);
}

/// Record a read that found nothing fresh
pub fn record_cache_miss(cache: &str) {
    counter!("mentor_shield_cache_misses_total", "cache" => cache.to_owned()).increment(1);
}

/// Record a stale value served in place of a failed refresh
pub fn record_stale_served(cache: &str) {
    counter!("mentor_shield_cache_stale_served_total", "cache" => cache.to_owned()).increment(1);
}

/// Record the outcome of an upstream refresh
pub fn record_refresh(cache: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "mentor_shield_cache_refreshes_total",
        "cache" => cache.to_owned(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a circuit breaker state change
pub fn record_breaker_transition(breaker: &str, from: &'static str, to: &'static str) {
    counter!(
        "mentor_shield_breaker_transitions_total",
        "breaker" => breaker.to_owned(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

/// Record a scheduled retry
pub fn record_retry(operation: &str) {
    counter!("mentor_shield_retry_attempts_total", "operation" => operation.to_owned())
        .increment(1);
}

/// Record a request denied by a rate limiter
pub fn record_rate_limited(limiter: &str) {
    counter!("mentor_shield_rate_limited_total", "limiter" => limiter.to_owned()).increment(1);
}

/// Install the Prometheus exporter, serving `/metrics` on `addr`
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder is
/// already installed.
#[cfg(feature = "metrics")]
pub fn install_prometheus(addr: std::net::SocketAddr) -> crate::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| crate::Error::Config(format!("metrics exporter: {e}")))
}
