//! Prometheus metrics exposition
//!
//! Gateway-level metrics; the keypool crate emits its own counters
//! (`keypool_acquire_total`, `keypool_cooldowns_total`,
//! `keypool_attempts_total`, `keypool_exhaustions_total`) through the same
//! recorder:
//!
//! - `gateway_generations_total` (counter): label `outcome`
//! - `gateway_generation_duration_seconds` (histogram): label `outcome`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `gateway_generation_duration_seconds` with explicit buckets so
/// it renders as a Prometheus histogram (with `_bucket` lines) rather than a
/// summary. Boundaries cover 50ms to 60s; generation calls are slow compared
/// to plain proxying.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_generation_duration_seconds".to_string(),
            ),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a finished generation request with its outcome label.
pub fn record_generation(outcome: &str, duration_secs: f64) {
    metrics::counter!("gateway_generations_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("gateway_generation_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_secs);
}
