//! Shared Prometheus recorder initialisation.
//!
//! This module is only compiled when the `prometheus` Cargo feature is
//! enabled. It installs the global `metrics` recorder and hands back the
//! handle used to render the scrape endpoint.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Latency buckets in seconds shared by every `*_duration_seconds` histogram.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors that can occur while installing the recorder.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: {0}")]
    Install(#[from] BuildError),
}

/// Install the global Prometheus recorder.
///
/// Can only succeed once per process; later calls return an error.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()?;
    Ok(handle)
}
