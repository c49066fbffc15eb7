//! Prometheus metrics for the dispatch core.
//!
//! Counters and histograms are emitted through the `metrics` facade from the
//! client, session managers, operations, and the event loop. Nothing is
//! recorded unless the application installs a recorder, for example with
//! [`install_prometheus_recorder`].
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::install_prometheus_recorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = install_prometheus_recorder()?;
//!
//! // ... dispatch some requests ...
//!
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Build a Prometheus recorder, install it globally, and describe every
/// metric this crate emits.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a global recorder is already
/// installed.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    register_metrics();
    tracing::info!("Prometheus recorder installed");
    Ok(handle)
}

/// Register all metric descriptions with the installed recorder.
pub fn register_metrics() {
    // Client
    describe_counter!(
        "courier.client.submitted",
        "Operations accepted by Client::submit"
    );
    describe_counter!(
        "courier.client.rejected",
        "Submissions refused because the client is closing or killed"
    );
    describe_counter!(
        "courier.client.timeouts",
        "Operations failed by their timeout timer"
    );

    // Operations
    describe_counter!(
        "courier.operation.completed",
        "Terminal transitions, labelled by outcome"
    );

    // Session managers
    describe_counter!(
        "courier.session.created",
        "Session managers created (one per canonical destination)"
    );
    describe_counter!(
        "courier.session.dispatched",
        "Operations assigned to a connection stream"
    );
    describe_counter!(
        "courier.session.retries",
        "Operations re-queued after a retriable transport failure"
    );
    describe_counter!("courier.session.redirects", "Redirect hops followed");
    describe_counter!(
        "courier.session.connections_opened",
        "Connections established"
    );
    describe_counter!(
        "courier.session.connect_failures",
        "Connection attempts that failed or timed out"
    );
    describe_histogram!(
        "courier.session.queue_wait_seconds",
        "Time from admission to dispatch"
    );

    // Event loop
    describe_counter!(
        "courier.event_loop.tasks",
        "Tasks run on the event loop thread"
    );
    describe_counter!(
        "courier.event_loop.timers",
        "Timers scheduled on the event loop"
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn register_without_recorder_is_harmless() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn second_install_reports_error() {
        let _first = install_prometheus_recorder();
        let second = install_prometheus_recorder();
        assert!(matches!(second, Err(MetricsError::Install(_))));
    }
}
