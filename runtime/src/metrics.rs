//! Prometheus metrics for observability and monitoring.
//!
//! This module describes and exports the metrics recorded by the middleware:
//! - Store dispatch (actions reduced, Epic output re-dispatched, rejections)
//! - Reducer execution time
//! - Epic failures (panics caught by the combinator)
//! - Watch subscriptions (opened, closed, values decoded)
//! - One-shot writes issued by Epics
//!
//! # Example
//!
//! ```rust,no_run
//! use composable_epics_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Prometheus scrapes http://0.0.0.0:9090/metrics; the same text is
//! // available in-process:
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter (bad bucket config or listener bind)
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus exporter serving `GET /metrics` on `addr`.
///
/// `start` installs the global recorder and spawns the HTTP listener on the
/// current tokio runtime. Only one recorder can be installed per process; a
/// second `start` leaves the first one serving.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server that will listen on `addr`
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every metric, install the recorder and start serving.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the bucket configuration is
    /// rejected or `addr` cannot be bound.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!(addr = %self.addr, "Metrics recorder already installed, not serving");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display`.
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics listener stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Serving Prometheus metrics at /metrics");
        self.handle = Some(handle);
        Ok(())
    }

    /// Address the exporter listens on
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Handle to the installed recorder, if this server installed it
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` unless this server installed the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Store Metrics
    describe_counter!(
        "store_actions_dispatched_total",
        "Total number of actions reduced by the store"
    );
    describe_counter!(
        "store_epic_actions_emitted_total",
        "Total number of actions emitted by Epics and re-dispatched"
    );
    describe_counter!(
        "store_rejected_actions_total",
        "Total number of actions rejected because the store was shutting down"
    );
    describe_histogram!(
        "store_reducer_duration_seconds",
        "Time taken to reduce one action"
    );
    describe_gauge!(
        "store_running",
        "1 while the store event loop is running, 0 after it stopped"
    );

    // Epic Metrics
    describe_counter!(
        "epic_panics_total",
        "Total number of Epic panics caught and restarted by the combinator"
    );
    describe_counter!(
        "epic_writes_total",
        "Total number of one-shot writes issued by Epics, labelled by outcome"
    );

    // Watch Metrics
    describe_counter!(
        "watch_subscriptions_opened_total",
        "Total number of watch subscriptions opened"
    );
    describe_counter!(
        "watch_subscriptions_closed_total",
        "Total number of watch subscriptions closed"
    );
    describe_counter!(
        "watch_values_decoded_total",
        "Total number of watched values decoded into domain values"
    );
}

/// Store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record an action reduced by the store.
    pub fn record_dispatch(duration: Duration) {
        counter!("store_actions_dispatched_total").increment(1);
        histogram!("store_reducer_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an action emitted by the root Epic.
    pub fn record_epic_emission() {
        counter!("store_epic_actions_emitted_total").increment(1);
    }

    /// Record an action rejected during shutdown.
    pub fn record_rejection() {
        counter!("store_rejected_actions_total").increment(1);
    }

    /// Record whether the event loop is running.
    pub fn record_running(running: bool) {
        gauge!("store_running").set(if running { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn free_local_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:9464".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert_eq!(server.addr(), addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_served_over_http() {
        let mut server = MetricsServer::new(free_local_addr());
        server.start().unwrap();

        // Another test in this binary may have installed the recorder first.
        if server.handle().is_none() {
            return;
        }

        StoreMetrics::record_dispatch(Duration::from_micros(40));
        StoreMetrics::record_epic_emission();
        StoreMetrics::record_rejection();

        let rendered = server.render().unwrap();
        assert!(rendered.contains("store_actions_dispatched_total"));
        assert!(rendered.contains("store_rejected_actions_total"));

        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("store_epic_actions_emitted_total"));
    }

    #[tokio::test]
    async fn test_second_start_is_harmless() {
        let mut first = MetricsServer::new(free_local_addr());
        let mut second = MetricsServer::new(free_local_addr());

        first.start().unwrap();
        second.start().unwrap();

        // At most one of them owns the process-wide recorder.
        assert!(!(first.handle().is_some() && second.handle().is_some()));
    }
}
