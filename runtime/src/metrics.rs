//! Prometheus metrics for the aggregation engine.
//!
//! Counter names are defined here as constants so the hot paths and the
//! dashboards agree on spelling. The reconciliation-gap counter is the one
//! to alert on: it counts actions whose guard was persisted but whose
//! publish failed, which nothing retries automatically.

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::counter;

/// Inbound facts folded into aggregates, labelled by fact kind.
pub const FACTS_APPLIED: &str = "fulfillment_facts_applied_total";

/// Inbound messages skipped as permanently undecodable.
pub const FACTS_REJECTED: &str = "fulfillment_facts_rejected_total";

/// Version conflicts absorbed by the compare-and-swap retry loop.
pub const CAS_CONFLICTS: &str = "fulfillment_cas_conflicts_total";

/// Outbound actions fired, labelled by action kind.
pub const ACTIONS_FIRED: &str = "fulfillment_actions_fired_total";

/// Publishes that failed after their fired guard was persisted.
pub const RECONCILIATION_GAPS: &str = "fulfillment_reconciliation_gaps_total";

/// Aggregates deleted by the retention sweep.
pub const AGGREGATES_PURGED: &str = "fulfillment_aggregates_purged_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes counters on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the Prometheus recorder and
    /// spawn the scrape endpoint.
    ///
    /// Must be called from within a Tokio runtime; the HTTP exporter runs
    /// as a spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built. An
    /// already-installed recorder (as happens across tests) is tolerated
    /// with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                tokio::spawn(async move {
                    if let Err(e) = exporter.await {
                        tracing::error!(error = ?e, "Metrics exporter stopped");
                    }
                });
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    "Metrics recorder already initialized, skipping re-initialization"
                );
                Ok(())
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }
}

/// Register descriptions for every counter the engine emits.
pub fn register_metrics() {
    describe_counter!(
        FACTS_APPLIED,
        "Inbound facts folded into per-order aggregates"
    );
    describe_counter!(
        FACTS_REJECTED,
        "Inbound messages skipped as permanently undecodable"
    );
    describe_counter!(
        CAS_CONFLICTS,
        "Version conflicts absorbed by the compare-and-swap retry loop"
    );
    describe_counter!(ACTIONS_FIRED, "Outbound action facts fired exactly once");
    describe_counter!(
        RECONCILIATION_GAPS,
        "Publishes that failed after their fired guard was persisted"
    );
    describe_counter!(AGGREGATES_PURGED, "Aggregates deleted by the retention sweep");
}
