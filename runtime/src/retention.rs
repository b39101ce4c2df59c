//! Periodic retention sweep over the aggregate store.
//!
//! Aggregates are working state for in-flight orders, not an archive.
//! Records older than the retention window (measured from `created_at`)
//! are deleted on a fixed interval.

use crate::metrics;
use fulfillment_core::environment::Clock;
use fulfillment_core::store::AggregateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default retention window: 24 hours.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default sweep interval: hourly.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Deletes expired aggregates on a fixed interval.
pub struct RetentionSweeper {
    store: Arc<dyn AggregateStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl RetentionSweeper {
    /// Create a sweeper with the default window and interval.
    #[must_use]
    pub fn new(
        store: Arc<dyn AggregateStore>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            retention: DEFAULT_RETENTION,
            interval: DEFAULT_SWEEP_INTERVAL,
            shutdown,
        }
    }

    /// Override the retention window.
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Override the sweep interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep on the configured interval until the shutdown signal fires.
    ///
    /// Store failures during a sweep are logged and the next interval is
    /// awaited; retention is not worth crashing the engine over.
    pub async fn run(&self) {
        tracing::info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Starting retention sweeper"
        );

        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        // The immediate first tick would race startup; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Retention sweeper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep: delete everything created before the retention cutoff.
    pub async fn sweep_once(&self) {
        let Ok(window) = chrono::Duration::from_std(self.retention) else {
            tracing::error!("Retention window too large to represent, skipping sweep");
            return;
        };
        let cutoff = self.clock.now() - window;

        match self.store.purge_expired(cutoff).await {
            Ok(purged) => {
                metrics::counter!(metrics::AGGREGATES_PURGED).increment(purged);
                if purged > 0 {
                    tracing::info!(purged, %cutoff, "Expired aggregates purged");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Retention sweep failed, will retry next interval");
            }
        }
    }
}
