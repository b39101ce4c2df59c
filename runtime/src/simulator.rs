//! Driver progress simulator.
//!
//! Watches the outbound action topic for `delivery_assigned` facts and
//! plays out a scripted delivery for each one: picked up, in transit,
//! delivered, with randomized delays between steps. Stands in for a real
//! driver app until one exists.
//!
//! Every per-order script runs as a spawned task holding a clone of the
//! engine-wide shutdown receiver, so shutdown cancels in-flight deliveries
//! instead of leaking sleepers.

use fulfillment_core::bus::{ActionPublisher, BusError, EventBus};
use fulfillment_core::environment::Clock;
use fulfillment_core::fact::{ActionFact, DeliveryStatus};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The scripted delivery lifecycle: status, message, and the delay range
/// (in pace units) before the step happens.
const SCRIPT: &[(DeliveryStatus, &str, u32, u32)] = &[
    (
        DeliveryStatus::PickedUp,
        "Driver picked up the order",
        10,
        20,
    ),
    (
        DeliveryStatus::InTransit,
        "Driver is on the way to the customer",
        15,
        30,
    ),
    (
        DeliveryStatus::Delivered,
        "Order was delivered successfully",
        20,
        40,
    ),
];

/// Simulates driver progress for every assigned delivery.
pub struct DriverSimulator {
    bus: Arc<dyn EventBus>,
    publisher: Arc<dyn ActionPublisher>,
    clock: Arc<dyn Clock>,
    topic: String,
    /// One script delay unit. Production pace is one second; tests shrink
    /// this to finish a whole delivery in milliseconds.
    pace_unit: Duration,
    shutdown: watch::Receiver<bool>,
}

impl DriverSimulator {
    /// Create a simulator watching `topic` for assignments.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        publisher: Arc<dyn ActionPublisher>,
        clock: Arc<dyn Clock>,
        topic: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            publisher,
            clock,
            topic: topic.into(),
            pace_unit: Duration::from_secs(1),
            shutdown,
        }
    }

    /// Override the pace unit (tests).
    #[must_use]
    pub const fn with_pace_unit(mut self, unit: Duration) -> Self {
        self.pace_unit = unit;
        self
    }

    /// Watch the action topic and spawn a delivery script per assignment.
    ///
    /// Runs until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the initial subscription
    /// cannot be established.
    pub async fn run(&self) -> Result<(), BusError> {
        tracing::info!(topic = %self.topic, "Starting driver simulator");

        let mut stream = self.bus.subscribe(&[self.topic.as_str()]).await?;
        let mut shutdown = self.shutdown.clone();

        while !*shutdown.borrow() {
            tokio::select! {
                Some(result) = stream.next() => {
                    match result {
                        Ok(delivery) => {
                            self.handle_action(&delivery.message.payload);
                            delivery.ack();
                        }
                        Err(e) => {
                            tracing::error!(
                                topic = %self.topic,
                                error = %e,
                                "Error receiving from bus"
                            );
                        }
                    }
                }

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(topic = %self.topic, "Shutdown signal received");
                        break;
                    }
                }
            }
        }

        tracing::info!(topic = %self.topic, "Driver simulator stopped");
        Ok(())
    }

    /// React to one message on the action topic. Only `delivery_assigned`
    /// starts a script; everything else on the topic (including our own
    /// status updates echoing back) is ignored.
    fn handle_action(&self, payload: &[u8]) {
        let Ok(ActionFact::DeliveryAssigned {
            order_id,
            driver_id,
            ..
        }) = serde_json::from_slice::<ActionFact>(payload)
        else {
            return;
        };

        tracing::info!(order_id, driver_id, "Starting driver simulation");

        let publisher = Arc::clone(&self.publisher);
        let clock = Arc::clone(&self.clock);
        let pace_unit = self.pace_unit;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            run_script(&publisher, clock.as_ref(), &order_id, pace_unit, shutdown).await;
        });
    }
}

/// Play the scripted delivery for one order, publishing a status update per
/// step. Cancelled mid-sleep by the shutdown signal.
async fn run_script(
    publisher: &Arc<dyn ActionPublisher>,
    clock: &dyn Clock,
    order_id: &str,
    pace_unit: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    for (status, message, min_units, max_units) in SCRIPT {
        let delay = random_delay(pace_unit, *min_units, *max_units);

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!(order_id, "Driver simulation cancelled by shutdown");
                    return;
                }
            }
        }

        let update = ActionFact::DeliveryStatusUpdate {
            order_id: order_id.to_string(),
            status: *status,
            message: (*message).to_string(),
            location: None,
            timestamp: clock.now(),
        };

        if let Err(err) = publisher.publish(&update).await {
            tracing::error!(
                order_id,
                status = ?status,
                error = %err,
                "Failed to publish simulated status update, abandoning script"
            );
            return;
        }
    }

    tracing::info!(order_id, "Driver simulation completed");
}

/// Uniform delay in `[min_units, max_units]` pace units.
fn random_delay(unit: Duration, min_units: u32, max_units: u32) -> Duration {
    use rand::Rng;

    let units = rand::thread_rng().gen_range(min_units..=max_units);
    unit * units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_ends_in_delivered() {
        let (status, _, _, _) = SCRIPT[SCRIPT.len() - 1];
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[test]
    fn random_delay_stays_in_range() {
        let unit = Duration::from_millis(1);
        for _ in 0..50 {
            let delay = random_delay(unit, 10, 20);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(20));
        }
    }
}
