//! The fold engine: read, fold, guard-check, compare-and-swap, publish.
//!
//! # Write Path
//!
//! [`Aggregator::apply_fact`] runs one optimistic-concurrency round per
//! attempt:
//!
//! 1. read the aggregate (or start a fresh one at the initial version)
//! 2. fold the fact and recompute the status projection
//! 3. evaluate action triggers; flip the guard for each newly satisfied one
//! 4. compare-and-swap the whole aggregate at the read version
//! 5. publish the fired actions
//!
//! A version conflict restarts the round from a fresh read after a jittered
//! backoff, bounded by the retry policy. The guard flips and the fold land
//! in the same write, so a crash between steps 4 and 5 leaves a persisted
//! guard with no published action — the reconciliation gap, which is logged
//! and counted, never rolled back.

use crate::metrics;
use crate::retry::RetryPolicy;
use fulfillment_core::aggregate::{ActionKind, AggregateStatus, OrderAggregate};
use fulfillment_core::bus::ActionPublisher;
use fulfillment_core::environment::Clock;
use fulfillment_core::error::ApplyError;
use fulfillment_core::fact::{ActionFact, CustomerInfo, Fact};
use fulfillment_core::key::{OrderKey, Version};
use fulfillment_core::store::{AggregateStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Round-robin roster of driver identifiers.
///
/// Stands in for a real dispatch system; assignment is a rotation over
/// `driver-001` .. `driver-NNN`.
#[derive(Debug)]
pub struct DriverRoster {
    cursor: AtomicU64,
    size: u64,
}

impl DriverRoster {
    /// Create a roster of `size` drivers (at least one).
    #[must_use]
    pub const fn new(size: u64) -> Self {
        Self {
            cursor: AtomicU64::new(0),
            size: if size == 0 { 1 } else { size },
        }
    }

    /// Next driver id in rotation.
    fn next_driver(&self) -> String {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.size;
        format!("driver-{:03}", slot + 1)
    }
}

impl Default for DriverRoster {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Result of successfully folding one fact.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    /// The aggregate's status after the fold.
    pub status: AggregateStatus,
    /// Actions fired by this fold, in firing order. Empty for most folds.
    pub fired: Vec<ActionFact>,
}

/// Outcome of one optimistic round, before retry classification.
enum Attempt {
    Done(ApplyOutcome),
    /// The delivery trigger was satisfied but the aggregate carries no
    /// address. The fold itself was persisted; the guard was not flipped.
    MissingInfo,
}

/// Folds facts into per-order aggregates and fires one-time actions.
///
/// Cheap to share: all state lives behind the store and publisher seams,
/// so one `Arc<Aggregator>` serves every stream reader concurrently.
pub struct Aggregator {
    store: Arc<dyn AggregateStore>,
    publisher: Arc<dyn ActionPublisher>,
    clock: Arc<dyn Clock>,
    roster: DriverRoster,
    cas_policy: RetryPolicy,
}

impl Aggregator {
    /// Create an aggregator with the default retry policy and a one-driver
    /// roster.
    #[must_use]
    pub fn new(
        store: Arc<dyn AggregateStore>,
        publisher: Arc<dyn ActionPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            roster: DriverRoster::default(),
            cas_policy: RetryPolicy::default(),
        }
    }

    /// Override the compare-and-swap retry policy.
    #[must_use]
    pub fn with_cas_policy(mut self, policy: RetryPolicy) -> Self {
        self.cas_policy = policy;
        self
    }

    /// Override the driver roster.
    #[must_use]
    pub fn with_roster(mut self, roster: DriverRoster) -> Self {
        self.roster = roster;
        self
    }

    /// Fold one fact into its order's aggregate and fire any newly
    /// triggered actions.
    ///
    /// Version conflicts are absorbed internally by re-reading and
    /// recomputing; callers only ever see the error classes in
    /// [`ApplyError`].
    ///
    /// # Errors
    ///
    /// - [`ApplyError::StoreUnavailable`] when the store cannot be reached
    ///   or contention outlasts the retry budget. Transient: redeliver.
    /// - [`ApplyError::MissingDeliveryInfo`] when a delivery order reaches
    ///   its trigger without an address. Permanent: the fold is persisted,
    ///   the guard stays unfired, and the caller should advance.
    pub async fn apply_fact(
        &self,
        key: &OrderKey,
        fact: &Fact,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut attempt = 0;

        loop {
            match self.try_apply(key, fact).await {
                Ok(Attempt::Done(outcome)) => {
                    metrics::counter!(metrics::FACTS_APPLIED, "fact" => fact.label())
                        .increment(1);
                    tracing::debug!(
                        order_key = %key,
                        fact = fact.label(),
                        status = %outcome.status,
                        fired = outcome.fired.len(),
                        "Fact folded"
                    );
                    return Ok(outcome);
                }
                Ok(Attempt::MissingInfo) => {
                    metrics::counter!(metrics::FACTS_APPLIED, "fact" => fact.label())
                        .increment(1);
                    tracing::error!(
                        order_key = %key,
                        "Delivery trigger satisfied with no delivery address on record; \
                         driver assignment withheld until a corrected order fact arrives"
                    );
                    return Err(ApplyError::MissingDeliveryInfo { key: key.clone() });
                }
                Err(err) if err.is_conflict() && attempt < self.cas_policy.max_retries => {
                    metrics::counter!(metrics::CAS_CONFLICTS).increment(1);
                    let delay = self.cas_policy.jittered_delay_for_attempt(attempt);
                    tracing::debug!(
                        order_key = %key,
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Version conflict, re-reading and retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_conflict() {
                        metrics::counter!(metrics::CAS_CONFLICTS).increment(1);
                        tracing::warn!(
                            order_key = %key,
                            attempt,
                            "Contention outlasted the retry budget"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// One optimistic round: read, fold, trigger-check, compare-and-swap,
    /// publish.
    async fn try_apply(&self, key: &OrderKey, fact: &Fact) -> Result<Attempt, StoreError> {
        let now = self.clock.now();

        let (mut aggregate, version) = match self.store.get(key).await? {
            Some(loaded) => loaded,
            None => (OrderAggregate::new(key.clone(), now), Version::INITIAL),
        };

        aggregate.apply(fact, now);

        let mut fired = Vec::new();
        let mut missing_info = false;
        for kind in aggregate.pending_actions() {
            match kind {
                ActionKind::DeliveryStart => {
                    let Some(info) = aggregate.delivery_info.clone() else {
                        missing_info = true;
                        continue;
                    };
                    let driver_id = self.roster.next_driver();
                    aggregate.assign_driver(driver_id.clone());
                    aggregate.mark_action_fired(kind, now);
                    fired.push(ActionFact::DeliveryAssigned {
                        order_id: key.as_str().to_string(),
                        driver_id,
                        customer_info: CustomerInfo::from_delivery_info(&info),
                        timestamp: now,
                    });
                }
                ActionKind::PickupReady => {
                    aggregate.mark_action_fired(kind, now);
                    fired.push(ActionFact::PickupReady {
                        order_id: key.as_str().to_string(),
                        timestamp: now,
                    });
                }
            }
        }

        let status = aggregate.status;
        self.store.compare_and_swap(key, version, aggregate).await?;

        // Guards are durable from here on. A failed publish is a
        // reconciliation gap: counted, logged, never rolled back.
        for action in &fired {
            match self.publisher.publish(action).await {
                Ok(()) => {
                    metrics::counter!(metrics::ACTIONS_FIRED, "action" => action.event_type())
                        .increment(1);
                    tracing::info!(
                        order_key = %key,
                        event_type = action.event_type(),
                        "Action fired"
                    );
                }
                Err(err) => {
                    metrics::counter!(metrics::RECONCILIATION_GAPS).increment(1);
                    tracing::error!(
                        order_key = %key,
                        event_type = action.event_type(),
                        error = %err,
                        "Action publish failed after its guard was persisted; \
                         the action will not be retried"
                    );
                }
            }
        }

        if missing_info {
            return Ok(Attempt::MissingInfo);
        }
        Ok(Attempt::Done(ApplyOutcome { status, fired }))
    }

    /// Current aggregate for an order, if any fact has arrived for it.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::StoreUnavailable`] if the store cannot be
    /// reached.
    pub async fn get_status(&self, key: &OrderKey) -> Result<Option<OrderAggregate>, ApplyError> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|(aggregate, _)| aggregate))
    }

    /// All delivery orders whose trigger condition holds but whose
    /// assignment has not fired, for operational inspection.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::StoreUnavailable`] if the store cannot be
    /// reached.
    pub async fn ready_for_delivery(&self) -> Result<Vec<OrderAggregate>, ApplyError> {
        Ok(self
            .store
            .scan_matching(Box::new(OrderAggregate::can_start_delivery))
            .await?)
    }
}
