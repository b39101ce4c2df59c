//! In-memory doubles for the store, the bus and the clock.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::{DateTime, Utc};
use fulfillment_core::aggregate::OrderAggregate;
use fulfillment_core::bus::{
    AckDecision, ActionPublisher, BusError, BusMessage, Delivery, EventBus, MessageStream,
};
use fulfillment_core::environment::Clock;
use fulfillment_core::fact::ActionFact;
use fulfillment_core::key::{OrderKey, Version};
use fulfillment_core::store::{AggregateStore, ScanPredicate, StoreError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fixed clock for deterministic tests.
///
/// Always returns the same time, making folds reproducible.
///
/// # Example
///
/// ```
/// use fulfillment_testing::mocks::FixedClock;
/// use fulfillment_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Panics if the hardcoded timestamp fails to parse, which cannot happen.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_clock() -> FixedClock {
    FixedClock::new(
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc),
    )
}

/// In-memory aggregate store with real compare-and-swap semantics.
///
/// The CAS check is performed under one mutex acquisition, so concurrent
/// `apply_fact` stress tests exercise the same winner-takes-the-version race
/// a real backend produces.
///
/// Outages are injectable: [`fail_next`](Self::fail_next) makes the next N
/// operations return [`StoreError::Unavailable`].
#[derive(Clone, Default)]
pub struct InMemoryAggregateStore {
    records: Arc<Mutex<HashMap<OrderKey, (OrderAggregate, Version)>>>,
    failures_remaining: Arc<AtomicUsize>,
}

impl InMemoryAggregateStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store operations fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of live records, for assertions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Direct snapshot of a record, bypassing failure injection.
    #[must_use]
    pub fn snapshot(&self, key: &OrderKey) -> Option<(OrderAggregate, Version)> {
        self.records.lock().unwrap().get(key).cloned()
    }

    fn check_outage(&self) -> Result<(), StoreError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl AggregateStore for InMemoryAggregateStore {
    fn get(
        &self,
        key: &OrderKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(OrderAggregate, Version)>, StoreError>> + Send + '_>>
    {
        let key = key.clone();
        Box::pin(async move {
            self.check_outage()?;
            Ok(self.records.lock().unwrap().get(&key).cloned())
        })
    }

    fn compare_and_swap(
        &self,
        key: &OrderKey,
        expected_version: Version,
        aggregate: OrderAggregate,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            self.check_outage()?;

            let mut records = self.records.lock().unwrap();
            let current = records.get(&key).map(|(_, v)| *v);

            let matches = match current {
                None => expected_version.is_initial(),
                Some(version) => version == expected_version,
            };
            if !matches {
                return Err(StoreError::VersionConflict {
                    key,
                    expected: expected_version,
                });
            }

            let new_version = expected_version.next();
            records.insert(key, (aggregate, new_version));
            Ok(new_version)
        })
    }

    fn scan_matching(
        &self,
        predicate: ScanPredicate,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OrderAggregate>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_outage()?;
            let records = self.records.lock().unwrap();
            Ok(records
                .values()
                .map(|(aggregate, _)| aggregate)
                .filter(|aggregate| predicate(aggregate))
                .cloned()
                .collect())
        })
    }

    fn purge_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_outage()?;
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, (aggregate, _)| aggregate.created_at >= cutoff);
            Ok((before - records.len()) as u64)
        })
    }
}

/// In-memory event bus backed by per-topic append-only logs.
///
/// Subscribers replay each topic from the beginning and then follow the
/// tail, like a Kafka consumer with `auto_offset_reset = earliest`, so
/// tests never race a publish against a subscription. A redelivered
/// message is handed out again before the cursor advances.
///
/// Everything published is also inspectable per topic via
/// [`published`](Self::published).
pub struct InMemoryEventBus {
    logs: Arc<Mutex<HashMap<String, Vec<BusMessage>>>>,
}

impl InMemoryEventBus {
    /// Create a new empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// All messages published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.logs
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    fn message_at(&self, topic: &str, index: usize) -> Option<BusMessage> {
        self.logs
            .lock()
            .unwrap()
            .get(topic)
            .and_then(|log| log.get(index))
            .cloned()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Box a stream behind the [`MessageStream`] alias.
///
/// Going through a function boundary lets a never-ending `stream!` body
/// (whose block type is `!`) unify with the alias's `()`-returning future,
/// which a direct `as` cast on `Box::pin` does not.
fn boxed(
    stream: impl futures::Stream<Item = Result<Delivery, BusError>> + Send + 'static,
) -> MessageStream {
    Box::pin(stream)
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let topic = topic.to_string();
        let message = message.clone();
        Box::pin(async move {
            self.logs
                .lock()
                .unwrap()
                .entry(topic)
                .or_default()
                .push(message);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>> {
        let logs = Arc::clone(&self.logs);
        let topics: Vec<String> = topics.iter().map(ToString::to_string).collect();

        Box::pin(async move {
            let bus = Self { logs };
            let stream = async_stream::stream! {
                let mut cursors = vec![0_usize; topics.len()];
                loop {
                    // Round-robin poll over all subscribed topic logs.
                    let mut yielded = false;
                    for (topic, cursor) in topics.iter().zip(cursors.iter_mut()) {
                        let Some(message) = bus.message_at(topic, *cursor) else {
                            continue;
                        };
                        yielded = true;
                        // Keep handing out the same message until the
                        // subscriber commits it.
                        loop {
                            let (decision_tx, decision_rx) = tokio::sync::oneshot::channel();
                            yield Ok(Delivery::new(message.clone(), decision_tx));
                            match decision_rx.await {
                                Ok(AckDecision::Redeliver) => {}
                                Ok(AckDecision::Commit) | Err(_) => {
                                    *cursor += 1;
                                    break;
                                }
                            }
                        }
                    }
                    if !yielded {
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    }
                }
            };
            Ok(boxed(stream))
        })
    }
}

/// Action publisher that records everything it is asked to publish.
///
/// Failures are injectable via [`fail_next`](Self::fail_next) to test the
/// persist-then-publish reconciliation gap.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    actions: Arc<Mutex<Vec<ActionFact>>>,
    failures_remaining: Arc<AtomicUsize>,
}

impl RecordingPublisher {
    /// Create a new recording publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with [`BusError::PublishFailed`].
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// All successfully published actions, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<ActionFact> {
        self.actions.lock().unwrap().clone()
    }

    /// Count of published actions with the given wire discriminant.
    #[must_use]
    pub fn count_of(&self, event_type: &str) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|action| action.event_type() == event_type)
            .count()
    }
}

impl ActionPublisher for RecordingPublisher {
    fn publish(
        &self,
        action: &ActionFact,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let action = action.clone();
        Box::pin(async move {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0
                && self
                    .failures_remaining
                    .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return Err(BusError::PublishFailed {
                    topic: "recording".to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }

            self.actions.lock().unwrap().push(action);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fulfillment_core::aggregate::OrderAggregate;

    fn aggregate(key: &str) -> OrderAggregate {
        OrderAggregate::new(OrderKey::new(key), test_clock().now())
    }

    #[tokio::test]
    async fn cas_inserts_at_initial_version() {
        let store = InMemoryAggregateStore::new();
        let key = OrderKey::new("o1");

        let v1 = store
            .compare_and_swap(&key, Version::INITIAL, aggregate("o1"))
            .await
            .unwrap();
        assert_eq!(v1, Version::new(1));

        let (_, version) = store.get(&key).await.unwrap().unwrap();
        assert_eq!(version, v1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = InMemoryAggregateStore::new();
        let key = OrderKey::new("o1");

        store
            .compare_and_swap(&key, Version::INITIAL, aggregate("o1"))
            .await
            .unwrap();

        // A second writer still holding the initial version loses.
        let err = store
            .compare_and_swap(&key, Version::INITIAL, aggregate("o1"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_outage_fails_once_per_operation() {
        let store = InMemoryAggregateStore::new();
        let key = OrderKey::new("o1");

        store.fail_next(1);
        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get(&key).await.is_ok());
    }

    #[tokio::test]
    async fn purge_removes_old_records() {
        let store = InMemoryAggregateStore::new();
        let old_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let old = OrderAggregate::new(OrderKey::new("old"), old_time);

        store
            .compare_and_swap(&OrderKey::new("old"), Version::INITIAL, old)
            .await
            .unwrap();
        store
            .compare_and_swap(&OrderKey::new("new"), Version::INITIAL, aggregate("new"))
            .await
            .unwrap();

        let removed = store
            .purge_expired(Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).single().unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn bus_captures_published_messages() {
        let bus = InMemoryEventBus::new();
        let message = BusMessage::new(Some("o1".to_string()), b"{}".to_vec());

        bus.publish("delivery-events", &message).await.unwrap();

        let captured = bus.published("delivery-events");
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].key.as_deref(), Some("o1"));
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        use futures::StreamExt;

        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["order-events"]).await.unwrap();

        let message = BusMessage::new(Some("o1".to_string()), b"{\"n\":1}".to_vec());
        bus.publish("order-events", &message).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.message.payload, message.payload);
        received.ack();
    }

    #[tokio::test]
    async fn bus_redelivers_until_committed() {
        use futures::StreamExt;

        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["order-events"]).await.unwrap();

        let message = BusMessage::new(Some("o1".to_string()), b"{\"n\":1}".to_vec());
        bus.publish("order-events", &message).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        first.redeliver();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message.payload, message.payload);
        second.ack();
    }

    #[tokio::test]
    async fn topic_publisher_emits_keyed_json() {
        use fulfillment_core::bus::TopicActionPublisher;

        let bus = Arc::new(InMemoryEventBus::new());
        let publisher =
            TopicActionPublisher::new(Arc::clone(&bus) as Arc<dyn EventBus>, "delivery-events");

        let action = ActionFact::PickupReady {
            order_id: "order-9".to_string(),
            timestamp: test_clock().now(),
        };
        publisher.publish(&action).await.unwrap();

        let captured = bus.published("delivery-events");
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].key.as_deref(), Some("order-9"));
        let round_trip: ActionFact = serde_json::from_slice(&captured[0].payload).unwrap();
        assert_eq!(round_trip, action);
    }

    #[tokio::test]
    async fn recording_publisher_counts_by_event_type() {
        let publisher = RecordingPublisher::new();
        let action = ActionFact::PickupReady {
            order_id: "o1".to_string(),
            timestamp: test_clock().now(),
        };

        publisher.publish(&action).await.unwrap();
        assert_eq!(publisher.count_of("pickup_ready"), 1);
        assert_eq!(publisher.count_of("delivery_assigned"), 0);
    }

    #[tokio::test]
    async fn recording_publisher_injected_failure() {
        let publisher = RecordingPublisher::new();
        publisher.fail_next(1);

        let action = ActionFact::PickupReady {
            order_id: "o1".to_string(),
            timestamp: test_clock().now(),
        };

        assert!(publisher.publish(&action).await.is_err());
        assert!(publisher.publish(&action).await.is_ok());
        assert_eq!(publisher.count_of("pickup_ready"), 1);
    }
}
