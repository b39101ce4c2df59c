//! Event bus abstraction and the outbound action publisher.
//!
//! # Overview
//!
//! The bus is an at-least-once transport: messages may be redelivered, and
//! ordering is only guaranteed within one topic partition. Payloads are JSON;
//! the message key is the order key so all facts for one order land on one
//! partition.
//!
//! # Delivery Semantics
//!
//! Implementations commit a message's position only after the subscriber has
//! taken it, so a crash between receive and commit results in redelivery.
//! Everything downstream of the bus is therefore idempotent by construction
//! (monotone flags, fired-once guards).
//!
//! # Implementations
//!
//! - `RedpandaEventBus` (in `fulfillment-redpanda`): Kafka-compatible,
//!   production
//! - `InMemoryEventBus` (in `fulfillment-testing`): fast, synchronous tests

use crate::fact::ActionFact;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during bus operations.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// Failed to connect to the bus.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic. Transient from the caller's
    /// point of view.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed.
        topic: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to subscribe to topics.
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe.
        topics: Vec<String>,
        /// The reason for failure.
        reason: String,
    },

    /// Network or transport error while receiving.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// One raw message from a topic: an optional partition key plus the JSON
/// payload. Decoding into typed facts happens at the stream-reader boundary.
#[derive(Clone, Debug)]
pub struct BusMessage {
    /// Partition key (the order key for all topics in this system).
    pub key: Option<String>,
    /// JSON-encoded payload.
    pub payload: Vec<u8>,
}

impl BusMessage {
    /// Create a new message.
    #[must_use]
    pub const fn new(key: Option<String>, payload: Vec<u8>) -> Self {
        Self { key, payload }
    }
}

/// The subscriber's verdict on one delivered message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckDecision {
    /// Processing finished (successfully or permanently); advance past the
    /// message.
    Commit,
    /// Processing failed transiently; do not advance, deliver the message
    /// again.
    Redeliver,
}

/// One message delivered by a subscription, carrying its acknowledgement
/// handle.
///
/// The transport commits the message's position only when the subscriber
/// calls [`ack`](Self::ack). [`redeliver`](Self::redeliver) asks for the
/// message again, which is how a reader refuses to advance past a fact the
/// store could not absorb. Dropping a delivery without a verdict counts as
/// an ack, so a permanently undecodable message can never block a partition.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered message.
    pub message: BusMessage,
    decision: Option<tokio::sync::oneshot::Sender<AckDecision>>,
}

impl Delivery {
    /// Create a delivery with an acknowledgement channel.
    #[must_use]
    pub const fn new(
        message: BusMessage,
        decision: tokio::sync::oneshot::Sender<AckDecision>,
    ) -> Self {
        Self {
            message,
            decision: Some(decision),
        }
    }

    /// Create a delivery whose acknowledgement goes nowhere (for tests).
    #[must_use]
    pub const fn detached(message: BusMessage) -> Self {
        Self {
            message,
            decision: None,
        }
    }

    /// Commit the message's position.
    pub fn ack(mut self) {
        self.send(AckDecision::Commit);
    }

    /// Request redelivery of the message.
    pub fn redeliver(mut self) {
        self.send(AckDecision::Redeliver);
    }

    fn send(&mut self, decision: AckDecision) {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(decision);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.send(AckDecision::Commit);
    }
}

/// Stream of deliveries from a subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Publish/subscribe transport with at-least-once delivery.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns enable `Arc<dyn EventBus>` usage
/// across the readers, the publisher and the simulator.
pub trait EventBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        message: &BusMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, BusError>> + Send + '_>>;
}

/// Stateless emitter of outbound action facts.
///
/// Safe for concurrent use without additional locking. A publish failure is
/// transient from the caller's point of view, but the aggregator never
/// retries a publish whose guard has already been persisted — that is the
/// reconciliation-gap trade-off, handled at the call site.
pub trait ActionPublisher: Send + Sync {
    /// Publish one outbound action fact.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] on transient transport failure.
    fn publish(
        &self,
        action: &ActionFact,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>>;
}

/// [`ActionPublisher`] that serializes actions as JSON onto one bus topic,
/// keyed by order id.
pub struct TopicActionPublisher {
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl TopicActionPublisher {
    /// Create a publisher emitting onto `topic`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// The topic this publisher emits onto.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl ActionPublisher for TopicActionPublisher {
    fn publish(
        &self,
        action: &ActionFact,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + '_>> {
        let action = action.clone();
        Box::pin(async move {
            let payload =
                serde_json::to_vec(&action).map_err(|e| BusError::PublishFailed {
                    topic: self.topic.clone(),
                    reason: format!("Failed to serialize action: {e}"),
                })?;

            let message = BusMessage::new(Some(action.order_id().to_string()), payload);
            self.bus.publish(&self.topic, &message).await?;

            tracing::debug!(
                topic = %self.topic,
                event_type = action.event_type(),
                order_id = action.order_id(),
                "Action published"
            );
            Ok(())
        })
    }
}
