//! Per-topic stream readers feeding the aggregator.
//!
//! One reader per inbound topic, each with its own consumer position.
//! Messages within a topic are processed one at a time, in delivery order;
//! concurrency across orders comes from the two topics running in parallel,
//! and correctness under interleaving comes from the aggregator's
//! compare-and-swap loop, not from the readers.
//!
//! # Acknowledgement Policy
//!
//! - fold succeeded: ack
//! - recognized but irrelevant message: ack
//! - undecodable message or permanent fold failure: log, count, ack — the
//!   offset advances so one poison message cannot block the partition
//! - store unavailable after local retries: request redelivery

use crate::aggregator::Aggregator;
use crate::metrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use fulfillment_core::bus::{BusError, Delivery, EventBus};
use fulfillment_core::error::ApplyError;
use fulfillment_core::fact::{Decoded, FactDecodeError, decode_kitchen_fact, decode_order_fact};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;

/// Which wire schema a reader's topic carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TopicKind {
    /// Checkout facts (`order-events`).
    Orders,
    /// Kitchen status facts (`kitchen-events`).
    Kitchen,
}

impl TopicKind {
    fn decode(self, payload: &[u8]) -> Result<Decoded, FactDecodeError> {
        match self {
            Self::Orders => decode_order_fact(payload),
            Self::Kitchen => decode_kitchen_fact(payload),
        }
    }
}

/// Pulls one topic and drives every decoded fact through the aggregator.
pub struct StreamReader {
    bus: Arc<dyn EventBus>,
    aggregator: Arc<Aggregator>,
    topic: String,
    kind: TopicKind,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl StreamReader {
    /// Create a reader for `topic`.
    ///
    /// The shutdown receiver is shared with the other readers and the
    /// simulator so one signal stops the whole engine.
    #[must_use]
    pub fn new(
        bus: Arc<dyn EventBus>,
        aggregator: Arc<Aggregator>,
        topic: impl Into<String>,
        kind: TopicKind,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            aggregator,
            topic: topic.into(),
            kind,
            retry: RetryPolicy::default(),
            shutdown,
        }
    }

    /// Override the local retry policy for transient store failures.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Subscribe and process messages until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the initial subscription
    /// cannot be established. Receive errors after that are logged and the
    /// loop continues; the transport handles reconnection.
    pub async fn run(&self) -> Result<(), BusError> {
        tracing::info!(topic = %self.topic, kind = ?self.kind, "Starting stream reader");

        let mut stream = self.bus.subscribe(&[self.topic.as_str()]).await?;
        let mut shutdown = self.shutdown.clone();

        while !*shutdown.borrow() {
            tokio::select! {
                Some(result) = stream.next() => {
                    match result {
                        Ok(delivery) => self.process(delivery).await,
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

        tracing::info!(topic = %self.topic, "Stream reader stopped");
        Ok(())
    }

    /// Decode and fold one message, then render the ack verdict.
    async fn process(&self, delivery: Delivery) {
        let decoded = match self.kind.decode(&delivery.message.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                let err = ApplyError::from(err);
                metrics::counter!(metrics::FACTS_REJECTED).increment(1);
                tracing::error!(
                    topic = %self.topic,
                    error = %err,
                    "Undecodable message skipped"
                );
                delivery.ack();
                return;
            }
        };

        let (key, fact) = match decoded {
            Decoded::Ignored { reason } => {
                tracing::trace!(topic = %self.topic, reason, "Message ignored");
                delivery.ack();
                return;
            }
            Decoded::Fact { key, fact } => (key, fact),
        };

        let result = retry_with_predicate(
            self.retry.clone(),
            || self.aggregator.apply_fact(&key, &fact),
            ApplyError::is_retryable,
        )
        .await;

        match result {
            Ok(_) => delivery.ack(),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    topic = %self.topic,
                    order_key = %key,
                    error = %err,
                    "Store unavailable, leaving message for redelivery"
                );
                delivery.redeliver();
            }
            Err(err) => {
                // Permanent failure; details were logged at the fold site.
                tracing::warn!(
                    topic = %self.topic,
                    order_key = %key,
                    error = %err,
                    "Permanent failure, advancing past message"
                );
                delivery.ack();
            }
        }
    }
}
