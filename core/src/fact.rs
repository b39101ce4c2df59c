//! Inbound and outbound fact types and their JSON wire codecs.
//!
//! # Overview
//!
//! Facts are immutable, idempotently-applicable input events describing one
//! attribute of an order's lifecycle. Two logical topics feed the aggregator:
//!
//! - `order-events`: the checkout fact ([`OrderPlacedFact`]), no discriminant
//!   field, one schema per topic
//! - `kitchen-events`: a shared topic carrying several `event_type`-tagged
//!   schemas, of which only kitchen status changes with `status == "ready"`
//!   are meaningful here
//!
//! Decoding is a closed-set affair: every message either maps onto a known
//! variant, is recognized and deliberately ignored (other kitchen statuses,
//! notification events, our own outbound facts echoed on a shared topic), or
//! fails permanently with [`FactDecodeError`]. There is no speculative
//! try-one-schema-then-another parsing.
//!
//! Outbound facts ([`ActionFact`]) carry an explicit `event_type` tag so that
//! downstream consumers can do the same schema-tag filtering.

use crate::key::OrderKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from decoding a raw bus message into a fact.
///
/// These are permanent: a message that fails to decode will fail identically
/// on every redelivery, so the reader must log it and advance past it rather
/// than retry.
#[derive(Error, Debug)]
pub enum FactDecodeError {
    /// The payload was not valid JSON or did not match the expected schema.
    #[error("Malformed fact payload: {0}")]
    Malformed(String),

    /// The message carried a discriminant outside the closed set of known
    /// event types.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The decoded fact carried an empty order key.
    #[error("Fact has an empty order key")]
    EmptyOrderKey,
}

/// Fulfillment mode of an order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    /// A driver delivers the order to the customer's address.
    Delivery,
    /// The customer collects the order themselves.
    Pickup,
}

/// Structured delivery address and contact details, supplied by the checkout
/// fact for delivery orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Customer's display name.
    pub customer_name: String,
    /// Customer's phone number.
    pub customer_phone: String,
    /// Street name.
    pub street: String,
    /// House number.
    pub house_number: String,
    /// Postal code.
    pub postal_code: String,
    /// City.
    pub city: String,
    /// Floor, if the customer supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    /// Free-text delivery instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// One line item of an order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product identifier.
    pub product_id: String,
    /// Product display name.
    pub product_name: String,
    /// Quantity ordered.
    pub quantity: u32,
    /// Unit price.
    pub price: f64,
    /// Preparation time estimate in minutes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep_time: Option<u32>,
}

/// Wire shape of the checkout fact on the `order-events` topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderPlacedFact {
    /// The order key.
    pub order_id: String,
    /// The user who placed the order.
    pub user_id: String,
    /// Order total.
    pub total_amount: f64,
    /// ISO currency code.
    pub currency: String,
    /// Fulfillment mode.
    pub order_type: String,
    /// Address and contact details; present only for delivery orders, and not
    /// guaranteed even then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_info: Option<DeliveryInfo>,
    /// Ordered items.
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// When the order was placed.
    pub created_at: DateTime<Utc>,
}

impl OrderPlacedFact {
    /// The fulfillment mode, if it is one of the modes this aggregator
    /// handles.
    #[must_use]
    pub fn mode(&self) -> Option<OrderMode> {
        match self.order_type.as_str() {
            "delivery" => Some(OrderMode::Delivery),
            "pickup" => Some(OrderMode::Pickup),
            _ => None,
        }
    }
}

/// Kitchen order status values carried by status-change events.
///
/// Only [`KitchenOrderStatus::Ready`] is meaningful to the aggregator; the
/// rest belong to the kitchen's internal preparation workflow and are
/// recognized and ignored.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitchenOrderStatus {
    /// Order received by the kitchen.
    Received,
    /// Preparation in progress.
    Preparing,
    /// Preparation finished; the order can leave the kitchen.
    Ready,
    /// A driver collected the order.
    PickedUp,
    /// The kitchen cancelled the order.
    Cancelled,
    /// A status value this aggregator does not know about.
    #[serde(other)]
    Other,
}

/// Wire shape of a kitchen status-change event on the `kitchen-events` topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KitchenStatusFact {
    /// Discriminant tag.
    pub event_type: String,
    /// The order key.
    pub order_id: String,
    /// The kitchen's new status for this order.
    pub status: KitchenOrderStatus,
    /// Estimated remaining time in minutes, if the kitchen supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<u32>,
    /// When the status changed.
    pub timestamp: DateTime<Utc>,
}

/// A typed fact ready to be folded into an aggregate.
///
/// This is the closed set of inputs the aggregator's `apply_fact` accepts.
/// Both variants are idempotent: folding the same fact twice leaves the
/// received flags and action guards unchanged and only refreshes the
/// denormalized payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Fact {
    /// The checkout service recorded the order.
    OrderPlaced(OrderPlacedFact),
    /// The kitchen finished preparing the order.
    KitchenReady {
        /// When the kitchen reported readiness.
        timestamp: DateTime<Utc>,
    },
}

impl Fact {
    /// Short label for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::OrderPlaced(_) => "order_placed",
            Self::KitchenReady { .. } => "kitchen_ready",
        }
    }
}

/// Outcome of decoding one raw bus message.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// A fact the aggregator must fold, with its order key.
    Fact {
        /// The order key the fact belongs to.
        key: OrderKey,
        /// The decoded fact.
        fact: Fact,
    },
    /// A message this aggregator recognizes but deliberately does not fold
    /// (other kitchen statuses, notification chatter, echoed outbound facts).
    Ignored {
        /// Why the message was ignored, for trace logging.
        reason: &'static str,
    },
}

/// Event-type tags this aggregator emits; seen inbound on a shared topic they
/// are our own echoes and must be ignored to avoid feedback loops.
const OWN_EVENT_TYPES: &[&str] = &["delivery_assigned", "pickup_ready", "delivery_status_update"];

/// Kitchen-side tags that are recognized but carry nothing for us.
const KITCHEN_CHATTER: &[&str] = &["kitchen_notification", "order_confirmed"];

/// Kitchen-side tags that carry an order status change.
const KITCHEN_STATUS_TYPES: &[&str] = &[
    "order_received_in_kitchen",
    "order_preparation_started",
    "order_ready",
    "order_picked_up_by_driver",
    "order_cancelled_in_kitchen",
];

/// Decode a raw message from the `order-events` topic.
///
/// Orders with a fulfillment mode outside {delivery, pickup} are recognized
/// and ignored; they belong to workflows this aggregator does not drive.
///
/// # Errors
///
/// Returns [`FactDecodeError`] if the payload is not a valid checkout fact.
pub fn decode_order_fact(payload: &[u8]) -> Result<Decoded, FactDecodeError> {
    let fact: OrderPlacedFact =
        serde_json::from_slice(payload).map_err(|e| FactDecodeError::Malformed(e.to_string()))?;

    let key: OrderKey = fact
        .order_id
        .parse()
        .map_err(|_| FactDecodeError::EmptyOrderKey)?;

    if fact.mode().is_none() {
        return Ok(Decoded::Ignored {
            reason: "unhandled order type",
        });
    }

    Ok(Decoded::Fact {
        key,
        fact: Fact::OrderPlaced(fact),
    })
}

/// Decode a raw message from the `kitchen-events` topic.
///
/// The kitchen topic is shared: it carries the kitchen's own status-change
/// events, notification chatter, and potentially this aggregator's outbound
/// facts. Filtering is by the explicit `event_type` tag; only a status change
/// with `status == "ready"` yields a fact.
///
/// # Errors
///
/// Returns [`FactDecodeError::Malformed`] if the payload is not JSON or a
/// known tag's schema does not parse, and
/// [`FactDecodeError::UnknownEventType`] for tags outside the closed set.
pub fn decode_kitchen_fact(payload: &[u8]) -> Result<Decoded, FactDecodeError> {
    #[derive(Deserialize)]
    struct Tagged {
        event_type: String,
    }

    let tag: Tagged =
        serde_json::from_slice(payload).map_err(|e| FactDecodeError::Malformed(e.to_string()))?;

    if OWN_EVENT_TYPES.contains(&tag.event_type.as_str()) {
        return Ok(Decoded::Ignored {
            reason: "own outbound event",
        });
    }
    if KITCHEN_CHATTER.contains(&tag.event_type.as_str()) {
        return Ok(Decoded::Ignored {
            reason: "kitchen chatter",
        });
    }
    if !KITCHEN_STATUS_TYPES.contains(&tag.event_type.as_str()) {
        return Err(FactDecodeError::UnknownEventType(tag.event_type));
    }

    let fact: KitchenStatusFact =
        serde_json::from_slice(payload).map_err(|e| FactDecodeError::Malformed(e.to_string()))?;

    if fact.status != KitchenOrderStatus::Ready {
        return Ok(Decoded::Ignored {
            reason: "non-ready kitchen status",
        });
    }

    let key: OrderKey = fact
        .order_id
        .parse()
        .map_err(|_| FactDecodeError::EmptyOrderKey)?;

    Ok(Decoded::Fact {
        key,
        fact: Fact::KitchenReady {
            timestamp: fact.timestamp,
        },
    })
}

//
// ===== Outbound facts =====
//

/// Delivery address as published to downstream services.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAddress {
    /// Street name.
    pub street: String,
    /// House number.
    pub house_number: String,
    /// Postal code.
    pub postal_code: String,
    /// City.
    pub city: String,
    /// Floor, if supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
}

/// Customer contact block attached to a delivery assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    /// Customer's display name.
    pub name: String,
    /// Customer's phone number.
    pub phone: String,
    /// Delivery address.
    pub address: DeliveryAddress,
    /// Free-text delivery instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl CustomerInfo {
    /// Build the customer block from the denormalized delivery info.
    #[must_use]
    pub fn from_delivery_info(info: &DeliveryInfo) -> Self {
        Self {
            name: info.customer_name.clone(),
            phone: info.customer_phone.clone(),
            address: DeliveryAddress {
                street: info.street.clone(),
                house_number: info.house_number.clone(),
                postal_code: info.postal_code.clone(),
                city: info.city.clone(),
                floor: info.floor.clone(),
            },
            instructions: info.instructions.clone(),
        }
    }
}

/// Progress states of an assigned delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// A driver was assigned.
    Assigned,
    /// The driver collected the order from the kitchen.
    PickedUp,
    /// The driver is en route to the customer.
    InTransit,
    /// The order was handed to the customer.
    Delivered,
    /// The delivery was cancelled.
    Cancelled,
}

/// GPS position attached to status updates, when available.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// Outbound facts published to the delivery topic.
///
/// The `event_type` tag is part of the wire format so downstream consumers
/// can filter by discriminant the same way this aggregator does inbound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ActionFact {
    /// A driver was assigned to a delivery order.
    DeliveryAssigned {
        /// The order key.
        order_id: String,
        /// The assigned driver.
        driver_id: String,
        /// Customer contact and address, built strictly from the aggregate's
        /// denormalized payload.
        customer_info: CustomerInfo,
        /// When the assignment was made.
        timestamp: DateTime<Utc>,
    },
    /// A pickup order is ready for collection.
    PickupReady {
        /// The order key.
        order_id: String,
        /// When readiness was established.
        timestamp: DateTime<Utc>,
    },
    /// Progress update on an assigned delivery (emitted by the driver
    /// simulator, not the aggregation core).
    DeliveryStatusUpdate {
        /// The order key.
        order_id: String,
        /// New delivery status.
        status: DeliveryStatus,
        /// Human-readable message.
        message: String,
        /// Driver position, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<GpsLocation>,
        /// When the update happened.
        timestamp: DateTime<Utc>,
    },
}

impl ActionFact {
    /// The order key this fact belongs to, used as the bus partition key.
    #[must_use]
    pub fn order_id(&self) -> &str {
        match self {
            Self::DeliveryAssigned { order_id, .. }
            | Self::PickupReady { order_id, .. }
            | Self::DeliveryStatusUpdate { order_id, .. } => order_id,
        }
    }

    /// The wire discriminant, matching the serialized `event_type` tag.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::DeliveryAssigned { .. } => "delivery_assigned",
            Self::PickupReady { .. } => "pickup_ready",
            Self::DeliveryStatusUpdate { .. } => "delivery_status_update",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)] // Test assertions

    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().unwrap()
    }

    fn order_json(order_type: &str, with_address: bool) -> String {
        let delivery_info = if with_address {
            r#","delivery_info":{"customer_name":"Ada","customer_phone":"+4912345",
               "street":"Hauptstr.","house_number":"7","postal_code":"10115","city":"Berlin"}"#
        } else {
            ""
        };
        format!(
            r#"{{"order_id":"o1","user_id":"u1","total_amount":10.5,"currency":"EUR",
                "order_type":"{order_type}"{delivery_info},
                "items":[{{"product_id":"p1","product_name":"Pizza","quantity":1,"price":10.5}}],
                "created_at":"2025-01-01T12:00:00Z"}}"#
        )
    }

    mod order_decoding {
        use super::*;

        #[test]
        fn decodes_delivery_order() {
            let decoded = decode_order_fact(order_json("delivery", true).as_bytes()).unwrap();
            match decoded {
                Decoded::Fact { key, fact } => {
                    assert_eq!(key.as_str(), "o1");
                    match fact {
                        Fact::OrderPlaced(placed) => {
                            assert_eq!(placed.mode(), Some(OrderMode::Delivery));
                            assert!(placed.delivery_info.is_some());
                            assert_eq!(placed.items.len(), 1);
                        }
                        Fact::KitchenReady { .. } => panic!("wrong fact variant"),
                    }
                }
                Decoded::Ignored { .. } => panic!("should not be ignored"),
            }
        }

        #[test]
        fn ignores_unhandled_order_type() {
            let decoded = decode_order_fact(order_json("dine_in", false).as_bytes()).unwrap();
            assert!(matches!(decoded, Decoded::Ignored { .. }));
        }

        #[test]
        fn malformed_payload_is_permanent_error() {
            let err = decode_order_fact(b"not json").unwrap_err();
            assert!(matches!(err, FactDecodeError::Malformed(_)));
        }

        #[test]
        fn empty_order_key_is_rejected() {
            let json = order_json("pickup", false).replace("\"o1\"", "\"\"");
            let err = decode_order_fact(json.as_bytes()).unwrap_err();
            assert!(matches!(err, FactDecodeError::EmptyOrderKey));
        }
    }

    mod kitchen_decoding {
        use super::*;

        fn kitchen_json(event_type: &str, status: &str) -> String {
            format!(
                r#"{{"event_type":"{event_type}","order_id":"o1","status":"{status}",
                    "timestamp":"2025-01-01T12:00:00Z"}}"#
            )
        }

        #[test]
        fn ready_status_yields_fact() {
            let decoded =
                decode_kitchen_fact(kitchen_json("order_ready", "ready").as_bytes()).unwrap();
            match decoded {
                Decoded::Fact { key, fact } => {
                    assert_eq!(key.as_str(), "o1");
                    assert_eq!(
                        fact,
                        Fact::KitchenReady {
                            timestamp: sample_time()
                        }
                    );
                }
                Decoded::Ignored { .. } => panic!("should not be ignored"),
            }
        }

        #[test]
        fn non_ready_status_is_ignored() {
            let decoded =
                decode_kitchen_fact(kitchen_json("order_preparation_started", "preparing").as_bytes())
                    .unwrap();
            assert!(matches!(decoded, Decoded::Ignored { .. }));
        }

        #[test]
        fn own_outbound_events_are_ignored() {
            let json = r#"{"event_type":"pickup_ready","order_id":"o1",
                           "timestamp":"2025-01-01T12:00:00Z"}"#;
            let decoded = decode_kitchen_fact(json.as_bytes()).unwrap();
            assert!(matches!(
                decoded,
                Decoded::Ignored {
                    reason: "own outbound event"
                }
            ));
        }

        #[test]
        fn unknown_tag_is_invalid() {
            let err =
                decode_kitchen_fact(kitchen_json("mystery_event", "ready").as_bytes()).unwrap_err();
            assert!(matches!(err, FactDecodeError::UnknownEventType(_)));
        }

        #[test]
        fn unknown_status_value_still_parses_and_is_ignored() {
            let decoded =
                decode_kitchen_fact(kitchen_json("order_ready", "garnishing").as_bytes()).unwrap();
            assert!(matches!(decoded, Decoded::Ignored { .. }));
        }
    }

    mod outbound {
        use super::*;

        #[test]
        fn action_fact_carries_event_type_tag() {
            let fact = ActionFact::PickupReady {
                order_id: "o1".to_string(),
                timestamp: sample_time(),
            };

            let json = serde_json::to_value(&fact).unwrap();
            assert_eq!(json["event_type"], "pickup_ready");
            assert_eq!(json["order_id"], "o1");
            assert_eq!(fact.event_type(), "pickup_ready");
        }

        #[test]
        fn delivery_status_serializes_snake_case() {
            let fact = ActionFact::DeliveryStatusUpdate {
                order_id: "o2".to_string(),
                status: DeliveryStatus::InTransit,
                message: "Driver is on the way".to_string(),
                location: None,
                timestamp: sample_time(),
            };

            let json = serde_json::to_value(&fact).unwrap();
            assert_eq!(json["status"], "in_transit");
            assert_eq!(json["event_type"], "delivery_status_update");
            assert!(json.get("location").is_none());
        }
    }
}
