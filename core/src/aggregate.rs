//! The per-order aggregate record and its fold/status logic.
//!
//! # Overview
//!
//! One [`OrderAggregate`] exists per order key. Facts from independent,
//! unordered streams are folded into it; after every fold the derived status
//! is recomputed from scratch and pending one-time actions are evaluated.
//!
//! # Invariants
//!
//! - Received flags are monotone: once true, never reset. Re-applying a fact
//!   only refreshes the denormalized payload.
//! - Each action guard (`delivery_started`, `pickup_notified`) transitions
//!   false -> true at most once; the transition is persisted in the same
//!   write that decides to fire.
//! - `status` is a projection: always equal to [`OrderAggregate::derived_status`]
//!   applied to the other fields. It is persisted for observability only.
//! - The aggregate may be created by either stream; a kitchen fact arriving
//!   before the order fact synthesizes a record that waits for the order.

use crate::fact::{DeliveryInfo, Fact, OrderMode};
use crate::key::OrderKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived status of an order aggregate.
///
/// Recomputed deterministically after every fold; see
/// [`OrderAggregate::derived_status`] for the decision table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Kitchen fact seen (or nothing yet), order fact still missing.
    WaitingForOrder,
    /// Order fact seen, kitchen fact still missing.
    WaitingForKitchen,
    /// Delivery order with both facts; driver assignment not yet fired.
    ReadyToDeliver,
    /// Driver assignment fired.
    Delivering,
    /// Pickup order with both facts.
    PickupReady,
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::WaitingForOrder => "waiting_for_order",
            Self::WaitingForKitchen => "waiting_for_kitchen",
            Self::ReadyToDeliver => "ready_to_deliver",
            Self::Delivering => "delivering",
            Self::PickupReady => "pickup_ready",
        };
        write!(f, "{label}")
    }
}

/// The distinct one-time downstream actions an aggregate can fire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Assign a driver and publish `delivery_assigned`.
    DeliveryStart,
    /// Publish `pickup_ready`.
    PickupReady,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeliveryStart => write!(f, "delivery-start"),
            Self::PickupReady => write!(f, "pickup-ready"),
        }
    }
}

/// The folded per-order state derived from all facts seen so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAggregate {
    /// Partition/merge key for all facts of this order.
    pub order_key: OrderKey,

    // Received flags, one per expected fact type. Monotone.
    /// The checkout fact arrived.
    pub order_received: bool,
    /// The kitchen-ready fact arrived.
    pub kitchen_ready: bool,

    // Action guards. Each transitions false -> true at most once.
    /// `delivery-start` already fired.
    pub delivery_started: bool,
    /// `pickup-ready` already fired.
    pub pickup_notified: bool,

    // Denormalized payload. Each field is owned by exactly one fact type.
    /// User who placed the order (from the order fact).
    pub user_id: Option<String>,
    /// Fulfillment mode (from the order fact).
    pub mode: Option<OrderMode>,
    /// Order total (from the order fact).
    pub total_amount: Option<f64>,
    /// ISO currency code (from the order fact).
    pub currency: Option<String>,
    /// Address and contact details (from the order fact, delivery only).
    pub delivery_info: Option<DeliveryInfo>,

    /// Driver assigned when `delivery-start` fired.
    pub driver_id: Option<String>,

    /// Projection of the fields above; see [`Self::derived_status`].
    pub status: AggregateStatus,

    /// When the first fact for this key arrived.
    pub created_at: DateTime<Utc>,
    /// When the last fact was folded.
    pub updated_at: DateTime<Utc>,
}

impl OrderAggregate {
    /// Synthesize a fresh aggregate for a key no fact has been seen for.
    #[must_use]
    pub fn new(order_key: OrderKey, now: DateTime<Utc>) -> Self {
        Self {
            order_key,
            order_received: false,
            kitchen_ready: false,
            delivery_started: false,
            pickup_notified: false,
            user_id: None,
            mode: None,
            total_amount: None,
            currency: None,
            delivery_info: None,
            driver_id: None,
            status: AggregateStatus::WaitingForOrder,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold one fact into the aggregate.
    ///
    /// Sets the fact's received flag, copies its payload fields, bumps
    /// `updated_at` and recomputes the status projection. Idempotent: a
    /// duplicate fact only refreshes payload and timestamp.
    pub fn apply(&mut self, fact: &Fact, now: DateTime<Utc>) {
        match fact {
            Fact::OrderPlaced(placed) => {
                self.order_received = true;
                self.user_id = Some(placed.user_id.clone());
                self.mode = placed.mode();
                self.total_amount = Some(placed.total_amount);
                self.currency = Some(placed.currency.clone());
                self.delivery_info = placed.delivery_info.clone();
            }
            Fact::KitchenReady { .. } => {
                self.kitchen_ready = true;
            }
        }
        self.updated_at = now;
        self.status = self.derived_status();
    }

    /// Recompute the status projection from the flag and guard state.
    ///
    /// Decision table, first match wins:
    ///
    /// | Condition | Status |
    /// |---|---|
    /// | pickup, both facts | `pickup_ready` |
    /// | delivery, both facts, delivery-start not fired | `ready_to_deliver` |
    /// | delivery-start fired | `delivering` |
    /// | order fact only | `waiting_for_kitchen` |
    /// | kitchen fact only | `waiting_for_order` |
    /// | otherwise | `waiting_for_order` |
    #[must_use]
    pub fn derived_status(&self) -> AggregateStatus {
        if self.is_pickup_ready() {
            AggregateStatus::PickupReady
        } else if self.can_start_delivery() {
            AggregateStatus::ReadyToDeliver
        } else if self.delivery_started {
            AggregateStatus::Delivering
        } else if self.order_received && !self.kitchen_ready {
            AggregateStatus::WaitingForKitchen
        } else {
            AggregateStatus::WaitingForOrder
        }
    }

    /// True iff the `delivery-start` trigger condition holds right now.
    #[must_use]
    pub fn can_start_delivery(&self) -> bool {
        self.order_received
            && self.kitchen_ready
            && !self.delivery_started
            && self.mode == Some(OrderMode::Delivery)
    }

    /// True iff this is a pickup order with both facts received.
    #[must_use]
    pub fn is_pickup_ready(&self) -> bool {
        self.order_received && self.kitchen_ready && self.mode == Some(OrderMode::Pickup)
    }

    /// Actions whose trigger condition is satisfied and whose guard has not
    /// fired yet, evaluated independently.
    #[must_use]
    pub fn pending_actions(&self) -> Vec<ActionKind> {
        let mut pending = Vec::new();
        if self.can_start_delivery() {
            pending.push(ActionKind::DeliveryStart);
        }
        if self.is_pickup_ready() && !self.pickup_notified {
            pending.push(ActionKind::PickupReady);
        }
        pending
    }

    /// Check whether the guard for `kind` has already fired.
    #[must_use]
    pub const fn action_fired(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::DeliveryStart => self.delivery_started,
            ActionKind::PickupReady => self.pickup_notified,
        }
    }

    /// Flip the guard for `kind` and refresh the status projection.
    ///
    /// Must be persisted in the same write that carries the firing decision.
    pub fn mark_action_fired(&mut self, kind: ActionKind, now: DateTime<Utc>) {
        match kind {
            ActionKind::DeliveryStart => self.delivery_started = true,
            ActionKind::PickupReady => self.pickup_notified = true,
        }
        self.updated_at = now;
        self.status = self.derived_status();
    }

    /// Record the driver assigned when `delivery-start` fires.
    pub fn assign_driver(&mut self, driver_id: impl Into<String>) {
        self.driver_id = Some(driver_id.into());
    }
}
