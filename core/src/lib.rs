//! # Fulfillment Core
//!
//! Core domain model and trait seams for the order-fulfillment aggregator.
//!
//! Independent services emit facts about an order's lifecycle (order placed,
//! kitchen ready) onto a message bus. This crate defines the vocabulary those
//! facts are folded into, and the trait boundaries the runtime engine works
//! against:
//!
//! - [`fact`]: closed tagged unions for inbound and outbound events
//! - [`key`]: `OrderKey` and `Version` newtypes
//! - [`aggregate`]: the per-order folded state and its status decision table
//! - [`store`]: the [`AggregateStore`](store::AggregateStore) CAS contract
//! - [`bus`]: the [`EventBus`](bus::EventBus) and
//!   [`ActionPublisher`](bus::ActionPublisher) seams
//! - [`error`]: the `apply_fact` error taxonomy
//!
//! # Design
//!
//! The aggregate is the only shared mutable state in the system, and it is
//! accessed exclusively through a read-then-compare-and-swap discipline. All
//! fact folds are idempotent: received flags are monotone, and each downstream
//! action carries its own fired-once guard.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod bus;
pub mod error;
pub mod fact;
pub mod key;
pub mod store;

use chrono::{DateTime, Utc};

/// Environment abstractions shared across the workspace.
pub mod environment {
    use super::{DateTime, Utc};

    /// Source of the current time.
    ///
    /// Aggregates carry `created_at`/`updated_at` timestamps and outbound
    /// facts are stamped at publish time. Production code uses
    /// [`SystemClock`]; tests use a fixed clock so folds are reproducible.
    pub trait Clock: Send + Sync {
        /// Returns the current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use environment::{Clock, SystemClock};
