//! # Fulfillment Testing
//!
//! Testing utilities and in-memory doubles for the fulfillment aggregator.
//!
//! This crate provides:
//! - [`InMemoryAggregateStore`]: HashMap-backed store with real CAS semantics
//!   and injectable outages
//! - [`InMemoryEventBus`]: log-backed bus where subscribers replay every
//!   topic from the beginning
//! - [`RecordingPublisher`]: action publisher that records fired actions and
//!   can fail on demand
//! - [`FixedClock`] / [`test_clock`]: deterministic time

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod mocks;

pub use mocks::{
    FixedClock, InMemoryAggregateStore, InMemoryEventBus, RecordingPublisher, test_clock,
};
