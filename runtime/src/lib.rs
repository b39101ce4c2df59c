//! Aggregation engine for the order-fulfillment service.
//!
//! Wires the domain model from `fulfillment-core` into a running system:
//!
//! - [`aggregator`]: the read-fold-compare-and-swap loop with one-time
//!   action firing
//! - [`reader`]: per-topic stream readers with the acknowledgement policy
//! - [`retention`]: periodic purge of expired aggregates
//! - [`retry`]: jittered exponential backoff shared by the engine
//! - [`simulator`]: scripted driver-progress updates for assigned deliveries
//! - [`metrics`]: Prometheus counters and the scrape endpoint

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod metrics;
pub mod reader;
pub mod retention;
pub mod retry;
pub mod simulator;

pub use aggregator::{Aggregator, ApplyOutcome, DriverRoster};
pub use reader::{StreamReader, TopicKind};
pub use retention::RetentionSweeper;
pub use retry::RetryPolicy;
pub use simulator::DriverSimulator;
