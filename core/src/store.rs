//! Aggregate store abstraction: durable per-key persistence with CAS.
//!
//! # Overview
//!
//! The store holds exactly one [`OrderAggregate`] record per order key,
//! together with an opaque [`Version`] token bumped on every successful
//! write. The aggregator always reads-then-compare-and-swaps, never
//! blind-writes, so concurrent folds for the same key (the two stream readers
//! racing on one order) are serialized by version conflicts rather than
//! locks. Folds for distinct keys never contend.
//!
//! # Retention
//!
//! Entries expire after a fixed retention window from `created_at`,
//! independent of terminal status. This bounds storage growth and is
//! best-effort cleanup, not a correctness mechanism.
//!
//! # Implementations
//!
//! - `PostgresAggregateStore` (in `fulfillment-postgres`): production
//! - `InMemoryAggregateStore` (in `fulfillment-testing`): fast, deterministic
//!   tests
//!
//! # Dyn Compatibility
//!
//! This trait uses explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` to enable trait object usage (`Arc<dyn AggregateStore>`) in the
//! aggregator and readers.

use crate::aggregate::OrderAggregate;
use crate::key::{OrderKey, Version};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during aggregate store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the record's version moved between
    /// the read and the compare-and-swap. Expected by design under racing
    /// folds; the caller re-reads and recomputes.
    #[error("Version conflict for '{key}': expected version {expected}")]
    VersionConflict {
        /// The key where the conflict occurred.
        key: OrderKey,
        /// The version the writer expected the record to be at.
        expected: Version,
    },

    /// The backing store could not be reached or the operation failed
    /// transiently. Retryable by the caller.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Failed to encode or decode a persisted aggregate record.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error is an expected concurrency conflict rather than a
    /// real failure.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Predicate over aggregates for convenience scans.
pub type ScanPredicate = Box<dyn Fn(&OrderAggregate) -> bool + Send + Sync>;

/// Durable key-value persistence for order aggregates with conditional
/// overwrite and expiry.
///
/// # Contract
///
/// - [`get`](Self::get) returns the record and its current version, or `None`
///   for a key that has never been written (or has expired).
/// - [`compare_and_swap`](Self::compare_and_swap) persists a new value only
///   if the record is still at `expected_version`; passing
///   [`Version::INITIAL`] asserts the record does not exist yet. On success
///   the returned version is the one subsequent CAS calls must present.
/// - [`scan_matching`](Self::scan_matching) walks all live records; it is a
///   convenience/recovery operation, not the hot path.
/// - [`purge_expired`](Self::purge_expired) deletes records whose
///   `created_at` is before the cutoff.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the store is the sole
/// synchronization point between the stream readers.
pub trait AggregateStore: Send + Sync {
    /// Load the aggregate for `key` together with its version token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on transient backend failure and
    /// [`StoreError::Serialization`] if the persisted record is unreadable.
    fn get(
        &self,
        key: &OrderKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(OrderAggregate, Version)>, StoreError>> + Send + '_>>;

    /// Conditionally overwrite the aggregate for `key`.
    ///
    /// The write succeeds only if the record is still at `expected_version`
    /// ([`Version::INITIAL`] for a record that must not exist yet). Returns
    /// the new version on success.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionConflict`]: a concurrent writer won the race;
    ///   the caller must re-read and recompute, not blindly re-submit.
    /// - [`StoreError::Unavailable`]: transient backend failure.
    /// - [`StoreError::Serialization`]: the record could not be encoded.
    fn compare_and_swap(
        &self,
        key: &OrderKey,
        expected_version: Version,
        aggregate: OrderAggregate,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + '_>>;

    /// Collect all live aggregates matching `predicate`.
    ///
    /// Used for recovery sweeps and convenience queries ("list orders ready
    /// to deliver"), never on the fold hot path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on transient backend failure.
    fn scan_matching(
        &self,
        predicate: ScanPredicate,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OrderAggregate>, StoreError>> + Send + '_>>;

    /// Delete records created before `cutoff`. Returns the number removed.
    ///
    /// Best-effort retention cleanup; losing a record early is tolerated,
    /// firing twice because of it is not (guards live in the record itself,
    /// so an expired-and-recreated aggregate may re-fire — the retention
    /// window must therefore exceed any realistic fact redelivery horizon).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] on transient backend failure.
    fn purge_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_recognizable() {
        let err = StoreError::VersionConflict {
            key: OrderKey::new("o1"),
            expected: Version::new(3),
        };
        assert!(err.is_conflict());
        assert!(!StoreError::Unavailable("down".to_string()).is_conflict());
    }

    #[test]
    fn error_display_names_key_and_version() {
        let err = StoreError::VersionConflict {
            key: OrderKey::new("o1"),
            expected: Version::new(3),
        };
        let msg = format!("{err}");
        assert!(msg.contains("o1"));
        assert!(msg.contains('3'));
    }
}
