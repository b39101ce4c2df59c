//! Order key and aggregate version types.
//!
//! This module defines strong types for the per-order partition key
//! (`OrderKey`) and the optimistic-concurrency token (`Version`) carried by
//! every aggregate record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `OrderKey` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid order key: {0}")]
pub struct ParseOrderKeyError(String);

/// Stable external identifier for an order.
///
/// The order key is the partition and merge key for all facts: every inbound
/// fact carries one, and the aggregate store holds exactly one record per key.
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for application-controlled data)
///
/// Use `FromStr` when parsing external input such as decoded bus messages.
///
/// # Examples
///
/// ```
/// use fulfillment_core::key::OrderKey;
///
/// let key = OrderKey::new("order-12345");
/// assert_eq!(key.as_str(), "order-12345");
///
/// let parsed: OrderKey = "order-abc".parse().unwrap();
/// assert_eq!(parsed, OrderKey::new("order-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey(String);

impl OrderKey {
    /// Create a new `OrderKey` from a string.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `OrderKey` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderKey {
    type Err = ParseOrderKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseOrderKeyError("Order key cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for OrderKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for OrderKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Aggregate version for optimistic concurrency control.
///
/// Versions start at 0 for a record that has never been persisted and are
/// bumped by 1 on every successful write. The aggregator always reads the
/// current version and then compare-and-swaps against it; a mismatch means a
/// concurrent fold won the race and the whole apply must be recomputed.
///
/// # Examples
///
/// ```
/// use fulfillment_core::key::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(v1.value(), 1);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a record that has never been persisted.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    ///
    /// # Overflow Behavior
    ///
    /// Reaching `u64::MAX` writes on a single order record is not a realistic
    /// concern; the addition is unchecked.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (never persisted).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}
