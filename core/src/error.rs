//! Error taxonomy for applying facts.
//!
//! Three classes matter to callers:
//!
//! - **Permanent** (`InvalidFact`, `MissingDeliveryInfo`): retrying the same
//!   input reproduces the failure. The stream reader logs and advances past
//!   the message; redelivery would only block the partition.
//! - **Transient** (`StoreUnavailable`): the reader does not acknowledge and
//!   relies on the transport's at-least-once redelivery after backoff.
//! - **Contention** (version conflicts): absorbed entirely inside
//!   `apply_fact` by re-reading and recomputing; never surfaced here.

use crate::fact::FactDecodeError;
use crate::key::OrderKey;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by `apply_fact`.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The fact is malformed or violates the schema. Permanent; do not
    /// retry.
    #[error("Invalid fact: {0}")]
    InvalidFact(String),

    /// The aggregate store could not be reached, or internal conflict
    /// retries were exhausted. Transient; retry via transport redelivery.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A delivery order reached its trigger condition without any delivery
    /// address on record. Permanent data-integrity violation: the action
    /// guard stays unfired so a later corrected order fact can re-trigger.
    #[error("Missing delivery info for order '{key}'")]
    MissingDeliveryInfo {
        /// The order the address is missing for.
        key: OrderKey,
    },
}

impl ApplyError {
    /// Whether the caller should retry (via redelivery) rather than skip.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            // Conflicts are retried inside apply_fact; one escaping here
            // means the retry budget was exhausted, which callers treat the
            // same as an unavailable store.
            StoreError::VersionConflict { key, expected } => Self::StoreUnavailable(format!(
                "contention on '{key}' persisted past retry budget (expected version {expected})"
            )),
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            StoreError::Serialization(reason) => Self::StoreUnavailable(reason),
        }
    }
}

impl From<FactDecodeError> for ApplyError {
    fn from(err: FactDecodeError) -> Self {
        Self::InvalidFact(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(ApplyError::StoreUnavailable("down".to_string()).is_retryable());
        assert!(!ApplyError::InvalidFact("bad".to_string()).is_retryable());
        assert!(
            !ApplyError::MissingDeliveryInfo {
                key: OrderKey::new("o1")
            }
            .is_retryable()
        );
    }

    #[test]
    fn decode_errors_map_to_the_permanent_class() {
        let err: ApplyError = FactDecodeError::Malformed("not json".to_string()).into();
        assert!(matches!(err, ApplyError::InvalidFact(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_errors_map_to_transient_class() {
        let err: ApplyError = StoreError::Unavailable("timeout".to_string()).into();
        assert!(err.is_retryable());

        let err: ApplyError = StoreError::VersionConflict {
            key: OrderKey::new("o1"),
            expected: crate::key::Version::new(2),
        }
        .into();
        assert!(err.is_retryable());
    }
}
