//! `PostgreSQL`-backed aggregate store.
//!
//! # Overview
//!
//! One row per order key in the `order_aggregates` table:
//!
//! ```sql
//! CREATE TABLE order_aggregates (
//!     order_key TEXT PRIMARY KEY,
//!     version BIGINT NOT NULL,
//!     aggregate JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The compare-and-swap is a conditional `UPDATE ... WHERE order_key = $key
//! AND version = $expected`; zero rows affected means another writer won the
//! race. Creation at the initial version is an `INSERT ... ON CONFLICT DO
//! NOTHING` with the same zero-rows interpretation. No advisory locks, no
//! transactions spanning the fold: the version column carries the whole
//! concurrency story.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use fulfillment_core::aggregate::OrderAggregate;
use fulfillment_core::key::{OrderKey, Version};
use fulfillment_core::store::{AggregateStore, ScanPredicate, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL`-backed [`AggregateStore`].
#[derive(Clone)]
pub struct PostgresAggregateStore {
    pool: PgPool,
}

impl PostgresAggregateStore {
    /// Create a store using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a fresh pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Run database migrations for the aggregate table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_row(value: serde_json::Value) -> Result<OrderAggregate, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("Failed to decode aggregate: {e}")))
}

impl AggregateStore for PostgresAggregateStore {
    fn get(
        &self,
        key: &OrderKey,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<Option<(OrderAggregate, Version)>, StoreError>> + Send + '_,
        >,
    > {
        let key = key.clone();
        Box::pin(async move {
            let row: Option<(serde_json::Value, i64)> = sqlx::query_as(
                "SELECT aggregate, version FROM order_aggregates WHERE order_key = $1",
            )
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to get: {e}")))?;

            match row {
                None => Ok(None),
                Some((value, version)) => {
                    let aggregate = decode_row(value)?;
                    Ok(Some((aggregate, Version::new(version as u64))))
                }
            }
        })
    }

    fn compare_and_swap(
        &self,
        key: &OrderKey,
        expected_version: Version,
        aggregate: OrderAggregate,
    ) -> Pin<Box<dyn Future<Output = Result<Version, StoreError>> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            let payload = serde_json::to_value(&aggregate).map_err(|e| {
                StoreError::Serialization(format!("Failed to encode aggregate: {e}"))
            })?;
            let new_version = expected_version.next();

            let result = if expected_version.is_initial() {
                sqlx::query(
                    "INSERT INTO order_aggregates
                         (order_key, version, aggregate, created_at, updated_at)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT (order_key) DO NOTHING",
                )
                .bind(key.as_str())
                .bind(new_version.value() as i64)
                .bind(&payload)
                .bind(aggregate.created_at)
                .bind(aggregate.updated_at)
                .execute(&self.pool)
                .await
            } else {
                sqlx::query(
                    "UPDATE order_aggregates
                     SET version = $1, aggregate = $2, updated_at = $3
                     WHERE order_key = $4 AND version = $5",
                )
                .bind(new_version.value() as i64)
                .bind(&payload)
                .bind(aggregate.updated_at)
                .bind(key.as_str())
                .bind(expected_version.value() as i64)
                .execute(&self.pool)
                .await
            };

            let result =
                result.map_err(|e| StoreError::Unavailable(format!("Failed to write: {e}")))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::VersionConflict {
                    key,
                    expected: expected_version,
                });
            }
            Ok(new_version)
        })
    }

    fn scan_matching(
        &self,
        predicate: ScanPredicate,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OrderAggregate>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<(serde_json::Value,)> =
                sqlx::query_as("SELECT aggregate FROM order_aggregates")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("Failed to scan: {e}")))?;

            let mut matching = Vec::new();
            for (value,) in rows {
                let aggregate = decode_row(value)?;
                if predicate(&aggregate) {
                    matching.push(aggregate);
                }
            }
            Ok(matching)
        })
    }

    fn purge_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM order_aggregates WHERE created_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Unavailable(format!("Failed to purge: {e}")))?;

            let purged = result.rows_affected();
            if purged > 0 {
                tracing::debug!(purged, %cutoff, "Purged expired aggregates");
            }
            Ok(purged)
        })
    }
}
