//! Durable storage for entries and aggregate buckets.
//!
//! [`DurableStore`] is the seam the flush loop and retention sweeper depend
//! on. Both SQL implementations delegate to [`backend::SqlBackend`], which is
//! generic over the sqlx database and keeps the statements in one place.

pub mod backend;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::aggregate::AggregateBucket;
use crate::config::{StoreConfig, StoreKind};
use crate::entry::Entry;
use crate::error::Result;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Names of the two tables the pipeline writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub metrics: String,
    pub aggregates: String,
}

impl TableNames {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            metrics: config.metrics_table.clone(),
            aggregates: config.aggregates_table.clone(),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Creates the entry and aggregate tables if they do not exist.
    async fn ensure_schema(&self) -> Result<()>;

    /// Bulk-inserts entries. Rows whose id is already stored are skipped, so a
    /// redelivered batch does not fail. Returns the number of new rows.
    async fn insert_entries(&self, entries: &[Entry]) -> Result<u64>;

    /// Adds each bucket's counts to the stored bucket with the same start,
    /// inserting it when absent.
    async fn merge_buckets(&self, buckets: &[AggregateBucket]) -> Result<()>;

    /// Deletes every entry with a timestamp strictly before `before`.
    /// Returns the number of rows removed.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Connects to the configured database, provisioning the schema when asked.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn DurableStore>> {
    let store: Arc<dyn DurableStore> = match config.kind {
        StoreKind::Sqlite => Arc::new(SqliteStore::connect(config).await?),
        StoreKind::Postgres => Arc::new(PostgresStore::connect(config).await?),
    };

    if config.ensure_schema {
        store.ensure_schema().await?;
        tracing::info!(
            store = store.kind(),
            metrics_table = %config.metrics_table,
            aggregates_table = %config.aggregates_table,
            "schema ready"
        );
    }

    Ok(store)
}
