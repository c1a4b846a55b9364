use std::fmt::{self, Debug, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool};

use super::backend::SqlBackend;
use super::{DurableStore, TableNames};
use crate::aggregate::AggregateBucket;
use crate::config::StoreConfig;
use crate::entry::Entry;
use crate::error::Result;

pub struct SqliteStore {
    backend: SqlBackend<Sqlite>,
}

impl Debug for SqliteStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("tables", self.backend.tables())
            .finish()
    }
}

impl SqliteStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.url)
            .await?;
        Ok(Self::from_pool(pool, TableNames::from_config(config)))
    }

    pub fn from_pool(pool: SqlitePool, tables: TableNames) -> Self {
        Self {
            backend: SqlBackend::new(pool, tables),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.backend.pool()
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.backend.ensure_schema().await
    }

    async fn insert_entries(&self, entries: &[Entry]) -> Result<u64> {
        self.backend.insert_entries(entries).await
    }

    async fn merge_buckets(&self, buckets: &[AggregateBucket]) -> Result<()> {
        self.backend.merge_buckets(buckets).await
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        self.backend.delete_expired(before).await
    }
}
