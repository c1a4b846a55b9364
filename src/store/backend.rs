//! SQL shared by every store.
//!
//! [`SqlBackend`] is parameterised by a sqlx database implementing
//! [`StoreDatabase`], which supplies the placeholder syntax (`?` for SQLite,
//! `$n` for Postgres). Everything else is portable SQL: `CREATE ... IF NOT
//! EXISTS` and `INSERT ... ON CONFLICT`.
//!
//! Timestamps are stored as epoch milliseconds so range comparisons behave
//! the same on both databases.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgQueryResult;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{query, Database, Encode, Executor, IntoArguments, Pool, Postgres, Sqlite, Type};

use super::TableNames;
use crate::aggregate::AggregateBucket;
use crate::entry::{Entry, MAX_PATH_LEN};
use crate::error::Result;

/// Rows per `INSERT`. Five binds per entry keeps each statement well under
/// SQLite's and Postgres' bind-parameter limits.
const MAX_ROWS_PER_STATEMENT: usize = 1_000;

const ENTRY_COLUMNS: usize = 5;
const BUCKET_COLUMNS: usize = 4;

/// Per-database hooks that sqlx does not expose generically.
pub trait StoreDatabase: Database {
    /// Placeholder for the given 1-based bind index.
    fn bind_param(index: usize) -> Cow<'static, str>;

    fn rows_affected(result: &Self::QueryResult) -> u64;
}

impl StoreDatabase for Sqlite {
    fn bind_param(_: usize) -> Cow<'static, str> {
        Cow::Borrowed("?")
    }

    fn rows_affected(result: &SqliteQueryResult) -> u64 {
        result.rows_affected()
    }
}

impl StoreDatabase for Postgres {
    fn bind_param(index: usize) -> Cow<'static, str> {
        Cow::Owned(format!("${index}"))
    }

    fn rows_affected(result: &PgQueryResult) -> u64 {
        result.rows_affected()
    }
}

pub struct SqlBackend<DB: StoreDatabase> {
    pool: Pool<DB>,
    tables: TableNames,
}

impl<DB: StoreDatabase> SqlBackend<DB> {
    pub fn new(pool: Pool<DB>, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }
}

impl<DB> SqlBackend<DB>
where
    DB: StoreDatabase,
    for<'q> i32: Encode<'q, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'q> String: Encode<'q, DB> + Type<DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB> + Send,
    for<'c> &'c Pool<DB>: Executor<'c, Database = DB>,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
{
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in schema_statements(&self.tables) {
            query::<DB>(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// All chunks go through one transaction, so a failed batch leaves no
    /// partial rows behind.
    pub async fn insert_entries(&self, entries: &[Entry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in entries.chunks(MAX_ROWS_PER_STATEMENT) {
            let sql = format!(
                "INSERT INTO {} (id, timestamp_ms, duration_ms, status_code, path) VALUES {} \
                 ON CONFLICT (id) DO NOTHING",
                self.tables.metrics,
                values_clause::<DB>(chunk.len(), ENTRY_COLUMNS)
            );

            let mut statement = query::<DB>(&sql);
            for entry in chunk {
                statement = statement
                    .bind(entry.id().to_string())
                    .bind(entry.timestamp().timestamp_millis())
                    .bind(to_i64(entry.duration_ms()))
                    .bind(i32::from(entry.status_code()))
                    .bind(entry.path().to_owned());
            }

            let result = statement.execute(&mut *tx).await?;
            inserted += DB::rows_affected(&result);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// One upsert for the whole set. `buckets` must not repeat a start; the
    /// output of [`bucketize`](crate::aggregate::bucketize) never does.
    pub async fn merge_buckets(&self, buckets: &[AggregateBucket]) -> Result<()> {
        if buckets.is_empty() {
            return Ok(());
        }

        let table = &self.tables.aggregates;
        let sql = format!(
            "INSERT INTO {table} (bucket_start_ms, total_requests, success_requests, failed_requests) \
             VALUES {} \
             ON CONFLICT (bucket_start_ms) DO UPDATE SET \
             total_requests = {table}.total_requests + excluded.total_requests, \
             success_requests = {table}.success_requests + excluded.success_requests, \
             failed_requests = {table}.failed_requests + excluded.failed_requests",
            values_clause::<DB>(buckets.len(), BUCKET_COLUMNS)
        );

        let mut statement = query::<DB>(&sql);
        for bucket in buckets {
            statement = statement
                .bind(bucket.bucket_start_ms())
                .bind(to_i64(bucket.total_requests()))
                .bind(to_i64(bucket.success_requests()))
                .bind(to_i64(bucket.failed_requests()));
        }

        statement.execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE timestamp_ms < {}",
            self.tables.metrics,
            DB::bind_param(1)
        );

        let result = query::<DB>(&sql)
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(DB::rows_affected(&result))
    }
}

/// `(p, p, ...), (p, p, ...)` for `rows` tuples of `columns` binds each,
/// numbered from 1.
fn values_clause<DB: StoreDatabase>(rows: usize, columns: usize) -> String {
    let mut index = 0;
    let tuples: Vec<String> = (0..rows)
        .map(|_| {
            let params: Vec<Cow<'static, str>> = (0..columns)
                .map(|_| {
                    index += 1;
                    DB::bind_param(index)
                })
                .collect();
            format!("({})", params.join(", "))
        })
        .collect();
    tuples.join(", ")
}

fn to_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn schema_statements(tables: &TableNames) -> [String; 3] {
    let metrics = &tables.metrics;
    let aggregates = &tables.aggregates;
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {metrics} (
                id VARCHAR(36) PRIMARY KEY NOT NULL,
                timestamp_ms BIGINT NOT NULL,
                duration_ms BIGINT NOT NULL,
                status_code INTEGER NOT NULL,
                path VARCHAR({MAX_PATH_LEN}) NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS ix_{metrics}_timestamp ON {metrics} (timestamp_ms)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {aggregates} (
                bucket_start_ms BIGINT PRIMARY KEY NOT NULL,
                total_requests BIGINT NOT NULL DEFAULT 0,
                success_requests BIGINT NOT NULL DEFAULT 0,
                failed_requests BIGINT NOT NULL DEFAULT 0
            )"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_uses_configured_table_names() {
        let tables = TableNames {
            metrics: "edge_metrics".into(),
            aggregates: "edge_rollups".into(),
        };
        let [entries, index, aggregates] = schema_statements(&tables);
        assert!(entries.contains("CREATE TABLE IF NOT EXISTS edge_metrics"));
        assert!(entries.contains("VARCHAR(2048)"));
        assert!(index.contains("ix_edge_metrics_timestamp ON edge_metrics"));
        assert!(aggregates.contains("CREATE TABLE IF NOT EXISTS edge_rollups"));
    }

    #[test]
    fn values_clause_numbers_postgres_binds_across_rows() {
        assert_eq!(
            values_clause::<Postgres>(2, 3),
            "($1, $2, $3), ($4, $5, $6)"
        );
    }

    #[test]
    fn values_clause_uses_anonymous_sqlite_binds() {
        assert_eq!(values_clause::<Sqlite>(2, 2), "(?, ?), (?, ?)");
        assert_eq!(values_clause::<Sqlite>(1, ENTRY_COLUMNS), "(?, ?, ?, ?, ?)");
    }

    #[test]
    fn counts_saturate_into_i64() {
        assert_eq!(to_i64(7), 7);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }
}
