use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::event::OutputRow;

/// Table the worker writes to, as created by the migrations.
pub const DEFAULT_TABLE: &str = "fact_events";

const COLUMNS: &str =
    "event_time, user_id, event_name, platform, list_name, product_id, product_name, price";

/// Postgres accepts at most 65535 bind parameters per statement, each row binds 8.
const MAX_ROWS_PER_INSERT: usize = 1000;

/// Enumeration of errors for committing rows.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("commit did not finish within {0:?}")]
    Timeout(time::Duration),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination of output rows.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// Persist every row in a single transaction: all of them are durable on `Ok`,
    /// none of them on `Err`.
    async fn commit(&self, rows: &[OutputRow]) -> Result<(), SinkError>;
}

/// A sink writing to a PostgreSQL table.
pub struct PgSink {
    table: String,
    pool: PgPool,
    commit_timeout: time::Duration,
}

impl PgSink {
    /// Connect a new pool and write to `table` through it.
    pub async fn new(
        table: &str,
        url: &str,
        max_connections: u32,
        acquire_timeout: time::Duration,
        commit_timeout: time::Duration,
    ) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|error| SinkError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool, commit_timeout))
    }

    pub fn new_from_pool(table: &str, pool: PgPool, commit_timeout: time::Duration) -> Self {
        Self {
            table: table.to_owned(),
            pool,
            commit_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, rows: &[OutputRow]) -> Result<(), SinkError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| SinkError::QueryError {
                command: "BEGIN",
                error,
            })?;

        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let mut query = QueryBuilder::<Postgres>::new(format!(
                r#"INSERT INTO "{}" ({}) "#,
                self.table, COLUMNS
            ));
            query.push_values(chunk, |mut values, row| {
                values
                    .push_bind(row.event_time)
                    .push_bind(row.user_id.clone())
                    .push_bind(row.event_name.clone())
                    .push_bind(row.platform.clone())
                    .push_bind(row.list_name.clone())
                    .push_bind(row.product_id.clone())
                    .push_bind(row.product_name.clone())
                    .push_bind(row.price);
            });

            if let Err(error) = query.build().execute(&mut *tx).await {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("failed to roll back transaction: {}", rollback_error);
                }
                return Err(SinkError::QueryError {
                    command: "INSERT",
                    error,
                });
            }
        }

        tx.commit().await.map_err(|error| SinkError::QueryError {
            command: "COMMIT",
            error,
        })
    }
}

#[async_trait]
impl RowSink for PgSink {
    async fn commit(&self, rows: &[OutputRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        // A transaction dropped before COMMIT is rolled back by sqlx.
        tokio::time::timeout(self.commit_timeout, self.insert(rows))
            .await
            .map_err(|_| SinkError::Timeout(self.commit_timeout))?
    }
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<OutputRow>,
    commits: usize,
    failure: Option<String>,
}

/// In-memory sink for tests - always available, no conditional compilation needed.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following commit fail with `reason`, or succeed again with `None`.
    pub async fn fail_commits(&self, reason: Option<&str>) {
        self.state.lock().await.failure = reason.map(str::to_owned);
    }

    /// Every committed row, in commit order.
    pub async fn rows(&self) -> Vec<OutputRow> {
        self.state.lock().await.rows.clone()
    }

    /// Number of successful commits.
    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl RowSink for MemorySink {
    async fn commit(&self, rows: &[OutputRow]) -> Result<(), SinkError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.failure {
            return Err(SinkError::Unavailable(reason.clone()));
        }

        state.rows.extend_from_slice(rows);
        state.commits += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn row(product_id: &str, price: Option<f64>) -> OutputRow {
        OutputRow {
            event_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            user_id: Some("u-1".to_owned()),
            event_name: Some("purchase".to_owned()),
            platform: None,
            list_name: None,
            product_id: Some(product_id.to_owned()),
            product_name: None,
            price,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_commit_is_all_or_nothing() {
        let sink = MemorySink::new();
        sink.commit(&[row("A", Some(1.0)), row("B", None)])
            .await
            .unwrap();

        sink.fail_commits(Some("database is down")).await;
        let error = sink.commit(&[row("C", None)]).await.unwrap_err();

        assert!(matches!(error, SinkError::Unavailable(_)));
        assert_eq!(sink.commits().await, 1);
        assert_eq!(sink.rows().await, vec![row("A", Some(1.0)), row("B", None)]);
    }

    #[derive(sqlx::FromRow)]
    struct StoredRow {
        event_time: DateTime<Utc>,
        user_id: Option<String>,
        product_id: Option<String>,
        price: Option<f64>,
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL (DATABASE_URL)"]
    async fn test_pg_sink_commits_rows(db: PgPool) {
        let sink = PgSink::new_from_pool(DEFAULT_TABLE, db.clone(), time::Duration::from_secs(5));

        sink.commit(&[row("A", Some(9.99)), row("B", None)])
            .await
            .expect("failed to commit rows");

        let stored: Vec<StoredRow> = sqlx::query_as(
            "SELECT event_time, user_id, product_id, price FROM fact_events ORDER BY id",
        )
        .fetch_all(&db)
        .await
        .expect("failed to read rows");

        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].event_time, row("A", None).event_time);
        assert_eq!(stored[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(stored[0].product_id.as_deref(), Some("A"));
        assert_eq!(stored[0].price, Some(9.99));
        assert_eq!(stored[1].price, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL (DATABASE_URL)"]
    async fn test_pg_sink_failed_commit_leaves_no_rows(db: PgPool) {
        let sink = PgSink::new_from_pool("missing_table", db.clone(), time::Duration::from_secs(5));

        let error = sink.commit(&[row("A", None)]).await.unwrap_err();
        assert!(matches!(error, SinkError::QueryError { command: "INSERT", .. }));

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM fact_events")
            .fetch_one(&db)
            .await
            .expect("failed to count rows");
        assert_eq!(count, 0);
    }

    async fn count_rows(db: &PgPool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT count(*) FROM {}", table))
            .fetch_one(db)
            .await
            .expect("failed to count rows")
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL (DATABASE_URL)"]
    async fn test_pg_sink_splits_large_batches(db: PgPool) {
        let sink = PgSink::new_from_pool(DEFAULT_TABLE, db.clone(), time::Duration::from_secs(30));
        let rows: Vec<OutputRow> = (0..MAX_ROWS_PER_INSERT * 2 + 500)
            .map(|i| row(&format!("P{i}"), Some(1.0)))
            .collect();

        sink.commit(&rows).await.expect("failed to commit rows");

        assert_eq!(count_rows(&db, DEFAULT_TABLE).await, 2500);
        let last: Option<String> =
            sqlx::query_scalar("SELECT product_id FROM fact_events ORDER BY id DESC LIMIT 1")
                .fetch_one(&db)
                .await
                .expect("failed to read last row");
        assert_eq!(last.as_deref(), Some("P2499"));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL (DATABASE_URL)"]
    async fn test_pg_sink_late_chunk_failure_rolls_back_earlier_chunks(db: PgPool) {
        sqlx::query(
            "CREATE TABLE checked_events \
             (LIKE fact_events INCLUDING ALL, CHECK (product_id <> 'bad'))",
        )
        .execute(&db)
        .await
        .expect("failed to create table");
        let sink = PgSink::new_from_pool(
            "checked_events",
            db.clone(),
            time::Duration::from_secs(30),
        );
        let mut rows: Vec<OutputRow> = (0..MAX_ROWS_PER_INSERT + 500)
            .map(|i| row(&format!("P{i}"), None))
            .collect();
        rows.push(row("bad", None));

        let error = sink.commit(&rows).await.unwrap_err();

        assert!(matches!(error, SinkError::QueryError { command: "INSERT", .. }));
        assert_eq!(count_rows(&db, "checked_events").await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL (DATABASE_URL)"]
    async fn test_pg_sink_commit_times_out(db: PgPool) {
        let mut blocker = db.begin().await.expect("failed to begin");
        sqlx::query("LOCK TABLE fact_events IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *blocker)
            .await
            .expect("failed to lock table");
        let sink = PgSink::new_from_pool(
            DEFAULT_TABLE,
            db.clone(),
            time::Duration::from_millis(200),
        );

        let error = sink.commit(&[row("A", None)]).await.unwrap_err();

        assert!(matches!(error, SinkError::Timeout(_)));
        blocker.rollback().await.expect("failed to release lock");
        assert_eq!(count_rows(&db, DEFAULT_TABLE).await, 0);
    }
}
