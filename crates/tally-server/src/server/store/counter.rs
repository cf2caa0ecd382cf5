use super::{SCHEMA, connect_options};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tally::{ChildKind, CounterKey, CounterStore, Error, Result, SequenceNumber};

/// Counters kept in the durable store's `counters` table.
///
/// Each increment is one `INSERT .. ON CONFLICT DO UPDATE .. RETURNING`
/// statement. SQLite serializes writers, so the statement is the row lock and
/// no two callers, in this process or another, can observe the same value.
/// Slower than the in-process or Redis stores, but it survives restarts and
/// needs no extra service.
#[derive(Clone, Debug)]
pub struct SqlCounterStore {
    pool: SqlitePool,
}

impl SqlCounterStore {
    /// Counters on an existing pool. The pool must not be one that workers
    /// and sweeps also draw from, or allocation waits behind them.
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a dedicated connection to the durable store at `url`.
    pub async fn connect(url: &str) -> crate::common::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options(url)?)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn unavailable(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

#[async_trait]
impl CounterStore for SqlCounterStore {
    async fn increment(&self, key: CounterKey) -> Result<SequenceNumber> {
        sqlx::query_scalar(
            "INSERT INTO counters (parent_id, kind, value) VALUES (?, ?, 1) \
             ON CONFLICT(parent_id, kind) DO UPDATE SET value = value + 1 \
             RETURNING value",
        )
        .bind(key.parent_id)
        .bind(key.kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn current(&self, key: CounterKey) -> Result<SequenceNumber> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM counters WHERE parent_id = ? AND kind = ?")
                .bind(key.parent_id)
                .bind(key.kind.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(value.unwrap_or(0))
    }

    async fn raise_to(&self, key: CounterKey, floor: SequenceNumber) -> Result<SequenceNumber> {
        sqlx::query_scalar(
            "INSERT INTO counters (parent_id, kind, value) VALUES (?, ?, ?) \
             ON CONFLICT(parent_id, kind) DO UPDATE SET value = MAX(value, excluded.value) \
             RETURNING value",
        )
        .bind(key.parent_id)
        .bind(key.kind.as_str())
        .bind(floor)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)
    }

    async fn snapshot(&self) -> Result<Vec<(CounterKey, SequenceNumber)>> {
        let rows: Vec<(i64, String, i64)> =
            sqlx::query_as("SELECT parent_id, kind, value FROM counters ORDER BY parent_id, kind")
                .fetch_all(&self.pool)
                .await
                .map_err(unavailable)?;

        let mut counters = rows
            .into_iter()
            .map(|(parent_id, kind, value)| {
                let kind = kind
                    .parse::<ChildKind>()
                    .map_err(|e| Error::unavailable(e.to_string()))?;
                Ok((CounterKey::new(parent_id, kind), value))
            })
            .collect::<Result<Vec<_>>>()?;
        counters.sort_unstable_by_key(|(key, _)| *key);
        Ok(counters)
    }
}
