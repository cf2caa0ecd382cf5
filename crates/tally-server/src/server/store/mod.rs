//! Durable store backed by SQLite.
//!
//! [`SqliteStore`] is the final correctness arbiter of the pipeline: the
//! composite unique index on every child table rejects a second row for the
//! same `(parent_id, sequence_number)` no matter how tasks are ordered, and
//! foreign keys with `ON DELETE CASCADE` guarantee there are no orphans.
//!
//! Operations are split by concern across the submodules, all as inherent
//! methods on [`SqliteStore`].

mod children;
mod counter;
mod counts;
mod dead_letters;
#[cfg(feature = "redis")]
mod redis_counter;
mod schema;
mod tenants;

pub use counter::SqlCounterStore;
#[cfg(feature = "redis")]
pub use redis_counter::RedisCounterStore;
pub use schema::SCHEMA;

use crate::common::Result;
use core::time::Duration;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;

/// SQLite-based durable store.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies the
    /// schema.
    ///
    /// SQLite permits limited write concurrency; a small pool (often a single
    /// connection) avoids persistent "database is locked" failures.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(connect_options(url)?)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database, used by tests and dry runs.
    ///
    /// Every connection to `:memory:` opens a distinct database, so the pool
    /// is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Options shared by every connection to a file-backed durable store.
pub(crate) fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
    Ok(SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        // Prevent transient "database is locked" errors under concurrent access.
        .busy_timeout(Duration::from_secs(5)))
}

/// Whether `err` is SQLite reporting lock contention (`SQLITE_BUSY` and its
/// extended codes).
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code();
            matches!(code.as_deref(), Some("5" | "261" | "517"))
                || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}
