use super::{IndexDocument, SearchIndex, tokenize};
use crate::common::Result;
use async_trait::async_trait;
use core::time::Duration;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Documents live in `search_documents`; `search_fts` is an FTS5
/// external-content index over their bodies, kept in step by triggers.
/// Diacritics are kept so a term matches only its exact folded spelling.
const INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS search_documents (
    id INTEGER PRIMARY KEY,
    parent_id INTEGER NOT NULL,
    body TEXT NOT NULL,
    indexed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_search_documents_parent
    ON search_documents(parent_id, id);

CREATE VIRTUAL TABLE IF NOT EXISTS search_fts USING fts5(
    body,
    content = 'search_documents',
    content_rowid = 'id',
    tokenize = 'unicode61 remove_diacritics 0'
);

CREATE TRIGGER IF NOT EXISTS search_documents_ai AFTER INSERT ON search_documents BEGIN
    INSERT INTO search_fts(rowid, body) VALUES (new.id, new.body);
END;
CREATE TRIGGER IF NOT EXISTS search_documents_ad AFTER DELETE ON search_documents BEGIN
    INSERT INTO search_fts(search_fts, rowid, body) VALUES ('delete', old.id, old.body);
END;
CREATE TRIGGER IF NOT EXISTS search_documents_au AFTER UPDATE ON search_documents BEGIN
    INSERT INTO search_fts(search_fts, rowid, body) VALUES ('delete', old.id, old.body);
    INSERT INTO search_fts(rowid, body) VALUES (new.id, new.body);
END;
"#;

const UPSERT: &str = "INSERT INTO search_documents (id, parent_id, body, indexed_at) \
                      VALUES (?, ?, ?, ?) \
                      ON CONFLICT(id) DO UPDATE SET \
                      parent_id = excluded.parent_id, \
                      body = excluded.body, \
                      indexed_at = excluded.indexed_at";

/// Index kept in its own SQLite database, separate from the durable store so
/// that losing it loses nothing the reindex sweep cannot rebuild.
#[derive(Clone, Debug)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(INDEX_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert(&self, doc: IndexDocument) -> Result<()> {
        sqlx::query(UPSERT)
            .bind(doc.id)
            .bind(doc.parent_id)
            .bind(doc.body)
            .bind(doc.indexed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_batch(&self, docs: Vec<IndexDocument>) -> Result<usize> {
        let count = docs.len();
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query(UPSERT)
                .bind(doc.id)
                .bind(doc.parent_id)
                .bind(doc.body)
                .bind(doc.indexed_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(count)
    }

    async fn search(
        &self,
        parent_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        let Some(expr) = match_expression(query) else {
            return Ok(Vec::new());
        };

        let docs = sqlx::query_as::<_, IndexDocument>(
            "SELECT d.id AS id, d.parent_id AS parent_id, d.body AS body, \
             d.indexed_at AS indexed_at \
             FROM search_fts JOIN search_documents d ON d.id = search_fts.rowid \
             WHERE search_fts MATCH ? AND d.parent_id = ? \
             ORDER BY d.id LIMIT ?",
        )
        .bind(expr)
        .bind(parent_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }

    async fn remove_parents(&self, parent_ids: &[i64]) -> Result<u64> {
        let mut removed = 0;
        let mut tx = self.pool.begin().await?;
        for parent_id in parent_ids {
            removed += sqlx::query("DELETE FROM search_documents WHERE parent_id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_documents")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

/// An FTS5 query requiring every term of `query`, each quoted so user input
/// is never parsed as query syntax. `None` when `query` has no terms.
fn match_expression(query: &str) -> Option<String> {
    let terms = tokenize(query);
    if terms.is_empty() {
        return None;
    }
    let quoted: Vec<String> = terms.iter().map(|t| format!("\"{t}\"")).collect();
    Some(quoted.join(" AND "))
}
