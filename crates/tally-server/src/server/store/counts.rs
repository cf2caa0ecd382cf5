use super::{SqliteStore, is_busy};
use crate::common::{
    Error, Result,
    types::{ParentKind, ParentRef},
};

impl SqliteStore {
    /// Bumps the cached child count of `parent` by one.
    ///
    /// Fast and approximate: lost or duplicated increments are corrected by
    /// [`SqliteStore::reconcile_parent`]. Returns whether the parent exists.
    pub async fn increment_cached_count(&self, parent: ParentRef) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET cached_child_count = cached_child_count + 1 WHERE id = ?",
            parent.kind.table()
        ))
        .bind(parent.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrites the cached count of `parent` with its exact live-child
    /// count and returns `(before, after)`, or `None` if the parent is gone.
    ///
    /// The read of the previous value and the overwrite run in one
    /// transaction, so the recount is never interleaved with another writer
    /// on the same row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReconciliationRace`] if SQLite reports lock
    /// contention. The next sweep heals the row.
    pub async fn reconcile_parent(&self, parent: ParentRef) -> Result<Option<(i64, i64)>> {
        let race = |e: sqlx::Error| -> Error {
            if is_busy(&e) {
                Error::ReconciliationRace {
                    parent,
                    reason: e.to_string(),
                }
            } else {
                Error::Database(e)
            }
        };

        let table = parent.kind.table();
        let child_table = parent.kind.child_table();

        let mut tx = self.pool.begin().await.map_err(race)?;

        let before: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT cached_child_count FROM {table} WHERE id = ?"
        ))
        .bind(parent.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(race)?;

        let Some(before) = before else {
            tx.rollback().await.map_err(race)?;
            return Ok(None);
        };

        let after: Option<i64> = sqlx::query_scalar(&format!(
            "UPDATE {table} \
             SET cached_child_count = (SELECT COUNT(*) FROM {child_table} WHERE parent_id = ?) \
             WHERE id = ? RETURNING cached_child_count"
        ))
        .bind(parent.id)
        .bind(parent.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(race)?;

        tx.commit().await.map_err(race)?;
        Ok(after.map(|after| (before, after)))
    }

    /// Ids of every parent row of `kind`, ascending.
    pub async fn parent_ids(&self, kind: ParentKind) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(&format!("SELECT id FROM {} ORDER BY id", kind.table()))
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}
