use super::SqliteStore;
use crate::common::{
    Error, Result,
    types::{Entry, ParentKind, ParentRef, Payload, Persisted, Thread, now_millis},
};
use std::collections::BTreeMap;
use tally::{ChildKind, CounterKey, SequenceNumber};

const THREAD_COLUMNS: &str = "id, parent_id, sequence_number, cached_child_count, created_at";
const ENTRY_COLUMNS: &str = "id, parent_id, sequence_number, body, created_at";

impl SqliteStore {
    /// Inserts one child row for `(parent_id, number)`.
    ///
    /// This is a single statement: either the row is written or nothing is.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateNumber`] if the unique index already holds
    ///   `(parent_id, number)`. `replay` is set when the existing row carries
    ///   exactly `payload`.
    /// - [`Error::ParentMissing`] if the parent row does not exist.
    pub async fn insert_child(
        &self,
        parent_id: i64,
        number: SequenceNumber,
        payload: &Payload,
    ) -> Result<Persisted> {
        let result = match payload {
            Payload::Thread => sqlx::query_as::<_, Thread>(&format!(
                "INSERT INTO threads (parent_id, sequence_number, created_at) VALUES (?, ?, ?) \
                 RETURNING {THREAD_COLUMNS}"
            ))
            .bind(parent_id)
            .bind(number)
            .bind(now_millis())
            .fetch_one(&self.pool)
            .await
            .map(Persisted::Thread),
            Payload::Entry { body } => sqlx::query_as::<_, Entry>(&format!(
                "INSERT INTO entries (parent_id, sequence_number, body, created_at) \
                 VALUES (?, ?, ?, ?) RETURNING {ENTRY_COLUMNS}"
            ))
            .bind(parent_id)
            .bind(number)
            .bind(body)
            .bind(now_millis())
            .fetch_one(&self.pool)
            .await
            .map(Persisted::Entry),
        };

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let kind = payload.kind();
                let replay = self
                    .child(parent_id, kind, number)
                    .await?
                    .is_some_and(|existing| existing.matches(payload));
                Err(Error::DuplicateNumber {
                    parent_id,
                    kind,
                    number,
                    replay,
                })
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_foreign_key_violation() => {
                Err(Error::ParentMissing {
                    parent: ParentRef::of_child(payload.kind(), parent_id),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the child of `kind` numbered `number` under `parent_id`.
    pub async fn child(
        &self,
        parent_id: i64,
        kind: ChildKind,
        number: SequenceNumber,
    ) -> Result<Option<Persisted>> {
        Ok(match kind {
            ChildKind::Thread => self
                .thread_by_number(parent_id, number)
                .await?
                .map(Persisted::Thread),
            ChildKind::Entry => self.entry(parent_id, number).await?.map(Persisted::Entry),
        })
    }

    pub async fn thread_by_number(
        &self,
        tenant_id: i64,
        number: SequenceNumber,
    ) -> Result<Option<Thread>> {
        let thread = sqlx::query_as::<_, Thread>(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE parent_id = ? AND sequence_number = ?"
        ))
        .bind(tenant_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    pub async fn thread(&self, id: i64) -> Result<Option<Thread>> {
        let thread = sqlx::query_as::<_, Thread>(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(thread)
    }

    pub async fn entry(&self, thread_id: i64, number: SequenceNumber) -> Result<Option<Entry>> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE parent_id = ? AND sequence_number = ?"
        ))
        .bind(thread_id)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// A page of entries with `id > after_id`, in id order.
    ///
    /// Paging by id keeps a long scan resumable and unaffected by concurrent
    /// inserts, which always land after the cursor.
    pub async fn entries_after(&self, after_id: i64, limit: u32) -> Result<Vec<Entry>> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id > ? ORDER BY id LIMIT ?"
        ))
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn entry_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Highest number ever accounted for per counter: the maximum of every
    /// persisted child and every dead-lettered task.
    ///
    /// Dead letters are included so that an abandoned number is never issued
    /// again after the counter store is rebuilt.
    pub async fn max_numbers(&self) -> Result<Vec<(CounterKey, SequenceNumber)>> {
        let mut floors: BTreeMap<CounterKey, SequenceNumber> = BTreeMap::new();
        let mut raise = |key: CounterKey, value: SequenceNumber| {
            let slot = floors.entry(key).or_insert(value);
            *slot = (*slot).max(value);
        };

        for kind in ChildKind::ALL {
            let table = ParentKind::of_child(kind).child_table();
            let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
                "SELECT parent_id, MAX(sequence_number) FROM {table} GROUP BY parent_id"
            ))
            .fetch_all(&self.pool)
            .await?;
            for (parent_id, max) in rows {
                raise(CounterKey::new(parent_id, kind), max);
            }
        }

        let rows: Vec<(i64, String, i64)> = sqlx::query_as(
            "SELECT parent_id, kind, MAX(sequence_number) FROM dead_letters \
             GROUP BY parent_id, kind",
        )
        .fetch_all(&self.pool)
        .await?;
        for (parent_id, kind, max) in rows {
            let Ok(kind) = kind.parse::<ChildKind>() else {
                tracing::warn!(parent_id, kind = %kind, "skipping dead letter with unknown kind");
                continue;
            };
            raise(CounterKey::new(parent_id, kind), max);
        }

        Ok(floors.into_iter().collect())
    }

    /// Every persisted number under `key`, ascending.
    pub async fn persisted_numbers(&self, key: CounterKey) -> Result<Vec<SequenceNumber>> {
        let table = ParentKind::of_child(key.kind).child_table();
        let numbers = sqlx::query_scalar(&format!(
            "SELECT sequence_number FROM {table} WHERE parent_id = ? ORDER BY sequence_number"
        ))
        .bind(key.parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(numbers)
    }
}
