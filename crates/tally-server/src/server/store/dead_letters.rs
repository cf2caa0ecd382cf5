use super::SqliteStore;
use crate::common::{Error, Result, types::Payload};
use crate::server::task::{DeadLetter, DeadLetterRecord, DeadLetterStatus};
use tally::ChildKind;

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: i64,
    task_id: i64,
    parent_id: i64,
    kind: String,
    sequence_number: i64,
    payload: String,
    attempts: i64,
    last_error: String,
    dead_at: i64,
    status: String,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = Error;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        let kind = row.kind.parse::<ChildKind>().map_err(|e| Error::InvalidRequest {
            reason: format!("dead letter {}: {e}", row.id),
        })?;
        let payload: Payload =
            serde_json::from_str(&row.payload).map_err(|e| Error::InvalidRequest {
                reason: format!("dead letter {} payload: {e}", row.id),
            })?;
        let status = row
            .status
            .parse::<DeadLetterStatus>()
            .map_err(|reason| Error::InvalidRequest {
                reason: format!("dead letter {}: {reason}", row.id),
            })?;
        Ok(Self {
            id: row.id,
            status,
            letter: DeadLetter {
                task_id: row.task_id as u64,
                parent_id: row.parent_id,
                kind,
                number: row.sequence_number,
                payload,
                attempts: row.attempts as u32,
                last_error: row.last_error,
                dead_at: row.dead_at,
            },
        })
    }
}

const DEAD_LETTER_COLUMNS: &str = "id, task_id, parent_id, kind, sequence_number, payload, \
                                   attempts, last_error, dead_at, status";

impl SqliteStore {
    /// Persists `letter` and returns its row id.
    pub async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<i64> {
        let payload = encode_payload(letter)?;
        let id = sqlx::query_scalar(
            "INSERT INTO dead_letters \
             (task_id, parent_id, kind, sequence_number, payload, attempts, last_error, dead_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(letter.task_id as i64)
        .bind(letter.parent_id)
        .bind(letter.kind.as_str())
        .bind(letter.number)
        .bind(payload)
        .bind(i64::from(letter.attempts))
        .bind(&letter.last_error)
        .bind(letter.dead_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// The oldest `limit` dead letters.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY id LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeadLetterRecord::try_from).collect()
    }

    pub async fn dead_letter_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Marks dead letter `id` as requeued and returns it. The row stays
    /// until [`Self::resolve_dead_letter`] removes it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if there is no such letter.
    /// - [`Error::InvalidRequest`] if it is already requeued.
    pub async fn mark_requeued(&self, id: i64) -> Result<DeadLetterRecord> {
        let row = sqlx::query_as::<_, DeadLetterRow>(&format!(
            "UPDATE dead_letters SET status = 'requeued' WHERE id = ? AND status = 'dead' \
             RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row.try_into();
        }
        if self.dead_letter_exists(id).await? {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "dead letter {id} is already requeued; release it if its task was lost"
                ),
            });
        }
        Err(Error::not_found(format!("dead letter {id}")))
    }

    /// Returns a requeued letter to `dead`, e.g. after a crash lost its task.
    /// Returns whether the letter was requeued.
    pub async fn release_dead_letter(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dead_letters SET status = 'dead' WHERE id = ? AND status = 'requeued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Overwrites dead letter `id` with the outcome of its failed
    /// re-submission. Returns `false` if the row no longer exists.
    pub async fn rebury_dead_letter(&self, id: i64, letter: &DeadLetter) -> Result<bool> {
        let payload = encode_payload(letter)?;
        let result = sqlx::query(
            "UPDATE dead_letters SET status = 'dead', task_id = ?, payload = ?, attempts = ?, \
             last_error = ?, dead_at = ? WHERE id = ?",
        )
        .bind(letter.task_id as i64)
        .bind(payload)
        .bind(i64::from(letter.attempts))
        .bind(&letter.last_error)
        .bind(letter.dead_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes dead letter `id` once its number has a row.
    pub async fn resolve_dead_letter(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn dead_letter_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Dead-lettered numbers under `(parent_id, kind)`, ascending.
    pub async fn dead_numbers(&self, parent_id: i64, kind: ChildKind) -> Result<Vec<i64>> {
        let numbers = sqlx::query_scalar(
            "SELECT DISTINCT sequence_number FROM dead_letters \
             WHERE parent_id = ? AND kind = ? ORDER BY sequence_number",
        )
        .bind(parent_id)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(numbers)
    }
}

fn encode_payload(letter: &DeadLetter) -> Result<String> {
    serde_json::to_string(&letter.payload).map_err(|e| Error::InvalidRequest {
        reason: format!("unserializable payload: {e}"),
    })
}
