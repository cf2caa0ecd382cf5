use crate::common::Result;
use crate::server::{
    config::GapPolicy,
    store::SqliteStore,
    task::{CreationTask, DeadLetter},
    telemetry::{add_sequence_gaps, increment_tasks_dead},
};

/// Final destination of tasks that reach `Dead`.
///
/// Every dead task is persisted to the `dead_letters` table. If even that
/// fails, the full letter is logged at `error` so it is never lost silently.
#[derive(Clone)]
pub struct DeadLetterSink {
    store: SqliteStore,
    gap_policy: GapPolicy,
}

impl DeadLetterSink {
    pub const fn new(store: SqliteStore, gap_policy: GapPolicy) -> Self {
        Self { store, gap_policy }
    }

    /// Moves `task` to `Dead` (recording `reason` if it was still live) and
    /// persists it. A re-submitted dead letter is updated in place.
    pub async fn bury(&self, mut task: CreationTask, reason: &str) {
        if let Err(e) = task.abandon(reason) {
            tracing::error!(task_id = task.id, "Refusing to dead-letter task: {e}");
            return;
        }
        increment_tasks_dead();

        let letter = DeadLetter::from_task(&task);
        if let Err(e) = self.persist(task.dead_letter, &letter).await {
            tracing::error!(?letter, "Failed to persist dead letter: {e}");
        }

        // A replay that died on its own row leaves no hole behind.
        let gap = match self
            .store
            .child(letter.parent_id, letter.kind, letter.number)
            .await
        {
            Ok(existing) => existing.is_none(),
            Err(_) => true,
        };

        match (gap, self.gap_policy) {
            (false, _) => tracing::warn!(
                task_id = letter.task_id,
                parent = %task.parent(),
                number = letter.number,
                attempts = letter.attempts,
                "Creation task dead-lettered, row already present: {}",
                letter.last_error
            ),
            (true, GapPolicy::Alert) => {
                add_sequence_gaps(1);
                tracing::error!(
                    task_id = letter.task_id,
                    parent = %task.parent(),
                    number = letter.number,
                    attempts = letter.attempts,
                    "Creation task dead-lettered, permanent sequence gap: {}",
                    letter.last_error
                );
            }
            (true, GapPolicy::Accept) => tracing::info!(
                task_id = letter.task_id,
                parent = %task.parent(),
                number = letter.number,
                attempts = letter.attempts,
                "Creation task dead-lettered, gap accepted: {}",
                letter.last_error
            ),
        }
    }

    async fn persist(&self, requeued_from: Option<i64>, letter: &DeadLetter) -> Result<()> {
        if let Some(id) = requeued_from {
            if self.store.rebury_dead_letter(id, letter).await? {
                return Ok(());
            }
            tracing::warn!(dead_letter = id, "Requeued dead letter vanished; recording anew");
        }
        self.store.record_dead_letter(letter).await.map(drop)
    }
}
