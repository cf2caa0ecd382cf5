use super::{CreationTask, RetryPolicy, TaskState};
use crate::common::{
    Error, Result,
    types::{ParentRef, Payload, Persisted},
};
use crate::server::{
    search::Indexer,
    store::SqliteStore,
    telemetry::{increment_tasks_retried, increment_tasks_succeeded, record_task_duration},
};
use core::time::Duration;
use tally::SequenceNumber;
use tokio::{sync::mpsc, time::timeout};

/// Runs single attempts of [`CreationTask`]s against the durable store.
///
/// The worker is stateless and cheap to clone; the pool gives each of its
/// workers a copy.
#[derive(Clone)]
pub struct CreationWorker {
    store: SqliteStore,
    indexer: Indexer,
    increments: mpsc::Sender<ParentRef>,
    policy: RetryPolicy,
    task_timeout: Duration,
}

impl CreationWorker {
    pub fn new(
        store: SqliteStore,
        indexer: Indexer,
        increments: mpsc::Sender<ParentRef>,
        policy: RetryPolicy,
        task_timeout: Duration,
    ) -> Self {
        Self {
            store,
            indexer,
            increments,
            policy,
            task_timeout,
        }
    }

    /// Attempts exactly one insert of `(parent_id, number, payload)`.
    ///
    /// A unique-index violation comes back as [`Error::DuplicateNumber`]; it
    /// is never mapped to success, even when the existing row is an exact
    /// replay.
    pub async fn execute(
        &self,
        parent_id: i64,
        number: SequenceNumber,
        payload: &Payload,
    ) -> Result<Persisted> {
        match timeout(
            self.task_timeout,
            self.store.insert_child(parent_id, number, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::TaskTimeout {
                budget: self.task_timeout,
            }),
        }
    }

    /// Runs the next attempt of `task` and advances its state to
    /// `Succeeded`, `Retrying` or `Dead`.
    ///
    /// # Errors
    ///
    /// Only [`Error::InvalidTransition`], when `task` is not runnable.
    /// Failures of the attempt itself are recorded on the task.
    pub async fn process(&self, task: &mut CreationTask) -> Result<TaskState> {
        let attempt = task.start()?;

        match self.execute(task.parent_id, task.number, &task.payload).await {
            Ok(row) => {
                task.succeed()?;
                increment_tasks_succeeded();
                record_task_duration(task.enqueued_at.elapsed().as_secs_f64() * 1_000.0);
                tracing::trace!(
                    task_id = task.id,
                    parent = %row.parent(),
                    number = task.number,
                    attempt,
                    "Creation task persisted"
                );
                self.after_commit(task, &row).await;
            }
            Err(e) => {
                let state = task.fail(&e, &self.policy)?;
                if let TaskState::Retrying { backoff, .. } = state {
                    increment_tasks_retried();
                    tracing::debug!(
                        task_id = task.id,
                        parent = %task.parent(),
                        number = task.number,
                        attempt,
                        ?backoff,
                        "Creation attempt failed, retrying: {e}"
                    );
                }
            }
        }

        Ok(task.state())
    }

    /// Side effects of a committed row. None of them can fail the task.
    async fn after_commit(&self, task: &CreationTask, row: &Persisted) {
        if let Some(id) = task.dead_letter {
            match self.store.resolve_dead_letter(id).await {
                Ok(_) => tracing::debug!(dead_letter = id, "Requeued dead letter resolved"),
                Err(e) => tracing::warn!(
                    dead_letter = id,
                    "Requeued task persisted but its dead letter was not cleared: {e}"
                ),
            }
        }

        // A dropped increment only delays convergence until the next sweep.
        if let Err(e) = self.increments.try_send(row.parent()) {
            tracing::debug!(parent = %row.parent(), "Counter-cache increment dropped: {e}");
        }

        if let Persisted::Entry(entry) = row {
            self.indexer.index_entry(entry).await;
        }
    }
}
