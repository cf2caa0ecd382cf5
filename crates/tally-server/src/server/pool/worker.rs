use super::{DeadLetterSink, QueuedTask, WorkRequest, scheduler::RetryScheduler};
use crate::server::task::{CreationWorker, TaskState};
use tokio::sync::mpsc;

/// Worker task responsible for processing [`WorkRequest`] messages.
///
/// Each worker runs one task attempt at a time, so the pool's concurrency
/// against the durable store equals its worker count. The loop ends on
/// [`WorkRequest::Shutdown`]; anything still queued behind the shutdown
/// request is dead-lettered rather than dropped.
///
/// # Request Types
///
/// - [`WorkRequest::Create`] - runs one attempt and routes the task by its
///   resulting state: `Succeeded` frees the backlog slot, `Retrying` goes to
///   the [`RetryScheduler`], `Dead` goes to the [`DeadLetterSink`].
/// - [`WorkRequest::Shutdown`] - stops the worker and acknowledges.
pub async fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    worker: CreationWorker,
    scheduler: RetryScheduler,
    sink: DeadLetterSink,
) {
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.recv().await {
        match work {
            WorkRequest::Create(queued) => {
                handle_task(queued, &worker, &scheduler, &sink).await;
            }
            WorkRequest::Shutdown { response } => {
                tracing::debug!("Worker {worker_id} received shutdown signal");

                rx.close();
                while let Ok(leftover) = rx.try_recv() {
                    match leftover {
                        WorkRequest::Create(queued) => {
                            sink.bury(queued.task, "worker stopped before running task")
                                .await;
                        }
                        WorkRequest::Shutdown { response } => {
                            let _ = response.send(());
                        }
                    }
                }

                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

async fn handle_task(
    queued: QueuedTask,
    worker: &CreationWorker,
    scheduler: &RetryScheduler,
    sink: &DeadLetterSink,
) {
    let QueuedTask { mut task, permit } = queued;

    match worker.process(&mut task).await {
        Ok(TaskState::Succeeded { .. }) => drop(permit),
        Ok(TaskState::Retrying { backoff, .. }) => {
            scheduler.schedule(QueuedTask { task, permit }, backoff);
        }
        Ok(_) => sink.bury(task, "retry budget exhausted").await,
        Err(e) => {
            let reason = e.to_string();
            sink.bury(task, &reason).await;
        }
    }
}
