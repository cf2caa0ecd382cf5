//! Asynchronous worker pool for creation tasks.
//!
//! This module defines the [`WorkerPool`] struct, which admits creation tasks
//! under a bounded backlog and distributes them to a set of asynchronous
//! workers using round-robin scheduling. It supports coordinated shutdown via
//! a shared [`CancellationToken`].
//!
//! Each worker listens on its own [`mpsc::Receiver`]. Channels are sized to
//! the backlog limit, so a dispatch never waits on a full channel: the
//! semaphore is the only place producers are turned away.

use super::{
    BacklogPermit, DeadLetterSink, QueuedTask, WorkRequest, scheduler::RetryScheduler,
    worker::worker_loop,
};
use crate::common::{Error, Result, types::Payload};
use crate::server::{
    task::{CreationTask, CreationWorker, DeadLetterRecord},
    telemetry::increment_backpressure_rejections,
};
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tally::SequenceNumber;
use tokio::{
    sync::{Semaphore, TryAcquireError, mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

/// Round-robin sender side of the worker channels.
#[derive(Clone)]
pub struct Dispatcher {
    workers: Arc<[mpsc::Sender<WorkRequest>]>,
    next_worker: Arc<AtomicUsize>,
}

impl Dispatcher {
    fn new(workers: Vec<mpsc::Sender<WorkRequest>>) -> Self {
        Self {
            workers: workers.into(),
            next_worker: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the index of the next worker to receive work (round-robin).
    ///
    /// Uses a relaxed atomic increment to minimize contention.
    pub fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Sends `queued` to the next worker. Hands the task back if the worker's
    /// channel is closed.
    pub async fn dispatch(&self, queued: QueuedTask) -> core::result::Result<(), QueuedTask> {
        let worker_idx = self.next_worker_index();
        match self.workers[worker_idx]
            .send(WorkRequest::Create(queued))
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(WorkRequest::Create(queued))) => Err(queued),
            Err(mpsc::error::SendError(WorkRequest::Shutdown { .. })) => Ok(()),
        }
    }
}

/// A cooperative pool of asynchronous workers that persist
/// [`CreationTask`]s.
pub struct WorkerPool {
    dispatcher: Dispatcher,
    semaphore: Arc<Semaphore>,
    max_backlog: usize,
    sink: DeadLetterSink,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
    next_task_id: AtomicU64,
}

impl WorkerPool {
    /// Spawns `num_workers` workers, each with its own copy of `worker`.
    pub fn spawn(
        num_workers: usize,
        max_backlog: usize,
        worker: CreationWorker,
        sink: DeadLetterSink,
        shutdown_timeout: Duration,
    ) -> Self {
        let num_workers = num_workers.max(1);
        let max_backlog = max_backlog.max(1);
        let shutdown_token = CancellationToken::new();

        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            // Capacity matches the backlog so re-dispatching a retry never
            // blocks behind admissions.
            let (tx, rx) = mpsc::channel(max_backlog);
            senders.push(tx);
            receivers.push(rx);
        }

        let dispatcher = Dispatcher::new(senders);
        let scheduler =
            RetryScheduler::new(dispatcher.clone(), sink.clone(), shutdown_token.clone());

        for (worker_id, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(worker_loop(
                worker_id,
                rx,
                worker.clone(),
                scheduler.clone(),
                sink.clone(),
            ));
        }

        Self {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(max_backlog)),
            max_backlog,
            sink,
            shutdown_token,
            shutdown_timeout,
            next_task_id: AtomicU64::new(1),
        }
    }

    /// Reserves one backlog slot without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Backpressure`] if the backlog is full.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    pub fn reserve(&self) -> Result<BacklogPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(BacklogPermit::new(permit)),
            Err(TryAcquireError::NoPermits) => {
                increment_backpressure_rejections();
                Err(Error::Backpressure {
                    limit: self.max_backlog,
                })
            }
            Err(TryAcquireError::Closed) => Err(Error::ServiceShutdown),
        }
    }

    /// Enqueues a creation task for an already-allocated `number`.
    ///
    /// The number is never lost: if no worker can take the task, it is
    /// dead-lettered before this returns.
    pub async fn submit(
        &self,
        permit: BacklogPermit,
        parent_id: i64,
        number: SequenceNumber,
        payload: Payload,
    ) -> Result<u64> {
        let task = CreationTask::new(self.next_task_id(), parent_id, number, payload);
        self.enqueue(permit, task).await
    }

    /// Enqueues the re-submission of a requeued dead letter under its
    /// original number.
    pub async fn requeue(&self, permit: BacklogPermit, record: DeadLetterRecord) -> Result<u64> {
        let DeadLetterRecord { id, letter, .. } = record;
        let task = CreationTask::new(
            self.next_task_id(),
            letter.parent_id,
            letter.number,
            letter.payload,
        )
        .with_dead_letter(id);
        self.enqueue(permit, task).await
    }

    fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn enqueue(&self, permit: BacklogPermit, task: CreationTask) -> Result<u64> {
        let task_id = task.id;
        match self.dispatcher.dispatch(QueuedTask { task, permit }).await {
            Ok(()) => Ok(task_id),
            Err(queued) => {
                self.sink.bury(queued.task, "worker pool closed at submission").await;
                Err(Error::ChannelError {
                    context: format!("no worker accepted task {task_id}"),
                })
            }
        }
    }

    /// Admitted tasks that have not reached a terminal state.
    pub fn backlog(&self) -> usize {
        self.max_backlog
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Waits until every admitted task is terminal, or `budget` elapses.
    /// Returns whether the backlog drained.
    pub async fn drain(&self, budget: Duration) -> bool {
        timeout(budget, async {
            while self.backlog() > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Gracefully shuts down the pool.
    ///
    /// - Closes admission, so new requests fail with
    ///   [`Error::ServiceShutdown`].
    /// - Waits up to the shutdown timeout for the backlog to drain.
    /// - Cancels the shared [`CancellationToken`]; tasks waiting on a retry
    ///   backoff are dead-lettered.
    /// - Sends a [`WorkRequest::Shutdown`] to each worker and waits (up to 3
    ///   seconds per worker) for acknowledgements.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new tasks ===
        tracing::info!("Refusing new creation tasks");
        self.semaphore.close();

        // === Phase 1: Wait for in-flight tasks to drain ===
        tracing::info!("Draining creation backlog ({} tasks)", self.backlog());
        if self.drain(self.shutdown_timeout).await {
            tracing::debug!("Creation backlog drained");
        } else {
            tracing::warn!(
                "Graceful drain timed out ({} tasks outstanding)",
                self.backlog()
            );
        }

        // === Phase 2: Cancel pending retries ===
        tracing::debug!("Cancelling pending retries via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.dispatcher.workers.len());

        for (i, worker) in self.dispatcher.workers.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if let Err(e) = worker.send(WorkRequest::Shutdown { response: tx }).await {
                tracing::error!("Failed to send shutdown to worker {i}: {e}");
            } else {
                shutdown_handles.push((i, rx));
            }
        }

        tracing::debug!("Waiting for up to 3s per worker for shutdown acknowledgements");

        let timeout_futures = shutdown_handles.into_iter().map(|(i, rx)| async move {
            match timeout(Duration::from_secs(3), rx).await {
                Ok(Ok(())) => tracing::trace!("Worker {i} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("Worker {i} returned error: {e}"),
                Err(_) => tracing::warn!("Worker {i} shutdown timed out"),
            }
        });

        futures::future::join_all(timeout_futures).await;

        // Dead-lettering cancelled retries releases their slots.
        self.drain(Duration::from_secs(1)).await;

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}
