//! Pipeline service for per-parent sequence allocation.
//!
//! This module defines [`PipelineService`], the single entry point request
//! handlers use to create children. A creation request is answered as soon
//! as its number is allocated and its task enqueued; persistence, counter
//! maintenance and indexing happen behind it.
//!
//! ## Responsibilities
//!
//! - Rebuild allocation counters from the durable store at startup.
//! - Spawn and manage the creation worker pool and the reconciler.
//! - Enforce backpressure before any number is allocated.
//! - Expose the maintenance operations: sweeps, gap reports, dead letters.
//! - Coordinate graceful shutdown.

use crate::common::{
    Error, Result,
    types::{ParentRef, Payload, Receipt, Tenant},
};
use crate::server::{
    config::PipelineConfig,
    pool::{DeadLetterSink, WorkerPool},
    reconciler::{Reconciler, SweepReport},
    search::{IndexDocument, Indexer, ReindexReport, ReindexSweep, SearchIndex},
    service::gaps::{SequenceGap, gap_report},
    store::SqliteStore,
    task::{CreationWorker, DeadLetterRecord},
    telemetry::{increment_allocation_failures, increment_allocations},
};
use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;
use tally::{ChildKind, CounterStore, NumberAllocator, SequenceNumber};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Upper bound on search results per query.
pub const MAX_SEARCH_LIMIT: usize = 1_000;

/// Handle to a running pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PipelineService {
    inner: Arc<Inner>,
}

struct Inner {
    config: PipelineConfig,
    store: SqliteStore,
    allocator: NumberAllocator<Arc<dyn CounterStore>>,
    index: Arc<dyn SearchIndex>,
    pool: WorkerPool,
    reconciler: Reconciler,
    reconciler_token: CancellationToken,
    reconciler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineService {
    /// Recovers the counters, then spawns the worker pool and the reconciler.
    ///
    /// Counters are raised to the highest number the durable store knows of
    /// (persisted or dead-lettered) before the first allocation, so a counter
    /// store that lost its state never reissues a number.
    pub async fn start(
        config: PipelineConfig,
        store: SqliteStore,
        counters: Arc<dyn CounterStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let allocator = NumberAllocator::with_timeout(counters, config.allocate_timeout);
        let raised = allocator.recover(store.max_numbers().await?).await?;
        tracing::info!(raised, "Allocation counters recovered from the durable store");

        let (increments_tx, increments_rx) = mpsc::channel(config.max_backlog.max(1));
        let worker = CreationWorker::new(
            store.clone(),
            Indexer::new(Arc::clone(&index), config.index_timeout),
            increments_tx,
            config.retry,
            config.task_timeout,
        );
        let sink = DeadLetterSink::new(store.clone(), config.gap_policy);
        let pool = WorkerPool::spawn(
            config.num_workers,
            config.max_backlog,
            worker,
            sink,
            config.shutdown_timeout,
        );

        let reconciler = Reconciler::new(store.clone(), config.reconcile_interval);
        let reconciler_token = CancellationToken::new();
        let handle = reconciler
            .clone()
            .spawn(increments_rx, reconciler_token.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                allocator,
                index,
                pool,
                reconciler,
                reconciler_token,
                reconciler_handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    pub fn allocator(&self) -> &NumberAllocator<Arc<dyn CounterStore>> {
        &self.inner.allocator
    }

    /// Creates a tenant synchronously.
    pub async fn create_tenant(&self, external_token: &str, display_name: &str) -> Result<Tenant> {
        if external_token.trim().is_empty() {
            return Err(Error::InvalidRequest {
                reason: "external token must not be empty".to_string(),
            });
        }
        self.inner
            .store
            .create_tenant(external_token, display_name)
            .await
    }

    /// Allocates the next thread number under `tenant_id` and enqueues its
    /// creation.
    pub async fn create_thread(&self, tenant_id: i64) -> Result<Receipt> {
        self.create_child(tenant_id, Payload::Thread).await
    }

    /// Allocates the next entry number under `thread_id` and enqueues its
    /// creation.
    pub async fn create_entry(&self, thread_id: i64, body: impl Into<String>) -> Result<Receipt> {
        self.create_child(thread_id, Payload::entry(body)).await
    }

    /// The request path: reserve a backlog slot, allocate, enqueue, answer.
    ///
    /// # Errors
    ///
    /// - [`Error::Backpressure`] / [`Error::ServiceShutdown`] before
    ///   allocation; no number is consumed.
    /// - [`Error::NotFound`] if the parent does not exist.
    /// - [`Error::AllocatorUnavailable`] if the counter store fails. No
    ///   number is synthesized.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(kind = %payload.kind()))]
    pub async fn create_child(&self, parent_id: i64, payload: Payload) -> Result<Receipt> {
        let kind = payload.kind();
        let permit = self.inner.pool.reserve()?;

        let parent = ParentRef::of_child(kind, parent_id);
        if !self.inner.store.parent_exists(parent).await? {
            return Err(Error::not_found(parent.to_string()));
        }

        let number = match self.inner.allocator.allocate(parent_id, kind).await {
            Ok(number) => number,
            Err(e) => {
                increment_allocation_failures();
                tracing::warn!(%parent, "Allocation failed: {e}");
                return Err(e.into());
            }
        };
        increment_allocations();

        let task_id = self
            .inner
            .pool
            .submit(permit, parent_id, number, payload)
            .await?;

        Ok(Receipt {
            task_id,
            parent_id,
            kind,
            number,
        })
    }

    /// Enqueues a creation task for a number that was already allocated,
    /// e.g. to replay a task. Never allocates.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if `number` was never handed out.
    pub async fn resubmit(
        &self,
        parent_id: i64,
        number: SequenceNumber,
        payload: Payload,
    ) -> Result<u64> {
        let permit = self.inner.pool.reserve()?;
        self.ensure_allocated(parent_id, payload.kind(), number)
            .await?;
        self.inner
            .pool
            .submit(permit, parent_id, number, payload)
            .await
    }

    /// Re-submits dead letter `id` under its original number.
    ///
    /// The letter is marked `requeued` rather than removed: it is deleted
    /// once the row persists, and updated in place if the task dies again.
    pub async fn requeue_dead_letter(&self, id: i64) -> Result<u64> {
        let permit = self.inner.pool.reserve()?;
        let record = self.inner.store.mark_requeued(id).await?;
        tracing::info!(
            dead_letter = id,
            parent_id = record.letter.parent_id,
            number = record.letter.number,
            "Re-submitting dead letter"
        );
        self.inner.pool.requeue(permit, record).await
    }

    /// Returns a requeued dead letter whose task was lost (e.g. to a crash)
    /// to `dead`, so it can be requeued again.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `id` is not a requeued letter.
    pub async fn release_dead_letter(&self, id: i64) -> Result<()> {
        if self.inner.store.release_dead_letter(id).await? {
            tracing::info!(dead_letter = id, "Requeued dead letter released");
            Ok(())
        } else {
            Err(Error::not_found(format!("requeued dead letter {id}")))
        }
    }

    async fn ensure_allocated(
        &self,
        parent_id: i64,
        kind: ChildKind,
        number: SequenceNumber,
    ) -> Result<()> {
        let high_water_mark = self.high_water_mark(parent_id, kind).await?;
        if number < 1 || number > high_water_mark {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "{kind} number {number} under parent {parent_id} was never allocated \
                     (high-water mark {high_water_mark})"
                ),
            });
        }
        Ok(())
    }

    pub async fn high_water_mark(&self, parent_id: i64, kind: ChildKind) -> Result<SequenceNumber> {
        Ok(self.inner.allocator.high_water_mark(parent_id, kind).await?)
    }

    /// Deletes a tenant with all descendants, then removes their documents
    /// from the search index on a best-effort basis.
    pub async fn delete_tenant(&self, tenant_id: i64) -> Result<bool> {
        let threads = self.inner.store.thread_ids(tenant_id).await?;
        if !self.inner.store.delete_tenant(tenant_id).await? {
            return Ok(false);
        }

        if !threads.is_empty() {
            match self.inner.index.remove_parents(&threads).await {
                Ok(removed) => tracing::debug!(tenant_id, removed, "Index cleaned after delete"),
                Err(e) => tracing::warn!(
                    tenant_id,
                    "Index cleanup failed; a full reindex will drop the documents: {e}"
                ),
            }
        }
        Ok(true)
    }

    /// Entries of `thread_id` whose body contains every term of `query`.
    pub async fn search(
        &self,
        thread_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        self.inner.index.search(thread_id, query, limit).await
    }

    /// Allocated numbers that have no row, per counter.
    pub async fn gap_report(&self, max_missing: usize) -> Result<Vec<SequenceGap>> {
        gap_report(
            &self.inner.store,
            self.inner.allocator.store().as_ref(),
            max_missing,
        )
        .await
    }

    /// Raises every counter to the durable store's maximum. Returns how many
    /// counters moved.
    pub async fn rebuild_counters(&self) -> Result<usize> {
        let floors = self.inner.store.max_numbers().await?;
        Ok(self.inner.allocator.recover(floors).await?)
    }

    /// Runs one authoritative counter-cache sweep now.
    pub async fn sweep_counts(&self) -> Result<SweepReport> {
        self.inner.reconciler.sweep().await
    }

    /// Republishes durable entries with `id > after` into the index. `full`
    /// clears the index first and always starts from the beginning.
    pub async fn reindex(&self, full: bool, after: i64) -> Result<ReindexReport> {
        let sweep = ReindexSweep::new(
            self.inner.store.clone(),
            Arc::clone(&self.inner.index),
            self.inner.config.reindex_batch_size,
        );
        if full {
            sweep.rebuild().await
        } else {
            sweep.resume_after(after).await
        }
    }

    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetterRecord>> {
        self.inner.store.dead_letters(limit).await
    }

    /// Admitted tasks not yet terminal.
    pub fn backlog(&self) -> usize {
        self.inner.pool.backlog()
    }

    /// Waits until every admitted task is terminal, or `budget` elapses.
    pub async fn drain(&self, budget: Duration) -> bool {
        self.inner.pool.drain(budget).await
    }

    /// Initiates a graceful shutdown.
    ///
    /// Admission closes first; the backlog drains within the configured
    /// timeout; retries still waiting are dead-lettered; workers and then
    /// the reconciler stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.pool.shutdown().await?;

        self.inner.reconciler_token.cancel();
        let handle = self.inner.reconciler_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Reconciler task failed: {e}");
            }
        }

        tracing::info!("Pipeline shut down");
        Ok(())
    }
}
