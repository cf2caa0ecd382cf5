//! End-to-end behaviour of the pipeline behind [`PipelineService`].

use crate::common::{
    Error, Result,
    types::{ParentRef, Payload, now_millis},
};
use crate::server::{
    config::{GapPolicy, PipelineConfig},
    reconciler::Reconciler,
    search::{IndexDocument, MemoryIndex, ReindexSweep, SearchIndex, tests::FlakyIndex},
    service::{gaps::gap_report, handler::PipelineService},
    store::{SqlCounterStore, SqliteStore},
    task::{DeadLetter, DeadLetterStatus, RetryPolicy},
};
use async_trait::async_trait;
use core::time::Duration;
use std::sync::Arc;
use tally::{ChildKind, CounterKey, CounterStore, MemoryCounterStore, NumberAllocator};

const DRAIN: Duration = Duration::from_secs(5);

fn test_config() -> PipelineConfig {
    PipelineConfig {
        num_workers: 2,
        max_backlog: 64,
        retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
        },
        allocate_timeout: Duration::from_millis(50),
        task_timeout: Duration::from_secs(2),
        index_timeout: Duration::from_millis(500),
        reconcile_interval: Duration::from_secs(3_600),
        reindex_batch_size: 4,
        shutdown_timeout: Duration::from_secs(2),
        gap_policy: GapPolicy::Alert,
    }
}

async fn start_on(
    store: SqliteStore,
    config: PipelineConfig,
    index: Arc<dyn SearchIndex>,
) -> PipelineService {
    let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    PipelineService::start(config, store, counters, index)
        .await
        .unwrap()
}

async fn start(config: PipelineConfig, index: Arc<dyn SearchIndex>) -> PipelineService {
    start_on(SqliteStore::in_memory().await.unwrap(), config, index).await
}

/// A pipeline on the file database at `url` with its own SQL counter
/// connection, as `serve` runs by default.
async fn start_shared(url: &str, config: PipelineConfig) -> PipelineService {
    let store = SqliteStore::connect(url, 1).await.unwrap();
    let counters: Arc<dyn CounterStore> = Arc::new(SqlCounterStore::connect(url).await.unwrap());
    PipelineService::start(config, store, counters, Arc::new(MemoryIndex::new()))
        .await
        .unwrap()
}

/// Creates a tenant and one persisted thread. Returns their ids.
async fn tenant_and_thread(service: &PipelineService, token: &str) -> (i64, i64) {
    let tenant = service.create_tenant(token, "Acme").await.unwrap();
    let receipt = service.create_thread(tenant.id).await.unwrap();
    assert!(service.drain(DRAIN).await);
    let thread = service
        .store()
        .thread_by_number(tenant.id, receipt.number)
        .await
        .unwrap()
        .unwrap();
    (tenant.id, thread.id)
}

/// Waits for the incremental counter path to settle on `expected`.
async fn wait_for_cached_count(store: &SqliteStore, parent: ParentRef, expected: i64) {
    let settled = tokio::time::timeout(DRAIN, async {
        while store.cached_count(parent).await.unwrap() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "{parent} never reached {expected}");
}

/// An index whose writes never complete.
struct StalledIndex;

#[async_trait]
impl SearchIndex for StalledIndex {
    async fn upsert(&self, _doc: IndexDocument) -> Result<()> {
        std::future::pending().await
    }

    async fn search(&self, _: i64, _: &str, _: usize) -> Result<Vec<IndexDocument>> {
        Ok(Vec::new())
    }

    async fn remove_parents(&self, _: &[i64]) -> Result<u64> {
        Ok(0)
    }

    async fn clear(&self) -> Result<u64> {
        Ok(0)
    }

    async fn count(&self) -> Result<u64> {
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_creations_get_distinct_numbers_and_an_exact_count() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (tenant_id, thread_id) = tenant_and_thread(&service, "acme").await;

    let creations = (0..3).map(|i| {
        let service = service.clone();
        tokio::spawn(async move { service.create_entry(thread_id, format!("entry {i}")).await })
    });
    let mut numbers: Vec<_> = futures::future::join_all(creations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, [1, 2, 3]);

    assert!(service.drain(DRAIN).await);
    let parent = ParentRef::thread(thread_id);
    wait_for_cached_count(service.store(), parent, 3).await;
    wait_for_cached_count(service.store(), ParentRef::tenant(tenant_id), 1).await;

    sqlx::query("UPDATE threads SET cached_child_count = 42 WHERE id = ?")
        .bind(thread_id)
        .execute(service.store().pool())
        .await
        .unwrap();
    let report = service.sweep_counts().await.unwrap();
    assert_eq!(report.corrected, 1);
    assert_eq!(report.drift, 39);
    assert_eq!(service.store().cached_count(parent).await.unwrap(), Some(3));

    service.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_round_trips_through_the_pipeline() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    let body = "Zoë's first note: ünïcödé & \"quotes\"";
    let receipt = service.create_entry(thread_id, body).await.unwrap();
    assert_eq!(receipt.kind, ChildKind::Entry);
    assert_eq!(receipt.parent_id, thread_id);
    assert!(service.drain(DRAIN).await);

    let entry = service
        .store()
        .entry(thread_id, receipt.number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.body, body);

    let hits = service.search(thread_id, "FIRST note", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, entry.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn conflicting_row_exhausts_retries_and_is_dead_lettered() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    // A row the allocator does not know about.
    service
        .store()
        .insert_child(thread_id, 1, &Payload::entry("squatter"))
        .await
        .unwrap();

    let receipt = service.create_entry(thread_id, "mine").await.unwrap();
    assert_eq!(receipt.number, 1);
    assert!(service.drain(DRAIN).await);

    let letters = service.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    let letter = &letters[0].letter;
    assert_eq!((letter.parent_id, letter.number), (thread_id, 1));
    assert_eq!(letter.attempts, 3);
    assert!(letter.last_error.contains("Duplicate"));

    let entry = service.store().entry(thread_id, 1).await.unwrap().unwrap();
    assert_eq!(entry.body, "squatter");

    // The number is burned; the next creation moves on.
    let next = service.create_entry(thread_id, "mine again").await.unwrap();
    assert_eq!(next.number, 2);
    assert!(service.drain(DRAIN).await);
    assert!(service.store().entry(thread_id, 2).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_task_never_writes_a_second_row() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    let receipt = service.create_entry(thread_id, "hello").await.unwrap();
    assert!(service.drain(DRAIN).await);

    service
        .resubmit(thread_id, receipt.number, Payload::entry("hello"))
        .await
        .unwrap();
    assert!(service.drain(DRAIN).await);

    let key = CounterKey::new(thread_id, ChildKind::Entry);
    assert_eq!(service.store().persisted_numbers(key).await.unwrap(), [1]);
    assert_eq!(service.dead_letters(10).await.unwrap().len(), 1);

    let parent = ParentRef::thread(thread_id);
    wait_for_cached_count(service.store(), parent, 1).await;
    service.sweep_counts().await.unwrap();
    assert_eq!(service.store().cached_count(parent).await.unwrap(), Some(1));

    // Nothing is missing: the dead replay's row exists.
    let gaps = service.gap_report(10).await.unwrap();
    assert!(gaps.iter().all(|gap| gap.parent_id != thread_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn resubmit_refuses_numbers_never_allocated() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    for number in [0, 1, 7] {
        let err = service
            .resubmit(thread_id, number, Payload::entry("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }), "{number}: {err}");
    }
    assert_eq!(service.backlog(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn index_outage_is_invisible_to_callers_and_repaired_by_reindex() {
    let index = Arc::new(FlakyIndex::default());
    let service = start(test_config(), index.clone()).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    index.set_down(true);
    for i in 0..10 {
        service
            .create_entry(thread_id, format!("note {i}"))
            .await
            .unwrap();
    }
    assert!(service.drain(DRAIN).await);

    assert_eq!(service.store().entry_count().await.unwrap(), 10);
    assert_eq!(index.count().await.unwrap(), 0);
    assert!(service.dead_letters(10).await.unwrap().is_empty());

    index.set_down(false);
    let report = service.reindex(false, 0).await.unwrap();
    assert_eq!(report.scanned, 10);
    assert_eq!(report.indexed, 10);
    assert_eq!(index.count().await.unwrap(), 10);

    let hits = service.search(thread_id, "note", 100).await.unwrap();
    assert_eq!(hits.len(), 10);

    // Idempotent.
    service.reindex(false, 0).await.unwrap();
    assert_eq!(index.count().await.unwrap(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_backlog_rejects_without_burning_a_number() {
    let config = PipelineConfig {
        num_workers: 1,
        max_backlog: 1,
        ..test_config()
    };
    let service = start(config, Arc::new(StalledIndex)).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    // Indexing stalls, so this task holds the only slot for a while.
    let first = service.create_entry(thread_id, "slow").await.unwrap();
    assert_eq!(first.number, 1);

    let err = service.create_entry(thread_id, "rejected").await.unwrap_err();
    assert!(matches!(err, Error::Backpressure { limit: 1 }));
    assert_eq!(
        service.high_water_mark(thread_id, ChildKind::Entry).await.unwrap(),
        1
    );

    assert!(service.drain(DRAIN).await);
    let second = service.create_entry(thread_id, "accepted").await.unwrap();
    assert_eq!(second.number, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_task_on_a_deleted_parent_is_reported_as_a_gap() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (tenant_id, thread_id) = tenant_and_thread(&service, "acme").await;

    let number = service
        .allocator()
        .allocate(thread_id, ChildKind::Entry)
        .await
        .unwrap();
    assert!(service.delete_tenant(tenant_id).await.unwrap());

    service
        .resubmit(thread_id, number, Payload::entry("orphan"))
        .await
        .unwrap();
    assert!(service.drain(DRAIN).await);

    let letters = service.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].letter.attempts, 1);

    let gaps = service.gap_report(10).await.unwrap();
    let gap = gaps
        .iter()
        .find(|gap| gap.parent_id == thread_id && gap.kind == ChildKind::Entry)
        .unwrap();
    assert_eq!(gap.high_water_mark, 1);
    assert_eq!(gap.max_persisted, 0);
    assert_eq!(gap.missing, [1]);
    assert_eq!(gap.dead_lettered, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn requeued_dead_letter_fills_its_gap() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    let number = service
        .allocator()
        .allocate(thread_id, ChildKind::Entry)
        .await
        .unwrap();
    let id = service
        .store()
        .record_dead_letter(&DeadLetter {
            task_id: 99,
            parent_id: thread_id,
            kind: ChildKind::Entry,
            number,
            payload: Payload::entry("second chance"),
            attempts: 5,
            last_error: "database is locked".to_string(),
            dead_at: now_millis(),
        })
        .await
        .unwrap();
    assert_eq!(service.gap_report(10).await.unwrap().len(), 1);

    service.requeue_dead_letter(id).await.unwrap();
    assert!(service.drain(DRAIN).await);

    let entry = service
        .store()
        .entry(thread_id, number)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.body, "second chance");
    assert!(service.dead_letters(10).await.unwrap().is_empty());
    assert!(service.gap_report(10).await.unwrap().is_empty());

    let err = service.requeue_dead_letter(id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn requeued_letter_that_dies_again_is_updated_in_place() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (_, thread_id) = tenant_and_thread(&service, "acme").await;

    let number = service
        .allocator()
        .allocate(thread_id, ChildKind::Entry)
        .await
        .unwrap();
    service
        .store()
        .insert_child(thread_id, number, &Payload::entry("squatter"))
        .await
        .unwrap();
    let id = service
        .store()
        .record_dead_letter(&DeadLetter {
            task_id: 99,
            parent_id: thread_id,
            kind: ChildKind::Entry,
            number,
            payload: Payload::entry("mine"),
            attempts: 5,
            last_error: "database is locked".to_string(),
            dead_at: now_millis(),
        })
        .await
        .unwrap();

    let task_id = service.requeue_dead_letter(id).await.unwrap();
    assert!(service.drain(DRAIN).await);

    let letters = service.dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
    assert_eq!(letters[0].status, DeadLetterStatus::Dead);
    assert_eq!(letters[0].letter.task_id, task_id);
    assert_eq!(letters[0].letter.attempts, 3);
    assert!(letters[0].letter.last_error.contains("Duplicate"));

    // Dead again, so it can be requeued again.
    service.requeue_dead_letter(id).await.unwrap();
    assert!(service.drain(DRAIN).await);
    assert_eq!(service.dead_letters(10).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn instances_sharing_a_database_never_hand_out_the_same_number() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tally.db").display());
    let config = PipelineConfig {
        allocate_timeout: Duration::from_millis(250),
        ..test_config()
    };
    let a = start_shared(&url, config.clone()).await;
    let b = start_shared(&url, config).await;
    let tenant_id = a.create_tenant("acme", "Acme").await.unwrap().id;

    let creations = (0..20).map(|i| {
        let service = if i % 2 == 0 { a.clone() } else { b.clone() };
        tokio::spawn(async move { service.create_thread(tenant_id).await })
    });
    let mut numbers: Vec<_> = futures::future::join_all(creations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().number)
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=20).collect::<Vec<_>>());

    assert!(a.drain(DRAIN).await);
    assert!(b.drain(DRAIN).await);
    assert_eq!(a.store().dead_letter_count().await.unwrap(), 0);
    let key = CounterKey::new(tenant_id, ChildKind::Thread);
    assert_eq!(
        b.store().persisted_numbers(key).await.unwrap(),
        (1..=20).collect::<Vec<_>>()
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();

    // A restarted instance continues from the shared counter.
    let c = start_shared(&url, test_config()).await;
    assert_eq!(c.high_water_mark(tenant_id, ChildKind::Thread).await.unwrap(), 20);
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn maintenance_runs_without_a_pipeline() {
    let store = SqliteStore::in_memory().await.unwrap();
    let tenant = store.create_tenant("acme", "Acme").await.unwrap();
    let thread_id = store
        .insert_child(tenant.id, 1, &Payload::Thread)
        .await
        .unwrap()
        .id();
    for number in [1, 2, 4] {
        store
            .insert_child(thread_id, number, &Payload::entry(format!("note {number}")))
            .await
            .unwrap();
    }
    store
        .record_dead_letter(&DeadLetter {
            task_id: 1,
            parent_id: thread_id,
            kind: ChildKind::Entry,
            number: 5,
            payload: Payload::entry("lost"),
            attempts: 5,
            last_error: "database is locked".to_string(),
            dead_at: now_millis(),
        })
        .await
        .unwrap();

    let report = Reconciler::new(store.clone(), Duration::from_secs(3_600))
        .sweep()
        .await
        .unwrap();
    assert_eq!(report.corrected, 2);
    assert_eq!(
        store.cached_count(ParentRef::thread(thread_id)).await.unwrap(),
        Some(3)
    );

    let index = Arc::new(MemoryIndex::new());
    let reindexed = ReindexSweep::new(store.clone(), index.clone(), 2)
        .rebuild()
        .await
        .unwrap();
    assert_eq!(reindexed.indexed, 3);

    // Fresh in-process counters know nothing until recovered.
    let counters: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
    assert!(gap_report(&store, counters.as_ref(), 10).await.unwrap().is_empty());
    NumberAllocator::new(Arc::clone(&counters))
        .recover(store.max_numbers().await.unwrap())
        .await
        .unwrap();

    let gaps = gap_report(&store, counters.as_ref(), 10).await.unwrap();
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].parent_id, thread_id);
    assert_eq!(gaps[0].missing, [3, 5]);
    assert_eq!(gaps[0].dead_lettered, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_raises_counters_past_every_known_number() {
    let store = SqliteStore::in_memory().await.unwrap();
    let tenant = store.create_tenant("acme", "Acme").await.unwrap();
    for number in 1..=3 {
        store
            .insert_child(tenant.id, number, &Payload::Thread)
            .await
            .unwrap();
    }
    store
        .record_dead_letter(&DeadLetter {
            task_id: 1,
            parent_id: tenant.id,
            kind: ChildKind::Thread,
            number: 5,
            payload: Payload::Thread,
            attempts: 5,
            last_error: "lost".to_string(),
            dead_at: now_millis(),
        })
        .await
        .unwrap();

    let service = start_on(store, test_config(), Arc::new(MemoryIndex::new())).await;
    let receipt = service.create_thread(tenant.id).await.unwrap();
    assert_eq!(receipt.number, 6);
    assert_eq!(service.rebuild_counters().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_parent_fails_before_allocation() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;

    let err = service.create_thread(404).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = service.create_entry(404, "nowhere").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    assert_eq!(
        service.high_water_mark(404, ChildKind::Thread).await.unwrap(),
        0
    );
    assert_eq!(service.backlog(), 0);

    let err = service.create_tenant("  ", "Blank").await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_a_tenant_cascades_to_rows_and_index() {
    let index = Arc::new(MemoryIndex::new());
    let service = start(test_config(), index.clone()).await;
    let (tenant_id, thread_id) = tenant_and_thread(&service, "acme").await;
    let (_, other_thread) = tenant_and_thread(&service, "globex").await;

    service.create_entry(thread_id, "one").await.unwrap();
    service.create_entry(thread_id, "two").await.unwrap();
    service.create_entry(other_thread, "three").await.unwrap();
    assert!(service.drain(DRAIN).await);
    assert_eq!(index.count().await.unwrap(), 3);

    assert!(service.delete_tenant(tenant_id).await.unwrap());
    assert!(service.store().tenant(tenant_id).await.unwrap().is_none());
    assert!(service.store().thread(thread_id).await.unwrap().is_none());
    assert_eq!(service.store().entry_count().await.unwrap(), 1);
    assert_eq!(index.count().await.unwrap(), 1);

    assert!(!service.delete_tenant(tenant_id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_refuses_new_work() {
    let service = start(test_config(), Arc::new(MemoryIndex::new())).await;
    let (tenant_id, thread_id) = tenant_and_thread(&service, "acme").await;
    service.create_entry(thread_id, "last one").await.unwrap();

    service.shutdown().await.unwrap();

    // Admitted work finished before the pool stopped.
    assert!(service.store().entry(thread_id, 1).await.unwrap().is_some());
    assert_eq!(service.backlog(), 0);

    let err = service.create_thread(tenant_id).await.unwrap_err();
    assert!(matches!(err, Error::ServiceShutdown));
    let err = service.create_entry(thread_id, "too late").await.unwrap_err();
    assert!(matches!(err, Error::ServiceShutdown));
}
