use super::*;
use crate::common::{Error, Result, types::Payload};
use crate::server::store::SqliteStore;
use async_trait::async_trait;
use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A [`MemoryIndex`] that can be taken offline.
#[derive(Default)]
pub(crate) struct FlakyIndex {
    inner: MemoryIndex,
    down: AtomicBool,
}

impl FlakyIndex {
    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchIndex for FlakyIndex {
    async fn upsert(&self, doc: IndexDocument) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::IndexingFailure {
                entry_id: doc.id,
                reason: "index offline".to_string(),
            });
        }
        self.inner.upsert(doc).await
    }

    async fn search(
        &self,
        parent_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexDocument>> {
        self.inner.search(parent_id, query, limit).await
    }

    async fn remove_parents(&self, parent_ids: &[i64]) -> Result<u64> {
        self.inner.remove_parents(parent_ids).await
    }

    async fn clear(&self) -> Result<u64> {
        self.inner.clear().await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }
}

struct StalledIndex;

#[async_trait]
impl SearchIndex for StalledIndex {
    async fn upsert(&self, _doc: IndexDocument) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
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

fn doc(id: i64, parent_id: i64, body: &str) -> IndexDocument {
    IndexDocument {
        id,
        parent_id,
        body: body.to_string(),
        indexed_at: 0,
    }
}

/// A store with one tenant, one thread and `n` entries numbered `1..=n`.
async fn seeded_store(n: i64) -> (SqliteStore, i64) {
    let store = SqliteStore::in_memory().await.unwrap();
    let tenant = store.create_tenant("tok", "Tenant").await.unwrap();
    let thread = store
        .insert_child(tenant.id, 1, &Payload::Thread)
        .await
        .unwrap();
    for number in 1..=n {
        store
            .insert_child(thread.id(), number, &Payload::entry(format!("entry {number}")))
            .await
            .unwrap();
    }
    (store, thread.id())
}

#[test]
fn tokenize_lowercases_and_splits_on_punctuation() {
    assert_eq!(tokenize("Hello, World! it's"), ["hello", "world", "it", "s"]);
    assert!(tokenize("  ...  ").is_empty());
}

#[test]
fn every_term_must_match_a_whole_token() {
    let terms = tokenize("quick FOX");
    assert!(matches_all("The quick brown fox", &terms));
    assert!(!matches_all("The quick brown dog", &terms));
    assert!(!matches_all("quickly foxes", &terms));
    assert!(!matches_all("anything", &[]));
}

#[tokio::test]
async fn memory_search_is_scoped_to_parent() {
    let index = MemoryIndex::new();
    index.upsert(doc(1, 10, "deploy the service")).await.unwrap();
    index.upsert(doc(2, 10, "Service restarted")).await.unwrap();
    index.upsert(doc(3, 11, "service elsewhere")).await.unwrap();

    let hits = index.search(10, "SERVICE", 10).await.unwrap();
    assert_eq!(hits.iter().map(|d| d.id).collect::<Vec<_>>(), [1, 2]);

    let hits = index.search(10, "service", 1).await.unwrap();
    assert_eq!(hits.len(), 1);

    assert!(index.search(10, "", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_index_upserts_by_id() {
    let index = SqliteIndex::in_memory().await.unwrap();
    index.upsert(doc(1, 10, "first draft")).await.unwrap();
    index.upsert(doc(1, 10, "final text")).await.unwrap();
    index.upsert(doc(2, 11, "final answer")).await.unwrap();

    assert_eq!(index.count().await.unwrap(), 2);
    assert!(index.search(10, "draft", 10).await.unwrap().is_empty());

    let hits = index.search(10, "Final", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].body, "final text");

    assert_eq!(index.remove_parents(&[10]).await.unwrap(), 1);
    assert_eq!(index.count().await.unwrap(), 1);
    assert_eq!(index.clear().await.unwrap(), 1);
    assert_eq!(index.count().await.unwrap(), 0);
}

#[tokio::test]
async fn sqlite_index_matches_whole_terms_within_one_thread() {
    let index = SqliteIndex::in_memory().await.unwrap();
    index.upsert(doc(1, 10, "The quick brown fox")).await.unwrap();
    index.upsert(doc(2, 10, "quickly, foxes!")).await.unwrap();
    index.upsert(doc(3, 10, "Zoë's FOX and the quick hound")).await.unwrap();
    index.upsert(doc(4, 11, "quick fox elsewhere")).await.unwrap();

    let ids = |hits: Vec<IndexDocument>| hits.iter().map(|d| d.id).collect::<Vec<_>>();
    assert_eq!(ids(index.search(10, "QUICK fox", 10).await.unwrap()), [1, 3]);
    assert_eq!(ids(index.search(10, "quick fox", 1).await.unwrap()), [1]);
    assert_eq!(ids(index.search(10, "zoë", 10).await.unwrap()), [3]);
    assert!(index.search(10, "zoe", 10).await.unwrap().is_empty());
    assert_eq!(ids(index.search(11, "fox", 10).await.unwrap()), [4]);

    // Query syntax in user input is matched literally, never parsed.
    assert_eq!(ids(index.search(10, "fox AND (\"quick", 10).await.unwrap()), [3]);
    assert!(index.search(10, "NEAR fox*", 10).await.unwrap().is_empty());
    assert!(index.search(10, " ...", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_index_forgets_removed_documents() {
    let index = SqliteIndex::in_memory().await.unwrap();
    index
        .upsert_batch(vec![doc(1, 10, "alpha beta"), doc(2, 10, "beta gamma")])
        .await
        .unwrap();
    assert_eq!(index.search(10, "beta", 10).await.unwrap().len(), 2);

    index.remove_parents(&[10]).await.unwrap();
    assert!(index.search(10, "beta", 10).await.unwrap().is_empty());

    index.upsert(doc(1, 10, "alpha again")).await.unwrap();
    index.clear().await.unwrap();
    assert!(index.search(10, "alpha", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn indexer_swallows_index_errors() {
    let index = Arc::new(FlakyIndex::default());
    let indexer = Indexer::new(index.clone(), Duration::from_millis(100));
    let (store, thread_id) = seeded_store(1).await;
    let entry = store.entry(thread_id, 1).await.unwrap().unwrap();

    index.set_down(true);
    assert!(!indexer.index_entry(&entry).await);
    assert_eq!(index.count().await.unwrap(), 0);

    index.set_down(false);
    assert!(indexer.index_entry(&entry).await);
    assert_eq!(index.count().await.unwrap(), 1);
}

#[tokio::test]
async fn indexer_gives_up_on_a_stalled_index() {
    let indexer = Indexer::new(Arc::new(StalledIndex), Duration::from_millis(20));
    let (store, thread_id) = seeded_store(1).await;
    let entry = store.entry(thread_id, 1).await.unwrap().unwrap();

    let started = std::time::Instant::now();
    assert!(!indexer.index_entry(&entry).await);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn sweep_restores_missed_entries_idempotently() {
    let (store, thread_id) = seeded_store(10).await;
    let index = Arc::new(MemoryIndex::new());
    let sweep = ReindexSweep::new(store.clone(), index.clone(), 3);

    let report = sweep.run().await.unwrap();
    assert_eq!(report.scanned, 10);
    assert_eq!(report.indexed, 10);
    assert_eq!(index.count().await.unwrap(), 10);

    sweep.run().await.unwrap();
    assert_eq!(index.count().await.unwrap(), 10);

    let hits = index.search(thread_id, "entry 7", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn sweep_resumes_after_a_cursor() {
    let (store, _) = seeded_store(5).await;
    let third = store.entries_after(0, 3).await.unwrap()[2].id;
    let index = Arc::new(MemoryIndex::new());
    let sweep = ReindexSweep::new(store, index.clone(), 2);

    let report = sweep.resume_after(third).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(index.count().await.unwrap(), 2);
    assert!(index.get(third).is_none());
}

#[tokio::test]
async fn rebuild_drops_stale_documents() {
    let (store, thread_id) = seeded_store(2).await;
    let index = Arc::new(MemoryIndex::new());
    index.upsert(doc(9_999, thread_id, "stale")).await.unwrap();

    let report = ReindexSweep::new(store, index.clone(), 10)
        .rebuild()
        .await
        .unwrap();
    assert_eq!(report.cleared, 1);
    assert_eq!(report.indexed, 2);
    assert_eq!(index.count().await.unwrap(), 2);
    assert!(index.get(9_999).is_none());
}
