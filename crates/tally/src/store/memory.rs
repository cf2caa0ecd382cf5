use crate::{CounterKey, CounterStore, Result, SequenceNumber};
use async_trait::async_trait;
use parking_lot::RwLock;
use portable_atomic::{AtomicI64, Ordering};
use std::{collections::HashMap, sync::Arc};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// A lock-free, in-process [`CounterStore`].
///
/// Each key owns an [`AtomicI64`]; allocation is a single `fetch_add`. The
/// map lock is only taken for writing the first time a key is seen, so the
/// hot path is a shared read lock plus one atomic instruction.
///
/// ## Caveats
/// State lives in process memory. After a restart the counters must be
/// recovered from the durable store with
/// [`NumberAllocator::recover`](crate::NumberAllocator::recover) before any
/// allocation is served, or numbers will be reissued.
///
/// ## Recommended When
/// - A single process owns allocation for its parents
/// - Tests and benchmarks
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<CounterKey, Arc<AtomicI64>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every counter, simulating loss of the backing store.
    pub fn clear(&self) {
        self.counters.write().clear();
    }

    fn counter(&self, key: CounterKey) -> Arc<AtomicI64> {
        if let Some(counter) = self.counters.read().get(&key) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.counters
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    async fn increment(&self, key: CounterKey) -> Result<SequenceNumber> {
        Ok(self.counter(key).fetch_add(1, Ordering::AcqRel) + 1)
    }

    async fn current(&self, key: CounterKey) -> Result<SequenceNumber> {
        Ok(self
            .counters
            .read()
            .get(&key)
            .map_or(0, |counter| counter.load(Ordering::Acquire)))
    }

    async fn raise_to(&self, key: CounterKey, floor: SequenceNumber) -> Result<SequenceNumber> {
        let previous = self.counter(key).fetch_max(floor, Ordering::AcqRel);
        Ok(previous.max(floor))
    }

    async fn snapshot(&self) -> Result<Vec<(CounterKey, SequenceNumber)>> {
        let mut entries: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(key, counter)| (*key, counter.load(Ordering::Acquire)))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        Ok(entries)
    }
}
