use crate::{CounterKey, Result, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;

/// A store holding one atomically incrementable counter per [`CounterKey`].
///
/// Implementations must back [`CounterStore::increment`] with a single
/// logically-serial atomic operation (`fetch_add`, `INCR`, a single
/// `UPDATE ... RETURNING` statement). A read followed by a write is never a
/// valid implementation.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments the counter for `key` and returns the new value.
    ///
    /// The first call for a fresh key returns `1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`](crate::Error::StoreUnavailable) if
    /// the backing store cannot be reached.
    async fn increment(&self, key: CounterKey) -> Result<SequenceNumber>;

    /// Returns the current value (the high-water mark) without incrementing.
    ///
    /// A key that was never incremented reports `0`.
    async fn current(&self, key: CounterKey) -> Result<SequenceNumber>;

    /// Raises the counter to at least `floor` and returns the resulting value.
    ///
    /// Never lowers a counter.
    async fn raise_to(&self, key: CounterKey, floor: SequenceNumber) -> Result<SequenceNumber>;

    /// Every known key with its current value.
    async fn snapshot(&self) -> Result<Vec<(CounterKey, SequenceNumber)>>;
}

#[async_trait]
impl<S> CounterStore for Arc<S>
where
    S: CounterStore + ?Sized,
{
    async fn increment(&self, key: CounterKey) -> Result<SequenceNumber> {
        (**self).increment(key).await
    }

    async fn current(&self, key: CounterKey) -> Result<SequenceNumber> {
        (**self).current(key).await
    }

    async fn raise_to(&self, key: CounterKey, floor: SequenceNumber) -> Result<SequenceNumber> {
        (**self).raise_to(key, floor).await
    }

    async fn snapshot(&self) -> Result<Vec<(CounterKey, SequenceNumber)>> {
        (**self).snapshot().await
    }
}
