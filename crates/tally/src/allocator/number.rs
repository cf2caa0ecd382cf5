use crate::{ChildKind, CounterKey, CounterStore, Error, Result, SequenceNumber};
use core::time::Duration;
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default budget for a single allocation.
///
/// Allocation sits on the synchronous request path, so the budget is kept in
/// single-digit milliseconds.
pub const DEFAULT_ALLOCATE_TIMEOUT: Duration = Duration::from_millis(5);

/// Hands out per-parent sequence numbers from a [`CounterStore`].
///
/// Every number returned by [`NumberAllocator::allocate`] is unique and
/// strictly greater than any number previously returned for the same
/// `(parent_id, kind)`, across all concurrent callers sharing the store.
///
/// The allocator never retries and never invents a number: a store that is
/// unreachable or slower than the configured budget surfaces as
/// [`Error::AllocatorUnavailable`].
///
/// # Example
/// ```
/// use tally::{ChildKind, MemoryCounterStore, NumberAllocator};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let allocator = NumberAllocator::new(MemoryCounterStore::new());
/// assert_eq!(allocator.allocate(7, ChildKind::Entry).await.unwrap(), 1);
/// assert_eq!(allocator.allocate(7, ChildKind::Entry).await.unwrap(), 2);
/// assert_eq!(allocator.allocate(8, ChildKind::Entry).await.unwrap(), 1);
/// # });
/// ```
pub struct NumberAllocator<S> {
    store: S,
    timeout: Duration,
}

impl<S> NumberAllocator<S>
where
    S: CounterStore,
{
    /// Creates an allocator with [`DEFAULT_ALLOCATE_TIMEOUT`].
    pub const fn new(store: S) -> Self {
        Self::with_timeout(store, DEFAULT_ALLOCATE_TIMEOUT)
    }

    pub const fn with_timeout(store: S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Allocates the next number for `(parent_id, kind)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocatorUnavailable`] if the store fails or does not
    /// answer within the budget. Whether or not the store applied the
    /// increment in the timeout case, the number is never reported and is
    /// therefore never reused.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self)))]
    pub async fn allocate(&self, parent_id: i64, kind: ChildKind) -> Result<SequenceNumber> {
        let key = CounterKey::new(parent_id, kind);
        match tokio::time::timeout(self.timeout, self.store.increment(key)).await {
            Ok(Ok(number)) => Ok(number),
            Ok(Err(e)) => Err(Error::AllocatorUnavailable {
                key,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::AllocatorUnavailable {
                key,
                reason: Error::Timeout {
                    key,
                    budget: self.timeout,
                }
                .to_string(),
            }),
        }
    }

    /// Returns the highest number handed out for `(parent_id, kind)`, or `0`.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn high_water_mark(&self, parent_id: i64, kind: ChildKind) -> Result<SequenceNumber> {
        self.store.current(CounterKey::new(parent_id, kind)).await
    }

    /// Raises each counter to at least its supplied floor.
    ///
    /// Floors are the maximum numbers known to have been handed out (as found
    /// in the durable store). Counters are never lowered, so running recovery
    /// against a healthy store is a no-op. Returns how many counters were
    /// actually raised.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFloor`] for a negative floor, or propagates
    /// store failures. Counters processed before the failure stay raised.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub async fn recover<I>(&self, floors: I) -> Result<usize>
    where
        I: IntoIterator<Item = (CounterKey, SequenceNumber)>,
    {
        let mut raised = 0;
        for (key, floor) in floors {
            if floor < 0 {
                return Err(Error::InvalidFloor { key, floor });
            }
            let before = self.store.current(key).await?;
            if before < floor {
                self.store.raise_to(key, floor).await?;
                raised += 1;

                #[cfg(feature = "tracing")]
                tracing::debug!(%key, before, floor, "raised counter during recovery");
            }
        }
        Ok(raised)
    }
}
