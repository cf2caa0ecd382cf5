use crate::CounterKey;
use core::time::Duration;

/// A result type defaulting to the crate [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `tally` can emit.
///
/// Allocation never retries internally: every failure is surfaced to the
/// caller, who must not synthesize a number of their own.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The counter store could not serve an allocation for `key`.
    ///
    /// Produced by [`NumberAllocator`](crate::NumberAllocator) when the
    /// backing store is unreachable or exceeds the allocation budget.
    #[error("allocator unavailable for {key}: {reason}")]
    AllocatorUnavailable { key: CounterKey, reason: String },

    /// The backing store rejected or failed an operation.
    ///
    /// Store implementations return this; the allocator folds it into
    /// [`Error::AllocatorUnavailable`] on the allocation path.
    #[error("counter store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// The store did not answer within the configured budget.
    #[error("counter store timed out after {budget:?} for {key}")]
    Timeout { key: CounterKey, budget: Duration },

    /// A recovery floor below `0` was supplied.
    #[error("invalid recovery floor {floor} for {key}")]
    InvalidFloor { key: CounterKey, floor: i64 },
}

impl Error {
    /// Convenience constructor for store implementations.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }
}
