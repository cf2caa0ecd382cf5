mod allocator;
mod error;
mod key;
mod store;

pub use crate::allocator::*;
pub use crate::error::*;
pub use crate::key::*;
pub use crate::store::*;

/// The integer type of an allocated sequence number.
///
/// Numbers start at `1` for every fresh [`CounterKey`]; `0` is the value of a
/// counter that has never been incremented.
pub type SequenceNumber = i64;
