//! Best-effort text search over entry bodies.
//!
//! The index is a projection of the durable store, never a source of truth.
//! Writes on the creation path go through the [`Indexer`], which logs and
//! swallows every failure; the [`ReindexSweep`] republishes the durable store
//! into the index and is the only recovery path for missed writes.
//!
//! ## Structure
//!
//! - [`SearchIndex`] - the index interface, with [`MemoryIndex`] and the
//!   SQLite-backed [`SqliteIndex`].
//! - [`Indexer`] - the failure boundary used by creation workers.
//! - [`ReindexSweep`] - paged, resumable, idempotent rebuild.

mod index;
mod indexer;
mod memory;
mod sqlite;
mod sweep;
#[cfg(test)]
pub(crate) mod tests;

pub use index::*;
pub use indexer::*;
pub use memory::*;
pub use sqlite::*;
pub use sweep::*;
