//! Asynchronous persistence pipeline for per-parent sequence numbers.
//!
//! A caller obtains a number from the [`tally`] allocator synchronously and
//! receives it immediately; a creation task is then enqueued and written to
//! the durable store by a bounded, retrying worker pool. Successful writes
//! feed an approximate counter cache (corrected by a scheduled authoritative
//! sweep) and a best-effort search projection (recoverable by a reindex
//! sweep).
//!
//! The entry point is [`server::service::handler::PipelineService`].

mod common;
pub mod server;

pub use common::*;
// Downstream crates reach the allocation primitives through
// `tally_server::tally`.
pub use tally;
