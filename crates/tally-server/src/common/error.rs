//! Error types for the persistence pipeline.
//!
//! This module defines the central `Error` enum, which captures every failure
//! the pipeline can observe, together with its retry [`Disposition`]. The task
//! state machine consults [`Error::disposition`] to decide between
//! `Retrying` and `Dead`.
//!
//! ## Error Cases
//! - `AllocatorUnavailable`: the counter store is unreachable; surfaced to the
//!   caller synchronously, never retried inside the allocator.
//! - `DuplicateNumber`: the durable store rejected `(parent, number)`; retried
//!   with backoff, then dead-lettered.
//! - `IndexingFailure`: the search projection failed; logged, never fatal.
//! - `ReconciliationRace`: a count sweep lost a race; healed by the next sweep.
//! - `Backpressure`: the task backlog is full; no number was allocated.
//! - `ParentMissing`: the parent was deleted before the child was written.

use crate::common::types::ParentRef;
use core::time::Duration;
use tally::ChildKind;

pub type Result<T, E = Error> = core::result::Result<T, E>;

fn replay_suffix(replay: &bool) -> &'static str {
    if *replay {
        " (replay of an applied task)"
    } else {
        ""
    }
}

/// Unified error type for the persistence pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The number allocator could not reach its counter store in time.
    #[error("Allocator unavailable: {0}")]
    AllocatorUnavailable(#[from] tally::Error),

    /// The durable store already holds a row for `(parent_id, number)`.
    ///
    /// `replay` is set when the existing row carries the exact payload of the
    /// failing task, i.e. the task had already been applied.
    #[error("Duplicate {kind} number {number} under parent {parent_id}{}", replay_suffix(.replay))]
    DuplicateNumber {
        parent_id: i64,
        kind: ChildKind,
        number: i64,
        replay: bool,
    },

    /// The search index rejected or did not acknowledge a write.
    #[error("Indexing failure for entry {entry_id}: {reason}")]
    IndexingFailure { entry_id: i64, reason: String },

    /// A cached-count sweep collided with a concurrent writer.
    #[error("Reconciliation race on {parent}: {reason}")]
    ReconciliationRace { parent: ParentRef, reason: String },

    /// The task backlog is at its limit.
    #[error("Backlog full ({limit} tasks outstanding)")]
    Backpressure { limit: usize },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Conflict: {what}")]
    Conflict { what: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The parent row vanished (cascade delete) before the child was written.
    #[error("Parent {parent} no longer exists")]
    ParentMissing { parent: ParentRef },

    /// A single durable write exceeded its budget.
    #[error("Task attempt timed out after {budget:?}")]
    TaskTimeout { budget: Duration },

    #[error("Invalid task state transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What the task state machine should do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Transient or anomalous; try again after backoff.
    Retry,
    /// No later attempt can succeed; go straight to `Dead`.
    Abandon,
}

impl Error {
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::ParentMissing { .. }
            | Self::InvalidRequest { .. }
            | Self::NotFound { .. }
            | Self::InvalidTransition { .. } => Disposition::Abandon,
            _ => Disposition::Retry,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}
