//! Bounded, retrying worker pool for creation tasks.
//!
//! Admission is gated by a semaphore sized to the maximum backlog: a caller
//! first reserves a [`BacklogPermit`] and only then allocates a number, so a
//! full backlog rejects the request before any number is consumed. The permit
//! travels with its task through every retry and is released when the task
//! reaches a terminal state.
//!
//! ## Structure
//!
//! - [`manager`] - the [`WorkerPool`] front: admission, dispatch, drain and
//!   shutdown.
//! - [`worker`] - the per-worker receive loop.
//! - [`scheduler`] - delayed re-dispatch of `Retrying` tasks.
//! - [`sink`] - persistence of dead tasks.
//! - [`request`] - messages exchanged with workers.

pub mod manager;
pub mod request;
pub mod scheduler;
pub mod sink;
pub mod worker;

pub use manager::WorkerPool;
pub use request::{BacklogPermit, QueuedTask, WorkRequest};
pub use sink::DeadLetterSink;
