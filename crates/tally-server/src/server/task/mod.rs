//! Creation tasks and their execution.
//!
//! A [`CreationTask`] carries an allocated number and its payload from the
//! request path to the durable store. Each attempt is driven by a
//! [`CreationWorker`], which advances the task through an explicit, bounded
//! state machine:
//!
//! ```text
//! Pending ──> Running ──> Succeeded
//!               │  ^
//!               │  └───── Retrying(attempt + 1, backoff)
//!               └───────> Dead
//! ```
//!
//! `Dead` is reached only after [`RetryPolicy::max_attempts`] attempts, or
//! immediately for failures no retry can fix. Dead tasks become
//! [`DeadLetter`]s and are persisted, never dropped.

mod dead_letter;
mod policy;
mod processor;
mod state;
#[cfg(test)]
mod tests;

pub use dead_letter::*;
pub use policy::*;
pub use processor::*;
pub use state::*;
