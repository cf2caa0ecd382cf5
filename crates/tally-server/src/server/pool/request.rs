use crate::server::{
    task::CreationTask,
    telemetry::{decrement_task_backlog, increment_task_backlog},
};
use tokio::sync::{OwnedSemaphorePermit, oneshot};

/// A message sent to a pool worker.
pub enum WorkRequest {
    /// Run the next attempt of a task.
    Create(QueuedTask),
    /// Stop after the current task and acknowledge on `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// A task together with the backlog slot it occupies.
pub struct QueuedTask {
    pub task: CreationTask,
    pub permit: BacklogPermit,
}

/// One admitted-but-unfinished task's share of the backlog.
///
/// Dropping the permit frees the slot.
pub struct BacklogPermit {
    _permit: OwnedSemaphorePermit,
}

impl BacklogPermit {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        increment_task_backlog();
        Self { _permit: permit }
    }
}

impl Drop for BacklogPermit {
    fn drop(&mut self) {
        decrement_task_backlog();
    }
}
