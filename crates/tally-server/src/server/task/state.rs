use super::RetryPolicy;
use crate::common::{
    Disposition, Error, Result,
    types::{ParentRef, Payload},
};
use core::time::Duration;
use std::time::Instant;
use tally::{ChildKind, CounterKey, SequenceNumber};

/// Where a [`CreationTask`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Enqueued, never attempted.
    Pending,
    /// Attempt number `attempt` (1-based) is executing.
    Running { attempt: u32 },
    /// Persisted after `attempts` attempts.
    Succeeded { attempts: u32 },
    /// Waiting `backoff` before running attempt number `attempt`.
    Retrying { attempt: u32, backoff: Duration },
    /// Abandoned after `attempts` attempts. Terminal.
    Dead { attempts: u32 },
}

impl TaskState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded { .. } => "succeeded",
            Self::Retrying { .. } => "retrying",
            Self::Dead { .. } => "dead",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Dead { .. })
    }
}

/// One allocated number on its way to the durable store.
#[derive(Clone, Debug)]
pub struct CreationTask {
    pub id: u64,
    pub parent_id: i64,
    pub number: SequenceNumber,
    pub payload: Payload,
    pub enqueued_at: Instant,
    /// Row id of the dead letter this task re-submits, if any.
    pub dead_letter: Option<i64>,
    state: TaskState,
    last_error: Option<String>,
}

impl CreationTask {
    pub fn new(id: u64, parent_id: i64, number: SequenceNumber, payload: Payload) -> Self {
        Self {
            id,
            parent_id,
            number,
            payload,
            enqueued_at: Instant::now(),
            dead_letter: None,
            state: TaskState::Pending,
            last_error: None,
        }
    }

    /// Marks the task as the re-submission of dead letter `id`.
    #[must_use]
    pub fn with_dead_letter(mut self, id: i64) -> Self {
        self.dead_letter = Some(id);
        self
    }

    pub const fn state(&self) -> TaskState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub const fn kind(&self) -> ChildKind {
        self.payload.kind()
    }

    pub const fn parent(&self) -> ParentRef {
        ParentRef::of_child(self.kind(), self.parent_id)
    }

    pub const fn key(&self) -> CounterKey {
        CounterKey::new(self.parent_id, self.kind())
    }

    /// Attempts started so far.
    pub const fn attempts(&self) -> u32 {
        match self.state {
            TaskState::Pending => 0,
            TaskState::Running { attempt } => attempt,
            TaskState::Retrying { attempt, .. } => attempt - 1,
            TaskState::Succeeded { attempts } | TaskState::Dead { attempts } => attempts,
        }
    }

    /// `Pending | Retrying -> Running`. Returns the attempt number.
    pub fn start(&mut self) -> Result<u32> {
        let attempt = match self.state {
            TaskState::Pending => 1,
            TaskState::Retrying { attempt, .. } => attempt,
            other => return Err(invalid(other, "running")),
        };
        self.state = TaskState::Running { attempt };
        Ok(attempt)
    }

    /// `Running -> Succeeded`.
    pub fn succeed(&mut self) -> Result<()> {
        let TaskState::Running { attempt } = self.state else {
            return Err(invalid(self.state, "succeeded"));
        };
        self.state = TaskState::Succeeded { attempts: attempt };
        Ok(())
    }

    /// `Running -> Retrying | Dead`, depending on the failure's disposition
    /// and the remaining attempt budget.
    pub fn fail(&mut self, err: &Error, policy: &RetryPolicy) -> Result<TaskState> {
        let TaskState::Running { attempt } = self.state else {
            return Err(invalid(self.state, "failed"));
        };
        self.last_error = Some(err.to_string());
        self.state = match err.disposition() {
            Disposition::Retry if attempt < policy.max_attempts => TaskState::Retrying {
                attempt: attempt + 1,
                backoff: policy.backoff(attempt),
            },
            _ => TaskState::Dead { attempts: attempt },
        };
        Ok(self.state)
    }

    /// Moves a non-terminal task straight to `Dead`, recording `reason`.
    ///
    /// Used when the pool can no longer run the task (shutdown, closed
    /// channels). A `Succeeded` task cannot be abandoned.
    pub fn abandon(&mut self, reason: impl Into<String>) -> Result<()> {
        match self.state {
            TaskState::Succeeded { .. } => Err(invalid(self.state, "dead")),
            TaskState::Dead { .. } => Ok(()),
            _ => {
                let attempts = self.attempts();
                self.last_error = Some(reason.into());
                self.state = TaskState::Dead { attempts };
                Ok(())
            }
        }
    }
}

fn invalid(from: TaskState, to: &'static str) -> Error {
    Error::InvalidTransition {
        from: from.name(),
        to,
    }
}
