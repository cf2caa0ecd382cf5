use super::CreationTask;
use crate::common::types::{Payload, now_millis};
use core::{fmt, str::FromStr};
use serde::Serialize;
use tally::{ChildKind, SequenceNumber};

/// A task that exhausted its retries, or could not be retried at all.
///
/// Its number was allocated and is never reissued; unless the row exists
/// anyway (a replayed task), it is a permanent gap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub task_id: u64,
    pub parent_id: i64,
    pub kind: ChildKind,
    pub number: SequenceNumber,
    pub payload: Payload,
    pub attempts: u32,
    pub last_error: String,
    pub dead_at: i64,
}

impl DeadLetter {
    pub fn from_task(task: &CreationTask) -> Self {
        Self {
            task_id: task.id,
            parent_id: task.parent_id,
            kind: task.kind(),
            number: task.number,
            payload: task.payload.clone(),
            attempts: task.attempts(),
            last_error: task.last_error().unwrap_or("unknown").to_string(),
            dead_at: now_millis(),
        }
    }
}

/// Where a persisted [`DeadLetter`] stands.
///
/// A requeued letter keeps its row until the re-submitted task persists, so
/// a crash in between loses nothing and the number still counts toward
/// counter recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    Dead,
    /// Re-submitted; the task has not reached a terminal state yet.
    Requeued,
}

impl DeadLetterStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Requeued => "requeued",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dead" => Ok(Self::Dead),
            "requeued" => Ok(Self::Requeued),
            other => Err(format!("unknown dead letter status `{other}`")),
        }
    }
}

/// A persisted [`DeadLetter`] with its row id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    pub id: i64,
    pub status: DeadLetterStatus,
    #[serde(flatten)]
    pub letter: DeadLetter,
}
