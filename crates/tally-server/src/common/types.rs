//! # Domain Types
//!
//! Rows of the durable store and the payloads that creation tasks carry.
//!
//! ## Ownership
//!
//! ```text
//! Tenant ──< Thread ──< Entry
//! ```
//!
//! - A [`Tenant`] is created synchronously and owns its threads.
//! - A [`Thread`] is numbered within its tenant and owns its entries.
//! - An [`Entry`] is numbered within its thread and carries a text body.
//!
//! Deleting a tenant cascades to every descendant. `cached_child_count` is a
//! derived projection and is never authoritative between reconciliation
//! sweeps.

use core::fmt;
use serde::{Deserialize, Serialize};
use tally::{ChildKind, CounterKey};

/// A row that can own children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Tenant,
    Thread,
}

impl ParentKind {
    pub const ALL: [Self; 2] = [Self::Tenant, Self::Thread];

    /// Table holding rows of this kind.
    pub const fn table(&self) -> &'static str {
        match self {
            Self::Tenant => "tenants",
            Self::Thread => "threads",
        }
    }

    /// The kind of child numbered under this parent.
    pub const fn child_kind(&self) -> ChildKind {
        match self {
            Self::Tenant => ChildKind::Thread,
            Self::Thread => ChildKind::Entry,
        }
    }

    /// Table holding this parent's children.
    pub const fn child_table(&self) -> &'static str {
        match self {
            Self::Tenant => "threads",
            Self::Thread => "entries",
        }
    }

    pub const fn of_child(kind: ChildKind) -> Self {
        match kind {
            ChildKind::Thread => Self::Tenant,
            ChildKind::Entry => Self::Thread,
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tenant => "tenant",
            Self::Thread => "thread",
        })
    }
}

/// A reference to one parent row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub kind: ParentKind,
    pub id: i64,
}

impl ParentRef {
    pub const fn new(kind: ParentKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub const fn tenant(id: i64) -> Self {
        Self::new(ParentKind::Tenant, id)
    }

    pub const fn thread(id: i64) -> Self {
        Self::new(ParentKind::Thread, id)
    }

    /// The parent that numbers children of `kind` under `parent_id`.
    pub const fn of_child(kind: ChildKind, parent_id: i64) -> Self {
        Self::new(ParentKind::of_child(kind), parent_id)
    }

    pub const fn counter_key(&self) -> CounterKey {
        CounterKey::new(self.id, self.kind.child_kind())
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: i64,
    pub external_token: String,
    pub display_name: String,
    pub cached_child_count: i64,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Thread {
    pub id: i64,
    pub parent_id: i64,
    pub sequence_number: i64,
    pub cached_child_count: i64,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub parent_id: i64,
    pub sequence_number: i64,
    pub body: String,
    pub created_at: i64,
}

/// What a creation task writes once its number is allocated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Thread,
    Entry { body: String },
}

impl Payload {
    pub fn entry(body: impl Into<String>) -> Self {
        Self::Entry { body: body.into() }
    }

    pub const fn kind(&self) -> ChildKind {
        match self {
            Self::Thread => ChildKind::Thread,
            Self::Entry { .. } => ChildKind::Entry,
        }
    }
}

/// A freshly written child row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Persisted {
    Thread(Thread),
    Entry(Entry),
}

impl Persisted {
    pub const fn id(&self) -> i64 {
        match self {
            Self::Thread(t) => t.id,
            Self::Entry(e) => e.id,
        }
    }

    pub const fn parent(&self) -> ParentRef {
        match self {
            Self::Thread(t) => ParentRef::tenant(t.parent_id),
            Self::Entry(e) => ParentRef::thread(e.parent_id),
        }
    }

    /// Whether this row carries exactly `payload`.
    pub fn matches(&self, payload: &Payload) -> bool {
        match (self, payload) {
            (Self::Thread(_), Payload::Thread) => true,
            (Self::Entry(e), Payload::Entry { body }) => e.body == *body,
            _ => false,
        }
    }
}

/// Returned to the caller as soon as a number is allocated and the creation
/// task is enqueued. Persistence happens later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub task_id: u64,
    pub parent_id: i64,
    pub kind: ChildKind,
    pub number: i64,
}

/// Milliseconds since the Unix epoch, as stored in `*_at` columns.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
