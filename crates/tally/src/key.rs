use core::{fmt, str::FromStr};

/// The kind of child a sequence number is allocated for.
///
/// Each parent owns one independent counter per kind, so a tenant's thread
/// numbers never interfere with a thread's entry numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ChildKind {
    /// A thread, numbered within its tenant.
    Thread,
    /// An entry, numbered within its thread.
    Entry,
}

impl ChildKind {
    /// All kinds, in parent-to-leaf order.
    pub const ALL: [Self; 2] = [Self::Thread, Self::Entry];

    /// Stable lowercase name used in storage keys and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Entry => "entry",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown [`ChildKind`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown child kind: {0}")]
pub struct ParseChildKindError(pub String);

impl FromStr for ChildKind {
    type Err = ParseChildKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Self::Thread),
            "entry" => Ok(Self::Entry),
            other => Err(ParseChildKindError(other.to_string())),
        }
    }
}

/// Identifies one counter: the `(parent id, child kind)` scope in which
/// sequence numbers must be unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterKey {
    pub parent_id: i64,
    pub kind: ChildKind,
}

impl CounterKey {
    pub const fn new(parent_id: i64, kind: ChildKind) -> Self {
        Self { parent_id, kind }
    }

    /// Flat key used by external stores, e.g. `tally:entry:42`.
    pub fn storage_key(&self) -> String {
        format!("tally:{}:{}", self.kind, self.parent_id)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.parent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ChildKind::ALL {
            assert_eq!(kind.as_str().parse::<ChildKind>(), Ok(kind));
        }
        assert!("comment".parse::<ChildKind>().is_err());
    }

    #[test]
    fn storage_key_is_scoped_by_kind_and_parent() {
        let a = CounterKey::new(7, ChildKind::Entry);
        let b = CounterKey::new(7, ChildKind::Thread);
        assert_eq!(a.storage_key(), "tally:entry:7");
        assert_ne!(a.storage_key(), b.storage_key());
        assert_eq!(a.to_string(), "entry/7");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn key_serializes_with_snake_case_kind() {
        let key = CounterKey::new(3, ChildKind::Thread);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"parent_id":3,"kind":"thread"}"#);
        let back: CounterKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
