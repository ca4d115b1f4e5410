//! Data type representations for stored values.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A stored value in the keyspace.
///
/// Serializable so a key can be dumped on one node and restored on
/// another during renames, copies and slot migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Binary-safe string data.
    String(Bytes),

    /// Ordered list; `VecDeque` gives O(1) push/pop at both ends.
    List(VecDeque<Bytes>),

    /// Field → value map.
    Hash(HashMap<Bytes, Bytes>),

    /// Unordered set of unique members.
    Set(HashSet<Bytes>),
}

impl Value {
    /// Returns the type name, matching TYPE command output.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
        }
    }

    /// Collections are removed from the keyspace once they become empty.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
        }
    }
}

/// Normalizes LRANGE-style indices (negative counts from the end) into
/// clamped `(start, stop)` positions. `start > stop` means empty.
pub fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    let s = if start < 0 { (len + start).max(0) } else { start };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (s, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        assert_eq!(Value::String(Bytes::new()).type_name(), "string");
        assert_eq!(Value::List(VecDeque::new()).type_name(), "list");
        assert_eq!(Value::Hash(HashMap::new()).type_name(), "hash");
        assert_eq!(Value::Set(HashSet::new()).type_name(), "set");
    }

    #[test]
    fn empty_collections() {
        assert!(!Value::String(Bytes::new()).is_empty_collection());
        assert!(Value::List(VecDeque::new()).is_empty_collection());
        let mut set = HashSet::new();
        set.insert(Bytes::from_static(b"a"));
        assert!(!Value::Set(set).is_empty_collection());
    }

    #[test]
    fn range_normalization() {
        assert_eq!(normalize_range(0, -1, 5), (0, 4));
        assert_eq!(normalize_range(-2, -1, 5), (3, 4));
        assert_eq!(normalize_range(1, 100, 5), (1, 4));
        assert_eq!(normalize_range(-100, 2, 5), (0, 2));
        let (s, e) = normalize_range(4, 1, 5);
        assert!(s > e);
    }
}
