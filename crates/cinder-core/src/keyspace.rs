//! The keyspace: a concurrent map of keys to typed values.
//!
//! Backed by `DashMap` so connection tasks access it directly. Single
//! operations are atomic per key; multi-key commands get their atomicity
//! from the [`LockTable`](crate::locks::LockTable), which every command
//! acquires before touching the map. Expired keys are removed lazily on
//! access.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::time;
use crate::types::{normalize_range, Value};

/// Error returned when a command is used against a key holding the wrong type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrongType;

impl std::fmt::Display for WrongType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WRONGTYPE Operation against a key holding the wrong kind of value"
        )
    }
}

impl std::error::Error for WrongType {}

/// Errors that can occur during INCR/DECR operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrError {
    WrongType,
    NotAnInteger,
    Overflow,
}

impl std::fmt::Display for IncrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncrError::WrongType => WrongType.fmt(f),
            IncrError::NotAnInteger => write!(f, "ERR value is not an integer or out of range"),
            IncrError::Overflow => write!(f, "ERR increment or decrement would overflow"),
        }
    }
}

impl std::error::Error for IncrError {}

/// Errors from RESTOREKEY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreError {
    /// The target exists and REPLACE was not given.
    BusyKey,
    /// The payload didn't decode.
    BadPayload,
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::BusyKey => write!(f, "BUSYKEY Target key name already exists."),
            RestoreError::BadPayload => write!(f, "ERR DUMP payload version or checksum are wrong"),
        }
    }
}

impl std::error::Error for RestoreError {}

/// Result of a TTL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlResult {
    NotFound,
    NoExpiry,
    Millis(u64),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Monotonic expiry timestamp in ms. 0 = no expiry.
    expires_at_ms: u64,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: time::NO_EXPIRY,
        }
    }

    fn is_expired(&self) -> bool {
        time::is_expired(self.expires_at_ms)
    }
}

/// Serialized form of a key used by DUMPKEY / RESTOREKEY. Carries the
/// remaining TTL since expiry deadlines are process-local.
#[derive(Debug, Serialize, Deserialize)]
struct DumpPayload {
    value: Value,
    ttl_ms: Option<u64>,
}

/// A concurrent keyspace backed by DashMap.
#[derive(Debug, Default)]
pub struct Keyspace {
    data: DashMap<Bytes, Entry>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (may briefly count expired ones).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes the key if it has expired. Returns true if it was removed.
    fn remove_if_expired(&self, key: &[u8]) -> bool {
        self.data
            .remove_if(key, |_, entry| entry.is_expired())
            .is_some()
    }

    /// Returns a clone of the live value at `key`.
    pub fn get_value(&self, key: &[u8]) -> Option<Value> {
        self.remove_if_expired(key);
        self.data.get(key).map(|e| e.value.clone())
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.remove_if_expired(key);
        self.data.contains_key(key)
    }

    /// Returns the TYPE name, `"none"` for missing keys.
    pub fn value_type(&self, key: &[u8]) -> &'static str {
        self.remove_if_expired(key);
        self.data
            .get(key)
            .map_or("none", |e| e.value.type_name())
    }

    /// Removes a key. Returns true if it existed.
    pub fn del(&self, key: &[u8]) -> bool {
        let expired = self.remove_if_expired(key);
        !expired && self.data.remove(key).is_some()
    }

    pub fn flush(&self) {
        self.data.clear();
    }

    // -- strings --

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, WrongType> {
        match self.get_value(key) {
            None => Ok(None),
            Some(Value::String(data)) => Ok(Some(data)),
            Some(_) => Err(WrongType),
        }
    }

    /// Stores a string. `ttl_ms` of `None` clears any expiry unless
    /// `keep_ttl` is set.
    pub fn set(&self, key: Bytes, value: Bytes, ttl_ms: Option<u64>, keep_ttl: bool) {
        self.remove_if_expired(&key);
        let previous = if keep_ttl {
            self.data.get(&key).map_or(time::NO_EXPIRY, |e| e.expires_at_ms)
        } else {
            time::NO_EXPIRY
        };
        let expires_at_ms = ttl_ms.map_or(previous, time::deadline_after);
        self.data.insert(
            key,
            Entry {
                value: Value::String(value),
                expires_at_ms,
            },
        );
    }

    /// Adds `delta` to the integer at `key`, creating it at 0. The TTL is
    /// preserved.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, IncrError> {
        self.remove_if_expired(key);
        let mut entry = self
            .data
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Value::String(Bytes::from_static(b"0"))));
        let current = match &entry.value {
            Value::String(data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(IncrError::NotAnInteger)?,
            _ => return Err(IncrError::WrongType),
        };
        let next = current.checked_add(delta).ok_or(IncrError::Overflow)?;
        entry.value = Value::String(Bytes::from(next.to_string()));
        Ok(next)
    }

    /// Appends to a string, creating it if missing. Returns the new length.
    pub fn append(&self, key: &Bytes, data: &[u8]) -> Result<usize, WrongType> {
        self.remove_if_expired(key);
        let mut entry = self
            .data
            .entry(key.clone())
            .or_insert_with(|| Entry::new(Value::String(Bytes::new())));
        match &mut entry.value {
            Value::String(existing) => {
                let mut buf = Vec::with_capacity(existing.len() + data.len());
                buf.extend_from_slice(existing);
                buf.extend_from_slice(data);
                let len = buf.len();
                *existing = Bytes::from(buf);
                Ok(len)
            }
            _ => Err(WrongType),
        }
    }

    // -- expiry --

    /// Sets a TTL on an existing key. Returns false if the key is missing.
    pub fn expire(&self, key: &[u8], ttl_ms: u64) -> bool {
        self.remove_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = time::deadline_after(ttl_ms);
                true
            }
            None => false,
        }
    }

    /// Removes the TTL. Returns true if the key had one.
    pub fn persist(&self, key: &[u8]) -> bool {
        self.remove_if_expired(key);
        match self.data.get_mut(key) {
            Some(mut entry) if entry.expires_at_ms != time::NO_EXPIRY => {
                entry.expires_at_ms = time::NO_EXPIRY;
                true
            }
            _ => false,
        }
    }

    pub fn ttl(&self, key: &[u8]) -> TtlResult {
        self.remove_if_expired(key);
        match self.data.get(key) {
            None => TtlResult::NotFound,
            Some(entry) => match time::remaining_ms(entry.expires_at_ms) {
                None => TtlResult::NoExpiry,
                Some(ms) => TtlResult::Millis(ms),
            },
        }
    }

    // -- collections --

    /// Runs `f` against the collection at `key`, creating it with `init`
    /// when missing. Collections left empty are removed.
    fn update_collection<T>(
        &self,
        key: &Bytes,
        init: fn() -> Value,
        f: impl FnOnce(&mut Value) -> Result<T, WrongType>,
    ) -> Result<T, WrongType> {
        self.remove_if_expired(key);
        let mut entry = self
            .data
            .entry(key.clone())
            .or_insert_with(|| Entry::new(init()));
        let result = f(&mut entry.value);
        let empty = entry.value.is_empty_collection();
        drop(entry);
        if empty {
            self.data.remove(key);
        }
        result
    }

    /// Pushes values to the head (`left`) or tail of a list. Returns the
    /// new length.
    pub fn push(&self, key: &Bytes, values: &[Bytes], left: bool) -> Result<usize, WrongType> {
        self.update_collection(
            key,
            || Value::List(VecDeque::new()),
            |value| match value {
                Value::List(list) => {
                    for v in values {
                        if left {
                            list.push_front(v.clone());
                        } else {
                            list.push_back(v.clone());
                        }
                    }
                    Ok(list.len())
                }
                _ => Err(WrongType),
            },
        )
    }

    pub fn pop(&self, key: &Bytes, left: bool) -> Result<Option<Bytes>, WrongType> {
        if !self.exists(key) {
            return Ok(None);
        }
        self.update_collection(
            key,
            || Value::List(VecDeque::new()),
            |value| match value {
                Value::List(list) => Ok(if left {
                    list.pop_front()
                } else {
                    list.pop_back()
                }),
                _ => Err(WrongType),
            },
        )
    }

    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> Result<Vec<Bytes>, WrongType> {
        match self.get_value(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                let (s, e) = normalize_range(start, stop, list.len() as i64);
                if s > e {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(s as usize)
                    .take((e - s + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(WrongType),
        }
    }

    /// Sets hash fields. Returns the number of new fields.
    pub fn hset(&self, key: &Bytes, pairs: &[(Bytes, Bytes)]) -> Result<usize, WrongType> {
        self.update_collection(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(map) => Ok(pairs
                    .iter()
                    .filter(|(f, v)| map.insert(f.clone(), v.clone()).is_none())
                    .count()),
                _ => Err(WrongType),
            },
        )
    }

    pub fn hdel(&self, key: &Bytes, fields: &[Bytes]) -> Result<usize, WrongType> {
        if !self.exists(key) {
            return Ok(0);
        }
        self.update_collection(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(map) => Ok(fields.iter().filter(|f| map.remove(*f).is_some()).count()),
                _ => Err(WrongType),
            },
        )
    }

    /// Returns all fields and values, sorted by field.
    pub fn hgetall(&self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, WrongType> {
        match self.get_value(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(map)) => {
                let mut pairs: Vec<_> = map.into_iter().collect();
                pairs.sort();
                Ok(pairs)
            }
            Some(_) => Err(WrongType),
        }
    }

    /// Adds set members. Returns the number of new members.
    pub fn sadd(&self, key: &Bytes, members: &[Bytes]) -> Result<usize, WrongType> {
        self.update_collection(
            key,
            || Value::Set(HashSet::new()),
            |value| match value {
                Value::Set(set) => Ok(members.iter().filter(|m| set.insert((*m).clone())).count()),
                _ => Err(WrongType),
            },
        )
    }

    pub fn srem(&self, key: &Bytes, members: &[Bytes]) -> Result<usize, WrongType> {
        if !self.exists(key) {
            return Ok(0);
        }
        self.update_collection(
            key,
            || Value::Set(HashSet::new()),
            |value| match value {
                Value::Set(set) => Ok(members.iter().filter(|m| set.remove(*m)).count()),
                _ => Err(WrongType),
            },
        )
    }

    /// Returns the members of a set, sorted.
    pub fn smembers(&self, key: &[u8]) -> Result<Vec<Bytes>, WrongType> {
        match self.get_value(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => {
                let mut members: Vec<_> = set.into_iter().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(WrongType),
        }
    }

    // -- whole-key moves --

    /// Moves `src` to `dst`, keeping the TTL. Returns false if `src` is
    /// missing, or if `nx` is set and `dst` exists.
    pub fn rename(&self, src: &[u8], dst: Bytes, nx: bool) -> bool {
        self.remove_if_expired(src);
        if nx && self.exists(&dst) {
            return false;
        }
        match self.data.remove(src) {
            Some((_, entry)) => {
                self.data.insert(dst, entry);
                true
            }
            None => false,
        }
    }

    /// Copies `src` to `dst`. Returns false if `src` is missing or `dst`
    /// exists without `replace`.
    pub fn copy(&self, src: &[u8], dst: Bytes, replace: bool) -> bool {
        self.remove_if_expired(src);
        let Some(entry) = self.data.get(src).map(|e| e.clone()) else {
            return false;
        };
        if !replace && self.exists(&dst) {
            return false;
        }
        self.data.insert(dst, entry);
        true
    }

    /// Serializes a key with its remaining TTL, or None if missing.
    pub fn dump(&self, key: &[u8]) -> Option<Bytes> {
        self.remove_if_expired(key);
        let entry = self.data.get(key)?;
        let payload = DumpPayload {
            value: entry.value.clone(),
            ttl_ms: time::remaining_ms(entry.expires_at_ms),
        };
        drop(entry);
        bincode::serialize(&payload).ok().map(Bytes::from)
    }

    /// Installs a dumped key. `ttl_override` (when set) replaces the TTL
    /// stored in the payload.
    pub fn restore(
        &self,
        key: Bytes,
        payload: &[u8],
        ttl_override: Option<u64>,
        replace: bool,
    ) -> Result<(), RestoreError> {
        let decoded: DumpPayload =
            bincode::deserialize(payload).map_err(|_| RestoreError::BadPayload)?;
        if !replace && self.exists(&key) {
            return Err(RestoreError::BusyKey);
        }
        let expires_at_ms = ttl_override
            .or(decoded.ttl_ms)
            .map_or(time::NO_EXPIRY, time::deadline_after);
        self.data.insert(
            key,
            Entry {
                value: decoded.value,
                expires_at_ms,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn set_get_del() {
        let ks = Keyspace::new();
        ks.set(b("k"), b("v"), None, false);
        assert_eq!(ks.get(b"k").unwrap(), Some(b("v")));
        assert!(ks.del(b"k"));
        assert!(!ks.del(b"k"));
        assert_eq!(ks.get(b"k").unwrap(), None);
    }

    #[test]
    fn expired_keys_vanish() {
        let ks = Keyspace::new();
        ks.set(b("k"), b("v"), Some(0), false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!ks.exists(b"k"));
        assert_eq!(ks.ttl(b"k"), TtlResult::NotFound);
    }

    #[test]
    fn keep_ttl_preserves_deadline() {
        let ks = Keyspace::new();
        ks.set(b("k"), b("v"), Some(60_000), false);
        ks.set(b("k"), b("w"), None, true);
        assert!(matches!(ks.ttl(b"k"), TtlResult::Millis(_)));
        ks.set(b("k"), b("x"), None, false);
        assert_eq!(ks.ttl(b"k"), TtlResult::NoExpiry);
    }

    #[test]
    fn incr_rules() {
        let ks = Keyspace::new();
        assert_eq!(ks.incr_by(&b("n"), 5), Ok(5));
        assert_eq!(ks.incr_by(&b("n"), -7), Ok(-2));
        ks.set(b("s"), b("abc"), None, false);
        assert_eq!(ks.incr_by(&b("s"), 1), Err(IncrError::NotAnInteger));
        ks.set(b("max"), b(&i64::MAX.to_string()), None, false);
        assert_eq!(ks.incr_by(&b("max"), 1), Err(IncrError::Overflow));
        ks.push(&b("l"), &[b("x")], true).unwrap();
        assert_eq!(ks.incr_by(&b("l"), 1), Err(IncrError::WrongType));
    }

    #[test]
    fn lists_drop_when_empty() {
        let ks = Keyspace::new();
        assert_eq!(ks.push(&b("l"), &[b("a"), b("b")], false), Ok(2));
        assert_eq!(ks.push(&b("l"), &[b("z")], true), Ok(3));
        assert_eq!(ks.lrange(b"l", 0, -1).unwrap(), vec![b("z"), b("a"), b("b")]);
        assert_eq!(ks.pop(&b("l"), true), Ok(Some(b("z"))));
        assert_eq!(ks.pop(&b("l"), false), Ok(Some(b("b"))));
        assert_eq!(ks.pop(&b("l"), false), Ok(Some(b("a"))));
        assert!(!ks.exists(b"l"));
        assert_eq!(ks.pop(&b("l"), false), Ok(None));
    }

    #[test]
    fn wrong_type_leaves_value_alone() {
        let ks = Keyspace::new();
        ks.set(b("k"), b("v"), None, false);
        assert_eq!(ks.push(&b("k"), &[b("x")], true), Err(WrongType));
        assert_eq!(ks.sadd(&b("k"), &[b("x")]), Err(WrongType));
        assert_eq!(ks.get(b"k").unwrap(), Some(b("v")));
    }

    #[test]
    fn hashes_and_sets() {
        let ks = Keyspace::new();
        assert_eq!(ks.hset(&b("h"), &[(b("f1"), b("1")), (b("f2"), b("2"))]), Ok(2));
        assert_eq!(ks.hset(&b("h"), &[(b("f1"), b("3"))]), Ok(0));
        assert_eq!(ks.hgetall(b"h").unwrap(), vec![(b("f1"), b("3")), (b("f2"), b("2"))]);
        assert_eq!(ks.hdel(&b("h"), &[b("f1"), b("f2"), b("nope")]), Ok(2));
        assert!(!ks.exists(b"h"));

        assert_eq!(ks.sadd(&b("s"), &[b("b"), b("a"), b("a")]), Ok(2));
        assert_eq!(ks.smembers(b"s").unwrap(), vec![b("a"), b("b")]);
        assert_eq!(ks.srem(&b("s"), &[b("a")]), Ok(1));
        assert_eq!(ks.value_type(b"s"), "set");
        assert_eq!(ks.value_type(b"missing"), "none");
    }

    #[test]
    fn rename_and_copy() {
        let ks = Keyspace::new();
        ks.set(b("a"), b("1"), Some(60_000), false);
        ks.set(b("c"), b("3"), None, false);

        assert!(!ks.rename(b"a", b("c"), true));
        assert!(ks.rename(b"a", b("b"), false));
        assert!(!ks.exists(b"a"));
        assert!(matches!(ks.ttl(b"b"), TtlResult::Millis(_)));
        assert!(!ks.rename(b"missing", b("x"), false));

        assert!(!ks.copy(b"b", b("c"), false));
        assert!(ks.copy(b"b", b("c"), true));
        assert_eq!(ks.get(b"c").unwrap(), Some(b("1")));
        assert_eq!(ks.get(b"b").unwrap(), Some(b("1")));
    }

    #[test]
    fn dump_and_restore() {
        let ks = Keyspace::new();
        ks.sadd(&b("s"), &[b("x"), b("y")]).unwrap();
        ks.expire(b"s", 60_000);
        let payload = ks.dump(b"s").unwrap();
        assert!(ks.dump(b"missing").is_none());

        let other = Keyspace::new();
        other.restore(b("s2"), &payload, None, false).unwrap();
        assert_eq!(other.smembers(b"s2").unwrap(), vec![b("x"), b("y")]);
        assert!(matches!(other.ttl(b"s2"), TtlResult::Millis(_)));

        assert_eq!(
            other.restore(b("s2"), &payload, None, false),
            Err(RestoreError::BusyKey)
        );
        assert_eq!(
            other.restore(b("s3"), b"garbage", None, false),
            Err(RestoreError::BadPayload)
        );
    }

    #[test]
    fn persist_clears_ttl() {
        let ks = Keyspace::new();
        ks.set(b("k"), b("v"), None, false);
        assert!(!ks.persist(b"k"));
        assert!(ks.expire(b"k", 10_000));
        assert!(ks.persist(b"k"));
        assert_eq!(ks.ttl(b"k"), TtlResult::NoExpiry);
        assert!(!ks.expire(b"missing", 10));
    }
}
