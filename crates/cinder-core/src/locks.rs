//! Striped per-key read/write locks.
//!
//! Keys hash onto a fixed set of async `RwLock` stripes. A command locks
//! every stripe its keys touch, always in ascending stripe order so two
//! multi-key commands can never wait on each other in a cycle. The
//! returned [`KeyLocks`] releases everything on drop, which makes the
//! lock scope exactly the guard's lexical scope.
//!
//! [`Reservations`] outlive a lock scope: a prepared transaction holds its
//! keys between prepare and commit, and writes to a held key are refused.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default number of lock stripes.
pub const DEFAULT_STRIPES: usize = 1024;

/// A set of key locks held together. Dropping it releases all of them.
#[derive(Debug)]
pub struct KeyLocks<'a> {
    _guards: Vec<StripeGuard<'a>>,
}

// held only for their drop
#[allow(dead_code)]
#[derive(Debug)]
enum StripeGuard<'a> {
    Read(RwLockReadGuard<'a, ()>),
    Write(RwLockWriteGuard<'a, ()>),
}

/// Fixed-size table of lock stripes.
#[derive(Debug)]
pub struct LockTable {
    stripes: Box<[RwLock<()>]>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl LockTable {
    /// Creates a table with `stripes` locks (at least one).
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| RwLock::new(())).collect();
        Self { stripes }
    }

    fn stripe_of(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Write-locks `write` keys and read-locks `read` keys. A key in both
    /// sets is write-locked once.
    pub async fn lock(&self, write: &[Bytes], read: &[Bytes]) -> KeyLocks<'_> {
        // stripe -> needs write
        let mut plan: BTreeMap<usize, bool> = BTreeMap::new();
        for key in read {
            plan.entry(self.stripe_of(key)).or_insert(false);
        }
        for key in write {
            plan.insert(self.stripe_of(key), true);
        }

        let mut guards = Vec::with_capacity(plan.len());
        for (stripe, exclusive) in plan {
            let lock = &self.stripes[stripe];
            guards.push(if exclusive {
                StripeGuard::Write(lock.write().await)
            } else {
                StripeGuard::Read(lock.read().await)
            });
        }
        KeyLocks { _guards: guards }
    }

    /// Write-locks a single key.
    pub async fn write(&self, key: &Bytes) -> KeyLocks<'_> {
        self.lock(std::slice::from_ref(key), &[]).await
    }
}

/// Keys held by prepared transactions, keyed to the holder's id.
///
/// Reserve and release run under the write locks of the keys involved, and
/// the engine checks a command's write keys under the same locks, so a
/// write either lands before the reservation or is refused.
#[derive(Debug, Default)]
pub struct Reservations {
    held: DashMap<Bytes, u128>,
}

impl Reservations {
    /// Reserves every key for `holder`, or none of them if any key is
    /// already held. On conflict returns the key and its holder.
    pub fn reserve(&self, keys: &[Bytes], holder: u128) -> Result<(), (Bytes, u128)> {
        if let Some((key, other)) = self.first_held(keys) {
            return Err((key, other));
        }
        for key in keys {
            self.held.insert(key.clone(), holder);
        }
        Ok(())
    }

    /// Releases the keys `holder` has. Keys held by others stay held.
    pub fn release(&self, keys: &[Bytes], holder: u128) {
        for key in keys {
            self.held.remove_if(key, |_, h| *h == holder);
        }
    }

    /// The first of `keys` that is held, with its holder.
    pub fn first_held(&self, keys: &[Bytes]) -> Option<(Bytes, u128)> {
        keys.iter()
            .find_map(|k| self.held.get(k).map(|h| (k.clone(), *h)))
    }

    pub fn is_held(&self, key: &[u8]) -> bool {
        self.held.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
