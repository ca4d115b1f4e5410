//! Per-slot migration state, as consulted by the migration guard.
//!
//! Moving the data itself is not handled here. This module only records
//! which slots are being imported or migrated and which keys have already
//! crossed over, so the router can decide per key whether it is safe to
//! serve, needs a pull from the old owner, or must be retried later.
//!
//! A migration is driven by admin commands:
//!
//! ```text
//! CLUSTER SETSLOT 100 IMPORTING <source-id>   (on the target)
//! CLUSTER SETSLOT 100 MIGRATING <target-id>   (on the source)
//! CLUSTER SETSLOT 100 NODE <target-id>        (on every node, when done)
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::NodeId;

/// Unique identifier for a migration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MigrationId(pub u64);

impl MigrationId {
    /// Mixes a nanosecond timestamp, the slot and 16 random bits, so two
    /// migrations of the same slot in the same instant still differ.
    pub fn new(slot: u16) -> Self {
        use rand::Rng;
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let noise: u16 = rand::rng().random();
        Self(ts ^ u64::from(slot) ^ (u64::from(noise) << 48))
    }
}

/// Which side of a migration this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// This node is the target; keys are pulled in on first access.
    Importing,
    /// This node is the source; moved keys must not be served here.
    Migrating,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Importing => write!(f, "importing"),
            Self::Migrating => write!(f, "migrating"),
        }
    }
}

/// A single slot migration, seen from one side.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: MigrationId,
    pub slot: u16,
    /// Node that owned the slot before the migration.
    pub source: NodeId,
    /// Node receiving the slot.
    pub target: NodeId,
    pub state: MigrationState,
    pub started_at: Instant,
    /// Keys that crossed over so far.
    pub keys_moved: u64,
}

impl Migration {
    fn new(slot: u16, source: NodeId, target: NodeId, state: MigrationState) -> Self {
        Self {
            id: MigrationId::new(slot),
            slot,
            source,
            target,
            state,
            started_at: Instant::now(),
            keys_moved: 0,
        }
    }

    pub fn involves(&self, node: &NodeId) -> bool {
        self.source == *node || self.target == *node
    }
}

/// What the migration guard should do with one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Not affected by any migration, serve normally.
    Stable,
    /// The slot is importing and this key has not been pulled yet.
    NeedsPull { source: NodeId },
    /// The key already left this node but the slot is still owned here.
    Moved { target: NodeId },
}

/// Tracks all active migrations for a node.
#[derive(Debug, Default)]
pub struct MigrationManager {
    outgoing: HashMap<u16, Migration>,
    incoming: HashMap<u16, Migration>,
    /// Keys that crossed over, per slot: pulled in (incoming) or sent away
    /// (outgoing).
    moved_keys: HashMap<u16, HashSet<Vec<u8>>>,
}

impl MigrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_migrating(&self, slot: u16) -> bool {
        self.outgoing.contains_key(&slot)
    }

    pub fn is_importing(&self, slot: u16) -> bool {
        self.incoming.contains_key(&slot)
    }

    pub fn get_outgoing(&self, slot: u16) -> Option<&Migration> {
        self.outgoing.get(&slot)
    }

    pub fn get_incoming(&self, slot: u16) -> Option<&Migration> {
        self.incoming.get(&slot)
    }

    /// Starts importing `slot` from `source` into `local_id`.
    pub fn start_import(
        &mut self,
        slot: u16,
        source: NodeId,
        local_id: NodeId,
    ) -> Result<&Migration, MigrationError> {
        self.ensure_idle(slot)?;
        let migration = Migration::new(slot, source, local_id, MigrationState::Importing);
        self.moved_keys.insert(slot, HashSet::new());
        Ok(self.incoming.entry(slot).or_insert(migration))
    }

    /// Starts migrating `slot` from `local_id` to `target`.
    pub fn start_migrate(
        &mut self,
        slot: u16,
        local_id: NodeId,
        target: NodeId,
    ) -> Result<&Migration, MigrationError> {
        self.ensure_idle(slot)?;
        let migration = Migration::new(slot, local_id, target, MigrationState::Migrating);
        self.moved_keys.insert(slot, HashSet::new());
        Ok(self.outgoing.entry(slot).or_insert(migration))
    }

    fn ensure_idle(&self, slot: u16) -> Result<(), MigrationError> {
        if self.outgoing.contains_key(&slot) {
            return Err(MigrationError::SlotAlreadyMigrating { slot });
        }
        if self.incoming.contains_key(&slot) {
            return Err(MigrationError::SlotAlreadyImporting { slot });
        }
        Ok(())
    }

    /// Records that `key` crossed over. Ignored when the slot has no
    /// active migration.
    pub fn key_moved(&mut self, slot: u16, key: &[u8]) {
        let Some(keys) = self.moved_keys.get_mut(&slot) else {
            return;
        };
        if keys.insert(key.to_vec()) {
            if let Some(m) = self
                .outgoing
                .get_mut(&slot)
                .or_else(|| self.incoming.get_mut(&slot))
            {
                m.keys_moved += 1;
            }
        }
    }

    pub fn is_key_moved(&self, slot: u16, key: &[u8]) -> bool {
        self.moved_keys
            .get(&slot)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Classifies `key` for the migration guard. `owns_slot` is whether the
    /// slot map currently assigns the slot to this node.
    pub fn key_status(&self, slot: u16, key: &[u8], owns_slot: bool) -> KeyStatus {
        if let Some(m) = self.incoming.get(&slot) {
            if !self.is_key_moved(slot, key) {
                return KeyStatus::NeedsPull { source: m.source };
            }
            return KeyStatus::Stable;
        }
        if let Some(m) = self.outgoing.get(&slot) {
            if owns_slot && self.is_key_moved(slot, key) {
                return KeyStatus::Moved { target: m.target };
            }
        }
        KeyStatus::Stable
    }

    /// Finishes a migration and drops its key tracking.
    pub fn complete_migration(&mut self, slot: u16) -> Option<Migration> {
        self.moved_keys.remove(&slot);
        self.outgoing
            .remove(&slot)
            .or_else(|| self.incoming.remove(&slot))
    }

    /// Abandons a migration without touching ownership.
    pub fn abort_migration(&mut self, slot: u16) -> Option<Migration> {
        self.complete_migration(slot)
    }

    pub fn active_count(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }
}

/// Errors raised when starting a migration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("slot {slot} is already migrating")]
    SlotAlreadyMigrating { slot: u16 },

    #[error("slot {slot} is already importing")]
    SlotAlreadyImporting { slot: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_and_migrate_are_exclusive() {
        let mut manager = MigrationManager::new();
        let (local, other) = (NodeId::new(), NodeId::new());

        manager.start_migrate(100, local, other).unwrap();
        assert!(manager.is_migrating(100));
        assert_eq!(
            manager.start_migrate(100, local, NodeId::new()).unwrap_err(),
            MigrationError::SlotAlreadyMigrating { slot: 100 }
        );
        assert_eq!(
            manager.start_import(100, other, local).unwrap_err(),
            MigrationError::SlotAlreadyMigrating { slot: 100 }
        );

        manager.start_import(200, other, local).unwrap();
        assert!(manager.is_importing(200));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn migration_records_both_sides() {
        let mut manager = MigrationManager::new();
        let (source, target) = (NodeId::new(), NodeId::new());
        let m = manager.start_import(7, source, target).unwrap();
        assert_eq!(m.state, MigrationState::Importing);
        assert!(m.involves(&source));
        assert!(m.involves(&target));
        assert!(!m.involves(&NodeId::new()));
    }

    #[test]
    fn unaffected_slots_are_stable() {
        let manager = MigrationManager::new();
        assert_eq!(manager.key_status(5, b"k", true), KeyStatus::Stable);
        assert_eq!(manager.key_status(5, b"k", false), KeyStatus::Stable);
    }

    #[test]
    fn importing_key_needs_pull_until_moved() {
        let mut manager = MigrationManager::new();
        let (source, local) = (NodeId::new(), NodeId::new());
        manager.start_import(9, source, local).unwrap();

        assert_eq!(manager.key_status(9, b"k", true), KeyStatus::NeedsPull { source });
        manager.key_moved(9, b"k");
        assert_eq!(manager.key_status(9, b"k", true), KeyStatus::Stable);
        assert_eq!(manager.key_status(9, b"other", true), KeyStatus::NeedsPull { source });
        assert_eq!(manager.get_incoming(9).unwrap().keys_moved, 1);
    }

    #[test]
    fn migrating_key_is_moved_only_while_still_owned() {
        let mut manager = MigrationManager::new();
        let (local, target) = (NodeId::new(), NodeId::new());
        manager.start_migrate(3, local, target).unwrap();

        assert_eq!(manager.key_status(3, b"k", true), KeyStatus::Stable);
        manager.key_moved(3, b"k");
        manager.key_moved(3, b"k");
        assert_eq!(manager.get_outgoing(3).unwrap().keys_moved, 1);
        assert_eq!(manager.key_status(3, b"k", true), KeyStatus::Moved { target });
        // once ownership moved, the router relays instead
        assert_eq!(manager.key_status(3, b"k", false), KeyStatus::Stable);
    }

    #[test]
    fn complete_and_abort_clear_state() {
        let mut manager = MigrationManager::new();
        let (local, target) = (NodeId::new(), NodeId::new());
        manager.start_migrate(1, local, target).unwrap();
        manager.key_moved(1, b"k");

        assert!(manager.complete_migration(1).is_some());
        assert!(!manager.is_migrating(1));
        assert!(!manager.is_key_moved(1, b"k"));

        manager.start_import(2, target, local).unwrap();
        assert!(manager.abort_migration(2).is_some());
        assert!(manager.abort_migration(2).is_none());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn key_moved_without_migration_is_ignored() {
        let mut manager = MigrationManager::new();
        manager.key_moved(4, b"k");
        assert!(!manager.is_key_moved(4, b"k"));
    }

    #[test]
    fn state_display() {
        assert_eq!(MigrationState::Importing.to_string(), "importing");
        assert_eq!(MigrationState::Migrating.to_string(), "migrating");
    }
}
