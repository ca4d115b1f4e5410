//! cinder-core: the storage engine.
//!
//! Owns the keyspace, data types, expiration and the per-key lock table.
//! Connection tasks call into a shared [`Engine`] directly; atomicity of
//! multi-key commands comes from the striped key locks every command
//! takes before it runs.

pub mod command;
pub mod conn;
pub mod engine;
pub mod keyspace;
pub mod locks;
pub mod pubsub;
pub mod time;
pub mod types;

pub use command::{all_keys, keys_of, CommandSpec, KeySpec};
pub use conn::Connection;
pub use engine::Engine;
pub use keyspace::{IncrError, Keyspace, RestoreError, TtlResult, WrongType};
pub use locks::{KeyLocks, LockTable, Reservations};
pub use pubsub::{PubMessage, PubSub};
pub use types::Value;
