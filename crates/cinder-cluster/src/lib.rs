//! cinder-cluster: slot ownership and migration state for cinder.
//!
//! This crate holds the pieces of cluster state the router reads on every
//! command:
//!
//! - **Slots**: 16384 hash slots, CRC16 with `{hash tag}` support
//! - **Topology**: the node table and the slot map built from config
//! - **Migration**: which slots are importing or migrating, and which keys
//!   have already crossed over
//!
//! There is no membership protocol; the node table comes from
//! configuration and only changes through `CLUSTER SETSLOT`.
//!
//! # Quick Start
//!
//! ```
//! use cinder_cluster::{key_slot, ClusterNode, ClusterState, NodeId};
//!
//! let node = ClusterNode::new(NodeId::new(), "127.0.0.1:7379".parse().unwrap());
//! let cluster = ClusterState::single_node(node);
//!
//! let slot = key_slot(b"mykey");
//! assert!(cluster.owns_slot(slot));
//! ```

mod error;
mod migration;
mod slots;
mod topology;

pub use error::ClusterError;
pub use migration::{
    KeyStatus, Migration, MigrationError, MigrationId, MigrationManager, MigrationState,
};
pub use slots::{key_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use topology::{ClusterNode, ClusterState, NodeId};
