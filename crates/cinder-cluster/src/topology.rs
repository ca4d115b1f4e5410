//! Cluster topology: node identities, addresses and slot ownership.
//!
//! The router reads this state to pick the owner of a slot. It is built
//! from configuration at startup and only changes through the admin
//! commands that complete a slot migration.

use std::collections::HashMap;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::slots::{SlotMap, SlotRange, SLOT_COUNT};
use crate::ClusterError;

/// Unique identifier for a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form, like a git abbreviated hash
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// A member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    /// Address peers and clients connect to.
    pub addr: SocketAddr,
    /// Slot ranges owned by this node, kept in sync with the slot map.
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            slots: Vec::new(),
        }
    }

    /// Total number of slots owned by this node.
    pub fn slot_count(&self) -> usize {
        self.slots.iter().map(|r| r.len() as usize).sum()
    }
}

/// The node table plus the slot map, as seen from one node.
#[derive(Debug, Clone)]
pub struct ClusterState {
    local_id: NodeId,
    nodes: HashMap<NodeId, ClusterNode>,
    slot_map: SlotMap,
}

impl ClusterState {
    /// Creates a state containing only the local node, owning nothing.
    pub fn new(local: ClusterNode) -> Self {
        let local_id = local.id;
        let mut nodes = HashMap::new();
        nodes.insert(local_id, local);
        Self {
            local_id,
            nodes,
            slot_map: SlotMap::new(),
        }
    }

    /// Creates a single-node cluster where the local node owns every slot.
    pub fn single_node(mut local: ClusterNode) -> Self {
        local.slots = vec![SlotRange::full()];
        let mut state = Self::new(local.clone());
        state.slot_map = SlotMap::single_node(local.id);
        state
    }

    /// Builds the state from a full node list. Each node's `slots` are
    /// applied to the slot map; two nodes claiming the same slot is a
    /// configuration error.
    pub fn from_nodes(local_id: NodeId, nodes: Vec<ClusterNode>) -> Result<Self, ClusterError> {
        let mut slot_map = SlotMap::new();
        let mut table = HashMap::new();
        for node in nodes {
            for range in &node.slots {
                for slot in range.iter() {
                    if let Some(other) = slot_map.owner(slot) {
                        return Err(ClusterError::Configuration(format!(
                            "slot {slot} claimed by both {other} and {}",
                            node.id
                        )));
                    }
                    slot_map.assign(slot, node.id);
                }
            }
            if table.insert(node.id, node).is_some() {
                return Err(ClusterError::Configuration(
                    "duplicate node id in node list".into(),
                ));
            }
        }
        if !table.contains_key(&local_id) {
            return Err(ClusterError::Configuration(format!(
                "local node {local_id} is not in the node list"
            )));
        }
        Ok(Self {
            local_id,
            nodes: table,
            slot_map,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn node(&self, id: NodeId) -> Option<&ClusterNode> {
        self.nodes.get(&id)
    }

    /// All known nodes, local node included, in a stable order.
    pub fn nodes(&self) -> Vec<&ClusterNode> {
        let mut nodes: Vec<_> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Returns the node that owns `slot`.
    ///
    /// An unassigned slot, or an owner missing from the node table, is an
    /// error: routing never guesses an owner.
    pub fn owner_of(&self, slot: u16) -> Result<&ClusterNode, ClusterError> {
        if slot >= SLOT_COUNT {
            return Err(ClusterError::SlotNotAssigned(slot));
        }
        let id = self
            .slot_map
            .owner(slot)
            .ok_or(ClusterError::SlotNotAssigned(slot))?;
        self.nodes.get(&id).ok_or(ClusterError::NodeNotFound(id))
    }

    /// Returns true if the local node owns `slot`.
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slot_map.owner(slot) == Some(self.local_id)
    }

    /// Moves `slot` to `node`, refreshing both nodes' range lists.
    pub fn assign_slot(&mut self, slot: u16, node: NodeId) -> Result<(), ClusterError> {
        if !self.nodes.contains_key(&node) {
            return Err(ClusterError::NodeNotFound(node));
        }
        let previous = self.slot_map.owner(slot);
        self.slot_map.assign(slot, node);
        for id in [Some(node), previous].into_iter().flatten() {
            let ranges = self.slot_map.slots_for_node(id);
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.slots = ranges;
            }
        }
        Ok(())
    }

    /// Renders one line per node: `<id> <addr> [myself] <ranges>`.
    pub fn cluster_nodes(&self) -> String {
        let mut out = String::new();
        for node in self.nodes() {
            let ranges: Vec<String> = node.slots.iter().map(|r| r.to_string()).collect();
            let myself = if node.id == self.local_id { " myself" } else { "" };
            out.push_str(&format!(
                "{} {}{} {}\n",
                node.id.0,
                node.addr,
                myself,
                ranges.join(" ")
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16, slots: &str) -> ClusterNode {
        let mut n = ClusterNode::new(NodeId::new(), format!("127.0.0.1:{port}").parse().unwrap());
        n.slots = vec![slots.parse().unwrap()];
        n
    }

    #[test]
    fn node_id_display_is_short() {
        let id = NodeId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_eq!(NodeId::parse(&id.0.to_string()).unwrap(), id);
    }

    #[test]
    fn single_node_owns_everything() {
        let local = ClusterNode::new(NodeId::new(), "127.0.0.1:7000".parse().unwrap());
        let state = ClusterState::single_node(local.clone());
        assert!(state.owns_slot(0));
        assert!(state.owns_slot(SLOT_COUNT - 1));
        assert_eq!(state.owner_of(1234).unwrap().id, local.id);
        assert_eq!(state.node(local.id).unwrap().slot_count(), SLOT_COUNT as usize);
    }

    #[test]
    fn from_nodes_builds_ownership() {
        let a = node(7000, "0-8191");
        let b = node(7001, "8192-16383");
        let state = ClusterState::from_nodes(a.id, vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(state.owner_of(0).unwrap().id, a.id);
        assert_eq!(state.owner_of(16383).unwrap().id, b.id);
        assert!(state.owns_slot(100));
        assert!(!state.owns_slot(9000));
        assert_eq!(state.nodes().len(), 2);
    }

    #[test]
    fn overlapping_claims_are_rejected() {
        let a = node(7000, "0-100");
        let b = node(7001, "100-200");
        let err = ClusterState::from_nodes(a.id, vec![a.clone(), b]).unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    #[test]
    fn local_node_must_be_listed() {
        let a = node(7000, "0-100");
        let err = ClusterState::from_nodes(NodeId::new(), vec![a]).unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    #[test]
    fn unassigned_slot_is_a_routing_error() {
        let a = node(7000, "0-100");
        let state = ClusterState::from_nodes(a.id, vec![a]).unwrap();
        assert!(matches!(state.owner_of(5000), Err(ClusterError::SlotNotAssigned(5000))));
        assert!(matches!(state.owner_of(SLOT_COUNT), Err(ClusterError::SlotNotAssigned(_))));
    }

    #[test]
    fn assign_slot_moves_ranges() {
        let a = node(7000, "0-9");
        let b = node(7001, "10-19");
        let mut state = ClusterState::from_nodes(a.id, vec![a.clone(), b.clone()]).unwrap();
        state.assign_slot(5, b.id).unwrap();

        assert_eq!(state.owner_of(5).unwrap().id, b.id);
        let a_ranges: Vec<String> = state.node(a.id).unwrap().slots.iter().map(|r| r.to_string()).collect();
        assert_eq!(a_ranges, ["0-4", "6-9"]);
        assert!(state.assign_slot(5, NodeId::new()).is_err());
    }

    #[test]
    fn cluster_nodes_marks_myself() {
        let a = node(7000, "0-9");
        let b = node(7001, "10-19");
        let state = ClusterState::from_nodes(a.id, vec![a.clone(), b]).unwrap();
        let text = state.cluster_nodes();
        assert_eq!(text.lines().count(), 2);
        let mine = text.lines().find(|l| l.contains("myself")).unwrap();
        assert!(mine.starts_with(&a.id.0.to_string()));
        assert!(mine.ends_with("0-9"));
    }
}
