//! Error types for cluster routing and transactions.
//!
//! The `Display` text of each variant is exactly what a client sees, so the
//! leading word doubles as the error code.

use crate::NodeId;

/// Errors raised while routing a command or coordinating a transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// No node owns the slot.
    #[error("CLUSTERDOWN Hash slot {0} not served")]
    SlotNotAssigned(u16),

    /// The slot map names a node missing from the node table.
    #[error("CLUSTERDOWN node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// The key's slot is being migrated and the key can't be served yet.
    #[error("TRYAGAIN slot {slot} is migrating, retry later")]
    MigrationPending { slot: u16 },

    /// Transport failure talking to a peer.
    #[error("ERR relay to node {node} failed: {reason}")]
    RelayFailed { node: NodeId, reason: String },

    /// A peer didn't answer within the peer timeout.
    #[error("ERR node {0} timed out")]
    Timeout(NodeId),

    /// A participant refused to prepare.
    #[error("ERR transaction {tx} aborted by node {node}: {reason}")]
    PrepareRejected {
        tx: String,
        node: NodeId,
        reason: String,
    },

    /// Some participants failed to apply a commit after every prepare
    /// succeeded. The cluster may hold a partial write.
    #[error("ERR transaction {tx} commit failed on nodes {nodes}")]
    CommitFailed { tx: String, nodes: String },

    /// A broadcast command failed on some nodes.
    #[error("ERR broadcast failed on nodes {0}")]
    BroadcastFailed(String),

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// A MULTI batch touches keys owned by more than one node.
    #[error("CROSSSLOT transaction keys span {0} nodes")]
    CrossNode(usize),

    #[error("ERR invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Returns true if the client may retry the same command unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::MigrationPending { .. } | ClusterError::Timeout(_)
        )
    }

    /// Builds a relay failure from any displayable cause.
    pub fn relay(node: NodeId, reason: impl std::fmt::Display) -> Self {
        ClusterError::RelayFailed {
            node,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_client_text() {
        assert_eq!(
            ClusterError::SlotNotAssigned(42).to_string(),
            "CLUSTERDOWN Hash slot 42 not served"
        );
        assert_eq!(
            ClusterError::UnknownCommand("nope".into()).to_string(),
            "ERR unknown command 'nope'"
        );
        assert!(ClusterError::MigrationPending { slot: 7 }
            .to_string()
            .starts_with("TRYAGAIN"));
        assert!(ClusterError::CrossNode(2).to_string().starts_with("CROSSSLOT"));
    }

    #[test]
    fn relay_failure_names_node() {
        let node = NodeId::new();
        let err = ClusterError::relay(node, "connection refused");
        assert_eq!(
            err.to_string(),
            format!("ERR relay to node {node} failed: connection refused")
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryable_errors() {
        assert!(ClusterError::MigrationPending { slot: 1 }.is_retryable());
        assert!(ClusterError::Timeout(NodeId::new()).is_retryable());
        assert!(!ClusterError::SlotNotAssigned(1).is_retryable());
    }
}
