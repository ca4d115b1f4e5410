//! Server configuration.
//!
//! Values resolve in order: defaults, then the TOML file given with
//! `--config`, then environment variables and CLI flags (see `main.rs`).
//! The node table under `[[cluster.nodes]]` is static: membership only
//! changes through CLUSTER SETSLOT at runtime.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use cinder_cluster::{ClusterNode, ClusterState, NodeId, SlotRange};
use serde::{Deserialize, Serialize};

use crate::router::RouterOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CinderConfig {
    pub bind: String,
    pub port: u16,
    /// Identity of this node. Empty means a fresh id is generated, which
    /// only makes sense for a single-node setup.
    pub node_id: String,
    pub maxclients: usize,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Bound on every relay, prepare, commit and rollback call.
    pub peer_timeout_ms: u64,
    /// Prepared transactions are rolled back after this long.
    pub tx_timeout_ms: u64,
    /// Idle connections kept per peer.
    pub pool_size: usize,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub addr: String,
    /// Slot ranges like `"0-5460"` or single slots like `"42"`.
    #[serde(default)]
    pub slots: Vec<String>,
}

impl Default for CinderConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7379,
            node_id: String::new(),
            maxclients: 10_000,
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peer_timeout_ms: 3000,
            tx_timeout_ms: 10_000,
            pool_size: 4,
            nodes: Vec::new(),
        }
    }
}

impl CinderConfig {
    /// Loads a config from a TOML file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        toml::from_str(&text).map_err(|e| format!("invalid config '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The address this node listens on.
    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| format!("invalid bind address '{}:{}': {e}", self.bind, self.port))
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            peer_timeout: Duration::from_millis(self.cluster.peer_timeout_ms),
            tx_timeout: Duration::from_millis(self.cluster.tx_timeout_ms),
        }
    }

    /// Builds the cluster topology.
    ///
    /// With no `[[cluster.nodes]]` this node runs alone and owns every
    /// slot. Otherwise `node_id` must name one of the listed nodes.
    pub fn build_state(&self) -> Result<ClusterState, String> {
        if self.cluster.peer_timeout_ms == 0 || self.cluster.tx_timeout_ms == 0 {
            return Err("cluster timeouts must be greater than zero".into());
        }
        if self.cluster.nodes.is_empty() {
            let id = if self.node_id.is_empty() {
                NodeId::new()
            } else {
                parse_node_id(&self.node_id)?
            };
            return Ok(ClusterState::single_node(ClusterNode::new(
                id,
                self.bind_addr()?,
            )));
        }

        if self.node_id.is_empty() {
            return Err("node_id is required when cluster.nodes is set".into());
        }
        let local = parse_node_id(&self.node_id)?;
        let nodes = self
            .cluster
            .nodes
            .iter()
            .map(NodeConfig::to_node)
            .collect::<Result<Vec<_>, _>>()?;
        ClusterState::from_nodes(local, nodes).map_err(|e| e.to_string())
    }
}

impl NodeConfig {
    fn to_node(&self) -> Result<ClusterNode, String> {
        let id = parse_node_id(&self.id)?;
        let addr = self
            .addr
            .parse()
            .map_err(|e| format!("invalid address '{}' for node {id}: {e}", self.addr))?;
        let mut node = ClusterNode::new(id, addr);
        node.slots = self
            .slots
            .iter()
            .map(|s| parse_slot_range(s))
            .collect::<Result<_, _>>()?;
        Ok(node)
    }
}

fn parse_node_id(s: &str) -> Result<NodeId, String> {
    NodeId::parse(s).map_err(|e| format!("invalid node id '{s}': {e}"))
}

/// Parses `"start-end"` or a single slot number.
fn parse_slot_range(s: &str) -> Result<SlotRange, String> {
    let bound = |part: &str| {
        part.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid slot range '{s}'"))
    };
    match s.split_once('-') {
        Some((start, end)) => SlotRange::try_new(bound(start)?, bound(end)?),
        None => {
            let slot = bound(s)?;
            SlotRange::try_new(slot, slot)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use cinder_cluster::SLOT_COUNT;

    use super::*;

    #[test]
    fn defaults() {
        let cfg = CinderConfig::default();
        assert_eq!(cfg.port, 7379);
        assert_eq!(cfg.cluster.peer_timeout_ms, 3000);
        assert_eq!(cfg.cluster.tx_timeout_ms, 10_000);
        let opts = cfg.router_options();
        assert_eq!(opts.peer_timeout, Duration::from_secs(3));
    }

    #[test]
    fn template_round_trips() {
        let cfg = CinderConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: CinderConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn slot_ranges() {
        assert_eq!(parse_slot_range("0-5460").unwrap(), SlotRange::try_new(0, 5460).unwrap());
        assert_eq!(parse_slot_range("42").unwrap(), SlotRange::try_new(42, 42).unwrap());
        assert!(parse_slot_range("10-5").is_err());
        assert!(parse_slot_range("0-16384").is_err());
        assert!(parse_slot_range("abc").is_err());
    }

    #[test]
    fn single_node_owns_everything() {
        let state = CinderConfig::default().build_state().unwrap();
        assert!(state.owns_slot(0));
        assert!(state.owns_slot(SLOT_COUNT - 1));
    }

    #[test]
    fn loads_node_table_from_file() {
        let a = NodeId::new();
        let b = NodeId::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
port = 7001
node_id = "{a}"

[cluster]
tx_timeout_ms = 500

[[cluster.nodes]]
id = "{a}"
addr = "127.0.0.1:7001"
slots = ["0-8191"]

[[cluster.nodes]]
id = "{b}"
addr = "127.0.0.1:7002"
slots = ["8192-16383"]
"#,
            a = a.0,
            b = b.0,
        )
        .unwrap();

        let cfg = CinderConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.cluster.tx_timeout_ms, 500);
        // untouched fields keep their defaults
        assert_eq!(cfg.cluster.peer_timeout_ms, 3000);

        let state = cfg.build_state().unwrap();
        assert_eq!(state.local_id(), a);
        assert!(state.owns_slot(0));
        assert_eq!(state.owner_of(9000).unwrap().id, b);
    }

    #[test]
    fn cluster_requires_node_id() {
        let mut cfg = CinderConfig::default();
        cfg.cluster.nodes.push(NodeConfig {
            id: NodeId::new().0.to_string(),
            addr: "127.0.0.1:7001".into(),
            slots: vec!["0-16383".into()],
        });
        assert!(cfg.build_state().is_err());
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let err = CinderConfig::from_file(Path::new("/nonexistent/cinder.toml")).unwrap_err();
        assert!(err.contains("failed to read config"));
    }
}
