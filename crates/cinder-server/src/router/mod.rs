//! Command routing for a cluster node.
//!
//! The [`Cluster`] receives every command line a node sees, from clients
//! and from peers alike, and decides where it runs:
//!
//! - single-key commands go through the migration guard, then run on the
//!   local engine if this node owns the key's slot, or are relayed to the
//!   owner otherwise
//! - multi-key writes spanning nodes run as a two-phase commit (see
//!   [`tcc`])
//! - flush and publish are broadcast to every node
//! - penetrating names (`copy_`, `dumpkey_`, ...) run locally, unrouted
//!
//! Peers send commands to the node they already picked, so relayed
//! commands land on handlers that never relay again.

pub mod admin;
pub mod commands;
pub mod multi;
pub mod registry;
pub mod relay;
pub mod tcc;


use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cinder_cluster::{
    key_slot, ClusterError, ClusterNode, ClusterState, KeyStatus, MigrationManager, NodeId,
};
use cinder_core::{Connection, Engine};
use cinder_protocol::{command_name, CmdLine, Frame};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub use multi::Session;
pub use registry::{CommandRegistry, Handler, HandlerFuture};
pub use relay::{TcpTransport, Transport};

use tcc::TxTable;

/// Converts a routing error into the reply a client sees.
pub fn err_frame(e: ClusterError) -> Frame {
    Frame::Error(e.to_string())
}

/// Timeouts governing peer calls and transactions.
#[derive(Debug, Clone, Copy)]
pub struct RouterOptions {
    /// Bound on every relay, prepare, commit and rollback call.
    pub peer_timeout: Duration,
    /// Prepared transactions that see no commit or rollback within this
    /// window are rolled back.
    pub tx_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_millis(3000),
            tx_timeout: Duration::from_millis(10_000),
        }
    }
}

/// The routing layer of one node.
pub struct Cluster {
    local_id: NodeId,
    engine: Arc<Engine>,
    state: RwLock<ClusterState>,
    migration: Mutex<MigrationManager>,
    registry: CommandRegistry,
    transport: Arc<dyn Transport>,
    transactions: Arc<TxTable>,
    options: RouterOptions,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub fn new(
        state: ClusterState,
        engine: Arc<Engine>,
        transport: Arc<dyn Transport>,
        options: RouterOptions,
    ) -> Self {
        let transactions = Arc::new(TxTable::new(Arc::clone(&engine)));
        Self {
            local_id: state.local_id(),
            engine,
            state: RwLock::new(state),
            migration: Mutex::new(MigrationManager::new()),
            registry: CommandRegistry::builtin(),
            transport,
            transactions,
            options,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Dispatches a command line received from a client or a peer.
    pub fn exec<'a>(&'a self, conn: &'a Connection, args: &'a [Bytes]) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(name) = command_name(args) else {
                return Frame::error("ERR empty command");
            };
            match self.registry.get(&name) {
                None => err_frame(ClusterError::UnknownCommand(name)),
                Some(Handler::Default) => self.default_route(conn, args.to_vec()).await,
                Some(Handler::Custom(f)) => f(self, conn, args.to_vec()).await,
                Some(Handler::Penetrating(real)) => self.penetrate(conn, real, args).await,
            }
        })
    }

    /// Like [`exec`](Self::exec), but a default-routed name runs on the
    /// local engine instead of being routed. Used when a relay targets
    /// this node itself.
    fn exec_local<'a>(&'a self, conn: &'a Connection, args: &'a [Bytes]) -> HandlerFuture<'a> {
        Box::pin(async move {
            let name = command_name(args).unwrap_or_default();
            match self.registry.get(&name) {
                Some(Handler::Custom(f)) => f(self, conn, args.to_vec()).await,
                Some(Handler::Penetrating(real)) => self.penetrate(conn, real, args).await,
                Some(Handler::Default) | None => self.engine.exec(conn, args).await,
            }
        })
    }

    /// Runs `args` as the engine command `real` on this node. The caller's
    /// buffer is left untouched; the name is swapped on a copy.
    async fn penetrate(&self, conn: &Connection, real: &'static str, args: &[Bytes]) -> Frame {
        let mut line = args.to_vec();
        line[0] = Bytes::from_static(real.as_bytes());
        self.engine.exec(conn, &line).await
    }

    /// Routes a single-key command on `args[1]`.
    async fn default_route(&self, conn: &Connection, args: CmdLine) -> Frame {
        let Some(key) = args.get(1).cloned() else {
            let name = command_name(&args).unwrap_or_default();
            return Frame::error(format!(
                "ERR wrong number of arguments for '{name}' command"
            ));
        };
        if let Err(e) = self.ensure_key(conn, &key).await {
            return err_frame(e);
        }
        let node = match self.pick_node(key_slot(&key)).await {
            Ok(node) => node,
            Err(e) => return err_frame(e),
        };
        self.forward(conn, &node, &args).await
    }

    /// Returns the node currently responsible for `slot`.
    pub async fn pick_node(&self, slot: u16) -> Result<ClusterNode, ClusterError> {
        self.state.read().await.owner_of(slot).cloned()
    }

    /// Resolves the owners of `keys`, grouping key indexes by node in
    /// first-seen order.
    pub async fn group_by_owner(
        &self,
        keys: &[Bytes],
    ) -> Result<Vec<(ClusterNode, Vec<usize>)>, ClusterError> {
        let state = self.state.read().await;
        let mut groups: Vec<(ClusterNode, Vec<usize>)> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let owner = state.owner_of(key_slot(key))?;
            match groups.iter_mut().find(|(node, _)| node.id == owner.id) {
                Some((_, idx)) => idx.push(i),
                None => groups.push((owner.clone(), vec![i])),
            }
        }
        Ok(groups)
    }

    /// Runs the migration guard for each key in turn.
    pub async fn ensure_keys(&self, conn: &Connection, keys: &[Bytes]) -> Result<(), ClusterError> {
        for key in keys {
            self.ensure_key(conn, key).await?;
        }
        Ok(())
    }

    /// The migration guard.
    ///
    /// Returns immediately for keys in slots with no migration. For a slot
    /// importing into this node, pulls a not-yet-imported key from the
    /// source first. For a slot migrating away, a key that already moved
    /// is refused with a retryable error. The key lock is held only around
    /// the state checks, never across the pull.
    pub async fn ensure_key(&self, conn: &Connection, key: &Bytes) -> Result<(), ClusterError> {
        let slot = key_slot(key);
        let status = {
            let _lock = self.engine.locks().write(key).await;
            self.key_status(slot, key).await
        };
        match status {
            KeyStatus::Stable => Ok(()),
            KeyStatus::Moved { target } => {
                debug!(slot, %target, "key already migrated");
                Err(ClusterError::MigrationPending { slot })
            }
            KeyStatus::NeedsPull { source } => self.pull_key(conn, slot, key, source).await,
        }
    }

    async fn key_status(&self, slot: u16, key: &[u8]) -> KeyStatus {
        let owns = self.state.read().await.owns_slot(slot);
        self.migration.lock().await.key_status(slot, key, owns)
    }

    /// Copies `key` from the migration source, then installs it unless a
    /// local write got there first.
    async fn pull_key(
        &self,
        conn: &Connection,
        slot: u16,
        key: &Bytes,
        source: NodeId,
    ) -> Result<(), ClusterError> {
        let node = self
            .state
            .read()
            .await
            .node(source)
            .cloned()
            .ok_or(ClusterError::NodeNotFound(source))?;

        let line = vec![Bytes::from_static(b"dumpkey_"), key.clone()];
        let reply = match self.relay(conn, &node, &line).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(slot, %source, "migration pull failed: {e}");
                return Err(ClusterError::MigrationPending { slot });
            }
        };

        let _lock = self.engine.locks().write(key).await;
        // the slot may have settled, or another task pulled the key, while
        // the lock was released
        if !matches!(self.key_status(slot, key).await, KeyStatus::NeedsPull { .. }) {
            return Ok(());
        }
        match reply {
            Frame::Bulk(payload) => {
                if let Err(e) = self.engine.restore(key.clone(), &payload, false) {
                    warn!(slot, "pulled payload rejected: {e}");
                    return Err(ClusterError::MigrationPending { slot });
                }
            }
            // nothing to import
            Frame::Null => {}
            other => {
                warn!(slot, %source, "migration pull refused: {other:?}");
                return Err(ClusterError::MigrationPending { slot });
            }
        }
        self.migration.lock().await.key_moved(slot, key);
        debug!(slot, %source, "key imported");
        Ok(())
    }

    /// Records that `key` was transferred out of this node.
    pub async fn mark_key_moved(&self, key: &[u8]) {
        self.migration.lock().await.key_moved(key_slot(key), key);
    }

    /// Sends `args` to `node` and returns its reply verbatim.
    ///
    /// A relay to this node dispatches locally. Transport failures and
    /// timeouts are errors; an error reply from the peer is not.
    pub async fn relay(
        &self,
        conn: &Connection,
        node: &ClusterNode,
        args: &[Bytes],
    ) -> Result<Frame, ClusterError> {
        if node.id == self.local_id {
            return Ok(self.exec_local(conn, args).await);
        }
        debug!(conn = conn.id, node = %node.id, cmd = ?command_name(args), "relay");
        match tokio::time::timeout(self.options.peer_timeout, self.transport.call(node.addr, args))
            .await
        {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!(node = %node.id, addr = %node.addr, "relay failed: {e}");
                Err(ClusterError::relay(node.id, e))
            }
            Err(_) => {
                warn!(node = %node.id, addr = %node.addr, "relay timed out");
                Err(ClusterError::Timeout(node.id))
            }
        }
    }

    /// Runs a routing-level command where its keys live: on the engine
    /// when `node` is this node, relayed otherwise. Routing errors become
    /// error replies.
    pub async fn forward(&self, conn: &Connection, node: &ClusterNode, args: &[Bytes]) -> Frame {
        if node.id == self.local_id {
            return self.engine.exec(conn, args).await;
        }
        self.relay(conn, node, args).await.unwrap_or_else(err_frame)
    }

    /// Every known node, this one included, in a stable order.
    pub async fn all_nodes(&self) -> Vec<ClusterNode> {
        self.state
            .read()
            .await
            .nodes()
            .into_iter()
            .cloned()
            .collect()
    }
}
