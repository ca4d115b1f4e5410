//! The CLUSTER command: slot inspection and the SETSLOT migration surface.
//!
//! SETSLOT drives the migration guard. A slot moves by marking it
//! IMPORTING on the target and MIGRATING on the source, letting keys be
//! pulled on access, then assigning it with SETSLOT NODE on every node.

use bytes::Bytes;
use cinder_cluster::{key_slot, NodeId, SLOT_COUNT};
use cinder_core::Connection;
use cinder_protocol::{CmdLine, Frame};
use tracing::info;

use super::registry::HandlerFuture;
use super::{err_frame, Cluster};

pub fn cluster<'a>(c: &'a Cluster, _conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.cluster_command(args))
}

fn wrong_args(sub: &str) -> Frame {
    Frame::error(format!(
        "ERR wrong number of arguments for 'cluster|{sub}' command"
    ))
}

fn parse_slot(raw: &Bytes) -> Result<u16, Frame> {
    let text = String::from_utf8_lossy(raw);
    match text.parse::<u16>() {
        Ok(slot) if slot < SLOT_COUNT => Ok(slot),
        _ => Err(Frame::error(format!("ERR Invalid or out of range slot {text}"))),
    }
}

fn parse_node(raw: &Bytes) -> Result<NodeId, Frame> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| NodeId::parse(s).ok())
        .ok_or_else(|| Frame::error("ERR Invalid node ID"))
}

impl Cluster {
    async fn cluster_command(&self, args: CmdLine) -> Frame {
        let Some(sub) = args.get(1) else {
            return Frame::error("ERR wrong number of arguments for 'cluster' command");
        };
        let sub = String::from_utf8_lossy(sub).to_ascii_lowercase();
        match (sub.as_str(), args.len()) {
            ("keyslot", 3) => Frame::Integer(i64::from(key_slot(&args[2]))),
            ("myid", 2) => Frame::bulk(self.local_id.0.to_string()),
            ("nodes", 2) => Frame::bulk(self.state.read().await.cluster_nodes()),
            ("setslot", 4 | 5) => self.cluster_setslot(&args[2..]).await,
            ("keyslot" | "myid" | "nodes" | "setslot", _) => wrong_args(&sub),
            _ => Frame::error(format!("ERR unknown subcommand '{sub}' for 'cluster'")),
        }
    }

    /// `SETSLOT <slot> IMPORTING|MIGRATING|NODE <id>` or
    /// `SETSLOT <slot> STABLE`.
    async fn cluster_setslot(&self, args: &[Bytes]) -> Frame {
        let slot = match parse_slot(&args[0]) {
            Ok(slot) => slot,
            Err(reply) => return reply,
        };
        let action = String::from_utf8_lossy(&args[1]).to_ascii_lowercase();
        match (action.as_str(), args.get(2)) {
            ("stable", None) => self.setslot_stable(slot).await,
            ("importing" | "migrating" | "node", Some(raw)) => {
                let node = match parse_node(raw) {
                    Ok(node) => node,
                    Err(reply) => return reply,
                };
                match action.as_str() {
                    "importing" => self.setslot_importing(slot, node).await,
                    "migrating" => self.setslot_migrating(slot, node).await,
                    _ => self.setslot_node(slot, node).await,
                }
            }
            ("stable" | "importing" | "migrating" | "node", _) => wrong_args("setslot"),
            _ => Frame::error(format!("ERR unknown SETSLOT action '{action}'")),
        }
    }

    /// This node becomes the target of a migration from `source`.
    async fn setslot_importing(&self, slot: u16, source: NodeId) -> Frame {
        if source == self.local_id {
            return Frame::error("ERR can't import from myself");
        }
        if self.state.read().await.node(source).is_none() {
            return Frame::error(format!("ERR Unknown node {source}"));
        }
        let mut migration = self.migration.lock().await;
        match migration.start_import(slot, source, self.local_id) {
            Ok(m) => {
                info!(slot, %source, id = m.id.0, "importing slot");
                Frame::ok()
            }
            Err(e) => Frame::Error(format!("ERR {e}")),
        }
    }

    /// Starts moving an owned slot to `target`.
    async fn setslot_migrating(&self, slot: u16, target: NodeId) -> Frame {
        if target == self.local_id {
            return Frame::error("ERR can't migrate to myself");
        }
        {
            let state = self.state.read().await;
            if state.node(target).is_none() {
                return Frame::error(format!("ERR Unknown node {target}"));
            }
            if !state.owns_slot(slot) {
                return Frame::Error(format!("ERR I'm not the owner of hash slot {slot}"));
            }
        }
        let mut migration = self.migration.lock().await;
        match migration.start_migrate(slot, self.local_id, target) {
            Ok(m) => {
                info!(slot, %target, id = m.id.0, "migrating slot");
                Frame::ok()
            }
            Err(e) => Frame::Error(format!("ERR {e}")),
        }
    }

    /// Assigns the slot to `node` and ends any migration of it.
    async fn setslot_node(&self, slot: u16, node: NodeId) -> Frame {
        if let Err(e) = self.state.write().await.assign_slot(slot, node) {
            return err_frame(e);
        }
        let finished = self.migration.lock().await.complete_migration(slot);
        match finished {
            Some(m) => info!(slot, %node, keys_moved = m.keys_moved, "slot migration finished"),
            None => info!(slot, %node, "slot assigned"),
        }
        Frame::ok()
    }

    /// Abandons any migration of the slot, leaving ownership alone.
    async fn setslot_stable(&self, slot: u16) -> Frame {
        if let Some(m) = self.migration.lock().await.abort_migration(slot) {
            info!(slot, state = %m.state, "slot migration aborted");
        }
        Frame::ok()
    }

    /// True if `slot` has an active migration in either direction.
    pub async fn is_migrating(&self, slot: u16) -> bool {
        let migration = self.migration.lock().await;
        migration.is_migrating(slot) || migration.is_importing(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_parsing() {
        assert_eq!(parse_slot(&Bytes::from("0")), Ok(0));
        assert_eq!(parse_slot(&Bytes::from("16383")), Ok(16383));
        assert_eq!(
            parse_slot(&Bytes::from("16384")),
            Err(Frame::error("ERR Invalid or out of range slot 16384"))
        );
        assert!(parse_slot(&Bytes::from("-1")).is_err());
    }

    #[test]
    fn node_parsing() {
        let id = NodeId::new();
        assert_eq!(parse_node(&Bytes::from(id.0.to_string())), Ok(id));
        assert_eq!(
            parse_node(&Bytes::from("abc")),
            Err(Frame::error("ERR Invalid node ID"))
        );
    }
}
