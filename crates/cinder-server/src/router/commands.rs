//! Custom handlers for commands that don't route on a single key.
//!
//! Multi-key commands group their keys by owning node. Keys on one node
//! run there directly; writes spanning nodes go through a two-phase commit.
//! Reads (MGET, EXISTS) scatter to each owner and gather the replies.

use bytes::Bytes;
use cinder_cluster::{key_slot, ClusterError};
use cinder_core::Connection;
use cinder_protocol::{CmdLine, Frame};
use tracing::warn;

use super::registry::HandlerFuture;
use super::tcc::TxOutcome;
use super::{err_frame, Cluster};

fn wrong_args(name: &str) -> Frame {
    Frame::error(format!("ERR wrong number of arguments for '{name}' command"))
}

/// Builds `[name, keys[idx[0]], keys[idx[1]], ...]`, taking `width`
/// arguments per selected key (2 for `k v` pairs).
fn sub_command(name: &'static str, args: &[Bytes], idx: &[usize], width: usize) -> CmdLine {
    let mut line = Vec::with_capacity(1 + idx.len() * width);
    line.push(Bytes::from_static(name.as_bytes()));
    for &i in idx {
        let start = 1 + i * width;
        line.extend_from_slice(&args[start..start + width]);
    }
    line
}

fn sum_integers(replies: &[Frame]) -> Result<i64, Frame> {
    replies.iter().try_fold(0i64, |acc, reply| match reply {
        Frame::Integer(n) => Ok(acc + n),
        Frame::Error(_) => Err(reply.clone()),
        other => Err(Frame::error(format!("ERR unexpected reply {other:?}"))),
    })
}

pub fn ping<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(async move {
        if args.len() > 2 {
            return wrong_args("ping");
        }
        c.engine().exec(conn, &args).await
    })
}

pub fn del<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.del_keys(conn, args))
}

pub fn exists<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.exists_keys(conn, args))
}

pub fn mset<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.mset_pairs(conn, args, false))
}

pub fn msetnx<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.mset_pairs(conn, args, true))
}

pub fn mget<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.mget_keys(conn, args))
}

pub fn rename<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.rename_key(conn, args, false))
}

pub fn renamenx<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.rename_key(conn, args, true))
}

pub fn copy<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.copy_key(conn, args))
}

pub fn publish<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(async move {
        if args.len() != 3 {
            return wrong_args("publish");
        }
        let line = vec![Bytes::from_static(b"_publish"), args[1].clone(), args[2].clone()];
        match c.broadcast(conn, &line).await {
            Ok(replies) => sum_integers(&replies).map_or_else(|e| e, Frame::Integer),
            Err(e) => err_frame(e),
        }
    })
}

pub fn flushdb<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.flush(conn, args, "flushdb_"))
}

pub fn flushall<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.flush(conn, args, "flushall_"))
}

impl Cluster {
    async fn del_keys(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() < 2 {
            return wrong_args("del");
        }
        let keys = &args[1..];
        if let Err(e) = self.ensure_keys(conn, keys).await {
            return err_frame(e);
        }
        let groups = match self.group_by_owner(keys).await {
            Ok(groups) => groups,
            Err(e) => return err_frame(e),
        };
        if let [(node, _)] = groups.as_slice() {
            return self.forward(conn, node, &args).await;
        }

        let parts = groups
            .into_iter()
            .map(|(node, idx)| (node, sub_command("del", &args, &idx, 1)))
            .collect();
        match self.run_tx(conn, parts).await {
            Ok(TxOutcome::Committed(replies)) => {
                sum_integers(&replies).map_or_else(|e| e, Frame::Integer)
            }
            Ok(TxOutcome::Declined) => Frame::Integer(0),
            Err(e) => err_frame(e),
        }
    }

    async fn exists_keys(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() < 2 {
            return wrong_args("exists");
        }
        let keys = &args[1..];
        if let Err(e) = self.ensure_keys(conn, keys).await {
            return err_frame(e);
        }
        let groups = match self.group_by_owner(keys).await {
            Ok(groups) => groups,
            Err(e) => return err_frame(e),
        };
        let mut replies = Vec::with_capacity(groups.len());
        for (node, idx) in groups {
            let line = sub_command("exists", &args, &idx, 1);
            replies.push(self.forward(conn, &node, &line).await);
        }
        sum_integers(&replies).map_or_else(|e| e, Frame::Integer)
    }

    async fn mset_pairs(&self, conn: &Connection, args: CmdLine, nx: bool) -> Frame {
        let name = if nx { "msetnx" } else { "mset" };
        if args.len() < 3 || args.len() % 2 == 0 {
            return wrong_args(name);
        }
        let keys: Vec<Bytes> = args[1..].iter().step_by(2).cloned().collect();
        if let Err(e) = self.ensure_keys(conn, &keys).await {
            return err_frame(e);
        }
        let groups = match self.group_by_owner(&keys).await {
            Ok(groups) => groups,
            Err(e) => return err_frame(e),
        };
        if let [(node, _)] = groups.as_slice() {
            return self.forward(conn, node, &args).await;
        }

        let parts = groups
            .into_iter()
            .map(|(node, idx)| (node, sub_command(name, &args, &idx, 2)))
            .collect();
        match self.run_tx(conn, parts).await {
            Ok(TxOutcome::Committed(_)) if nx => Frame::Integer(1),
            Ok(TxOutcome::Committed(_)) => Frame::ok(),
            Ok(TxOutcome::Declined) => Frame::Integer(0),
            Err(e) => err_frame(e),
        }
    }

    async fn mget_keys(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() < 2 {
            return wrong_args("mget");
        }
        let keys = &args[1..];
        if let Err(e) = self.ensure_keys(conn, keys).await {
            return err_frame(e);
        }
        let groups = match self.group_by_owner(keys).await {
            Ok(groups) => groups,
            Err(e) => return err_frame(e),
        };

        let mut values = vec![Frame::Null; keys.len()];
        for (node, idx) in groups {
            let line = sub_command("mget", &args, &idx, 1);
            match self.forward(conn, &node, &line).await {
                Frame::Array(items) if items.len() == idx.len() => {
                    for (i, item) in idx.into_iter().zip(items) {
                        values[i] = item;
                    }
                }
                err @ Frame::Error(_) => return err,
                other => {
                    return Frame::error(format!(
                        "ERR unexpected mget reply from node {}: {other:?}",
                        node.id
                    ))
                }
            }
        }
        Frame::Array(values)
    }

    async fn rename_key(&self, conn: &Connection, args: CmdLine, nx: bool) -> Frame {
        if args.len() != 3 {
            return wrong_args(if nx { "renamenx" } else { "rename" });
        }
        let (src, dst) = (&args[1], &args[2]);
        if let Err(e) = self.ensure_keys(conn, &args[1..]).await {
            return err_frame(e);
        }
        let owners = async {
            Ok::<_, ClusterError>((
                self.pick_node(key_slot(src)).await?,
                self.pick_node(key_slot(dst)).await?,
            ))
        };
        let (src_node, dst_node) = match owners.await {
            Ok(owners) => owners,
            Err(e) => return err_frame(e),
        };
        if src_node.id == dst_node.id {
            return self.forward(conn, &src_node, &args).await;
        }
        self.rename_across(conn, &src_node, &dst_node, src, dst, nx)
            .await
    }

    /// COPY across nodes: dump from the source owner, restore on the
    /// destination owner. Same-owner copies run there as `copy_`.
    async fn copy_key(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() != 3 && args.len() != 4 {
            return wrong_args("copy");
        }
        let replace = match args.get(3) {
            None => false,
            Some(opt) if opt.eq_ignore_ascii_case(b"replace") => true,
            Some(_) => return Frame::error("ERR syntax error"),
        };
        let (src, dst) = (&args[1], &args[2]);
        if let Err(e) = self.ensure_keys(conn, &args[1..3]).await {
            return err_frame(e);
        }
        let owners = async {
            Ok::<_, ClusterError>((
                self.pick_node(key_slot(src)).await?,
                self.pick_node(key_slot(dst)).await?,
            ))
        };
        let (src_node, dst_node) = match owners.await {
            Ok(owners) => owners,
            Err(e) => return err_frame(e),
        };

        if src_node.id == dst_node.id {
            let mut line = args.clone();
            line[0] = Bytes::from_static(b"copy_");
            return self
                .relay(conn, &src_node, &line)
                .await
                .unwrap_or_else(err_frame);
        }

        let dump = vec![Bytes::from_static(b"dumpkey_"), src.clone()];
        let payload = match self.relay(conn, &src_node, &dump).await {
            Ok(Frame::Bulk(payload)) => payload,
            Ok(Frame::Null) => return Frame::Integer(0),
            Ok(other) => return other,
            Err(e) => return err_frame(e),
        };
        let mut restore = vec![
            Bytes::from_static(b"restorekey_"),
            dst.clone(),
            Bytes::from_static(b"0"),
            payload,
        ];
        if replace {
            restore.push(Bytes::from_static(b"REPLACE"));
        }
        match self.relay(conn, &dst_node, &restore).await {
            Ok(Frame::Error(msg)) if msg.starts_with("BUSYKEY") => Frame::Integer(0),
            Ok(Frame::Error(msg)) => Frame::Error(msg),
            Ok(_) => Frame::Integer(1),
            Err(e) => err_frame(e),
        }
    }

    /// Sends `line` to every node, this one included. Any node failing
    /// fails the whole command; nothing is retried.
    pub(crate) async fn broadcast(
        &self,
        conn: &Connection,
        line: &[Bytes],
    ) -> Result<Vec<Frame>, ClusterError> {
        let mut replies = Vec::new();
        let mut failed = Vec::new();
        for node in self.all_nodes().await {
            match self.relay(conn, &node, line).await {
                Ok(reply) if !reply.is_error() => replies.push(reply),
                Ok(reply) => {
                    warn!(node = %node.id, "broadcast refused: {reply:?}");
                    failed.push(node.id.to_string());
                }
                Err(e) => {
                    warn!(node = %node.id, "broadcast failed: {e}");
                    failed.push(node.id.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(replies)
        } else {
            Err(ClusterError::BroadcastFailed(failed.join(", ")))
        }
    }

    async fn flush(&self, conn: &Connection, args: CmdLine, penetrating: &'static str) -> Frame {
        if args.len() != 1 {
            return wrong_args(penetrating.trim_end_matches('_'));
        }
        let line = vec![Bytes::from_static(penetrating.as_bytes())];
        match self.broadcast(conn, &line).await {
            Ok(_) => Frame::ok(),
            Err(e) => err_frame(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use cinder_protocol::cmd_line;

    use super::*;

    #[test]
    fn sub_command_selects_keys() {
        let args = cmd_line(["mset", "a", "1", "b", "2", "c", "3"]);
        let line = sub_command("mset", &args, &[0, 2], 2);
        assert_eq!(line, cmd_line(["mset", "a", "1", "c", "3"]));

        let args = cmd_line(["del", "x", "y", "z"]);
        assert_eq!(sub_command("del", &args, &[1], 1), cmd_line(["del", "y"]));
    }

    #[test]
    fn integer_sums() {
        assert_eq!(sum_integers(&[Frame::Integer(2), Frame::Integer(3)]), Ok(5));
        assert_eq!(sum_integers(&[]), Ok(0));
        let err = Frame::error("ERR boom");
        assert_eq!(sum_integers(&[Frame::Integer(1), err.clone()]), Err(err));
    }
}
