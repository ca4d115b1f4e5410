//! MULTI/EXEC/DISCARD.
//!
//! Queuing is per connection ([`Session`]). On EXEC the whole batch runs
//! where its keys live: on this node's engine, or relayed to the single
//! owner as one `_multi` command. A batch whose keys span nodes is
//! refused.
//!
//! `_multi` packs the batch into one command line:
//! `_multi <count> <argc> arg... <argc> arg...`.

use bytes::Bytes;
use cinder_cluster::ClusterError;
use cinder_core::{command, keys_of, Connection};
use cinder_protocol::{command_name, CmdLine, Frame};
use tracing::debug;

use super::registry::HandlerFuture;
use super::{err_frame, Cluster};

/// Per-connection transaction state.
#[derive(Debug, Default)]
pub struct Session {
    queued: Option<Vec<CmdLine>>,
    /// A command was refused while queuing; EXEC will abort.
    dirty: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_multi(&self) -> bool {
        self.queued.is_some()
    }

    /// Handles one command line from the connection's client.
    pub async fn handle(&mut self, cluster: &Cluster, conn: &Connection, args: CmdLine) -> Frame {
        let name = command_name(&args).unwrap_or_default();
        match name.as_str() {
            "multi" => {
                if self.queued.is_some() {
                    return Frame::error("ERR MULTI calls can not be nested");
                }
                self.queued = Some(Vec::new());
                self.dirty = false;
                Frame::ok()
            }
            "exec" => {
                let Some(cmds) = self.queued.take() else {
                    return Frame::error("ERR EXEC without MULTI");
                };
                if std::mem::take(&mut self.dirty) {
                    return Frame::error(
                        "EXECABORT Transaction discarded because of previous errors.",
                    );
                }
                cluster.exec_multi(conn, cmds).await
            }
            "discard" => {
                if self.queued.take().is_none() {
                    return Frame::error("ERR DISCARD without MULTI");
                }
                self.dirty = false;
                Frame::ok()
            }
            _ => match self.queued.as_mut() {
                Some(queue) => match queueable(&name, &args) {
                    Ok(()) => {
                        queue.push(args);
                        Frame::Simple("QUEUED".into())
                    }
                    Err(reply) => {
                        self.dirty = true;
                        reply
                    }
                },
                None => cluster.exec(conn, &args).await,
            },
        }
    }
}

/// Only engine commands with a valid arity can be queued.
fn queueable(name: &str, args: &[Bytes]) -> Result<(), Frame> {
    let spec = command::lookup(name)
        .ok_or_else(|| Frame::error(format!("ERR unknown command '{name}'")))?;
    if !spec.arity_ok(args.len()) {
        return Err(Frame::error(format!(
            "ERR wrong number of arguments for '{name}' command"
        )));
    }
    Ok(())
}

pub(crate) fn encode_batch(cmds: &[CmdLine]) -> CmdLine {
    let mut line = vec![
        Bytes::from_static(b"_multi"),
        Bytes::from(cmds.len().to_string()),
    ];
    for cmd in cmds {
        line.push(Bytes::from(cmd.len().to_string()));
        line.extend(cmd.iter().cloned());
    }
    line
}

pub(crate) fn decode_batch(args: &[Bytes]) -> Option<Vec<CmdLine>> {
    fn count(raw: &Bytes) -> Option<usize> {
        std::str::from_utf8(raw).ok()?.parse().ok()
    }

    let mut rest = args.get(1..)?;
    let (first, tail) = rest.split_first()?;
    let n = count(first)?;
    rest = tail;
    let mut cmds = Vec::with_capacity(n.min(rest.len()));
    for _ in 0..n {
        let (first, tail) = rest.split_first()?;
        let argc = count(first)?;
        if argc == 0 || argc > tail.len() {
            return None;
        }
        cmds.push(tail[..argc].to_vec());
        rest = &tail[argc..];
    }
    rest.is_empty().then_some(cmds)
}

/// Runs a batch relayed by a peer on the local engine.
pub fn relayed_multi<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(async move {
        match decode_batch(&args) {
            Some(cmds) => c.engine().exec_batch(conn, &cmds).await,
            None => Frame::error("ERR malformed _multi batch"),
        }
    })
}

impl Cluster {
    /// Executes a queued MULTI batch as one unit.
    pub async fn exec_multi(&self, conn: &Connection, cmds: Vec<CmdLine>) -> Frame {
        if cmds.is_empty() {
            return Frame::Array(Vec::new());
        }
        let mut keys = Vec::new();
        for cmd in &cmds {
            match keys_of(cmd) {
                Some((write, read)) => {
                    keys.extend(write);
                    keys.extend(read);
                }
                None => {
                    let name = command_name(cmd).unwrap_or_default();
                    return Frame::error(format!(
                        "EXECABORT Transaction discarded because of previous errors: \
                         ERR unknown command '{name}'"
                    ));
                }
            }
        }

        if let Err(e) = self.ensure_keys(conn, &keys).await {
            return err_frame(e);
        }
        let groups = match self.group_by_owner(&keys).await {
            Ok(groups) => groups,
            Err(e) => return err_frame(e),
        };
        match groups.as_slice() {
            [] => self.engine.exec_batch(conn, &cmds).await,
            [(node, _)] if node.id == self.local_id => self.engine.exec_batch(conn, &cmds).await,
            [(node, _)] => {
                debug!(conn = conn.id, node = %node.id, len = cmds.len(), "relaying multi");
                self.relay(conn, node, &encode_batch(&cmds))
                    .await
                    .unwrap_or_else(err_frame)
            }
            _ => err_frame(ClusterError::CrossNode(groups.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use cinder_protocol::cmd_line;

    use super::*;

    #[test]
    fn batch_encoding() {
        let cmds = vec![cmd_line(["set", "a", "1"]), cmd_line(["incr", "a"])];
        let line = encode_batch(&cmds);
        assert_eq!(
            line,
            cmd_line(["_multi", "2", "3", "set", "a", "1", "2", "incr", "a"])
        );
        assert_eq!(decode_batch(&line), Some(cmds));
    }

    #[test]
    fn malformed_batches() {
        assert_eq!(decode_batch(&cmd_line(["_multi"])), None);
        assert_eq!(decode_batch(&cmd_line(["_multi", "x"])), None);
        // argc runs past the end
        assert_eq!(decode_batch(&cmd_line(["_multi", "1", "3", "get", "a"])), None);
        // trailing garbage
        assert_eq!(decode_batch(&cmd_line(["_multi", "1", "1", "ping", "x"])), None);
        assert_eq!(decode_batch(&cmd_line(["_multi", "0"])), Some(vec![]));
    }

    #[test]
    fn only_engine_commands_queue() {
        assert!(queueable("set", &cmd_line(["set", "a", "1"])).is_ok());
        assert!(queueable("set", &cmd_line(["set", "a"])).is_err());
        assert!(queueable("cluster", &cmd_line(["cluster", "myid"])).is_err());
    }
}
