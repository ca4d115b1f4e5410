//! Two-phase commit across nodes.
//!
//! The coordinator is the node that received the client command. It sends
//! `prepare <txid> <sub> args...` to each participant in turn, and once
//! every participant has prepared, `commit <txid>` to all of them. If any
//! prepare fails it sends `rollback <txid>` to every participant that
//! prepared or whose outcome is unknown.
//!
//! A participant validates its part under the engine's key locks, records
//! the command it will run on commit, and reserves the keys in the engine.
//! Until commit or rollback, another prepare over those keys is rejected
//! and plain writes to them get `TRYAGAIN`. Nothing is visible until
//! commit. Prepared transactions that see neither commit nor rollback are
//! dropped after `tx_timeout`.
//!
//! Prepare replies: an error frame rejects, integer 0 declines (an NX
//! condition failed, the transaction aborts without an error), anything
//! else is a successful prepare and may carry data for the coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use cinder_cluster::{ClusterError, ClusterNode};
use cinder_core::{Connection, Engine};
use cinder_protocol::{command_name, CmdLine, Frame};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::registry::HandlerFuture;
use super::{err_frame, Cluster};

/// Transaction identifier.
pub type TxId = Uuid;

/// A prepared transaction on a participant.
#[derive(Debug)]
pub struct TxRecord {
    /// Keys reserved by this transaction.
    pub keys: Vec<Bytes>,
    /// Commands applied, in order, on commit.
    pub commit: Vec<CmdLine>,
    timer: Option<AbortHandle>,
}

impl TxRecord {
    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

/// Prepared transactions held by a participant. Key reservations live in
/// the engine, where every write checks them.
#[derive(Debug)]
pub struct TxTable {
    engine: Arc<Engine>,
    txs: Mutex<HashMap<TxId, TxRecord>>,
}

impl TxTable {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            txs: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TxId, TxRecord>> {
        self.txs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a prepared transaction and reserves its keys. The caller
    /// holds the write locks of `keys`.
    ///
    /// Fails if the id is already in use or another transaction holds any
    /// of the keys.
    pub fn prepare(&self, tx: TxId, keys: Vec<Bytes>, commit: Vec<CmdLine>) -> Result<(), String> {
        let mut txs = self.lock();
        if txs.contains_key(&tx) {
            return Err(format!("transaction {tx} already prepared"));
        }
        self.engine
            .reservations()
            .reserve(&keys, tx.as_u128())
            .map_err(|(key, holder)| {
                format!(
                    "key '{}' is held by transaction {}",
                    String::from_utf8_lossy(&key),
                    Uuid::from_u128(holder)
                )
            })?;
        txs.insert(
            tx,
            TxRecord {
                keys,
                commit,
                timer: None,
            },
        );
        Ok(())
    }

    /// Keys reserved by a prepared transaction.
    pub fn keys_of(&self, tx: TxId) -> Option<Vec<Bytes>> {
        self.lock().get(&tx).map(|r| r.keys.clone())
    }

    /// Removes a transaction and releases its keys.
    pub fn take(&self, tx: TxId) -> Option<TxRecord> {
        let record = self.lock().remove(&tx)?;
        self.engine.reservations().release(&record.keys, tx.as_u128());
        Some(record)
    }

    /// Attaches the auto-rollback timer. Returns false if the transaction
    /// is already gone.
    fn set_timer(&self, tx: TxId, timer: AbortHandle) -> bool {
        match self.lock().get_mut(&tx) {
            Some(record) => {
                record.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_reserved(&self, key: &[u8]) -> bool {
        self.engine.reservations().is_held(key)
    }
}

fn wrong_args(name: &str) -> Frame {
    Frame::error(format!("ERR wrong number of arguments for '{name}' command"))
}

fn parse_tx(raw: &[u8]) -> Result<TxId, Frame> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Frame::error("ERR invalid transaction id"))
}

fn line<I>(name: &'static str, rest: I) -> CmdLine
where
    I: IntoIterator<Item = Bytes>,
{
    std::iter::once(Bytes::from_static(name.as_bytes()))
        .chain(rest)
        .collect()
}

/// What a participant stages for one prepare.
enum Staged {
    /// Prepared: reply to the coordinator, keys to reserve, commit batch.
    Ready(Frame, Vec<Bytes>, Vec<CmdLine>),
    Declined,
    Rejected(Frame),
}

pub fn prepare<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.prepare_tx(conn, args))
}

pub fn commit<'a>(c: &'a Cluster, conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(c.commit_tx(conn, args))
}

pub fn rollback<'a>(c: &'a Cluster, _conn: &'a Connection, args: CmdLine) -> HandlerFuture<'a> {
    Box::pin(async move { c.rollback_tx(&args) })
}

/// Result of a transaction that didn't fail.
#[derive(Debug, PartialEq)]
pub enum TxOutcome {
    /// Every participant committed; replies in participant order.
    Committed(Vec<Frame>),
    /// A participant declined its NX condition; nothing was applied.
    Declined,
}

/// How one participant's commit ended, as far as the coordinator knows.
#[derive(Debug)]
enum Applied {
    Yes(Frame),
    /// The participant answered with an error to the first attempt, so
    /// the commit did not run there.
    No,
    /// The reply was lost; the commit may or may not have run.
    Unknown,
}

/// A participant's answer to prepare.
#[derive(Debug)]
enum Vote {
    Prepared(Frame),
    Declined,
    Rejected(String),
    Unreachable(ClusterError),
}

/// Drives one transaction from the coordinator side.
struct Coordinator<'a> {
    cluster: &'a Cluster,
    conn: &'a Connection,
    tx: TxId,
    /// Participants that prepared or may have, in prepare order.
    staged: Vec<ClusterNode>,
}

impl<'a> Coordinator<'a> {
    fn new(cluster: &'a Cluster, conn: &'a Connection) -> Self {
        Self {
            cluster,
            conn,
            tx: Uuid::new_v4(),
            staged: Vec::new(),
        }
    }

    fn tx_bytes(&self) -> Bytes {
        Bytes::from(self.tx.to_string())
    }

    async fn prepare(&mut self, node: &ClusterNode, sub: &[Bytes]) -> Vote {
        let mut args = Vec::with_capacity(sub.len() + 2);
        args.push(Bytes::from_static(b"prepare"));
        args.push(self.tx_bytes());
        args.extend_from_slice(sub);

        let vote = match self.cluster.relay(self.conn, node, &args).await {
            Ok(Frame::Error(reason)) => Vote::Rejected(reason),
            Ok(Frame::Integer(0)) => Vote::Declined,
            Ok(reply) => Vote::Prepared(reply),
            Err(e) => Vote::Unreachable(e),
        };
        match &vote {
            Vote::Prepared(_) => self.staged.push(node.clone()),
            Vote::Unreachable(e) => {
                warn!(tx = %self.tx, node = %node.id, "prepare outcome unknown: {e}");
                self.staged.push(node.clone());
            }
            Vote::Rejected(reason) => {
                warn!(tx = %self.tx, node = %node.id, "prepare rejected: {reason}");
            }
            Vote::Declined => debug!(tx = %self.tx, node = %node.id, "prepare declined"),
        }
        vote
    }

    /// Turns a failed vote into the error reported to the client.
    fn abort_error(&self, node: &ClusterNode, vote: Vote) -> ClusterError {
        let reason = match vote {
            Vote::Rejected(reason) => reason,
            Vote::Unreachable(e) => e.to_string(),
            Vote::Prepared(_) | Vote::Declined => String::new(),
        };
        ClusterError::PrepareRejected {
            tx: self.tx.to_string(),
            node: node.id,
            reason,
        }
    }

    async fn rollback(self) {
        let args = vec![Bytes::from_static(b"rollback"), self.tx_bytes()];
        for node in &self.staged {
            match self.cluster.relay(self.conn, node, &args).await {
                Ok(reply) if !reply.is_error() => {}
                Ok(reply) => warn!(tx = %self.tx, node = %node.id, "rollback refused: {reply:?}"),
                // the participant drops the transaction on its own after
                // tx_timeout
                Err(e) => warn!(tx = %self.tx, node = %node.id, "rollback failed: {e}"),
            }
        }
        debug!(tx = %self.tx, participants = self.staged.len(), "transaction rolled back");
    }

    /// Commits every staged participant in prepare order.
    ///
    /// Only when the first participant refuses its commit outright is
    /// nothing applied; the rest are then rolled back. Once any commit may
    /// have run, the remaining participants are still committed and every
    /// participant not known to have applied is reported, since the nodes
    /// may now disagree.
    async fn commit(self) -> Result<Vec<Frame>, ClusterError> {
        let args = vec![Bytes::from_static(b"commit"), self.tx_bytes()];
        let mut replies = Vec::with_capacity(self.staged.len());
        let mut failed = Vec::new();

        for (i, node) in self.staged.iter().enumerate() {
            match self.commit_one(node, &args).await {
                Applied::Yes(reply) => replies.push(reply),
                Applied::No if i == 0 => {
                    let rest = Coordinator {
                        cluster: self.cluster,
                        conn: self.conn,
                        tx: self.tx,
                        staged: self.staged[1..].to_vec(),
                    };
                    rest.rollback().await;
                    return Err(ClusterError::CommitFailed {
                        tx: self.tx.to_string(),
                        nodes: node.id.to_string(),
                    });
                }
                Applied::No | Applied::Unknown => failed.push(node.id.to_string()),
            }
        }

        if failed.is_empty() {
            debug!(tx = %self.tx, participants = replies.len(), "transaction committed");
            Ok(replies)
        } else {
            let nodes = failed.join(", ");
            error!(tx = %self.tx, %nodes, "commit incomplete, participants may diverge");
            Err(ClusterError::CommitFailed {
                tx: self.tx.to_string(),
                nodes,
            })
        }
    }

    /// Sends commit, and resends it once if the first reply was lost. An
    /// error on the resend can't tell a lost commit from one that already
    /// ran (the participant forgets the transaction as it applies it).
    async fn commit_one(&self, node: &ClusterNode, args: &[Bytes]) -> Applied {
        match self.cluster.relay(self.conn, node, args).await {
            Ok(Frame::Error(msg)) => {
                warn!(tx = %self.tx, node = %node.id, "commit refused: {msg}");
                return Applied::No;
            }
            Ok(reply) => return Applied::Yes(reply),
            Err(e) => warn!(tx = %self.tx, node = %node.id, "commit reply lost, resending: {e}"),
        }
        match self.cluster.relay(self.conn, node, args).await {
            Ok(Frame::Error(msg)) => {
                warn!(tx = %self.tx, node = %node.id, "commit outcome unknown: {msg}");
                Applied::Unknown
            }
            Ok(reply) => Applied::Yes(reply),
            Err(e) => {
                warn!(tx = %self.tx, node = %node.id, "commit outcome unknown: {e}");
                Applied::Unknown
            }
        }
    }
}

impl Cluster {
    /// Runs `parts` (one sub-command per participant) as a transaction.
    pub(crate) async fn run_tx(
        &self,
        conn: &Connection,
        parts: Vec<(ClusterNode, CmdLine)>,
    ) -> Result<TxOutcome, ClusterError> {
        let mut coord = Coordinator::new(self, conn);
        for (node, sub) in &parts {
            match coord.prepare(node, sub).await {
                Vote::Prepared(_) => {}
                Vote::Declined => {
                    coord.rollback().await;
                    return Ok(TxOutcome::Declined);
                }
                vote => {
                    let err = coord.abort_error(node, vote);
                    coord.rollback().await;
                    return Err(err);
                }
            }
        }
        coord.commit().await.map(TxOutcome::Committed)
    }

    /// RENAME/RENAMENX between keys owned by different nodes.
    ///
    /// The source prepares first and hands back the dumped value, which
    /// the destination stages for restore. On commit the destination is
    /// written before the source is deleted.
    pub(crate) async fn rename_across(
        &self,
        conn: &Connection,
        src_node: &ClusterNode,
        dst_node: &ClusterNode,
        src: &Bytes,
        dst: &Bytes,
        nx: bool,
    ) -> Frame {
        let mut coord = Coordinator::new(self, conn);
        let from = line("renamefrom", [src.clone()]);
        let payload = match coord.prepare(src_node, &from).await {
            Vote::Prepared(Frame::Bulk(payload)) => payload,
            // no such key, wrong arguments: the source's own error
            Vote::Rejected(reason) => return Frame::Error(reason),
            vote => {
                let err = coord.abort_error(src_node, vote);
                coord.rollback().await;
                return err_frame(err);
            }
        };

        let to_name = if nx { "renamenxto" } else { "renameto" };
        let to = line(to_name, [dst.clone(), payload]);
        match coord.prepare(dst_node, &to).await {
            Vote::Prepared(_) => {}
            Vote::Declined => {
                coord.rollback().await;
                return Frame::Integer(0);
            }
            vote => {
                let err = coord.abort_error(dst_node, vote);
                coord.rollback().await;
                return err_frame(err);
            }
        }

        // destination first, so a failed restore leaves the source intact
        coord.staged.reverse();
        match coord.commit().await {
            Ok(_) if nx => Frame::Integer(1),
            Ok(_) => Frame::ok(),
            Err(e) => err_frame(e),
        }
    }

    async fn prepare_tx(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() < 3 {
            return wrong_args("prepare");
        }
        let tx = match parse_tx(&args[1]) {
            Ok(tx) => tx,
            Err(reply) => return reply,
        };
        let sub = command_name(&args[2..]).unwrap_or_default();
        let sub_args = &args[3..];
        let keys = match staged_keys(&sub, sub_args) {
            Ok(keys) => keys,
            Err(reply) => return reply,
        };

        let staged = {
            let _locks = self.engine.locks().lock(&keys, &[]).await;
            let staged = self.stage(&sub, sub_args, keys);
            if let Staged::Ready(reply, keys, commit) = staged {
                match self.transactions.prepare(tx, keys, commit) {
                    Ok(()) => Staged::Ready(reply, Vec::new(), Vec::new()),
                    Err(reason) => Staged::Rejected(Frame::error(format!("ERR {reason}"))),
                }
            } else {
                staged
            }
        };

        match staged {
            Staged::Ready(reply, ..) => {
                self.arm_rollback_timer(tx);
                debug!(conn = conn.id, %tx, sub = %sub, "prepared");
                reply
            }
            Staged::Declined => Frame::Integer(0),
            Staged::Rejected(reply) => reply,
        }
    }

    /// Validates one prepare against the keyspace. Runs under the key
    /// locks.
    fn stage(&self, sub: &str, args: &[Bytes], keys: Vec<Bytes>) -> Staged {
        let ks = self.engine.keyspace();
        match sub {
            "mset" => Staged::Ready(Frame::ok(), keys, vec![line("mset", args.to_vec())]),
            "msetnx" => {
                if keys.iter().any(|k| ks.exists(k)) {
                    return Staged::Declined;
                }
                Staged::Ready(Frame::ok(), keys, vec![line("mset", args.to_vec())])
            }
            "del" => Staged::Ready(Frame::ok(), keys, vec![line("del", args.to_vec())]),
            "renamefrom" => match ks.dump(&args[0]) {
                Some(payload) => Staged::Ready(
                    Frame::Bulk(payload),
                    keys,
                    vec![line("del", [args[0].clone()])],
                ),
                None => Staged::Rejected(Frame::error("ERR no such key")),
            },
            "renameto" | "renamenxto" => {
                let nx = sub == "renamenxto";
                if nx && ks.exists(&args[0]) {
                    return Staged::Declined;
                }
                let mut restore = line(
                    "restorekey",
                    [args[0].clone(), Bytes::from_static(b"0"), args[1].clone()],
                );
                if !nx {
                    restore.push(Bytes::from_static(b"REPLACE"));
                }
                Staged::Ready(Frame::ok(), keys, vec![restore])
            }
            _ => Staged::Rejected(Frame::error(format!(
                "ERR unknown transaction command '{sub}'"
            ))),
        }
    }

    /// Drops the transaction if it is still prepared after `tx_timeout`.
    fn arm_rollback_timer(&self, tx: TxId) {
        let table = Arc::clone(&self.transactions);
        let timeout = self.options.tx_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if table.take(tx).is_some() {
                warn!(%tx, "prepared transaction timed out, rolled back");
            }
        })
        .abort_handle();
        if !self.transactions.set_timer(tx, timer.clone()) {
            timer.abort();
        }
    }

    async fn commit_tx(&self, conn: &Connection, args: CmdLine) -> Frame {
        if args.len() != 2 {
            return wrong_args("commit");
        }
        let tx = match parse_tx(&args[1]) {
            Ok(tx) => tx,
            Err(reply) => return reply,
        };
        let not_found = || Frame::error(format!("ERR transaction {tx} not found"));
        let Some(keys) = self.transactions.keys_of(tx) else {
            return not_found();
        };
        // the keys stay locked from release of the reservation until the
        // staged writes are in
        let _locks = self.engine.locks().lock(&keys, &[]).await;
        // the rollback timer may have fired while waiting for the locks
        let Some(record) = self.transactions.take(tx) else {
            return not_found();
        };
        record.cancel_timer();
        debug!(conn = conn.id, %tx, "commit");
        let mut replies: Vec<Frame> = record
            .commit
            .iter()
            .map(|line| self.engine.exec_locked(line))
            .collect();
        match replies.len() {
            1 => replies.pop().unwrap_or(Frame::Null),
            _ => Frame::Array(replies),
        }
    }

    /// Rolling back an unknown or finished transaction is not an error.
    fn rollback_tx(&self, args: &[Bytes]) -> Frame {
        if args.len() != 2 {
            return wrong_args("rollback");
        }
        let tx = match parse_tx(&args[1]) {
            Ok(tx) => tx,
            Err(reply) => return reply,
        };
        if let Some(record) = self.transactions.take(tx) {
            record.cancel_timer();
            debug!(%tx, "rolled back");
        }
        Frame::ok()
    }

    /// Number of transactions prepared on this node.
    pub fn prepared_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_reserved(&self, key: &[u8]) -> bool {
        self.transactions.is_reserved(key)
    }
}

/// Keys a prepare sub-command reserves, with an arity check.
fn staged_keys(sub: &str, args: &[Bytes]) -> Result<Vec<Bytes>, Frame> {
    let bad = || Frame::error(format!("ERR wrong number of arguments for prepare '{sub}'"));
    match sub {
        "mset" | "msetnx" => {
            if args.is_empty() || args.len() % 2 != 0 {
                return Err(bad());
            }
            Ok(args.iter().step_by(2).cloned().collect())
        }
        "del" if !args.is_empty() => Ok(args.to_vec()),
        "renamefrom" if args.len() == 1 => Ok(args.to_vec()),
        "renameto" | "renamenxto" if args.len() == 2 => Ok(vec![args[0].clone()]),
        "del" | "renamefrom" | "renameto" | "renamenxto" => Err(bad()),
        _ => Err(Frame::error(format!(
            "ERR unknown transaction command '{sub}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<Bytes> {
        names.iter().map(|n| Bytes::from(n.to_string())).collect()
    }

    fn table() -> TxTable {
        TxTable::new(Arc::new(Engine::new()))
    }

    #[test]
    fn prepare_reserves_keys() {
        let table = table();
        let tx = Uuid::new_v4();
        table.prepare(tx, keys(&["a", "b"]), vec![]).unwrap();
        assert!(table.is_reserved(b"a"));
        assert!(table.is_reserved(b"b"));
        assert_eq!(table.len(), 1);

        let other = Uuid::new_v4();
        let err = table.prepare(other, keys(&["b", "c"]), vec![]).unwrap_err();
        assert!(err.contains("held by transaction"));
        // a rejected prepare reserves nothing
        assert!(!table.is_reserved(b"c"));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = table();
        let tx = Uuid::new_v4();
        table.prepare(tx, keys(&["a"]), vec![]).unwrap();
        assert!(table.prepare(tx, keys(&["z"]), vec![]).is_err());
    }

    #[test]
    fn take_releases_keys() {
        let table = table();
        let tx = Uuid::new_v4();
        let commit = vec![line("del", keys(&["a"]))];
        table.prepare(tx, keys(&["a"]), commit.clone()).unwrap();

        let record = table.take(tx).unwrap();
        assert_eq!(record.commit, commit);
        assert!(!table.is_reserved(b"a"));
        assert!(table.is_empty());
        assert!(table.take(tx).is_none());
    }

    #[tokio::test]
    async fn timer_needs_live_transaction() {
        let table = table();
        let tx = Uuid::new_v4();
        let handle = tokio::spawn(async {}).abort_handle();
        assert!(!table.set_timer(tx, handle.clone()));
        table.prepare(tx, keys(&["a"]), vec![]).unwrap();
        assert!(table.set_timer(tx, handle));
    }

    #[test]
    fn staged_key_extraction() {
        assert_eq!(
            staged_keys("mset", &keys(&["a", "1", "b", "2"])).unwrap(),
            keys(&["a", "b"])
        );
        assert!(staged_keys("mset", &keys(&["a"])).is_err());
        assert_eq!(staged_keys("renameto", &keys(&["d", "payload"])).unwrap(), keys(&["d"]));
        assert!(staged_keys("renamefrom", &[]).is_err());
        assert!(staged_keys("flushall", &[]).is_err());
    }

    #[test]
    fn transaction_ids_parse() {
        let tx = Uuid::new_v4();
        assert_eq!(parse_tx(tx.to_string().as_bytes()).unwrap(), tx);
        assert!(parse_tx(b"not-a-uuid").is_err());
    }
}
