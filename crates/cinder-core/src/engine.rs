//! The engine: executes command lines against the local keyspace.
//!
//! Every command takes the stripe locks for its keys before it runs, so a
//! multi-key command or a batch is atomic with respect to every other
//! command on this node. Replies are [`Frame`]s, errors included.
//!
//! Writes to a key reserved by a prepared transaction are refused with a
//! retryable `TRYAGAIN` until the transaction commits or rolls back.

use bytes::Bytes;
use cinder_protocol::{command_name, CmdLine, Frame};
use tracing::debug;

use crate::command::{self, CommandSpec};
use crate::conn::Connection;
use crate::keyspace::{IncrError, Keyspace, RestoreError, TtlResult, WrongType};
use crate::locks::{LockTable, Reservations};
use crate::pubsub::PubSub;
use crate::types::Value;

/// An error reply produced while running a command.
#[derive(Debug)]
struct CommandError(String);

impl From<WrongType> for CommandError {
    fn from(e: WrongType) -> Self {
        CommandError(e.to_string())
    }
}

impl From<IncrError> for CommandError {
    fn from(e: IncrError) -> Self {
        CommandError(e.to_string())
    }
}

impl From<RestoreError> for CommandError {
    fn from(e: RestoreError) -> Self {
        CommandError(e.to_string())
    }
}

type CmdResult = Result<Frame, CommandError>;

fn err(msg: impl Into<String>) -> CommandError {
    CommandError(msg.into())
}

fn wrong_args(name: &str) -> CommandError {
    err(format!("ERR wrong number of arguments for '{name}' command"))
}

fn parse_int(arg: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| err("ERR value is not an integer or out of range"))
}

fn bulk_or_null(value: Option<Bytes>) -> Frame {
    value.map_or(Frame::Null, Frame::Bulk)
}

fn int(n: usize) -> Frame {
    Frame::Integer(n as i64)
}

fn flag(b: bool) -> Frame {
    Frame::Integer(i64::from(b))
}

fn bulk_array(items: Vec<Bytes>) -> Frame {
    Frame::Array(items.into_iter().map(Frame::Bulk).collect())
}

fn held_error(key: &[u8]) -> Frame {
    Frame::Error(format!(
        "TRYAGAIN key '{}' is held by a prepared transaction",
        String::from_utf8_lossy(key)
    ))
}

/// The single-node storage engine.
#[derive(Debug, Default)]
pub struct Engine {
    keyspace: Keyspace,
    locks: LockTable,
    reservations: Reservations,
    pubsub: PubSub,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn reservations(&self) -> &Reservations {
        &self.reservations
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Checks the name and arity of a command line.
    fn resolve(args: &[Bytes]) -> Result<&'static CommandSpec, CommandError> {
        let name = command_name(args).ok_or_else(|| err("ERR empty command"))?;
        let spec =
            command::lookup(&name).ok_or_else(|| err(format!("ERR unknown command '{name}'")))?;
        if !spec.arity_ok(args.len()) {
            return Err(wrong_args(spec.name));
        }
        Ok(spec)
    }

    /// Executes one command, holding its key locks for the duration.
    pub async fn exec(&self, conn: &Connection, args: &[Bytes]) -> Frame {
        let spec = match Self::resolve(args) {
            Ok(spec) => spec,
            Err(CommandError(msg)) => return Frame::Error(msg),
        };
        let (write, read) = spec.keys(args);
        let _locks = self.locks.lock(&write, &read).await;
        if let Some((key, _)) = self.reservations.first_held(&write) {
            return held_error(&key);
        }
        debug!(conn = conn.id, cmd = spec.name, "exec");
        self.run(spec, args)
    }

    /// Executes one command without taking locks or checking reservations.
    /// The caller must already hold the locks for every key the command
    /// touches; a committing transaction runs its writes this way.
    pub fn exec_locked(&self, args: &[Bytes]) -> Frame {
        match Self::resolve(args) {
            Ok(spec) => self.run(spec, args),
            Err(CommandError(msg)) => Frame::Error(msg),
        }
    }

    /// Executes a batch atomically: all keys of all commands are locked
    /// once, then each command runs in order. A batch with an unknown
    /// command or a bad arity runs nothing.
    pub async fn exec_batch(&self, conn: &Connection, cmds: &[CmdLine]) -> Frame {
        let mut specs = Vec::with_capacity(cmds.len());
        for args in cmds {
            match Self::resolve(args) {
                Ok(spec) => specs.push(spec),
                Err(CommandError(msg)) => {
                    return Frame::Error(format!(
                        "EXECABORT Transaction discarded because of previous errors: {msg}"
                    ))
                }
            }
        }

        let mut write = Vec::new();
        let mut read = Vec::new();
        for (spec, args) in specs.iter().zip(cmds) {
            let (w, r) = spec.keys(args);
            write.extend(w);
            read.extend(r);
        }
        let _locks = self.locks.lock(&write, &read).await;
        if let Some((key, _)) = self.reservations.first_held(&write) {
            return held_error(&key);
        }
        debug!(conn = conn.id, len = cmds.len(), "exec batch");

        Frame::Array(
            specs
                .into_iter()
                .zip(cmds)
                .map(|(spec, args)| self.run(spec, args))
                .collect(),
        )
    }

    /// Serializes a key for transfer to another node.
    pub fn dump(&self, key: &[u8]) -> Option<Bytes> {
        self.keyspace.dump(key)
    }

    /// Installs a dumped key. Without `replace` an existing key wins and
    /// `Ok(false)` is returned.
    pub fn restore(&self, key: Bytes, payload: &[u8], replace: bool) -> Result<bool, String> {
        match self.keyspace.restore(key, payload, None, replace) {
            Ok(()) => Ok(true),
            Err(RestoreError::BusyKey) => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    fn run(&self, spec: &CommandSpec, args: &[Bytes]) -> Frame {
        match self.dispatch(spec.name, args) {
            Ok(frame) => frame,
            Err(CommandError(msg)) => Frame::Error(msg),
        }
    }

    fn dispatch(&self, name: &str, args: &[Bytes]) -> CmdResult {
        let ks = &self.keyspace;
        match name {
            "ping" => Ok(match args.get(1) {
                Some(msg) => Frame::Bulk(msg.clone()),
                None => Frame::Simple("PONG".into()),
            }),

            // -- strings --
            "get" => Ok(bulk_or_null(ks.get(&args[1])?)),
            "set" => self.set(args),
            "setnx" => {
                if ks.exists(&args[1]) {
                    return Ok(flag(false));
                }
                ks.set(args[1].clone(), args[2].clone(), None, false);
                Ok(flag(true))
            }
            "setex" => {
                let secs = parse_int(&args[2])?;
                if secs <= 0 {
                    return Err(err("ERR invalid expire time in 'setex' command"));
                }
                ks.set(args[1].clone(), args[3].clone(), Some((secs as u64).saturating_mul(1000)), false);
                Ok(Frame::ok())
            }
            "getset" => {
                let old = ks.get(&args[1])?;
                ks.set(args[1].clone(), args[2].clone(), None, false);
                Ok(bulk_or_null(old))
            }
            "getdel" => {
                let old = ks.get(&args[1])?;
                if old.is_some() {
                    ks.del(&args[1]);
                }
                Ok(bulk_or_null(old))
            }
            "incr" => Ok(Frame::Integer(ks.incr_by(&args[1], 1)?)),
            "decr" => Ok(Frame::Integer(ks.incr_by(&args[1], -1)?)),
            "incrby" => Ok(Frame::Integer(ks.incr_by(&args[1], parse_int(&args[2])?)?)),
            "decrby" => {
                let delta = parse_int(&args[2])?
                    .checked_neg()
                    .ok_or(IncrError::Overflow)?;
                Ok(Frame::Integer(ks.incr_by(&args[1], delta)?))
            }
            "append" => Ok(int(ks.append(&args[1], &args[2])?)),
            "strlen" => Ok(int(ks.get(&args[1])?.map_or(0, |v| v.len()))),

            // -- keys --
            "exists" => Ok(int(args[1..].iter().filter(|k| ks.exists(k)).count())),
            "type" => Ok(Frame::Simple(ks.value_type(&args[1]).into())),
            "del" => Ok(int(args[1..].iter().filter(|k| ks.del(k)).count())),
            "expire" | "pexpire" => {
                let n = parse_int(&args[2])?;
                let ms = if name == "expire" { n.saturating_mul(1000) } else { n };
                if ms <= 0 {
                    return Ok(flag(ks.del(&args[1])));
                }
                Ok(flag(ks.expire(&args[1], ms as u64)))
            }
            "ttl" | "pttl" => Ok(Frame::Integer(match ks.ttl(&args[1]) {
                TtlResult::NotFound => -2,
                TtlResult::NoExpiry => -1,
                TtlResult::Millis(ms) if name == "ttl" => ((ms + 500) / 1000) as i64,
                TtlResult::Millis(ms) => ms as i64,
            })),
            "persist" => Ok(flag(ks.persist(&args[1]))),
            "rename" | "renamenx" => {
                if !ks.exists(&args[1]) {
                    return Err(err("ERR no such key"));
                }
                let nx = name == "renamenx";
                let moved = ks.rename(&args[1], args[2].clone(), nx);
                Ok(if nx { flag(moved) } else { Frame::ok() })
            }
            "copy" => {
                let replace = match args.get(3) {
                    None => false,
                    Some(opt) if opt.eq_ignore_ascii_case(b"replace") => true,
                    Some(_) => return Err(err("ERR syntax error")),
                };
                Ok(flag(ks.copy(&args[1], args[2].clone(), replace)))
            }

            // -- multi-key strings --
            "mset" | "msetnx" => {
                if args.len() % 2 == 0 {
                    return Err(wrong_args(name));
                }
                if name == "msetnx" && args[1..].iter().step_by(2).any(|k| ks.exists(k)) {
                    return Ok(flag(false));
                }
                for pair in args[1..].chunks_exact(2) {
                    ks.set(pair[0].clone(), pair[1].clone(), None, false);
                }
                Ok(if name == "mset" { Frame::ok() } else { flag(true) })
            }
            "mget" => Ok(Frame::Array(
                args[1..]
                    .iter()
                    // wrong-typed keys read as null
                    .map(|k| bulk_or_null(ks.get(k).ok().flatten()))
                    .collect(),
            )),

            // -- lists --
            "lpush" | "rpush" => Ok(int(ks.push(&args[1], &args[2..], name == "lpush")?)),
            "lpop" | "rpop" => Ok(bulk_or_null(ks.pop(&args[1], name == "lpop")?)),
            "llen" => match ks.get_value(&args[1]) {
                None => Ok(int(0)),
                Some(Value::List(list)) => Ok(int(list.len())),
                Some(_) => Err(WrongType.into()),
            },
            "lrange" => {
                let (start, stop) = (parse_int(&args[2])?, parse_int(&args[3])?);
                Ok(bulk_array(ks.lrange(&args[1], start, stop)?))
            }

            // -- hashes --
            "hset" => {
                if args.len() % 2 != 0 {
                    return Err(wrong_args(name));
                }
                let pairs: Vec<(Bytes, Bytes)> = args[2..]
                    .chunks_exact(2)
                    .map(|p| (p[0].clone(), p[1].clone()))
                    .collect();
                Ok(int(ks.hset(&args[1], &pairs)?))
            }
            "hget" => match ks.get_value(&args[1]) {
                None => Ok(Frame::Null),
                Some(Value::Hash(map)) => Ok(bulk_or_null(map.get(&args[2]).cloned())),
                Some(_) => Err(WrongType.into()),
            },
            "hdel" => Ok(int(ks.hdel(&args[1], &args[2..])?)),
            "hlen" => match ks.get_value(&args[1]) {
                None => Ok(int(0)),
                Some(Value::Hash(map)) => Ok(int(map.len())),
                Some(_) => Err(WrongType.into()),
            },
            "hgetall" => Ok(bulk_array(
                ks.hgetall(&args[1])?
                    .into_iter()
                    .flat_map(|(f, v)| [f, v])
                    .collect(),
            )),

            // -- sets --
            "sadd" => Ok(int(ks.sadd(&args[1], &args[2..])?)),
            "srem" => Ok(int(ks.srem(&args[1], &args[2..])?)),
            "smembers" => Ok(bulk_array(ks.smembers(&args[1])?)),
            "scard" => match ks.get_value(&args[1]) {
                None => Ok(int(0)),
                Some(Value::Set(set)) => Ok(int(set.len())),
                Some(_) => Err(WrongType.into()),
            },
            "sismember" => match ks.get_value(&args[1]) {
                None => Ok(flag(false)),
                Some(Value::Set(set)) => Ok(flag(set.contains(&args[2]))),
                Some(_) => Err(WrongType.into()),
            },

            // -- server --
            "flushdb" | "flushall" => {
                // a prepared transaction would commit into the flushed keyspace
                if !self.reservations.is_empty() {
                    return Err(err("TRYAGAIN keys are held by a prepared transaction"));
                }
                ks.flush();
                Ok(Frame::ok())
            }
            "publish" => Ok(int(self.pubsub.publish(&args[1], args[2].clone()))),

            // -- transfer --
            "dumpkey" => Ok(bulk_or_null(ks.dump(&args[1]))),
            "restorekey" => self.restore_key(args),

            _ => Err(err(format!("ERR unknown command '{name}'"))),
        }
    }

    /// `SET key value [EX s | PX ms] [NX | XX] [KEEPTTL]`
    fn set(&self, args: &[Bytes]) -> CmdResult {
        let mut ttl_ms = None;
        let (mut nx, mut xx, mut keep_ttl) = (false, false, false);
        let mut opts = args[3..].iter();
        while let Some(opt) = opts.next() {
            let upper = opt.to_ascii_uppercase();
            match upper.as_slice() {
                b"NX" => nx = true,
                b"XX" => xx = true,
                b"KEEPTTL" => keep_ttl = true,
                b"EX" | b"PX" => {
                    let n = parse_int(opts.next().ok_or_else(|| err("ERR syntax error"))?)?;
                    if n <= 0 {
                        return Err(err("ERR invalid expire time in 'set' command"));
                    }
                    let scale = if upper.as_slice() == b"EX" { 1000 } else { 1 };
                    ttl_ms = Some((n as u64).saturating_mul(scale));
                }
                _ => return Err(err("ERR syntax error")),
            }
        }
        if (nx && xx) || (keep_ttl && ttl_ms.is_some()) {
            return Err(err("ERR syntax error"));
        }

        let exists = self.keyspace.exists(&args[1]);
        if (nx && exists) || (xx && !exists) {
            return Ok(Frame::Null);
        }
        self.keyspace
            .set(args[1].clone(), args[2].clone(), ttl_ms, keep_ttl);
        Ok(Frame::ok())
    }

    /// `RESTOREKEY key ttl-ms payload [REPLACE]`. A TTL of 0 keeps the TTL
    /// carried in the payload.
    fn restore_key(&self, args: &[Bytes]) -> CmdResult {
        let ttl = parse_int(&args[2])?;
        if ttl < 0 {
            return Err(err("ERR Invalid TTL value, must be >= 0"));
        }
        let replace = match args.get(4) {
            None => false,
            Some(opt) if opt.eq_ignore_ascii_case(b"replace") => true,
            Some(_) => return Err(err("ERR syntax error")),
        };
        let ttl_override = (ttl > 0).then_some(ttl as u64);
        self.keyspace
            .restore(args[1].clone(), &args[3], ttl_override, replace)?;
        Ok(Frame::ok())
    }
}
