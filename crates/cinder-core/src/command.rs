//! The engine's command table: names, arity and key positions.
//!
//! Key positions tell the engine which stripes to lock and tell the
//! router which keys a command routes on, so both read from one table.

use bytes::Bytes;

/// Where a command's keys sit in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// No keys (PING, PUBLISH, FLUSHDB).
    None,
    /// `args[1]` only.
    First,
    /// Every argument after the name.
    All,
    /// `args[1]`, `args[3]`, ... as in `MSET k v k v`.
    Pairs,
    /// `args[1]` is a source and `args[2]` a destination. The source is
    /// only read unless `src_write` is set.
    SrcDst { src_write: bool },
}

/// Static description of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Lower-case name.
    pub name: &'static str,
    /// Exact argument count including the name when positive, minimum
    /// when negative.
    pub arity: i32,
    /// Whether the command may modify its keys.
    pub write: bool,
    pub keys: KeySpec,
}

const fn cmd(name: &'static str, arity: i32, write: bool, keys: KeySpec) -> CommandSpec {
    CommandSpec {
        name,
        arity,
        write,
        keys,
    }
}

const R: bool = false;
const W: bool = true;

static COMMANDS: &[CommandSpec] = &[
    cmd("ping", -1, R, KeySpec::None),
    cmd("get", 2, R, KeySpec::First),
    cmd("set", -3, W, KeySpec::First),
    cmd("setnx", 3, W, KeySpec::First),
    cmd("setex", 4, W, KeySpec::First),
    cmd("getset", 3, W, KeySpec::First),
    cmd("getdel", 2, W, KeySpec::First),
    cmd("incr", 2, W, KeySpec::First),
    cmd("incrby", 3, W, KeySpec::First),
    cmd("decr", 2, W, KeySpec::First),
    cmd("decrby", 3, W, KeySpec::First),
    cmd("append", 3, W, KeySpec::First),
    cmd("strlen", 2, R, KeySpec::First),
    cmd("exists", -2, R, KeySpec::All),
    cmd("type", 2, R, KeySpec::First),
    cmd("del", -2, W, KeySpec::All),
    cmd("expire", 3, W, KeySpec::First),
    cmd("pexpire", 3, W, KeySpec::First),
    cmd("ttl", 2, R, KeySpec::First),
    cmd("pttl", 2, R, KeySpec::First),
    cmd("persist", 2, W, KeySpec::First),
    cmd("mset", -3, W, KeySpec::Pairs),
    cmd("msetnx", -3, W, KeySpec::Pairs),
    cmd("mget", -2, R, KeySpec::All),
    cmd("rename", 3, W, KeySpec::SrcDst { src_write: true }),
    cmd("renamenx", 3, W, KeySpec::SrcDst { src_write: true }),
    cmd("copy", -3, W, KeySpec::SrcDst { src_write: false }),
    cmd("lpush", -3, W, KeySpec::First),
    cmd("rpush", -3, W, KeySpec::First),
    cmd("lpop", 2, W, KeySpec::First),
    cmd("rpop", 2, W, KeySpec::First),
    cmd("llen", 2, R, KeySpec::First),
    cmd("lrange", 4, R, KeySpec::First),
    cmd("hset", -4, W, KeySpec::First),
    cmd("hget", 3, R, KeySpec::First),
    cmd("hdel", -3, W, KeySpec::First),
    cmd("hlen", 2, R, KeySpec::First),
    cmd("hgetall", 2, R, KeySpec::First),
    cmd("sadd", -3, W, KeySpec::First),
    cmd("srem", -3, W, KeySpec::First),
    cmd("smembers", 2, R, KeySpec::First),
    cmd("scard", 2, R, KeySpec::First),
    cmd("sismember", 3, R, KeySpec::First),
    cmd("flushdb", 1, W, KeySpec::None),
    cmd("flushall", 1, W, KeySpec::None),
    cmd("publish", 3, R, KeySpec::None),
    cmd("dumpkey", 2, R, KeySpec::First),
    cmd("restorekey", -4, W, KeySpec::First),
];

/// Looks up a command by its lower-case name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name == name)
}

/// All engine commands, in table order.
pub fn all() -> &'static [CommandSpec] {
    COMMANDS
}

impl CommandSpec {
    /// Returns true if `argc` (including the name) satisfies the arity.
    pub fn arity_ok(&self, argc: usize) -> bool {
        let argc = argc as i32;
        if self.arity >= 0 {
            argc == self.arity
        } else {
            argc >= -self.arity
        }
    }

    /// Splits the keys of `args` into `(write, read)` sets.
    pub fn keys(&self, args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
        let rest = args.get(1..).unwrap_or_default();
        let (written, read): (Vec<Bytes>, Vec<Bytes>) = match self.keys {
            KeySpec::None => (Vec::new(), Vec::new()),
            KeySpec::First => (rest.iter().take(1).cloned().collect(), Vec::new()),
            KeySpec::All => (rest.to_vec(), Vec::new()),
            KeySpec::Pairs => (rest.iter().step_by(2).cloned().collect(), Vec::new()),
            KeySpec::SrcDst { src_write } => {
                let src: Vec<Bytes> = rest.iter().take(1).cloned().collect();
                let dst: Vec<Bytes> = rest.iter().skip(1).take(1).cloned().collect();
                if src_write {
                    ([src, dst].concat(), Vec::new())
                } else {
                    (dst, src)
                }
            }
        };
        if self.write {
            (written, read)
        } else {
            // a read-only command never write-locks
            (Vec::new(), [written, read].concat())
        }
    }
}

/// Returns `(write, read)` keys of a command line, or `None` for names the
/// engine doesn't know.
pub fn keys_of(args: &[Bytes]) -> Option<(Vec<Bytes>, Vec<Bytes>)> {
    let name = cinder_protocol::command_name(args)?;
    lookup(&name).map(|spec| spec.keys(args))
}

/// Every key of a command line, write keys first.
pub fn all_keys(args: &[Bytes]) -> Vec<Bytes> {
    keys_of(args)
        .map(|(w, r)| [w, r].concat())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use cinder_protocol::cmd_line;

    use super::*;

    fn strs(keys: Vec<Bytes>) -> Vec<String> {
        keys.iter()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    #[test]
    fn lookup_by_lowercase_name() {
        assert_eq!(lookup("get").unwrap().arity, 2);
        assert!(lookup("GET").is_none());
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|c| c.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn arity_rules() {
        let get = lookup("get").unwrap();
        assert!(get.arity_ok(2));
        assert!(!get.arity_ok(3));
        let del = lookup("del").unwrap();
        assert!(!del.arity_ok(1));
        assert!(del.arity_ok(2));
        assert!(del.arity_ok(10));
    }

    #[test]
    fn key_extraction() {
        let (w, r) = keys_of(&cmd_line(["MSET", "a", "1", "b", "2"])).unwrap();
        assert_eq!(strs(w), ["a", "b"]);
        assert!(r.is_empty());

        let (w, r) = keys_of(&cmd_line(["mget", "a", "b"])).unwrap();
        assert!(w.is_empty());
        assert_eq!(strs(r), ["a", "b"]);

        let (w, r) = keys_of(&cmd_line(["copy", "src", "dst", "REPLACE"])).unwrap();
        assert_eq!(strs(w), ["dst"]);
        assert_eq!(strs(r), ["src"]);

        let (w, _) = keys_of(&cmd_line(["rename", "src", "dst"])).unwrap();
        assert_eq!(strs(w), ["src", "dst"]);

        let (w, r) = keys_of(&cmd_line(["publish", "ch", "msg"])).unwrap();
        assert!(w.is_empty() && r.is_empty());

        assert!(keys_of(&cmd_line(["bogus", "x"])).is_none());
    }

    #[test]
    fn all_keys_flattens() {
        assert_eq!(strs(all_keys(&cmd_line(["copy", "s", "d"]))), ["d", "s"]);
        assert!(all_keys(&cmd_line(["ping"])).is_empty());
    }
}
