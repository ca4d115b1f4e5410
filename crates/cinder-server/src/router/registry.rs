//! The command registry: lower-cased name → handler.
//!
//! Built once at startup and owned by the [`Cluster`]; nothing mutates it
//! afterwards. A name maps to exactly one handler and a later
//! registration replaces an earlier one.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use cinder_core::command;
use cinder_core::Connection;
use cinder_protocol::{CmdLine, Frame};

use super::Cluster;
use super::{admin, commands, multi, tcc};

/// Future returned by every handler. Boxed so handlers can recurse into
/// the router (a relay to self dispatches through the registry again).
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Frame> + Send + 'a>>;

/// A distributed handler that does its own routing.
pub type CustomFn = for<'a> fn(&'a Cluster, &'a Connection, CmdLine) -> HandlerFuture<'a>;

/// How a command name is executed.
#[derive(Clone, Copy)]
pub enum Handler {
    /// Route on `args[1]`: guard, pick the owner, run locally or relay.
    Default,
    /// A handler that routes keys itself (multi-key, broadcast, 2PC).
    Custom(CustomFn),
    /// Run the named engine command on this node, never routed. Used for
    /// commands peers send to a node they already picked.
    Penetrating(&'static str),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Default => write!(f, "Default"),
            Handler::Custom(_) => write!(f, "Custom"),
            Handler::Penetrating(real) => write!(f, "Penetrating({real})"),
        }
    }
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, Handler>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under the lower-cased `name`.
    pub fn register(&mut self, name: &str, handler: Handler) {
        self.handlers.insert(name.to_ascii_lowercase(), handler);
    }

    pub fn register_default(&mut self, name: &str) {
        self.register(name, Handler::Default);
    }

    pub fn register_custom(&mut self, name: &str, f: CustomFn) {
        self.register(name, Handler::Custom(f));
    }

    /// Registers `name` as a local-only alias of the engine command
    /// `real_name`.
    pub fn gen_penetrating(&mut self, name: &str, real_name: &'static str) {
        self.register(name, Handler::Penetrating(real_name));
    }

    /// Looks up a handler by an already lower-cased name.
    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).copied()
    }

    /// The full command table of a cluster node.
    pub fn builtin() -> Self {
        let mut reg = Self::new();

        // every engine command routes on its first key unless overridden
        for spec in command::all() {
            reg.register_default(spec.name);
        }

        reg.register_custom("ping", commands::ping);
        reg.register_custom("del", commands::del);
        reg.register_custom("exists", commands::exists);
        reg.register_custom("mset", commands::mset);
        reg.register_custom("msetnx", commands::msetnx);
        reg.register_custom("mget", commands::mget);
        reg.register_custom("rename", commands::rename);
        reg.register_custom("renamenx", commands::renamenx);
        reg.register_custom("copy", commands::copy);
        reg.register_custom("publish", commands::publish);
        reg.register_custom("flushdb", commands::flushdb);
        reg.register_custom("flushall", commands::flushall);
        reg.register_custom("cluster", admin::cluster);

        // peer protocol
        reg.register_custom("prepare", tcc::prepare);
        reg.register_custom("commit", tcc::commit);
        reg.register_custom("rollback", tcc::rollback);
        reg.register_custom("_multi", multi::relayed_multi);

        reg.gen_penetrating("copy_", "copy");
        reg.gen_penetrating("dumpkey_", "dumpkey");
        reg.gen_penetrating("restorekey_", "restorekey");
        reg.gen_penetrating("flushdb_", "flushdb");
        reg.gen_penetrating("flushall_", "flushall");
        reg.gen_penetrating("_publish", "publish");

        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let mut reg = CommandRegistry::new();
        reg.register_default("GeT");
        assert!(matches!(reg.get("get"), Some(Handler::Default)));
        assert!(reg.get("GeT").is_none());
    }

    #[test]
    fn last_registration_wins() {
        let mut reg = CommandRegistry::new();
        reg.register_default("x");
        reg.gen_penetrating("x", "get");
        assert!(matches!(reg.get("x"), Some(Handler::Penetrating("get"))));
        assert!(reg.get("y").is_none());
    }

    #[test]
    fn builtin_table() {
        let reg = CommandRegistry::builtin();
        assert!(matches!(reg.get("get"), Some(Handler::Default)));
        assert!(matches!(reg.get("set"), Some(Handler::Default)));
        assert!(matches!(reg.get("mset"), Some(Handler::Custom(_))));
        assert!(matches!(reg.get("prepare"), Some(Handler::Custom(_))));
        assert!(matches!(reg.get("_multi"), Some(Handler::Custom(_))));
        assert!(matches!(reg.get("copy_"), Some(Handler::Penetrating("copy"))));
        assert!(matches!(reg.get("_publish"), Some(Handler::Penetrating("publish"))));
        assert!(reg.get("subscribe").is_none());
    }

    #[test]
    fn penetrating_targets_are_engine_commands() {
        let reg = CommandRegistry::builtin();
        for name in ["copy_", "dumpkey_", "restorekey_", "flushdb_", "flushall_", "_publish"] {
            let Some(Handler::Penetrating(real)) = reg.get(name) else {
                panic!("{name} is not penetrating");
            };
            assert!(command::lookup(real).is_some(), "{real} unknown to the engine");
        }
    }
}
