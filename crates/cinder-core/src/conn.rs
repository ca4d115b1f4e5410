//! Per-connection context passed along with every command.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies who issued a command. Only used for logging; commands
/// don't carry per-connection state into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: u64,
    /// Remote address, `None` for work the node issues on its own behalf.
    pub peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer: Some(peer),
        }
    }

    /// A context for commands the node runs itself (transaction commits,
    /// migration pulls, tests).
    pub fn internal() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            peer: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Connection::internal();
        let b = Connection::new("127.0.0.1:5000".parse().unwrap());
        assert_ne!(a.id, b.id);
        assert!(a.peer.is_none());
        assert!(b.peer.is_some());
    }
}
