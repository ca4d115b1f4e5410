//! Peer transport used to relay command lines.
//!
//! A relayed command is one framed request and one framed reply on a
//! pooled TCP connection. The reply frame comes back verbatim, error
//! replies included; only transport failures are errors here.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use cinder_protocol::{read_frame, write_frame, Frame};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::debug;

/// Sends a command line to a peer and returns its reply.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, addr: SocketAddr, args: &[Bytes]) -> io::Result<Frame>;
}

type PeerStream = BufStream<TcpStream>;

/// TCP transport keeping up to `pool_size` idle connections per peer.
#[derive(Debug)]
pub struct TcpTransport {
    pool: Mutex<HashMap<SocketAddr, Vec<PeerStream>>>,
    pool_size: usize,
}

impl TcpTransport {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            pool_size,
        }
    }

    fn checkout(&self, addr: SocketAddr) -> Option<PeerStream> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.get_mut(&addr).and_then(Vec::pop)
    }

    fn checkin(&self, addr: SocketAddr, stream: PeerStream) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let idle = pool.entry(addr).or_default();
        if idle.len() < self.pool_size {
            idle.push(stream);
        }
    }

    /// Number of idle connections pooled for `addr`.
    pub fn idle(&self, addr: SocketAddr) -> usize {
        let pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.get(&addr).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, addr: SocketAddr, args: &[Bytes]) -> io::Result<Frame> {
        let mut stream = match self.checkout(addr) {
            Some(stream) => stream,
            None => {
                debug!(%addr, "opening peer connection");
                let tcp = TcpStream::connect(addr).await?;
                tcp.set_nodelay(true)?;
                BufStream::new(tcp)
            }
        };
        // a failed call drops its connection instead of returning it
        write_frame(&mut stream, &args).await?;
        let reply: Frame = read_frame(&mut stream).await?;
        self.checkin(addr, stream);
        Ok(reply)
    }
}
