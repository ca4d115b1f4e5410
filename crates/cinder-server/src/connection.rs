//! Per-connection handler.
//!
//! Reads length-prefixed command lines from the stream, runs each through
//! the connection's [`Session`] and writes the reply back. Requests on one
//! connection are handled strictly in order.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use cinder_core::Connection;
use cinder_protocol::{read_frame, write_frame, CmdLine, Frame};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tracing::debug;

use crate::router::{Cluster, Session};

pub async fn handle<S>(
    stream: S,
    peer_addr: SocketAddr,
    cluster: Arc<Cluster>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);
    let conn = Connection::new(peer_addr);
    let mut session = Session::new();
    debug!(conn = conn.id, "connection from {peer_addr}");

    loop {
        let args: CmdLine = match read_frame(&mut stream).await {
            Ok(args) => args,
            // clean disconnect between requests
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let reply = Frame::error(format!("ERR protocol error: {e}"));
                let _ = write_frame(&mut stream, &reply).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let reply = if args.is_empty() {
            Frame::error("ERR empty command")
        } else {
            session.handle(&cluster, &conn, args).await
        };
        write_frame(&mut stream, &reply).await?;
    }
}
