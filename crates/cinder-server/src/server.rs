//! TCP server that accepts client and peer connections and spawns handler
//! tasks.
//!
//! Handles graceful shutdown on SIGINT: stops accepting new connections
//! and waits for in-flight requests to drain before exiting.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::connection;
use crate::router::Cluster;

/// Binds to `addr` and runs the accept loop until ctrl-c.
pub async fn run(
    addr: SocketAddr,
    cluster: Arc<Cluster>,
    max_connections: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(
        node = %cluster.local_id(),
        "listening on {addr} (max {max_connections} connections)"
    );
    serve(listener, cluster, max_connections, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {e}");
        }
    })
    .await?;
    Ok(())
}

/// Accepts connections on `listener` until `shutdown` resolves.
///
/// Clients and peers share the loop: a peer relaying commands is just
/// another connection. Connections beyond `max_connections` are dropped
/// immediately.
pub async fn serve(
    listener: TcpListener,
    cluster: Arc<Cluster>,
    max_connections: usize,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    // draining takes every permit in one acquire_many, which counts in u32
    let permits = u32::try_from(max_connections).unwrap_or(u32::MAX);
    let semaphore = Arc::new(Semaphore::new(permits as usize));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, draining connections...");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = result?;

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, dropping connection from {peer}");
                        drop(stream);
                        continue;
                    }
                };

                let cluster = Arc::clone(&cluster);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, peer, cluster).await {
                        error!("connection error from {peer}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }

    info!("waiting for active connections to close...");
    match semaphore.acquire_many(permits).await {
        Ok(_) => info!("all connections drained, shutting down"),
        Err(e) => warn!("stopped waiting for connections to drain: {e}"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cinder_cluster::{ClusterNode, ClusterState, NodeId};
    use cinder_core::Engine;

    use super::*;
    use crate::router::{RouterOptions, TcpTransport};

    #[tokio::test]
    async fn oversized_connection_limit_still_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cluster = Arc::new(Cluster::new(
            ClusterState::single_node(ClusterNode::new(NodeId::new(), addr)),
            Arc::new(Engine::new()),
            Arc::new(TcpTransport::new(1)),
            RouterOptions::default(),
        ));

        let served = tokio::time::timeout(
            Duration::from_secs(1),
            serve(listener, cluster, usize::MAX, async {}),
        )
        .await;
        assert!(served.unwrap().is_ok());
    }
}
