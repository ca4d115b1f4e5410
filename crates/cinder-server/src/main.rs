mod config;
mod connection;
mod router;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use cinder_core::Engine;
use clap::Parser;
use tracing::info;

use crate::config::CinderConfig;
use crate::router::{Cluster, TcpTransport};

#[derive(Parser)]
#[command(name = "cinder-server", about = "cinder cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "CINDER_HOST")]
    host: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "CINDER_PORT")]
    port: Option<u16>,

    /// id of this node, must match an entry of the cluster node table
    #[arg(long, env = "CINDER_NODE_ID")]
    node_id: Option<String>,

    /// maximum number of simultaneous connections, clients and peers
    #[arg(long, env = "CINDER_MAXCLIENTS")]
    maxclients: Option<usize>,

    /// timeout for calls to other nodes, in milliseconds
    #[arg(long, env = "CINDER_PEER_TIMEOUT_MS")]
    peer_timeout_ms: Option<u64>,

    /// prepared transactions are rolled back after this many milliseconds
    #[arg(long, env = "CINDER_TX_TIMEOUT_MS")]
    tx_timeout_ms: Option<u64>,
}

/// Applies CLI overrides to a `CinderConfig`. Only `Some` values take
/// effect, so flags win over the file and the file wins over defaults.
fn apply_args(cfg: &mut CinderConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(ref id) = args.node_id {
        cfg.node_id = id.clone();
    }
    if let Some(v) = args.maxclients {
        cfg.maxclients = v;
    }
    if let Some(v) = args.peer_timeout_ms {
        cfg.cluster.peer_timeout_ms = v;
    }
    if let Some(v) = args.tx_timeout_ms {
        cfg.cluster.tx_timeout_ms = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match CinderConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => CinderConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => CinderConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let addr = cfg.bind_addr().unwrap_or_else(|e| exit_err(e));
    let state = cfg.build_state().unwrap_or_else(|e| exit_err(e));
    if cfg.maxclients == 0 {
        exit_err("maxclients must be at least 1");
    }

    info!(
        node = %state.local_id(),
        nodes = state.nodes().len(),
        owned_slots = state.node(state.local_id()).map_or(0, |n| n.slot_count()),
        "cluster topology loaded"
    );

    let transport = Arc::new(TcpTransport::new(cfg.cluster.pool_size));
    let cluster = Arc::new(Cluster::new(
        state,
        Arc::new(Engine::new()),
        transport,
        cfg.router_options(),
    ));

    if let Err(e) = server::run(addr, cluster, cfg.maxclients).await {
        exit_err(format!("server error: {e}"));
    }
}
