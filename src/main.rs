//! Node supervisor.
//!
//! Parses cluster configuration, binds the client (websocket) and RPC
//! (gRPC) listeners, wires the room registry to the gateway's fanout, and
//! runs until told to shut down. Exit codes: 0 on clean shutdown, 1 on
//! unrecoverable configuration error — spec's only two defined exit paths.

use room_cluster::cluster::ClusterConfig;
use room_cluster::gateway::{self, Gateway};
use room_cluster::rpc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = match ClusterConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    let self_spec = config.self_spec().clone();
    let raft_peers = config.raft_peers();
    let self_node_id = config.self_node_id();

    info!(
        node_id = %config.self_id,
        client_addr = %self_spec.client_bind_addr(),
        rpc_addr = %self_spec.rpc_bind_addr(),
        peers = raft_peers.len(),
        "starting node"
    );

    let gateway = Gateway::new(config.self_id.clone(), raft_peers, self_node_id);
    let registry = gateway.registry();
    registry.warm_peer_connections();

    let rpc_handle = tokio::spawn(rpc::start_rpc_server(
        self_spec.rpc_bind_addr(),
        registry,
        config.self_id.clone(),
    ));

    let app = gateway::router(gateway);
    let listener = match tokio::net::TcpListener::bind(self_spec.client_bind_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %self_spec.client_bind_addr(), "failed to bind client listener");
            std::process::exit(1);
        }
    };

    info!(addr = %self_spec.client_bind_addr(), "client websocket listener ready");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    rpc_handle.abort();

    match serve_result {
        Ok(()) => {
            info!("shut down cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "client listener exited with error");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to install Ctrl+C handler"),
    }
}
