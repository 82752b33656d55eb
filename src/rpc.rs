//! Inter-node gRPC transport.
//!
//! Implements the `ClusterTransport` service generated from
//! `proto/cluster.proto`. Every RPC except `HealthCheck` carries `room_code`
//! so the server dispatches to the right room's Raft group instead of a
//! single global one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::registry::RoomRegistry;
use crate::room_state::Operation;

pub mod proto {
    tonic::include_proto!("cluster");
}

use proto::cluster_transport_client::ClusterTransportClient;
use proto::cluster_transport_server::{ClusterTransport, ClusterTransportServer};
use proto::*;

// ── gRPC server implementation ────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClusterTransportService {
    registry: Arc<RoomRegistry>,
    node_id: String,
}

impl ClusterTransportService {
    pub fn new(registry: Arc<RoomRegistry>, node_id: String) -> Self {
        Self { registry, node_id }
    }
}

#[tonic::async_trait]
impl ClusterTransport for ClusterTransportService {
    async fn append_entries(
        &self,
        req: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let inner = req.into_inner();
        let group = self.registry.get_for_write(&inner.room_code).ok_or_else(|| {
            Status::not_found(format!("room {} not known on this node", inner.room_code))
        })?;

        let raft_req: openraft::raft::AppendEntriesRequest<crate::raft::TypeConfig> =
            serde_json::from_slice(&inner.payload)
                .map_err(|e| Status::invalid_argument(format!("bad AppendEntries payload: {}", e)))?;

        let resp = group
            .raft
            .append_entries(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft AppendEntries error: {}", e)))?;

        let success = matches!(
            resp,
            openraft::raft::AppendEntriesResponse::Success
                | openraft::raft::AppendEntriesResponse::PartialSuccess(_)
        );

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(AppendEntriesResponse { success, payload }))
    }

    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let inner = req.into_inner();
        let group = self.registry.get_for_write(&inner.room_code).ok_or_else(|| {
            Status::not_found(format!("room {} not known on this node", inner.room_code))
        })?;

        let raft_req: openraft::raft::VoteRequest<crate::raft::NodeId> =
            serde_json::from_slice(&inner.payload)
                .map_err(|e| Status::invalid_argument(format!("bad VoteRequest payload: {}", e)))?;

        let resp = group
            .raft
            .vote(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft Vote error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(VoteResponse {
            vote_granted: resp.vote_granted,
            payload,
        }))
    }

    async fn install_snapshot(
        &self,
        req: Request<SnapshotRequest>,
    ) -> Result<Response<SnapshotResponse>, Status> {
        let inner = req.into_inner();
        let group = self.registry.get_for_write(&inner.room_code).ok_or_else(|| {
            Status::not_found(format!("room {} not known on this node", inner.room_code))
        })?;

        let raft_req: openraft::raft::InstallSnapshotRequest<crate::raft::TypeConfig> =
            serde_json::from_slice(&inner.payload).map_err(|e| {
                Status::invalid_argument(format!("bad InstallSnapshot payload: {}", e))
            })?;

        let resp = group
            .raft
            .install_snapshot(raft_req)
            .await
            .map_err(|e| Status::internal(format!("Raft InstallSnapshot error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(SnapshotResponse { payload }))
    }

    /// Pre-registers a room's Raft group on this node ahead of the creating
    /// node's first AppendEntries — the handshake described in spec §4.5.
    /// Idempotent: a room already known locally is a no-op.
    async fn create_room(
        &self,
        req: Request<CreateRoomRequest>,
    ) -> Result<Response<CreateRoomResponse>, Status> {
        let inner = req.into_inner();
        self.registry
            .register_remote(&inner.room_code, &inner.creator_user_id, &inner.creator_username)
            .await;
        Ok(Response::new(CreateRoomResponse { ok: true }))
    }

    /// A client-originated write forwarded here because the sender believed
    /// this node holds the room's leadership. If it doesn't (stale belief,
    /// recent step-down) the caller is told so and must re-resolve the
    /// leader rather than being retried here.
    async fn forward(
        &self,
        req: Request<ForwardRequest>,
    ) -> Result<Response<ForwardResponse>, Status> {
        let inner = req.into_inner();
        let op: Operation = match serde_json::from_slice(&inner.operation) {
            Ok(op) => op,
            Err(e) => {
                return Ok(Response::new(ForwardResponse {
                    ok: false,
                    error: format!("malformed operation: {}", e),
                }))
            }
        };

        match self.registry.handle_forward(&inner.room_code, op).await {
            Ok(()) => Ok(Response::new(ForwardResponse {
                ok: true,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(ForwardResponse {
                ok: false,
                error: e.to_string(),
            })),
        }
    }

    async fn health_check(
        &self,
        _req: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            status: "ok".to_string(),
            node_id: self.node_id.clone(),
        }))
    }
}

/// Starts the `ClusterTransport` gRPC server on `bind_addr`. Runs until the
/// server itself errors out; the caller spawns this in a background task
/// and races it against the shutdown signal.
pub async fn start_rpc_server(bind_addr: SocketAddr, registry: Arc<RoomRegistry>, node_id: String) {
    let service = ClusterTransportService::new(registry, node_id);

    info!(addr = %bind_addr, "cluster RPC server starting");

    if let Err(e) = Server::builder()
        .add_service(ClusterTransportServer::new(service))
        .serve(bind_addr)
        .await
    {
        error!(error = %e, "cluster RPC server error");
    }
}

// ── Peer client pool ──────────────────────────────────────────────────────────

/// Pool of `ClusterTransportClient` connections, keyed by peer rpc address.
/// Connections are established lazily and retried with exponential backoff
/// (200 ms -> 30 s cap) when a peer is unreachable.
#[derive(Clone, Default)]
pub struct PeerClientPool {
    clients: Arc<Mutex<HashMap<String, ClusterTransportClient<Channel>>>>,
}

impl PeerClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_to_peers(&self, peer_addrs: Vec<String>) {
        for addr in peer_addrs {
            let clients = self.clients.clone();
            tokio::spawn(async move {
                connect_with_backoff(addr, clients).await;
            });
        }
    }

    pub fn get(&self, peer_addr: &str) -> Option<ClusterTransportClient<Channel>> {
        self.clients.lock().unwrap().get(peer_addr).cloned()
    }

    /// Connects on demand (blocking the caller) if not already connected,
    /// used by the forward-to-leader path where we can't wait for a
    /// background retry loop.
    pub async fn get_or_connect(&self, peer_addr: &str) -> Result<ClusterTransportClient<Channel>, String> {
        if let Some(c) = self.get(peer_addr) {
            return Ok(c);
        }
        let uri = normalize_uri(peer_addr);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| e.to_string())?
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(2));
        let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
        let client = ClusterTransportClient::new(channel);
        self.clients
            .lock()
            .unwrap()
            .insert(peer_addr.to_string(), client.clone());
        Ok(client)
    }

    pub fn connected_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

fn normalize_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

async fn connect_with_backoff(
    peer_addr: String,
    clients: Arc<Mutex<HashMap<String, ClusterTransportClient<Channel>>>>,
) {
    let endpoint = match Endpoint::from_shared(normalize_uri(&peer_addr)) {
        Ok(ep) => ep,
        Err(e) => {
            error!(peer = %peer_addr, error = %e, "invalid peer address, aborting reconnect");
            return;
        }
    };

    let mut backoff = Duration::from_millis(200);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        match endpoint.connect().await {
            Ok(channel) => {
                let client = ClusterTransportClient::new(channel);
                clients.lock().unwrap().insert(peer_addr.clone(), client);
                info!(peer = %peer_addr, "connected to cluster peer");
                return;
            }
            Err(e) => {
                warn!(
                    peer = %peer_addr,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "failed to connect to cluster peer, retrying"
                );
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_pool_starts_empty() {
        let pool = PeerClientPool::new();
        assert_eq!(pool.connected_count(), 0);
        assert!(pool.get("10.0.0.1:7000").is_none());
    }

    #[test]
    fn normalize_uri_adds_scheme() {
        assert_eq!(normalize_uri("10.0.0.1:7000"), "http://10.0.0.1:7000");
        assert_eq!(normalize_uri("http://10.0.0.1:7000"), "http://10.0.0.1:7000");
    }
}
