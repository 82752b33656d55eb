//! Room registry.
//!
//! Maps room code to its Raft group and owns the cluster-wide create-room
//! handshake and the forward-to-leader path. Does not own subscribers —
//! that set belongs to the gateway (spec's cyclic-ownership note): the
//! registry is handed a fanout factory at construction and never reaches
//! into the gateway directly.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use tracing::warn;

use crate::errors::GatewayError;
use crate::raft::{self, NodeId, RaftGroup, RoomFanout};
use crate::room_state::{Operation, OperationKind, RoomState};
use crate::rpc::{self, PeerClientPool};

const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ROOM_CODE_LEN: usize = 6;
const CREATE_RETRY_ATTEMPTS: u32 = 40;
const CREATE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub type FanoutFactory = Arc<dyn Fn(String) -> Arc<dyn RoomFanout> + Send + Sync>;

pub struct RoomRegistry {
    node_id: NodeId,
    peers: Vec<(NodeId, String)>,
    rooms: DashMap<String, Arc<RaftGroup>>,
    pool: PeerClientPool,
    fanout_factory: FanoutFactory,
}

impl RoomRegistry {
    pub fn new(node_id: NodeId, peers: Vec<(NodeId, String)>, fanout_factory: FanoutFactory) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            peers,
            rooms: DashMap::new(),
            pool: PeerClientPool::new(),
            fanout_factory,
        })
    }

    fn generate_room_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..ROOM_CODE_LEN)
                .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
                .collect();
            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }

    fn peer_addr(&self, node_id: NodeId) -> Option<String> {
        self.peers.iter().find(|(id, _)| *id == node_id).map(|(_, addr)| addr.clone())
    }

    /// Starts background connection attempts to every peer at once, matching
    /// the teacher's startup-time warm-up. Calls here just prime the pool;
    /// nothing blocks on them — `forward_via_rpc`/`send_create_room_handshake`
    /// fall back to `get_or_connect` for a peer that isn't warmed up yet.
    pub fn warm_peer_connections(&self) {
        let addrs: Vec<String> = self
            .peers
            .iter()
            .filter(|(id, _)| *id != self.node_id)
            .map(|(_, addr)| addr.clone())
            .collect();
        self.pool.connect_to_peers(addrs);
    }

    /// Instantiates the room's Raft group locally if not already present.
    /// Idempotent, matching spec's `createRoom`/handshake-receiver no-op
    /// requirement.
    async fn register_local(&self, code: &str) -> Arc<RaftGroup> {
        if let Some(existing) = self.rooms.get(code) {
            return existing.value().clone();
        }
        let fanout = (self.fanout_factory)(code.to_string());
        let group = raft::start_room_raft(
            code,
            self.node_id,
            self.peers.clone(),
            RoomState::empty(),
            fanout,
        )
        .await;
        self.rooms.insert(code.to_string(), group.clone());
        group
    }

    /// Handles a `CreateRoom` handshake RPC from the creating peer: pre-
    /// registers the room's Raft group so it's ready before the first
    /// AppendEntries arrives.
    pub async fn register_remote(&self, code: &str, _creator_user_id: &str, _creator_username: &str) {
        if self.rooms.contains_key(code) {
            return;
        }
        self.register_local(code).await;
    }

    /// Generates a fresh code, fans out the create-room handshake, and
    /// proposes the seeding `ROOM_CREATE`. Returns the code and the state
    /// snapshot immediately after the creator is seated.
    pub async fn create_room(
        &self,
        creator_user_id: &str,
        creator_username: &str,
    ) -> Result<(String, RoomState), GatewayError> {
        let code = self.generate_room_code();
        let group = self.register_local(&code).await;

        for (peer_id, addr) in &self.peers {
            if *peer_id == self.node_id {
                continue;
            }
            if let Err(e) = self
                .send_create_room_handshake(addr, &code, creator_user_id, creator_username)
                .await
            {
                warn!(
                    peer = %addr,
                    room = %code,
                    error = %e,
                    "create-room handshake failed, relying on replication to catch up"
                );
            }
        }

        let op = Operation::new(
            OperationKind::RoomCreate {
                room_code: code.clone(),
                user_id: creator_user_id.to_string(),
                username: creator_username.to_string(),
            },
            creator_user_id,
            now_millis(),
        );

        self.propose_create_with_retry(&group, &code, op).await?;

        Ok((code.clone(), group.current_state()))
    }

    async fn send_create_room_handshake(
        &self,
        addr: &str,
        code: &str,
        creator_user_id: &str,
        creator_username: &str,
    ) -> Result<(), String> {
        let mut client = self.pool.get_or_connect(addr).await?;
        client
            .create_room(rpc::proto::CreateRoomRequest {
                room_code: code.to_string(),
                creator_user_id: creator_user_id.to_string(),
                creator_username: creator_username.to_string(),
            })
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Waits out the room's bootstrap election (new groups have no leader
    /// for up to one election timeout) before giving up with `NoLeader`.
    async fn propose_create_with_retry(
        &self,
        group: &Arc<RaftGroup>,
        code: &str,
        mut op: Operation,
    ) -> Result<(), GatewayError> {
        for _ in 0..CREATE_RETRY_ATTEMPTS {
            if group.is_leader() {
                op.submit_timestamp = now_millis();
                return group.propose(op).await.map_err(|e| GatewayError::ForwardFailed {
                    room: code.to_string(),
                    reason: e.to_string(),
                });
            }
            if let Some(leader_id) = group.current_leader() {
                if leader_id != self.node_id {
                    if let Some(addr) = self.peer_addr(leader_id) {
                        return self.forward_via_rpc(&addr, code, &op).await;
                    }
                }
            }
            tokio::time::sleep(CREATE_RETRY_INTERVAL).await;
        }
        Err(GatewayError::NoLeader(code.to_string()))
    }

    /// Every room this node currently knows about, for the gateway's idle
    /// reaper sweep.
    pub fn room_codes(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    pub fn get_for_read(&self, code: &str) -> Option<Arc<RaftGroup>> {
        self.rooms.get(code).map(|r| r.value().clone())
    }

    pub fn get_for_write(&self, code: &str) -> Option<Arc<RaftGroup>> {
        self.get_for_read(code)
    }

    pub async fn drop_room(&self, code: &str) {
        if let Some((_, group)) = self.rooms.remove(code) {
            group.shutdown().await;
        }
    }

    /// Proposes directly if this node is the leader; otherwise forwards to
    /// the known leader by RPC. Used by the gateway for writes originating
    /// on a client session bound to this node.
    pub async fn propose_or_forward(&self, code: &str, mut op: Operation) -> Result<(), GatewayError> {
        let group = self
            .get_for_write(code)
            .ok_or_else(|| GatewayError::RoomNotFound(code.to_string()))?;

        if group.is_leader() {
            op.submit_timestamp = now_millis();
            return group.propose(op).await.map_err(|e| GatewayError::ForwardFailed {
                room: code.to_string(),
                reason: e.to_string(),
            });
        }

        match group.current_leader() {
            Some(leader_id) => {
                let addr = self
                    .peer_addr(leader_id)
                    .ok_or_else(|| GatewayError::NoLeader(code.to_string()))?;
                self.forward_via_rpc(&addr, code, &op).await
            }
            None => Err(GatewayError::NoLeader(code.to_string())),
        }
    }

    /// Handles an inbound `Forward` RPC: this node was named as leader by
    /// the sender. Re-stamps the authoritative timestamp and proposes
    /// directly rather than forwarding again.
    pub async fn handle_forward(&self, code: &str, mut op: Operation) -> Result<(), GatewayError> {
        let group = self
            .get_for_write(code)
            .ok_or_else(|| GatewayError::RoomNotFound(code.to_string()))?;
        if !group.is_leader() {
            return Err(GatewayError::NoLeader(code.to_string()));
        }
        op.submit_timestamp = now_millis();
        group.propose(op).await.map_err(|e| GatewayError::ForwardFailed {
            room: code.to_string(),
            reason: e.to_string(),
        })
    }

    async fn forward_via_rpc(&self, addr: &str, code: &str, op: &Operation) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec(op).map_err(|e| GatewayError::ForwardFailed {
            room: code.to_string(),
            reason: e.to_string(),
        })?;

        let mut client = self
            .pool
            .get_or_connect(addr)
            .await
            .map_err(|reason| GatewayError::ForwardFailed {
                room: code.to_string(),
                reason,
            })?;

        let resp = client
            .forward(rpc::proto::ForwardRequest {
                room_code: code.to_string(),
                operation: bytes,
            })
            .await
            .map_err(|e| GatewayError::ForwardFailed {
                room: code.to_string(),
                reason: e.to_string(),
            })?
            .into_inner();

        if resp.ok {
            Ok(())
        } else {
            Err(GatewayError::ForwardFailed {
                room: code.to_string(),
                reason: resp.error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    struct NoopFanout;
    impl RoomFanout for NoopFanout {
        fn on_apply(&self, _state: &RoomState) {}
    }

    fn single_node_registry(node_id: NodeId) -> Arc<RoomRegistry> {
        let peers = vec![(node_id, "127.0.0.1:1".to_string())];
        RoomRegistry::new(node_id, peers, Arc::new(|_code| Arc::new(NoopFanout) as Arc<dyn RoomFanout>))
    }

    #[test]
    fn room_code_is_six_uppercase_alnum_chars() {
        let registry = single_node_registry(1);
        let code = registry.generate_room_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn single_node_create_room_seeds_creator() {
        let registry = single_node_registry(42);
        let (code, state) =
            tokio::time::timeout(StdDuration::from_secs(5), registry.create_room("u1", "Alice"))
                .await
                .expect("create_room did not complete in time")
                .expect("create_room failed");

        assert_eq!(state.code, code);
        assert_eq!(state.created_by, "u1");
        assert_eq!(state.participants.len(), 1);
        assert!(state.participants[0].is_creator);
    }

    #[tokio::test]
    async fn unknown_room_lookup_returns_none() {
        let registry = single_node_registry(1);
        assert!(registry.get_for_read("ZZZZZZ").is_none());
    }

    #[tokio::test]
    async fn propose_on_unknown_room_is_room_not_found() {
        let registry = single_node_registry(1);
        let op = Operation::new(
            OperationKind::ChatMessage {
                text: "hi".to_string(),
            },
            "u1",
            1,
        );
        let err = registry.propose_or_forward("ZZZZZZ", op).await.unwrap_err();
        assert!(matches!(err, GatewayError::RoomNotFound(_)));
    }
}
