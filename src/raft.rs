//! Per-room Raft consensus.
//!
//! One `openraft::Raft<TypeConfig>` instance is created per room by
//! [`start_room_raft`]. Leader election, log replication, and commit-index
//! advance are all openraft's own machinery, configured to the timers spec
//! §4.3/§5 ask for; our job is the storage (fold committed entries into the
//! room state machine and notify subscribers) and the network (carry
//! openraft's RPCs over the room-code-tagged `ClusterTransport` service).
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge an in-memory combined `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in trait) rather than
//! `async_trait::async_trait`. Implementations of these traits must use
//! plain `async fn` — not `#[async_trait]` — to match the expected
//! signature.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::room_state::{self, Operation, RoomState};
use crate::rpc::proto::{
    cluster_transport_client::ClusterTransportClient, AppendEntriesRequest as ProtoAER,
    SnapshotRequest as ProtoSR, VoteRequest as ProtoVR,
};

// ── Type configuration ─────────────────────────────────────────────────────────

/// Result of applying one entry to the room state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub message: String,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Operation,
        R            = ApplyOutcome,
        NodeId       = u64,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type NodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;

/// Derive a stable u64 node ID from a human-readable string identifier.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// Handed to [`RoomStorage`] at construction so the apply path can push a
/// fresh snapshot to the gateway without the RSM ever touching the network
/// itself. Breaks the registry/gateway ownership cycle: the registry owns
/// this capability, the gateway implements it.
pub trait RoomFanout: Send + Sync {
    fn on_apply(&self, state: &RoomState);
}

// ── In-memory combined storage (openraft v1 RaftStorage) ─────────────────────

/// Combined in-memory Raft storage for one room: log entries plus the room
/// state machine. Wrapped by `openraft::storage::Adaptor::new(store)` to
/// produce the v2 `(RaftLogStorage, RaftStateMachine)` split required by
/// `Raft::new`.
pub struct RoomStorage {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    state: RoomState,
    snapshot: Option<Snapshot<TypeConfig>>,
    fanout: Arc<dyn RoomFanout>,
    /// Mirrors `state` for observers that only want to watch for change
    /// (the node supervisor's shutdown path checks this before tearing the
    /// room down).
    state_tx: watch::Sender<RoomState>,
}

impl RoomStorage {
    pub fn new(empty_state: RoomState, fanout: Arc<dyn RoomFanout>) -> (Self, watch::Receiver<RoomState>) {
        let (state_tx, state_rx) = watch::channel(empty_state.clone());
        let storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            state: empty_state,
            snapshot: None,
            fanout,
            state_tx,
        };
        (storage, state_rx)
    }
}

impl RaftLogReader<TypeConfig> for RoomStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

pub struct RoomLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for RoomLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serializes current room state to canonical JSON.
pub struct RoomSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    state: RoomState,
}

impl RaftSnapshotBuilder<TypeConfig> for RoomSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let data = serde_json::to_vec(&self.state).unwrap_or_default();

        let snap_id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .to_string();

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `RoomStorage`.
///
/// Method names follow the v1 API:
///   - `append_to_log` (not `append`)
///   - `delete_conflict_logs_since` (not `truncate`)
///   - `purge_logs_upto` (not `purge`)
///   - `apply_to_state_machine` (not `apply`)
impl RaftStorage<TypeConfig> for RoomStorage {
    type LogReader = RoomLogReader;
    type SnapshotBuilder = RoomSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        RoomLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    /// The only place `room_state::apply` is called. Determinism here is
    /// what keeps every node's state byte-identical at the same
    /// `lastApplied` — note nothing in this path reads the local clock or
    /// any other node-local state.
    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(ApplyOutcome {
                        ok: true,
                        message: "noop".to_string(),
                    });
                }
                openraft::EntryPayload::Normal(op) => {
                    self.state = room_state::apply(&self.state, op);
                    self.fanout.on_apply(&self.state);
                    let _ = self.state_tx.send(self.state.clone());
                    responses.push(ApplyOutcome {
                        ok: true,
                        message: "applied".to_string(),
                    });
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(ApplyOutcome {
                        ok: true,
                        message: "membership change applied".to_string(),
                    });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        RoomSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            state: self.state.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        if let Ok(state) = serde_json::from_slice::<RoomState>(snapshot.get_ref()) {
            self.state = state;
        }
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        self.fanout.on_apply(&self.state);
        let _ = self.state_tx.send(self.state.clone());
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        Ok(self.snapshot.clone())
    }
}

// ── gRPC network transport ─────────────────────────────────────────────────────

/// One gRPC channel per peer, tagged with the owning room's code on every
/// call so the receiver's `ClusterTransport` service dispatches to the right
/// room's Raft instance.
pub struct RoomNetwork {
    room_code: String,
    target_addr: String,
    client: Option<ClusterTransportClient<Channel>>,
}

impl RoomNetwork {
    fn get_client(&mut self) -> Result<&mut ClusterTransportClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() dials on first RPC and reconnects automatically;
            // connect_timeout/timeout keep a dead peer from stalling a
            // heartbeat past the point where it would trigger a spurious
            // re-election.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(2))
                .connect_lazy();
            self.client = Some(ClusterTransportClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for RoomNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let leader = rpc.vote.leader_id().node_id.to_string();

        let room_code = self.room_code.clone();
        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .append_entries(ProtoAER {
                room_code,
                term,
                leader_id: leader,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let candidate = rpc.vote.leader_id().node_id.to_string();

        let room_code = self.room_code.clone();
        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .request_vote(ProtoVR {
                room_code,
                term,
                candidate_id: candidate,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;

        let room_code = self.room_code.clone();
        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .install_snapshot(ProtoSR {
                room_code,
                term,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `RoomNetwork` instances per target peer node, for one room.
pub struct RoomNetworkFactory {
    room_code: String,
}

impl RoomNetworkFactory {
    pub fn new(room_code: impl Into<String>) -> Self {
        Self {
            room_code: room_code.into(),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for RoomNetworkFactory {
    type Network = RoomNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        RoomNetwork {
            room_code: self.room_code.clone(),
            target_addr: node.addr.clone(),
            client: None,
        }
    }
}

// ── RaftGroup public API ────────────────────────────────────────────────────────

/// A running per-room Raft group.
#[derive(Clone)]
pub struct RaftGroup {
    pub raft: Arc<RaftInstance>,
    pub room_code: String,
    pub node_id: NodeId,
    state_rx: watch::Receiver<RoomState>,
}

impl RaftGroup {
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Propose an operation. Returns `NotLeader` semantics via openraft's own
    /// `ClientWriteError::ForwardToLeader` when this node isn't the leader —
    /// the caller (gateway) is expected to forward instead of retrying here.
    pub async fn propose(
        &self,
        op: Operation,
    ) -> Result<(), openraft::error::RaftError<NodeId, openraft::error::ClientWriteError<NodeId, BasicNode>>>
    {
        self.raft.client_write(op).await.map(|_| ())
    }

    pub fn current_state(&self) -> RoomState {
        self.state_rx.borrow().clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.raft.shutdown().await;
    }
}

/// Initializes and starts a Raft group for one room, returning a shared
/// handle. `peers` is `(node_id, rpc_addr)` for every node including this
/// one.
pub async fn start_room_raft(
    room_code: impl Into<String>,
    this_node_id: NodeId,
    peers: Vec<(NodeId, String)>,
    empty_state: RoomState,
    fanout: Arc<dyn RoomFanout>,
) -> Arc<RaftGroup> {
    let room_code = room_code.into();

    let config = Arc::new(
        openraft::Config {
            cluster_name: format!("room-{}", room_code),
            heartbeat_interval: 100,
            election_timeout_min: 300,
            election_timeout_max: 500,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let (storage, state_rx) = RoomStorage::new(empty_state, fanout);
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            config,
            RoomNetworkFactory::new(room_code.clone()),
            log_store,
            state_machine,
        )
        .await
        .expect("failed to create Raft instance"),
    );

    if !peers.is_empty() {
        let members: BTreeMap<NodeId, BasicNode> = peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        let min_id = peers.iter().map(|(id, _)| *id).min().unwrap_or(this_node_id);
        if this_node_id == min_id {
            if let Err(e) = raft.initialize(members).await {
                info!(room = %room_code, error = %e, "Raft already initialized (ignoring on restart)");
            }
        }
    }

    info!(room = %room_code, node_id = this_node_id, peers = peers.len(), "room Raft group started");

    Arc::new(RaftGroup {
        raft,
        room_code,
        node_id: this_node_id,
        state_rx,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────
