//! Cluster configuration.
//!
//! A node's identity in this system is just its place in the peer list: one
//! env var enumerates every peer as `nodeId:host:clientPort:rpcPort`,
//! another selects which entry is this node. There is no separate "cluster
//! state" here — unlike a single global Raft node, this system's leadership
//! is a per-room concept owned by each room's [`crate::raft::RaftGroup`];
//! this module's only job is turning two env vars into a validated peer
//! table before anything else starts.

use std::net::SocketAddr;

use thiserror::Error;

use crate::raft::NodeId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("CLUSTER_NODES entry {0:?} is not of the form nodeId:host:clientPort:rpcPort")]
    MalformedPeer(String),

    #[error("CLUSTER_NODES entry {0:?} has a non-numeric port")]
    InvalidPort(String),

    #[error("CLUSTER_NODES is empty")]
    EmptyPeerList,

    #[error("NODE_ID={0:?} does not match any entry in CLUSTER_NODES")]
    UnknownSelfId(String),
}

/// One peer's address triple, parsed from a single `CLUSTER_NODES` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub node_id: String,
    pub host: String,
    pub client_port: u16,
    pub rpc_port: u16,
}

impl PeerSpec {
    pub fn client_bind_addr(&self) -> SocketAddr {
        format!("0.0.0.0:{}", self.client_port)
            .parse()
            .expect("client_port is a valid u16")
    }

    pub fn rpc_bind_addr(&self) -> SocketAddr {
        format!("0.0.0.0:{}", self.rpc_port)
            .parse()
            .expect("rpc_port is a valid u16")
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.rpc_port)
    }
}

fn parse_peer(entry: &str) -> Result<PeerSpec, ConfigError> {
    let parts: Vec<&str> = entry.split(':').collect();
    let [node_id, host, client_port, rpc_port] = parts.as_slice() else {
        return Err(ConfigError::MalformedPeer(entry.to_string()));
    };

    let client_port = client_port
        .parse()
        .map_err(|_| ConfigError::InvalidPort(entry.to_string()))?;
    let rpc_port = rpc_port
        .parse()
        .map_err(|_| ConfigError::InvalidPort(entry.to_string()))?;

    Ok(PeerSpec {
        node_id: node_id.to_string(),
        host: host.to_string(),
        client_port,
        rpc_port,
    })
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

/// The cluster as seen by one node: the full peer table plus which entry is
/// "us". Validated once at startup — an unknown self id is a fatal
/// configuration error (spec's exit code 1 path).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub self_id: String,
    pub peers: Vec<PeerSpec>,
}

impl ClusterConfig {
    /// Parses `NODE_ID` and `CLUSTER_NODES` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let self_id = env_required("NODE_ID")?;
        let nodes_raw = env_required("CLUSTER_NODES")?;

        let peers: Vec<PeerSpec> = nodes_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_peer)
            .collect::<Result<_, _>>()?;

        if peers.is_empty() {
            return Err(ConfigError::EmptyPeerList);
        }

        if !peers.iter().any(|p| p.node_id == self_id) {
            return Err(ConfigError::UnknownSelfId(self_id));
        }

        Ok(Self { self_id, peers })
    }

    pub fn self_spec(&self) -> &PeerSpec {
        self.peers
            .iter()
            .find(|p| p.node_id == self.self_id)
            .expect("self_id validated against peers in from_env")
    }

    /// `(node_id, rpc_addr)` for every peer including this node, for
    /// handing to [`crate::raft::start_room_raft`] and the room registry.
    pub fn raft_peers(&self) -> Vec<(NodeId, String)> {
        self.peers
            .iter()
            .map(|p| (crate::raft::node_id_from_str(&p.node_id), p.rpc_addr()))
            .collect()
    }

    pub fn self_node_id(&self) -> NodeId {
        crate::raft::node_id_from_str(&self.self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_peer() {
        let peer = parse_peer("node-1:10.0.0.1:8080:7000").unwrap();
        assert_eq!(peer.node_id, "node-1");
        assert_eq!(peer.host, "10.0.0.1");
        assert_eq!(peer.client_port, 8080);
        assert_eq!(peer.rpc_port, 7000);
    }

    #[test]
    fn rejects_malformed_peer_entry() {
        assert!(matches!(
            parse_peer("node-1:10.0.0.1:8080"),
            Err(ConfigError::MalformedPeer(_))
        ));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(matches!(
            parse_peer("node-1:10.0.0.1:abc:7000"),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn raft_peers_are_deterministic_per_node_id() {
        let peers = vec![
            PeerSpec { node_id: "a".into(), host: "h1".into(), client_port: 1, rpc_port: 7000 },
            PeerSpec { node_id: "b".into(), host: "h2".into(), client_port: 1, rpc_port: 7001 },
        ];
        let cfg = ClusterConfig { self_id: "a".into(), peers };
        let raft_peers = cfg.raft_peers();
        assert_eq!(raft_peers.len(), 2);
        assert_eq!(raft_peers[0].1, "h1:7000");
    }

    #[test]
    fn self_spec_finds_matching_entry() {
        let peers = vec![PeerSpec {
            node_id: "a".into(),
            host: "h1".into(),
            client_port: 1,
            rpc_port: 7000,
        }];
        let cfg = ClusterConfig { self_id: "a".into(), peers };
        assert_eq!(cfg.self_spec().host, "h1");
    }
}
