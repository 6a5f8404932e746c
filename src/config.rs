//! Bootstrap configuration for a node.
//!
//! Mirrors the reference's `Config` struct (a cluster membership map plus
//! this node's id/address and timing), extended with an environment-based
//! loader and a durable-storage backend selector so a binary built on this
//! crate does not have to hand-construct a `Config` in code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{RaftError, HEARTBEAT_INTERVAL};
use crate::server::NodeId;

/// Which `DurableState` backend a node should use. Kept out of the core
/// `durable` trait objects so a `Config` can be constructed (and parsed
/// from the environment) without depending on a concrete implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableBackend {
    /// Never actually persists. Only appropriate for tests.
    Null,
    /// Append-overwrite a single recovery file at this path.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    // Each server has a unique 64-bit id and a socket address. These
    // mappings MUST be identical for every server in the cluster.
    pub cluster: HashMap<NodeId, SocketAddr>,
    pub me: (NodeId, SocketAddr),
    pub heartbeat_timeout: Duration,
    pub durable_backend: DurableBackend,
}

impl Config {
    pub fn new(
        cluster: HashMap<NodeId, SocketAddr>,
        my_id: NodeId,
        my_addr: SocketAddr,
        heartbeat_timeout: Duration,
    ) -> Config {
        Config {
            cluster,
            me: (my_id, my_addr),
            heartbeat_timeout,
            durable_backend: DurableBackend::Null,
        }
    }

    pub fn with_durable_backend(mut self, backend: DurableBackend) -> Config {
        self.durable_backend = backend;
        self
    }

    /// Builds a `Config` from `RAFT_NODE_ID`, `RAFT_PEERS`
    /// (`id=host:port,id=host:port,...`, must include this node's own
    /// entry), and optionally `RAFT_HEARTBEAT_MS` (defaults to
    /// `common::HEARTBEAT_INTERVAL`) and `RAFT_DURABLE_FILE` (if unset,
    /// durability defaults to `DurableBackend::Null`).
    pub fn from_env() -> Result<Config, RaftError> {
        let my_id: NodeId = std::env::var("RAFT_NODE_ID")
            .map_err(|_| RaftError::Durability("RAFT_NODE_ID not set".into()))?
            .parse()
            .map_err(|e| RaftError::Durability(format!("RAFT_NODE_ID is not a valid node id: {e}")))?;

        let peers_raw = std::env::var("RAFT_PEERS")
            .map_err(|_| RaftError::Durability("RAFT_PEERS not set".into()))?;
        let mut cluster = HashMap::new();
        for entry in peers_raw.split(',').filter(|s| !s.is_empty()) {
            let (id_str, addr_str) = entry
                .split_once('=')
                .ok_or_else(|| RaftError::Durability(format!("malformed RAFT_PEERS entry: {entry}")))?;
            let id: NodeId = id_str
                .parse()
                .map_err(|e| RaftError::Durability(format!("malformed RAFT_PEERS id {id_str}: {e}")))?;
            let addr: SocketAddr = addr_str
                .parse()
                .map_err(|e| RaftError::Durability(format!("malformed RAFT_PEERS addr {addr_str}: {e}")))?;
            cluster.insert(id, addr);
        }
        let my_addr = *cluster
            .get(&my_id)
            .ok_or_else(|| RaftError::Durability("RAFT_PEERS does not contain this node's own id".into()))?;

        let heartbeat_ms: u64 = match std::env::var("RAFT_HEARTBEAT_MS") {
            Ok(v) => v
                .parse()
                .map_err(|e| RaftError::Durability(format!("RAFT_HEARTBEAT_MS is not a number: {e}")))?,
            Err(_) => HEARTBEAT_INTERVAL,
        };

        let durable_backend = match std::env::var("RAFT_DURABLE_FILE") {
            Ok(path) => DurableBackend::File(PathBuf::from(path)),
            Err(_) => DurableBackend::Null,
        };

        Ok(Config {
            cluster,
            me: (my_id, my_addr),
            heartbeat_timeout: Duration::from_millis(heartbeat_ms),
            durable_backend,
        })
    }
}
