//! The `Cluster` collaborator: everything the core needs to know about the
//! rest of the cluster and how to talk to it. The wire transport itself is
//! out of scope for this crate — `Cluster` is a trait so an embedder can
//! implement it over whatever RPC mechanism it likes. `StaticCluster` is a
//! reference implementation backed by a fixed peer map, usable in-process
//! for tests.

use rand::distributions::{Distribution, Uniform};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{RaftError, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};
use crate::server::log::Entry;
use crate::server::NodeId;

/// Contract the core uses to learn about cluster membership and to dispatch
/// RPCs to peers. Defined by contract only: this crate does not ship a
/// network transport, only this trait and an in-memory reference peer map.
pub trait Cluster: Send + Sync {
    /// Total number of nodes in the cluster, including self.
    fn size(&self) -> usize;

    /// IDs of every node in the cluster other than self.
    fn peers_except_self(&self) -> Vec<NodeId>;

    /// This node's randomised election timeout.
    fn election_timeout(&self) -> Duration;

    /// Sends a RequestVote RPC to `peer`. Returns `(vote_granted, term)`.
    fn request_vote_from(
        &self,
        peer: NodeId,
        term: u64,
        candidate_id: NodeId,
        last_log_index: Option<usize>,
        last_log_term: u64,
    ) -> Result<(bool, u64), RaftError>;

    /// Sends an AppendEntries RPC to `peer`. Returns `(success, term)`.
    fn send_append_entries_to(
        &self,
        peer: NodeId,
        term: u64,
        leader_id: NodeId,
        prev_log_index: Option<usize>,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: Option<usize>,
    ) -> Result<(bool, u64), RaftError>;

    /// Forwards a client command to `peer`, presumed to be the current leader.
    fn redirect_request_to(&self, peer: NodeId, command: Vec<u8>) -> Result<(), RaftError>;
}

/// A cluster membership map fixed at construction time: each server has a
/// unique id and a socket address, and this mapping must be identical on
/// every server in the cluster.
pub struct StaticCluster {
    me: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    transport: Box<dyn PeerTransport>,
}

/// The part of `StaticCluster` that actually talks to peers over the
/// network. Out of scope for this crate's tests: `StaticCluster::new_mock`
/// installs an in-process transport instead.
pub trait PeerTransport: Send + Sync {
    fn request_vote(
        &self,
        addr: SocketAddr,
        term: u64,
        candidate_id: NodeId,
        last_log_index: Option<usize>,
        last_log_term: u64,
    ) -> Result<(bool, u64), RaftError>;

    fn append_entries(
        &self,
        addr: SocketAddr,
        term: u64,
        leader_id: NodeId,
        prev_log_index: Option<usize>,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: Option<usize>,
    ) -> Result<(bool, u64), RaftError>;

    fn redirect(&self, addr: SocketAddr, command: Vec<u8>) -> Result<(), RaftError>;
}

/// A transport that never succeeds. Useful as a placeholder until a real
/// network transport is wired up; every call returns `RaftError::Transport`.
pub struct UnreachableTransport;

impl PeerTransport for UnreachableTransport {
    fn request_vote(
        &self,
        _addr: SocketAddr,
        _term: u64,
        _candidate_id: NodeId,
        _last_log_index: Option<usize>,
        _last_log_term: u64,
    ) -> Result<(bool, u64), RaftError> {
        Err(RaftError::Transport("no transport configured".into()))
    }

    fn append_entries(
        &self,
        _addr: SocketAddr,
        _term: u64,
        _leader_id: NodeId,
        _prev_log_index: Option<usize>,
        _prev_log_term: u64,
        _entries: Vec<Entry>,
        _leader_commit: Option<usize>,
    ) -> Result<(bool, u64), RaftError> {
        Err(RaftError::Transport("no transport configured".into()))
    }

    fn redirect(&self, _addr: SocketAddr, _command: Vec<u8>) -> Result<(), RaftError> {
        Err(RaftError::Transport("no transport configured".into()))
    }
}

impl StaticCluster {
    pub fn new(me: NodeId, peers: HashMap<NodeId, SocketAddr>, transport: Box<dyn PeerTransport>) -> StaticCluster {
        StaticCluster { me, peers, transport }
    }

    fn addr_of(&self, peer: NodeId) -> Result<SocketAddr, RaftError> {
        self.peers
            .get(&peer)
            .copied()
            .ok_or_else(|| RaftError::Transport(format!("unknown peer {peer}")))
    }
}

impl Cluster for StaticCluster {
    fn size(&self) -> usize {
        self.peers.len() + 1
    }

    fn peers_except_self(&self) -> Vec<NodeId> {
        self.peers.keys().filter(|&&id| id != self.me).copied().collect()
    }

    fn election_timeout(&self) -> Duration {
        generate_election_timeout()
    }

    fn request_vote_from(
        &self,
        peer: NodeId,
        term: u64,
        candidate_id: NodeId,
        last_log_index: Option<usize>,
        last_log_term: u64,
    ) -> Result<(bool, u64), RaftError> {
        let addr = self.addr_of(peer)?;
        self.transport
            .request_vote(addr, term, candidate_id, last_log_index, last_log_term)
    }

    fn send_append_entries_to(
        &self,
        peer: NodeId,
        term: u64,
        leader_id: NodeId,
        prev_log_index: Option<usize>,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: Option<usize>,
    ) -> Result<(bool, u64), RaftError> {
        let addr = self.addr_of(peer)?;
        self.transport
            .append_entries(addr, term, leader_id, prev_log_index, prev_log_term, entries, leader_commit)
    }

    fn redirect_request_to(&self, peer: NodeId, command: Vec<u8>) -> Result<(), RaftError> {
        let addr = self.addr_of(peer)?;
        self.transport.redirect(addr, command)
    }
}

/// Returns a new random election timeout in `[ELECTION_TIMEOUT_MIN,
/// ELECTION_TIMEOUT_MAX)` milliseconds. Should be redrawn whenever a node
/// transitions into the Follower or Candidate state.
pub fn generate_election_timeout() -> Duration {
    let between = Uniform::new(ELECTION_TIMEOUT_MIN, ELECTION_TIMEOUT_MAX);
    let mut rng = rand::thread_rng();
    Duration::from_millis(between.sample(&mut rng))
}

/// In-process `Cluster` mocks for single-process multi-node tests.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// A `Cluster` whose peer RPCs are wired directly to other in-process
    /// `Server` instances via closures, bypassing any real transport. Lets
    /// scenario tests build a 3-node cluster inside one process.
    pub struct ChannelCluster {
        pub me: NodeId,
        pub peer_ids: Vec<NodeId>,
        pub election_timeout: Duration,
        #[allow(clippy::type_complexity)]
        pub request_vote_fn:
            Mutex<Box<dyn FnMut(NodeId, u64, NodeId, Option<usize>, u64) -> Result<(bool, u64), RaftError> + Send>>,
        #[allow(clippy::type_complexity)]
        pub append_entries_fn: Mutex<
            Box<
                dyn FnMut(NodeId, u64, NodeId, Option<usize>, u64, Vec<Entry>, Option<usize>) -> Result<(bool, u64), RaftError>
                    + Send,
            >,
        >,
    }

    impl Cluster for ChannelCluster {
        fn size(&self) -> usize {
            self.peer_ids.len() + 1
        }

        fn peers_except_self(&self) -> Vec<NodeId> {
            self.peer_ids.clone()
        }

        fn election_timeout(&self) -> Duration {
            self.election_timeout
        }

        fn request_vote_from(
            &self,
            peer: NodeId,
            term: u64,
            candidate_id: NodeId,
            last_log_index: Option<usize>,
            last_log_term: u64,
        ) -> Result<(bool, u64), RaftError> {
            (self.request_vote_fn.lock().unwrap())(peer, term, candidate_id, last_log_index, last_log_term)
        }

        fn send_append_entries_to(
            &self,
            peer: NodeId,
            term: u64,
            leader_id: NodeId,
            prev_log_index: Option<usize>,
            prev_log_term: u64,
            entries: Vec<Entry>,
            leader_commit: Option<usize>,
        ) -> Result<(bool, u64), RaftError> {
            (self.append_entries_fn.lock().unwrap())(
                peer,
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            )
        }

        fn redirect_request_to(&self, _peer: NodeId, _command: Vec<u8>) -> Result<(), RaftError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_timeout_is_within_bounds() {
        for _ in 0..100 {
            let d = generate_election_timeout();
            assert!(d.as_millis() as u64 >= ELECTION_TIMEOUT_MIN);
            assert!(d.as_millis() as u64 <= ELECTION_TIMEOUT_MAX);
        }
    }

    #[test]
    fn static_cluster_excludes_self_from_peers() {
        let mut peers = HashMap::new();
        peers.insert(1, "127.0.0.1:9001".parse().unwrap());
        peers.insert(2, "127.0.0.1:9002".parse().unwrap());
        peers.insert(3, "127.0.0.1:9003".parse().unwrap());
        let cluster = StaticCluster::new(1, peers, Box::new(UnreachableTransport));
        assert_eq!(cluster.size(), 3);
        let mut others = cluster.peers_except_self();
        others.sort();
        assert_eq!(others, vec![2, 3]);
    }
}
