//! A background thread per peer that relays messages between the node's
//! owning thread and the `Cluster` collaborator. Sending an RPC is a
//! blocking call on this thread (it may take up to the cluster's RPC
//! timeout), so the owning thread never stalls waiting on a single slow
//! peer during a heartbeat fan-out.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cluster::Cluster;
use crate::server::log::Entry;
use crate::server::{AppendEntriesReplyMsg, MainThreadMessage, NodeId, RequestVoteReplyMsg};

/// Message for the main thread to push to a peer's background thread.
#[derive(Debug)]
pub enum PeerThreadMessage {
    AppendEntries(AppendEntriesMessage),
    RequestVote(RequestVoteMessage),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesMessage {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: Option<usize>,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestVoteMessage {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: Option<usize>,
    pub last_log_term: u64,
}

/// Handle for the owning thread to reach a peer's background thread, plus
/// the join handle used to wait for it to exit on shutdown.
pub struct PeerLink {
    pub to_peer: Sender<PeerThreadMessage>,
    thread: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub fn shutdown(&mut self) {
        let _ = self.to_peer.send(PeerThreadMessage::Shutdown);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for PeerLink {
    /// Blocks until the background peer thread exits. Can potentially
    /// block for a long time if this peer is unresponsive and mid-RPC.
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A background thread whose job is to relay AppendEntries/RequestVote
/// calls to a single peer via the `Cluster` collaborator, and post
/// replies back onto the owning thread's channel.
struct Peer<C: Cluster> {
    id: NodeId,
    cluster: Arc<C>,
    to_main: Sender<MainThreadMessage>,
    from_main: Receiver<PeerThreadMessage>,
}

impl<C: Cluster + 'static> Peer<C> {
    /// Spawns a new peer thread to talk to the node at `id` through `cluster`.
    ///
    /// # Panics
    /// Panics if the OS fails to create a new background thread.
    pub fn spawn(id: NodeId, cluster: Arc<C>, to_main: Sender<MainThreadMessage>) -> PeerLink {
        let (to_peer, from_main) = channel();
        let thread = thread::spawn(move || {
            Peer { id, cluster, to_main, from_main }.main();
        });
        PeerLink { to_peer, thread: Some(thread) }
    }

    /// Sends the AppendEntries RPC to this peer and relays the result.
    /// A transport failure is a missing reply, not a failure reply: the
    /// owning thread's fan-out simply proceeds with what it did receive.
    fn send_append_entries(&self, entry: AppendEntriesMessage) {
        let sent_prev_log_index = entry.prev_log_index;
        let sent_entries_len = entry.entries.len();
        let result = self.cluster.send_append_entries_to(
            self.id,
            entry.term,
            entry.leader_id,
            entry.prev_log_index,
            entry.prev_log_term,
            entry.entries,
            entry.leader_commit,
        );
        if let Ok((success, term)) = result {
            let _ = self.to_main.send(MainThreadMessage::AppendEntriesReply(AppendEntriesReplyMsg {
                peer: self.id,
                term,
                success,
                sent_prev_log_index,
                sent_entries_len,
            }));
        }
    }

    /// Requests a vote from this peer and relays the result. Same
    /// missing-reply treatment as `send_append_entries`.
    fn send_request_vote(&self, vote: RequestVoteMessage) {
        let result = self
            .cluster
            .request_vote_from(self.id, vote.term, vote.candidate_id, vote.last_log_index, vote.last_log_term);
        if let Ok((vote_granted, term)) = result {
            let _ = self
                .to_main
                .send(MainThreadMessage::RequestVoteReply(RequestVoteReplyMsg { term, vote_granted }));
        }
    }

    /// Main loop for this peer's background thread.
    fn main(self) {
        loop {
            match self.from_main.recv() {
                Ok(PeerThreadMessage::AppendEntries(entry)) => self.send_append_entries(entry),
                Ok(PeerThreadMessage::RequestVote(vote)) => self.send_request_vote(vote),
                Ok(PeerThreadMessage::Shutdown) | Err(_) => return,
            }
        }
    }
}

/// Spawns a peer thread for `id`. Exposed at module level so `server::mod`
/// doesn't need to name the private `Peer` type.
pub fn spawn_peer<C: Cluster + 'static>(id: NodeId, cluster: Arc<C>, to_main: Sender<MainThreadMessage>) -> PeerLink {
    Peer::spawn(id, cluster, to_main)
}
