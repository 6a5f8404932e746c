//! The node core: state transitions, the single owning thread's main loop,
//! and the types used to talk to it. The actual RPC accept/reject logic
//! lives in `handlers`; replicated-log storage in `log`; per-peer relay
//! threads in `peer`; timer bookkeeping in `timer`.

pub mod handlers;
pub mod log;
pub mod peer;
pub mod timer;

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cluster::Cluster;
use crate::common::{majority_for, RaftError, LEADER_POLL_INTERVAL};
use crate::config::Config;
use crate::durable::DurableState;
use crate::state_machine::StateMachine;

use self::handlers::{AppendEntriesHandler, RequestVoteHandler};
use self::log::{Entry, Log, MemoryLog};
use self::peer::{spawn_peer, AppendEntriesMessage, PeerLink, PeerThreadMessage, RequestVoteMessage};
use self::timer::Timer;

/// Each server has a unique 64-bit id, shared across its whole cluster.
pub type NodeId = u64;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

#[derive(Debug)]
pub struct AppendEntriesReplyMsg {
    pub peer: NodeId,
    pub term: u64,
    pub success: bool,
    pub sent_prev_log_index: Option<usize>,
    pub sent_entries_len: usize,
}

#[derive(Debug)]
pub struct RequestVoteReplyMsg {
    pub term: u64,
    pub vote_granted: bool,
}

/// What accepting a client command got the caller, per `Server::make_request`.
/// Neither variant waits for commit; `Server::result_for` polls for that.
#[derive(Debug, Clone, Copy)]
pub enum RequestOutcome {
    /// We were the leader; the command was appended at this log index.
    Accepted { index: usize },
    /// We were not the leader; the command was forwarded to the one we know of.
    Forwarded,
}

pub struct ClientAppendRequest {
    pub command: Vec<u8>,
    pub response_tx: Sender<Result<RequestOutcome, RaftError>>,
}

#[derive(Debug)]
pub enum MainThreadMessage {
    AppendEntriesReply(AppendEntriesReplyMsg),
    RequestVoteReply(RequestVoteReplyMsg),
    ClientAppendRequest(ClientAppendRequest),
    HeartbeatTick,
    ElectionPoll,
    /// Any role → `Stopped`, disarming both timers. Reversible via `Restart`.
    Stop,
    /// `Stopped` → `Follower`, re-arming both timers. A no-op from any other role.
    Restart,
    /// Tears the owning thread down for good; unlike `Stop`, not reversible.
    Shutdown,
}

impl std::fmt::Debug for ClientAppendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAppendRequest").field("command_len", &self.command.len()).finish()
    }
}

/// State that must be consulted or mutated under a single lock: the
/// handlers (running on peer-initiated calls in tests, or on the owning
/// thread in production) and the owning thread's main loop both touch it.
pub struct ServerState {
    pub current_role: Role,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    /// Index of the highest log entry known to be committed. `None` means
    /// nothing has been committed yet.
    pub commit_index: Option<usize>,
    /// Index of the highest log entry applied to the state machine.
    pub last_applied: Option<usize>,
    pub last_leader_contact: Instant,
    pub election_timeout: Duration,
    pub leader_id: Option<NodeId>,
    /// Leader-only: next log index to send to each peer.
    pub next_index: HashMap<NodeId, usize>,
    /// Leader-only: highest log index known replicated to each peer.
    pub match_index: HashMap<NodeId, Option<usize>>,
}

impl ServerState {
    fn new(election_timeout: Duration) -> ServerState {
        ServerState {
            current_role: Role::Follower,
            current_term: 0,
            voted_for: None,
            commit_index: None,
            last_applied: None,
            last_leader_contact: Instant::now(),
            election_timeout,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Advances to a strictly higher term: `current_term := new_term`,
    /// `leader_id := None`, `voted_for := None`, `role := Follower`. A
    /// no-op, returning `false`, when `new_term <= current_term` — in
    /// particular this never demotes a Leader or Candidate on its own at
    /// an equal term. (A Candidate stepping down on a same-term
    /// AppendEntries from an actual leader is a separate rule, applied by
    /// the AppendEntries handler itself, not by this primitive.) This is
    /// the only place `current_term` moves forward.
    pub fn advance_term(&mut self, new_term: u64) -> bool {
        if new_term <= self.current_term {
            return false;
        }
        self.current_term = new_term;
        self.leader_id = None;
        self.voted_for = None;
        self.current_role = Role::Follower;
        true
    }

    pub fn transition_to_candidate(&mut self, my_id: NodeId, election_timeout: Duration) -> u64 {
        self.current_role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
        self.election_timeout = election_timeout;
        self.last_leader_contact = Instant::now();
        self.current_term
    }

    pub fn transition_to_leader(&mut self, me: NodeId, peers: &[NodeId], log_len: usize) {
        debug_assert_eq!(self.current_role, Role::Candidate);
        self.current_role = Role::Leader;
        self.leader_id = Some(me);
        self.next_index.clear();
        self.match_index.clear();
        for &peer in peers {
            self.next_index.insert(peer, log_len);
            self.match_index.insert(peer, None);
        }
    }

    pub fn election_timeout_elapsed(&self) -> bool {
        Instant::now().duration_since(self.last_leader_contact) >= self.election_timeout
    }
}

/// Computes the new commit index from the leader's view of `match_index`
/// (plus its own log length, since the leader always matches itself): the
/// highest index replicated to a majority. Only entries from the leader's
/// current term may be committed this way (the leader-completeness /
/// "commit gated by current term" safety rule) — an older-term entry can
/// only become committed as a side effect of a newer entry committing.
pub fn compute_commit_index(
    match_index: &HashMap<NodeId, Option<usize>>,
    my_last_index: Option<usize>,
    current_term: u64,
    log: &dyn Log,
    cluster_size: usize,
) -> Option<usize> {
    let mut indices: Vec<Option<usize>> = match_index.values().copied().collect();
    indices.push(my_last_index);
    indices.sort();
    indices.reverse();
    let needed = majority_for(cluster_size);
    if needed == 0 || needed > indices.len() {
        return None;
    }
    let candidate = indices[needed - 1];
    match candidate {
        Some(index) => match log.get_entry(index) {
            Some(entry) if entry.term == current_term => Some(index),
            _ => None,
        },
        None => None,
    }
}

/// The node core. Generic over the three external collaborators so an
/// embedder can supply its own transport, state machine, and durability
/// backend while reusing all election/replication logic unchanged.
pub struct Server<C: Cluster, M: StateMachine, D: DurableState> {
    id: NodeId,
    cluster: Arc<C>,
    state: Arc<Mutex<ServerState>>,
    log: Arc<Mutex<dyn Log>>,
    state_machine: Arc<Mutex<M>>,
    durable: Arc<Mutex<D>>,
    peer_links: HashMap<NodeId, PeerLink>,
    to_main: Sender<MainThreadMessage>,
    from_peers_and_timers: Receiver<MainThreadMessage>,
    heartbeat_timer: Timer,
    election_timer: Timer,
    /// This node's heartbeat period, kept around so `restart()` can re-arm
    /// `heartbeat_timer` without needing the `Config` back.
    heartbeat_interval: Duration,
    /// State-machine results, keyed by the log index that produced them,
    /// for `result_for` to poll without blocking the owning thread.
    results: Arc<Mutex<HashMap<usize, Vec<u8>>>>,
    /// Votes granted in the current election, including our own vote for
    /// ourselves. `RequestVoteReply` doesn't carry the replying peer's id
    /// (the `Cluster` trait doesn't need to expose it), so this counts
    /// granted replies rather than tracking which specific peers voted;
    /// a stale reply from a past election is filtered out by term first.
    votes_received: usize,
}

impl<C: Cluster + 'static, M: StateMachine, D: DurableState> Server<C, M, D> {
    pub fn new(config: Config, cluster: Arc<C>, state_machine: M, mut durable: D) -> Result<Server<C, M, D>, RaftError> {
        let id = config.me.0;
        let recovered = durable.load()?;
        let log: Arc<Mutex<dyn Log>> = match recovered {
            Some(ref record) => Arc::new(Mutex::new(MemoryLog::from_entries(record.log.clone()))),
            None => Arc::new(Mutex::new(MemoryLog::new())),
        };

        let election_timeout = cluster.election_timeout();
        let mut state = ServerState::new(election_timeout);
        if let Some(record) = recovered {
            state.current_term = record.current_term;
            state.voted_for = record.voted_for;
        }
        let state = Arc::new(Mutex::new(state));

        let (to_main, from_peers_and_timers) = channel();
        let peer_links: HashMap<NodeId, PeerLink> = cluster
            .peers_except_self()
            .into_iter()
            .map(|peer_id| (peer_id, spawn_peer(peer_id, cluster.clone(), to_main.clone())))
            .collect();

        let heartbeat_interval = config.heartbeat_timeout;
        let heartbeat_timer = Timer::arm(heartbeat_interval, heartbeat_interval, to_main.clone(), || {
            MainThreadMessage::HeartbeatTick
        });
        let election_poll_interval = election_timeout / 3;
        let election_timer = Timer::arm(election_poll_interval, election_poll_interval, to_main.clone(), || {
            MainThreadMessage::ElectionPoll
        });

        Ok(Server {
            id,
            cluster,
            state,
            log,
            state_machine: Arc::new(Mutex::new(state_machine)),
            durable: Arc::new(Mutex::new(durable)),
            peer_links,
            to_main,
            from_peers_and_timers,
            heartbeat_timer,
            election_timer,
            heartbeat_interval,
            votes_received: 0,
            results: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// A handle an embedder can clone and hand to client-facing code: a
    /// `ClientAppendRequest` round-trips through the owning thread's
    /// channel, so it's safe to call from any thread.
    pub fn request_sender(&self) -> Sender<MainThreadMessage> {
        self.to_main.clone()
    }

    /// Returns a `Box<dyn RpcObject>`-style pair the embedder's transport
    /// can dispatch incoming RPCs to, sharing this server's locks.
    pub fn handlers(&self) -> (AppendEntriesHandler<M, D>, RequestVoteHandler<D>) {
        (
            AppendEntriesHandler {
                id: self.id,
                state: self.state.clone(),
                log: self.log.clone(),
                state_machine: self.state_machine.clone(),
                durable: self.durable.clone(),
                results: self.results.clone(),
            },
            RequestVoteHandler {
                state: self.state.clone(),
                log: self.log.clone(),
                durable: self.durable.clone(),
            },
        )
    }

    /// Submits `command` to the cluster. If we're the leader, appends it
    /// to the log and returns the index it landed at without waiting for
    /// commit; poll `result_for` to observe the applied result. If we're
    /// not the leader, forwards to whichever leader we know of, retrying
    /// on `common::LEADER_POLL_INTERVAL` while none is known yet.
    pub fn make_request(&self, command: Vec<u8>) -> Result<RequestOutcome, RaftError> {
        loop {
            let (response_tx, response_rx) = channel();
            self.to_main
                .send(MainThreadMessage::ClientAppendRequest(ClientAppendRequest {
                    command: command.clone(),
                    response_tx,
                }))
                .map_err(|_| RaftError::Stopped)?;
            match response_rx.recv().map_err(|_| RaftError::Stopped)? {
                Ok(outcome) => return Ok(outcome),
                Err(RaftError::NotLeader { leader_id: None }) => {
                    std::thread::sleep(Duration::from_millis(LEADER_POLL_INTERVAL));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The state machine's result for `index`, once it has been applied.
    /// `None` until `last_applied >= index`.
    pub fn result_for(&self, index: usize) -> Option<Vec<u8>> {
        self.results.lock().unwrap().get(&index).cloned()
    }

    /// Moves this node to `Stopped` and disarms both timers: any RPC
    /// against it now returns a benign failure without mutating state.
    /// Reversible via `restart()`.
    pub fn stop(&self) {
        let _ = self.to_main.send(MainThreadMessage::Stop);
    }

    /// Moves a `Stopped` node back to `Follower` and re-arms both timers.
    /// A no-op if the node isn't currently `Stopped`.
    pub fn restart(&self) {
        let _ = self.to_main.send(MainThreadMessage::Restart);
    }

    /// Runs the main loop forever. Does not return under normal operation;
    /// an embedder that needs to tear the node down for good sends
    /// `MainThreadMessage::Shutdown` (see `stop()` for a reversible pause).
    pub fn run(mut self) {
        loop {
            let message = match self.from_peers_and_timers.recv() {
                Ok(m) => m,
                Err(_) => return,
            };
            match message {
                MainThreadMessage::Shutdown => {
                    self.state.lock().unwrap().current_role = Role::Stopped;
                    self.heartbeat_timer.disarm();
                    self.election_timer.disarm();
                    return;
                }
                MainThreadMessage::Stop => self.on_stop(),
                MainThreadMessage::Restart => self.on_restart(),
                MainThreadMessage::ElectionPoll => self.on_election_poll(),
                MainThreadMessage::HeartbeatTick => self.on_heartbeat_tick(),
                MainThreadMessage::AppendEntriesReply(reply) => self.on_append_entries_reply(reply),
                MainThreadMessage::RequestVoteReply(reply) => self.on_request_vote_reply(reply),
                MainThreadMessage::ClientAppendRequest(req) => self.on_client_append_request(req),
            }
        }
    }

    /// Any role → `Stopped`, disarming both timers (§4.1).
    fn on_stop(&mut self) {
        self.state.lock().unwrap().current_role = Role::Stopped;
        self.heartbeat_timer.disarm();
        self.election_timer.disarm();
    }

    /// `Stopped` → `Follower`, re-arming both timers. A no-op from any
    /// other role.
    fn on_restart(&mut self) {
        let new_election_timeout = self.cluster.election_timeout();
        {
            let mut state = self.state.lock().unwrap();
            if state.current_role != Role::Stopped {
                return;
            }
            state.current_role = Role::Follower;
            state.leader_id = None;
            state.election_timeout = new_election_timeout;
            state.last_leader_contact = Instant::now();
        }
        self.heartbeat_timer = Timer::arm(
            self.heartbeat_interval,
            self.heartbeat_interval,
            self.to_main.clone(),
            || MainThreadMessage::HeartbeatTick,
        );
        let election_poll_interval = new_election_timeout / 3;
        self.election_timer = Timer::arm(election_poll_interval, election_poll_interval, self.to_main.clone(), || {
            MainThreadMessage::ElectionPoll
        });
    }

    fn on_client_append_request(&mut self, req: ClientAppendRequest) {
        let (role, leader_id) = {
            let state = self.state.lock().unwrap();
            (state.current_role, state.leader_id)
        };
        let outcome = if role == Role::Leader {
            let term = self.state.lock().unwrap().current_term;
            let index = self.log.lock().unwrap().append_command(term, req.command.clone());
            {
                let voted_for = self.state.lock().unwrap().voted_for;
                let log = self.log.lock().unwrap();
                let mut durable = self.durable.lock().unwrap();
                let _ = durable.persist(term, voted_for, log.get_entries_from(0));
            }
            self.send_append_entries_to_all();
            Ok(RequestOutcome::Accepted { index })
        } else {
            match leader_id {
                Some(leader) => {
                    let _ = self.cluster.redirect_request_to(leader, req.command);
                    Ok(RequestOutcome::Forwarded)
                }
                None => Err(RaftError::NotLeader { leader_id: None }),
            }
        };
        let _ = req.response_tx.send(outcome);
    }

    fn on_heartbeat_tick(&mut self) {
        let is_leader = { self.state.lock().unwrap().current_role == Role::Leader };
        if is_leader {
            self.send_append_entries_to_all();
        }
    }

    fn on_election_poll(&mut self) {
        let should_start = {
            let state = self.state.lock().unwrap();
            matches!(state.current_role, Role::Follower | Role::Candidate) && state.election_timeout_elapsed()
        };
        if should_start {
            self.start_election();
        }
    }

    fn start_election(&mut self) {
        let peers = self.cluster.peers_except_self();
        let new_timeout = self.cluster.election_timeout();
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.lock().unwrap();
            let term = state.transition_to_candidate(self.id, new_timeout);
            let log = self.log.lock().unwrap();
            (term, log.last_index(), log.last_term())
        };
        {
            let voted_for = { self.state.lock().unwrap().voted_for };
            let log = self.log.lock().unwrap();
            let mut durable = self.durable.lock().unwrap();
            let _ = durable.persist(term, voted_for, log.get_entries_from(0));
        }

        self.votes_received = 1; // vote for ourselves

        let request = RequestVoteMessage {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };
        for peer in peers {
            if let Some(link) = self.peer_links.get(&peer) {
                let _ = link.to_peer.send(PeerThreadMessage::RequestVote(request));
            }
        }
    }

    fn on_request_vote_reply(&mut self, reply: RequestVoteReplyMsg) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            state.advance_term(reply.term);
            return;
        }
        if state.current_role != Role::Candidate || reply.term != state.current_term || !reply.vote_granted {
            return;
        }
        drop(state);

        self.votes_received += 1;
        let needed = majority_for(self.cluster.size());
        if self.votes_received >= needed {
            let peers = self.cluster.peers_except_self();
            let mut state = self.state.lock().unwrap();
            if state.current_role == Role::Candidate {
                let log_len = self.log.lock().unwrap().len();
                state.transition_to_leader(self.id, &peers, log_len);
                drop(state);
                self.send_append_entries_to_all();
            }
        }
    }

    /// Sends AppendEntries (heartbeat or replication) to every peer,
    /// tailored to what each peer's `next_index` says it still needs.
    fn send_append_entries_to_all(&mut self) {
        let (term, leader_commit) = {
            let state = self.state.lock().unwrap();
            (state.current_term, state.commit_index)
        };
        let peers: Vec<NodeId> = self.cluster.peers_except_self();
        for peer in peers {
            let next_index = {
                let state = self.state.lock().unwrap();
                *state.next_index.get(&peer).unwrap_or(&0)
            };
            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.lock().unwrap();
                let prev_log_index = next_index.checked_sub(1);
                let prev_log_term = prev_log_index.and_then(|i| log.get_entry(i)).map(|e| e.term).unwrap_or(0);
                (prev_log_index, prev_log_term, log.get_entries_from(next_index).to_vec())
            };
            if let Some(link) = self.peer_links.get(&peer) {
                let _ = link.to_peer.send(PeerThreadMessage::AppendEntries(AppendEntriesMessage {
                    term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                }));
            }
        }
    }

    fn on_append_entries_reply(&mut self, reply: AppendEntriesReplyMsg) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            state.advance_term(reply.term);
            return;
        }
        if state.current_role != Role::Leader {
            return;
        }
        if reply.success {
            let new_match = reply.sent_prev_log_index.map(|i| i + reply.sent_entries_len).or({
                if reply.sent_entries_len > 0 {
                    Some(reply.sent_entries_len - 1)
                } else {
                    None
                }
            });
            if let Some(m) = new_match {
                state.match_index.insert(reply.peer, Some(m));
                state.next_index.insert(reply.peer, m + 1);
            }
            let my_last_index = self.log.lock().unwrap().last_index();
            let current_term = state.current_term;
            let cluster_size = self.cluster.size();
            let log = self.log.lock().unwrap();
            let new_commit = compute_commit_index(&state.match_index, my_last_index, current_term, &*log, cluster_size);
            drop(log);
            if new_commit > state.commit_index {
                state.commit_index = new_commit;
                drop(state);
                self.apply_committed_entries();
            }
        } else {
            let next = state.next_index.get(&reply.peer).copied().unwrap_or(1);
            state.next_index.insert(reply.peer, next.saturating_sub(1));
        }
    }

    /// Applies every log entry between `last_applied` (exclusive) and
    /// `commit_index` (inclusive) to the state machine, in order.
    fn apply_committed_entries(&mut self) {
        let (mut last_applied, commit_index) = {
            let state = self.state.lock().unwrap();
            (state.last_applied, state.commit_index)
        };
        let commit_index = match commit_index {
            Some(c) => c,
            None => return,
        };
        let start = last_applied.map(|a| a + 1).unwrap_or(0);
        if start > commit_index {
            return;
        }
        let entries: Vec<Entry> = {
            let log = self.log.lock().unwrap();
            (start..=commit_index).filter_map(|i| log.get_entry(i).cloned()).collect()
        };
        for entry in entries {
            let result = self.state_machine.lock().unwrap().apply(&entry.command);
            self.results.lock().unwrap().insert(entry.index, result);
            last_applied = Some(entry.index);
        }
        self.state.lock().unwrap().last_applied = last_applied;
    }
}
