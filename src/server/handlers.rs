//! AppendEntries and RequestVote accept/reject logic. Pulled out of
//! `Server` so an embedder's transport can dispatch incoming RPCs
//! straight to these handlers without round-tripping through the owning
//! thread's channel — they share the same locks `Server` does, and are
//! safe to call concurrently from any number of transport threads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::common::RaftError;
use crate::durable::DurableState;
use crate::state_machine::StateMachine;

use super::log::{Entry, Log};
use super::{NodeId, Role, ServerState};

/// Handles incoming AppendEntries RPCs (log replication and heartbeats).
pub struct AppendEntriesHandler<M: StateMachine, D: DurableState> {
    pub(crate) id: NodeId,
    pub(crate) state: Arc<Mutex<ServerState>>,
    pub(crate) log: Arc<Mutex<dyn Log>>,
    pub(crate) state_machine: Arc<Mutex<M>>,
    pub(crate) durable: Arc<Mutex<D>>,
    pub(crate) results: Arc<Mutex<HashMap<usize, Vec<u8>>>>,
}

impl<M: StateMachine, D: DurableState> AppendEntriesHandler<M, D> {
    /// Returns `(success, current_term)`, per the RPC's wire contract. A
    /// stopped node always reports `(false, current_term)` rather than
    /// vacuously succeeding — it must not count toward a leader's quorum.
    pub fn handle(
        &self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: Option<usize>,
        prev_log_term: u64,
        entries: Vec<Entry>,
        leader_commit: Option<usize>,
    ) -> Result<(bool, u64), RaftError> {
        let mut state = self.state.lock().unwrap();
        if state.current_role == Role::Stopped {
            return Ok((false, state.current_term));
        }
        if term < state.current_term {
            return Ok((false, state.current_term));
        }
        state.advance_term(term);
        // A valid AppendEntries (term >= current_term, already checked above)
        // always comes from this term's actual leader, so a Candidate steps
        // down even when the term didn't strictly advance — distinct from
        // `advance_term`'s own higher-term-only rule.
        state.current_role = Role::Follower;
        state.leader_id = Some(leader_id);
        state.last_leader_contact = Instant::now();

        let mut log = self.log.lock().unwrap();
        // A pure heartbeat (no entries) skips the prev_log_index check and
        // never truncates: Leader Completeness requires a lagging follower
        // still learn of the new leader and advance its commit index within
        // its existing log, rather than being rejected or truncated down to
        // whatever a stale leader-side next_index happens to say.
        if !entries.is_empty() {
            let log_ok = match prev_log_index {
                None => true,
                Some(i) => matches!(log.get_entry(i), Some(e) if e.term == prev_log_term),
            };
            if !log_ok {
                let current_term = state.current_term;
                return Ok((false, current_term));
            }
        }

        let truncate_to = prev_log_index.map(|i| i + 1).unwrap_or(0);
        let last_new_index = if entries.is_empty() {
            prev_log_index
        } else {
            Some(truncate_to + entries.len() - 1)
        };
        if !entries.is_empty() {
            log.truncate_and_append(truncate_to, entries)?;
        }

        {
            let mut durable = self.durable.lock().unwrap();
            durable.persist(state.current_term, state.voted_for, log.get_entries_from(0))?;
        }

        if leader_commit > state.commit_index {
            state.commit_index = match (leader_commit, last_new_index) {
                (Some(lc), Some(lni)) => Some(lc.min(lni)),
                _ => state.commit_index,
            };
        }
        let current_term = state.current_term;

        self.apply_committed(&mut state, &log);
        Ok((true, current_term))
    }

    /// Applies every newly committed entry to the state machine, in
    /// index order, advancing `last_applied` as it goes.
    fn apply_committed(&self, state: &mut ServerState, log: &dyn Log) {
        let commit_index = match state.commit_index {
            Some(c) => c,
            None => return,
        };
        let start = state.last_applied.map(|a| a + 1).unwrap_or(0);
        if start > commit_index {
            return;
        }
        let mut state_machine = self.state_machine.lock().unwrap();
        for index in start..=commit_index {
            if let Some(entry) = log.get_entry(index) {
                let result = state_machine.apply(&entry.command);
                self.results.lock().unwrap().insert(index, result);
                state.last_applied = Some(index);
            }
        }
    }
}

/// Handles incoming RequestVote RPCs.
pub struct RequestVoteHandler<D: DurableState> {
    pub(crate) state: Arc<Mutex<ServerState>>,
    pub(crate) log: Arc<Mutex<dyn Log>>,
    pub(crate) durable: Arc<Mutex<D>>,
}

impl<D: DurableState> RequestVoteHandler<D> {
    /// Returns `(vote_granted, current_term)`.
    pub fn handle(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: Option<usize>,
        last_log_term: u64,
    ) -> Result<(bool, u64), RaftError> {
        let mut state = self.state.lock().unwrap();
        if state.current_role == Role::Stopped {
            return Ok((false, state.current_term));
        }
        if term < state.current_term {
            return Ok((false, state.current_term));
        }
        state.advance_term(term);

        let can_vote = state.voted_for.is_none() || state.voted_for == Some(candidate_id);
        let log = self.log.lock().unwrap();
        let log_up_to_date = log.is_candidate_log_up_to_date(last_log_index, last_log_term);

        let vote_granted = can_vote && log_up_to_date;
        if vote_granted {
            state.voted_for = Some(candidate_id);
            state.last_leader_contact = Instant::now();
            let mut durable = self.durable.lock().unwrap();
            durable.persist(state.current_term, state.voted_for, log.get_entries_from(0))?;
        }
        Ok((vote_granted, state.current_term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::mocks::RecordingDurableState;
    use crate::server::log::mocks::new_mock_log;
    use crate::state_machine::mocks::RecordingStateMachine;
    use std::time::Duration;

    fn handler_fixture() -> (
        AppendEntriesHandler<RecordingStateMachine, RecordingDurableState>,
        Arc<Mutex<ServerState>>,
        Arc<Mutex<dyn Log>>,
    ) {
        let state = Arc::new(Mutex::new(ServerState::new(Duration::from_millis(150))));
        let log: Arc<Mutex<dyn Log>> = Arc::new(Mutex::new(new_mock_log()));
        let handler = AppendEntriesHandler {
            id: 1,
            state: state.clone(),
            log: log.clone(),
            state_machine: Arc::new(Mutex::new(RecordingStateMachine::new())),
            durable: Arc::new(Mutex::new(RecordingDurableState::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
        };
        (handler, state, log)
    }

    #[test]
    fn rejects_stale_term() {
        let (handler, state, _log) = handler_fixture();
        state.lock().unwrap().current_term = 5;
        let (success, term) = handler.handle(4, 2, None, 0, vec![], None).unwrap();
        assert!(!success);
        assert_eq!(term, 5);
    }

    #[test]
    fn stopped_node_never_succeeds() {
        let (handler, state, _log) = handler_fixture();
        state.lock().unwrap().current_term = 5;
        state.lock().unwrap().current_role = Role::Stopped;
        let (success, term) = handler.handle(9, 2, None, 0, vec![], None).unwrap();
        assert!(!success);
        assert_eq!(term, 5);
    }

    #[test]
    fn accepts_first_entry_at_empty_log() {
        let (handler, state, log) = handler_fixture();
        let entries = vec![Entry { index: 0, term: 1, command: vec![1] }];
        let (success, term) = handler.handle(1, 2, None, 0, entries, Some(0)).unwrap();
        assert!(success);
        assert_eq!(term, 1);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(state.lock().unwrap().commit_index, Some(0));
    }

    #[test]
    fn rejects_on_log_mismatch_when_entries_present() {
        let (handler, _state, _log) = handler_fixture();
        let entries = vec![Entry { index: 1, term: 9, command: vec![] }];
        let (success, _term) = handler.handle(1, 2, Some(0), 9, entries, None).unwrap();
        assert!(!success);
    }

    #[test]
    fn heartbeat_skips_the_log_match_check() {
        // A heartbeat (no entries) must be accepted even when prev_log_index
        // doesn't match this follower's log: the leader may simply be behind
        // on next_index for this peer, and a lagging follower still needs to
        // learn of the new leader and advance commits within its own log.
        let (handler, _state, _log) = handler_fixture();
        let (success, _term) = handler.handle(1, 2, Some(0), 9, vec![], None).unwrap();
        assert!(success);
    }

    #[test]
    fn heartbeat_does_not_truncate_existing_entries() {
        let (handler, _state, log) = handler_fixture();
        {
            let mut l = log.lock().unwrap();
            l.truncate_and_append(
                0,
                (0..10)
                    .map(|i| Entry { index: i, term: 1, command: vec![] })
                    .collect(),
            )
            .unwrap();
        }
        // Leader's next_index for us is stale (5), so prev_log_index is far
        // behind our actual log tail. A heartbeat must not discard entries
        // past it.
        let (success, _term) = handler.handle(1, 2, Some(4), 1, vec![], None).unwrap();
        assert!(success);
        assert_eq!(log.lock().unwrap().len(), 10);
    }

    #[test]
    fn conflicting_suffix_is_truncated() {
        let (handler, _state, log) = handler_fixture();
        {
            let mut l = log.lock().unwrap();
            l.truncate_and_append(
                0,
                vec![
                    Entry { index: 0, term: 1, command: vec![0] },
                    Entry { index: 1, term: 1, command: vec![1] },
                ],
            )
            .unwrap();
        }
        let new_entry = Entry { index: 1, term: 2, command: vec![9] };
        let (success, _) = handler.handle(2, 2, Some(0), 1, vec![new_entry], None).unwrap();
        assert!(success);
        let l = log.lock().unwrap();
        assert_eq!(l.len(), 2);
        assert_eq!(l.get_entry(1).unwrap().term, 2);
    }

    #[test]
    fn vote_denied_when_candidate_log_is_shorter() {
        let state = Arc::new(Mutex::new(ServerState::new(Duration::from_millis(150))));
        let log: Arc<Mutex<dyn Log>> = Arc::new(Mutex::new(new_mock_log()));
        {
            let mut l = log.lock().unwrap();
            l.truncate_and_append(0, vec![Entry { index: 0, term: 3, command: vec![] }]).unwrap();
        }
        let handler = RequestVoteHandler {
            state: state.clone(),
            log: log.clone(),
            durable: Arc::new(Mutex::new(RecordingDurableState::new())),
        };
        let (granted, _term) = handler.handle(3, 2, None, 0).unwrap();
        assert!(!granted);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let state = Arc::new(Mutex::new(ServerState::new(Duration::from_millis(150))));
        let log: Arc<Mutex<dyn Log>> = Arc::new(Mutex::new(new_mock_log()));
        let handler = RequestVoteHandler {
            state: state.clone(),
            log: log.clone(),
            durable: Arc::new(Mutex::new(RecordingDurableState::new())),
        };
        let (first, _) = handler.handle(1, 2, None, 0).unwrap();
        assert!(first);
        let (second, _) = handler.handle(1, 3, None, 0).unwrap();
        assert!(!second);
    }
}
