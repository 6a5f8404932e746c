//! The `StateMachine` collaborator: the deterministic application this
//! crate replicates commands into. The core treats commands as opaque
//! bytes; `KeyValueStateMachine` is a reference implementation used by
//! tests and examples, not a requirement on embedders.

use crate::common::RaftError;
use std::collections::HashMap;

/// Contract for the state machine Raft replicates commands into.
///
/// `apply` is assumed deterministic and is called exactly once per
/// committed log index, in increasing index order. Re-application is NOT
/// assumed idempotent; the core's job is to guarantee the "exactly once"
/// part, not the state machine's.
pub trait StateMachine: Send {
    /// Applies `command` and returns whatever result the caller should see.
    fn apply(&mut self, command: &[u8]) -> Vec<u8>;

    /// Diagnostic connectivity check. May fail. Never called on the hot path.
    fn test_connection(&self) -> Result<(), RaftError> {
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(tag = "op")]
pub enum KeyValueCommand {
    Set { key: String, value: String },
    Delete { key: String },
}

/// A trivial in-memory key/value store, serialized as JSON purely as an
/// example codec — the core itself never interprets command bytes.
#[derive(Default)]
pub struct KeyValueStateMachine {
    store: HashMap<String, String>,
}

impl KeyValueStateMachine {
    pub fn new() -> KeyValueStateMachine {
        KeyValueStateMachine { store: HashMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.store.get(key)
    }
}

impl StateMachine for KeyValueStateMachine {
    fn apply(&mut self, command: &[u8]) -> Vec<u8> {
        let decoded: Result<KeyValueCommand, _> = serde_json::from_slice(command);
        match decoded {
            Ok(KeyValueCommand::Set { key, value }) => {
                self.store.insert(key, value);
                b"ok".to_vec()
            }
            Ok(KeyValueCommand::Delete { key }) => {
                let existed = self.store.remove(&key).is_some();
                if existed { b"ok".to_vec() } else { b"missing".to_vec() }
            }
            Err(e) => {
                log::warn!("state machine could not decode command: {e}");
                b"error".to_vec()
            }
        }
    }
}

/// `StateMachine` mocks used by server tests: a handle that records every
/// applied command so tests can assert "applied exactly once" ordering.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingStateMachine {
        pub applied: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingStateMachine {
        pub fn new() -> RecordingStateMachine {
            RecordingStateMachine::default()
        }

        pub fn applied_commands(&self) -> Vec<Vec<u8>> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&mut self, command: &[u8]) -> Vec<u8> {
            self.applied.lock().unwrap().push(command.to_vec());
            command.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let mut sm = KeyValueStateMachine::new();
        let cmd = serde_json::to_vec(&KeyValueCommand::Set {
            key: "a".into(),
            value: "1".into(),
        })
        .unwrap();
        sm.apply(&cmd);
        assert_eq!(sm.get("a"), Some(&"1".to_string()));
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let mut sm = KeyValueStateMachine::new();
        let del = serde_json::to_vec(&KeyValueCommand::Delete { key: "missing".into() }).unwrap();
        assert_eq!(sm.apply(&del), b"missing".to_vec());
    }

    #[test]
    fn malformed_command_does_not_panic() {
        let mut sm = KeyValueStateMachine::new();
        assert_eq!(sm.apply(b"not json"), b"error".to_vec());
    }
}
