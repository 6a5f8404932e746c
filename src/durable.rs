//! The durable-write hook (§6 of the design spec): the reference
//! implementation this crate is modeled on keeps `current_term`,
//! `voted_for`, and `log` in memory only and leaves persistence as a
//! TODO. Raft safety requires these be written to stable storage before
//! replying to any RPC that changed them, so this crate makes that an
//! explicit, pluggable interface instead.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::common::RaftError;
use crate::server::log::Entry;
use crate::server::NodeId;

/// The set of fields that must be durable before an RPC reply depending on
/// them is returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableRecord {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<Entry>,
}

#[derive(Serialize, Deserialize)]
struct SerializableEntry {
    index: usize,
    term: u64,
    command: Vec<u8>,
}

impl From<&Entry> for SerializableEntry {
    fn from(e: &Entry) -> Self {
        SerializableEntry {
            index: e.index,
            term: e.term,
            command: e.command.clone(),
        }
    }
}

impl From<SerializableEntry> for Entry {
    fn from(e: SerializableEntry) -> Self {
        Entry {
            index: e.index,
            term: e.term,
            command: e.command,
        }
    }
}

/// Contract for persisting and recovering `current_term`/`voted_for`/`log`.
/// Called before any RPC reply that depends on updated values of those
/// fields, and once at node construction to recover them.
pub trait DurableState: Send {
    fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, log: &[Entry]) -> Result<(), RaftError>;

    fn load(&self) -> Result<Option<DurableRecord>, RaftError>;
}

/// Accepts every write and never recalls anything. Documented as
/// unsuitable for production: a node restarted with `NullDurableState`
/// forgets `voted_for` and can double-vote in the same term.
#[derive(Default)]
pub struct NullDurableState;

impl DurableState for NullDurableState {
    fn persist(&mut self, _current_term: u64, _voted_for: Option<NodeId>, _log: &[Entry]) -> Result<(), RaftError> {
        Ok(())
    }

    fn load(&self) -> Result<Option<DurableRecord>, RaftError> {
        Ok(None)
    }
}

/// Writes the full record as JSON to a single recovery file on every
/// `persist`, fsyncing before returning. Simple and not write-optimized —
/// adequate for the modest commit rates this core targets, not a
/// production log-structured store.
pub struct FileDurableState {
    path: PathBuf,
    // A single node-local lock is enough: persist/load are only ever
    // called from the owning server thread, but this keeps the type Sync
    // for embedders that share it across threads anyway.
    file: Mutex<()>,
}

impl FileDurableState {
    pub fn new(path: PathBuf) -> FileDurableState {
        FileDurableState {
            path,
            file: Mutex::new(()),
        }
    }
}

impl DurableState for FileDurableState {
    fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, log: &[Entry]) -> Result<(), RaftError> {
        let _guard = self.file.lock().unwrap();
        let record = DurableRecord {
            current_term,
            voted_for,
            log: log.to_vec(),
        };
        let serializable: Vec<SerializableEntry> = record.log.iter().map(SerializableEntry::from).collect();
        let on_disk = (record.current_term, record.voted_for, serializable);
        let json = serde_json::to_vec(&on_disk)
            .map_err(|e| RaftError::Durability(format!("failed to encode durable record: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| RaftError::Durability(format!("failed to open durable file: {e}")))?;
        file.write_all(&json)
            .map_err(|e| RaftError::Durability(format!("failed to write durable file: {e}")))?;
        file.sync_all()
            .map_err(|e| RaftError::Durability(format!("failed to fsync durable file: {e}")))?;
        Ok(())
    }

    fn load(&self) -> Result<Option<DurableRecord>, RaftError> {
        let _guard = self.file.lock().unwrap();
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RaftError::Durability(format!("failed to open durable file: {e}"))),
        };
        file.seek(SeekFrom::Start(0))
            .map_err(|e| RaftError::Durability(format!("failed to seek durable file: {e}")))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| RaftError::Durability(format!("failed to read durable file: {e}")))?;
        if buf.is_empty() {
            return Ok(None);
        }
        let (current_term, voted_for, serializable): (u64, Option<NodeId>, Vec<SerializableEntry>) =
            serde_json::from_slice(&buf).map_err(|e| RaftError::Durability(format!("failed to decode durable record: {e}")))?;
        let log = serializable.into_iter().map(Entry::from).collect();
        Ok(Some(DurableRecord {
            current_term,
            voted_for,
            log,
        }))
    }
}

/// In-memory `DurableState` mocks used in server tests to assert on what
/// was persisted without touching the filesystem.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct RecordingDurableState {
        pub writes: Arc<Mutex<Vec<DurableRecord>>>,
    }

    impl RecordingDurableState {
        pub fn new() -> RecordingDurableState {
            RecordingDurableState::default()
        }

        pub fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl DurableState for RecordingDurableState {
        fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, log: &[Entry]) -> Result<(), RaftError> {
            self.writes.lock().unwrap().push(DurableRecord {
                current_term,
                voted_for,
                log: log.to_vec(),
            });
            Ok(())
        }

        fn load(&self) -> Result<Option<DurableRecord>, RaftError> {
            Ok(self.writes.lock().unwrap().last().cloned())
        }
    }
}
