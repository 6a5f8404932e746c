//! A Raft consensus core: leader election, log replication, and commit
//! tracking, generic over pluggable transport (`Cluster`), application
//! (`StateMachine`), and persistence (`DurableState`) collaborators.
//!
//! This crate does not ship a network transport or a production storage
//! engine; it implements the consensus algorithm itself and the thread
//! architecture around it, and expects an embedder to supply the three
//! traits in `cluster`, `state_machine`, and `durable`.

pub mod cluster;
pub mod common;
pub mod config;
pub mod durable;
pub mod server;
pub mod state_machine;

pub use cluster::Cluster;
pub use common::RaftError;
pub use config::Config;
pub use durable::DurableState;
pub use server::{NodeId, Role, Server};
pub use state_machine::StateMachine;
