//! External contracts the engine consumes: durable storage plus transport
//! behind [`Io`], and the application state machine behind [`Fsm`].
//!
//! The engine performs no I/O of its own. `append` and `send` are
//! fire-and-forget intents; their completions come back through
//! [`Raft::append_done`](crate::Raft::append_done) and
//! [`Raft::send_done`](crate::Raft::send_done), delivered from the same
//! logical thread as every other engine operation.

use crate::config::{Configuration, ServerId};
use crate::raft_log::Entry;
use crate::rpc::Message;
use thiserror::Error;

/// Durable state handed back by [`Io::load`] at startup.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub term: u64,
    pub voted_for: Option<ServerId>,
    /// Absolute index of the first stored entry. Anything below it was
    /// compacted into a snapshot.
    pub start_index: u64,
    /// Term of the entry preceding `start_index`; zero unless a snapshot was
    /// taken.
    pub snapshot_last_term: u64,
    pub entries: Vec<Entry>,
}

/// Storage and transport capability.
pub trait Io {
    fn start(&mut self, id: ServerId, address: &str, heartbeat_ms: u64) -> Result<(), IoError>;

    fn load(&mut self) -> Result<PersistedState, IoError>;

    /// Persists an initial configuration entry at index 1. Fails with
    /// [`IoError::AlreadyBootstrapped`] when the store holds state.
    fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), IoError>;

    /// Durable before return.
    fn set_term(&mut self, term: u64) -> Result<(), IoError>;

    /// Durable before return.
    fn set_vote(&mut self, vote: Option<ServerId>) -> Result<(), IoError>;

    /// Asynchronous append; completion arrives through `Raft::append_done`
    /// once the entries are fsynced.
    fn append(&mut self, entries: &[Entry]) -> Result<(), IoError>;

    /// Asynchronous send; completion arrives through `Raft::send_done`.
    fn send(&mut self, to: ServerId, address: &str, message: &Message) -> Result<(), IoError>;

    fn stop(&mut self) -> Result<(), IoError>;
}

/// Application state machine fed with committed entries, in strictly
/// increasing index order.
pub trait Fsm {
    /// The engine advances its applied index only after this returns `Ok`.
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<(), FsmError>;

    fn snapshot(&mut self) -> Result<Vec<u8>, FsmError>;

    fn restore(&mut self, data: &[u8]) -> Result<(), FsmError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("storage is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("storage holds no bootstrap configuration")]
    NotBootstrapped,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("state machine failure: {0}")]
pub struct FsmError(pub String);
