use crate::config::ConfigError;
use crate::io::{FsmError, IoError};
use crate::raft_log::LogError;
use thiserror::Error;

/// Errors surfaced by the public engine operations.
///
/// Stale messages and out-of-order replies are absorbed internally and never
/// reach this surface. Everything that does reach it either describes a
/// rejected request (`NotLeader`, `ConfigBusy`, configuration edits) or a
/// condition the caller must react to (`Shutdown`, `Io`).
#[derive(Debug, Error)]
pub enum RaftError {
    /// The engine detected corrupted state (a conflict at or below the commit
    /// index) and went unavailable. Every subsequent operation returns this
    /// error; only a restart with repaired storage recovers.
    #[error("engine is shut down after detecting corrupted state")]
    Shutdown,

    #[error(transparent)]
    Io(#[from] IoError),

    #[error("this server is not the leader")]
    NotLeader,

    #[error("leadership was lost before the request completed")]
    LeadershipLost,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error("operation is not valid in the current role")]
    BadState,

    #[error("a configuration change is already in flight")]
    ConfigBusy,

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl RaftError {
    /// Stable numeric code for transports and FFI surfaces. `0` is reserved
    /// for success.
    pub fn code(&self) -> u8 {
        match self {
            RaftError::Shutdown => 1,
            RaftError::Io(_) => 2,
            RaftError::NotLeader => 3,
            RaftError::LeadershipLost => 4,
            RaftError::Config(ConfigError::DuplicateId { .. }) => 5,
            RaftError::Config(ConfigError::UnknownId { .. }) => 6,
            RaftError::Config(_) | RaftError::Log(_) | RaftError::BadState => 7,
            RaftError::ConfigBusy => 8,
            RaftError::Fsm(_) | RaftError::Internal(_) => 9,
        }
    }
}
