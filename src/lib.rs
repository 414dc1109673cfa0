//! Deterministic, I/O-agnostic Raft consensus engine.
//!
//! The engine keeps a replicated log strongly consistent across a
//! reconfigurable set of servers. It performs no I/O, spawns no threads and
//! reads no clock: external collaborators deliver events through
//! [`Raft::tick`], [`Raft::recv`], [`Raft::append_done`] and
//! [`Raft::send_done`], and the engine emits its side effects through the
//! injected [`Io`] capability and the [`Fsm`] apply callback. That inversion
//! makes every run reproducible from a seed and an event sequence.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod error;
pub mod io;
pub mod raft_log;
pub mod progress;
pub mod rpc;
pub mod watch;

mod election;
mod membership;
mod raft;
mod replication;
mod state;
mod tick;

pub use config::{ConfigError, Configuration, Server, ServerId};
pub use error::RaftError;
pub use io::{Fsm, FsmError, Io, IoError, PersistedState};
pub use raft_log::{Entry, EntryBuf, EntryKind, Log, LogError, TermOf};
pub use progress::{Progress, ProgressMode};
pub use raft::{Raft, RaftOptions, RaftStatus};
pub use rpc::{
    AppendEntries, AppendEntriesResult, FrameError, InstallSnapshot, Message, RequestVote,
    RequestVoteResult,
};
pub use state::RoleKind;
pub use watch::Watch;
