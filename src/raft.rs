//! The engine façade: lifecycle, client requests, event delivery and I/O
//! completion handling.

use crate::config::{Configuration, ServerId};
use crate::error::RaftError;
use crate::io::{Fsm, Io, IoError};
use crate::raft_log::{Entry, EntryBuf, EntryKind, Log};
use crate::rpc::{AppendEntriesResult, Message};
use crate::state::{FollowerState, RoleKind, RoleState};
use crate::watch::Watch;
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use std::collections::VecDeque;

/// Engine tuning knobs.
///
/// The election timeout is the base of the randomized window
/// `[election_timeout, 2 * election_timeout)` drawn on every timer reset.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub election_timeout_ms: u64,
    pub heartbeat_ms: u64,
    /// Upper bound on entries per AppendEntries request in pipeline mode.
    pub max_batch: usize,
    /// Seed for the timeout RNG; fixed seeds give deterministic schedules.
    pub rng_seed: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_ms: 150,
            heartbeat_ms: 50,
            max_batch: 32,
            rng_seed: 0,
        }
    }
}

/// Read-only snapshot of the engine's externally observable facts.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub id: ServerId,
    pub role: RoleKind,
    pub current_term: u64,
    pub voted_for: Option<ServerId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<ServerId>,
    pub configuration: Configuration,
}

/// A log write handed to storage whose fsync completion is still pending.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub(crate) entries: Vec<Entry>,
    pub(crate) last_index: u64,
    pub(crate) attempts: u8,
    pub(crate) origin: WriteOrigin,
}

#[derive(Debug)]
pub(crate) enum WriteOrigin {
    Leader,
    Follower {
        leader_id: ServerId,
        address: String,
        leader_commit: u64,
    },
}

/// Deterministic, I/O-agnostic Raft engine.
///
/// The engine is driven entirely by event delivery: [`tick`](Raft::tick) for
/// elapsed time, [`recv`](Raft::recv) for incoming messages and
/// [`append_done`](Raft::append_done) / [`send_done`](Raft::send_done) for
/// I/O completions. All four must be called from one logical thread. In
/// return the engine never blocks, spawns nothing and emits its side effects
/// exclusively through the injected [`Io`] capability.
pub struct Raft<I: Io, F: Fsm> {
    pub(crate) io: I,
    pub(crate) fsm: F,
    pub(crate) id: ServerId,
    pub(crate) address: String,
    pub(crate) options: RaftOptions,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<ServerId>,
    pub(crate) log: Log,

    pub(crate) configuration: Configuration,
    /// Index of the entry that produced the active configuration; zero until
    /// one is known.
    pub(crate) configuration_index: u64,
    /// Index of an appended but uncommitted configuration entry; zero when no
    /// change is in flight.
    pub(crate) pending_configuration_index: u64,
    /// Configuration carried by the last installed snapshot, kept for
    /// rollback when the whole uncompacted log is truncated.
    pub(crate) snapshot_configuration: Option<(u64, Configuration)>,

    pub(crate) role: RoleState,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,

    pub(crate) timer_ms: u64,
    pub(crate) election_timeout_rand_ms: u64,
    pub(crate) rng: ChaCha20Rng,

    pub(crate) watchers: Vec<Box<dyn Watch>>,
    pub(crate) shutdown: bool,
    pub(crate) pending_writes: VecDeque<PendingWrite>,
}

impl<I: Io, F: Fsm> Raft<I, F> {
    pub fn new(
        id: impl Into<ServerId>,
        address: impl Into<String>,
        io: I,
        fsm: F,
        options: RaftOptions,
    ) -> Self {
        let id = id.into();
        assert!(id.get() != 0, "server id must be non-zero");
        assert!(options.election_timeout_ms > 0);
        assert!(options.heartbeat_ms > 0);
        assert!(options.max_batch > 0);
        let rng = ChaCha20Rng::seed_from_u64(options.rng_seed);
        Self {
            io,
            fsm,
            id,
            address: address.into(),
            options,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            configuration: Configuration::new(),
            configuration_index: 0,
            pending_configuration_index: 0,
            snapshot_configuration: None,
            role: RoleState::Unavailable,
            commit_index: 0,
            last_applied: 0,
            timer_ms: 0,
            election_timeout_rand_ms: 0,
            rng,
            watchers: Vec::new(),
            shutdown: false,
            pending_writes: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn io(&self) -> &I {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut I {
        &mut self.io
    }

    pub fn fsm(&self) -> &F {
        &self.fsm
    }

    pub fn fsm_mut(&mut self) -> &mut F {
        &mut self.fsm
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn watch(&mut self, watch: Box<dyn Watch>) {
        self.watchers.push(watch);
    }

    /// Persists an initial configuration through storage. Valid only before
    /// [`start`](Raft::start); the entry lands at index 1 and is read back by
    /// `load`.
    pub fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), RaftError> {
        if self.shutdown {
            return Err(RaftError::Shutdown);
        }
        if !matches!(self.role, RoleState::Unavailable) {
            return Err(RaftError::BadState);
        }
        if configuration.n_voting() == 0 {
            return Err(RaftError::BadState);
        }
        self.io.bootstrap(configuration)?;
        Ok(())
    }

    /// Loads durable state and enters follower with a fresh randomized
    /// election timeout.
    pub fn start(&mut self) -> Result<(), RaftError> {
        if self.shutdown {
            return Err(RaftError::Shutdown);
        }
        if !matches!(self.role, RoleState::Unavailable) {
            return Err(RaftError::BadState);
        }
        self.io
            .start(self.id, &self.address, self.options.heartbeat_ms)?;
        let state = self.io.load()?;
        self.current_term = state.term;
        self.voted_for = state.voted_for;
        let start_index = state.start_index.max(1);
        self.log.reset(start_index - 1, state.snapshot_last_term);
        self.log.append_batch(state.entries)?;
        self.commit_index = self.log.snapshot_last_index();
        self.last_applied = self.log.snapshot_last_index();

        // The active configuration is whatever the newest stored
        // configuration entry says, committed or not.
        let restored = match self.log.newest_configuration_at_or_below(self.log.last_index()) {
            Some(entry) => Some((entry.index, Configuration::decode(entry.payload.as_slice())?)),
            None => None,
        };
        if let Some((index, configuration)) = restored {
            self.configuration = configuration;
            self.configuration_index = index;
        }

        info!(
            "event=start id={} term={} last_log_index={} servers={}",
            self.id,
            self.current_term,
            self.log.last_index(),
            self.configuration.len()
        );
        self.set_role(RoleState::Follower(FollowerState::default()));
        self.reset_election_timer();
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), RaftError> {
        if matches!(self.role, RoleState::Unavailable) {
            return Ok(());
        }
        self.io.stop()?;
        self.pending_writes.clear();
        info!("event=stop id={} term={}", self.id, self.current_term);
        self.set_role(RoleState::Unavailable);
        Ok(())
    }

    /// Accepts a client command for replication. Leader only; returns the
    /// index assigned to the entry.
    pub fn accept(&mut self, command: Vec<u8>) -> Result<u64, RaftError> {
        self.check_available()?;
        match &self.role {
            RoleState::Leader(leader) if leader.transfer_to.is_some() => {
                return Err(RaftError::LeadershipLost);
            }
            RoleState::Leader(_) => {}
            _ => return Err(RaftError::NotLeader),
        }
        let index = self
            .log
            .append(self.current_term, EntryKind::Command, EntryBuf::new(command));
        let entry = self.log.get(index)?.clone();
        debug!(
            "event=accept id={} term={} index={} len={}",
            self.id,
            self.current_term,
            index,
            entry.payload.len()
        );
        self.submit_leader_write(vec![entry])?;
        self.replication_trigger()?;
        Ok(index)
    }

    /// Delivers a message received from `from` at `address`.
    pub fn recv(
        &mut self,
        from: ServerId,
        address: &str,
        message: Message,
    ) -> Result<(), RaftError> {
        self.check_available()?;
        match message {
            Message::RequestVote(request) => self.recv_request_vote(from, address, request),
            Message::RequestVoteResult(result) => self.recv_request_vote_result(from, result),
            Message::AppendEntries(request) => self.recv_append_entries(from, address, request),
            Message::AppendEntriesResult(result) => self.recv_append_entries_result(from, result),
            Message::InstallSnapshot(request) => self.recv_install_snapshot(from, address, request),
        }
    }

    /// Completion of the oldest outstanding storage append.
    ///
    /// On success the write becomes visible for quorum counting (leader) or
    /// is acknowledged back to the leader (follower). A failed write is
    /// retried once, then surfaced.
    pub fn append_done(&mut self, status: Result<(), IoError>) -> Result<(), RaftError> {
        self.check_available()?;
        let mut pending = self.pending_writes.pop_front().ok_or(RaftError::Internal(
            "append completion without a pending write",
        ))?;
        match status {
            Err(err) if pending.attempts == 0 => {
                warn!(
                    "event=append_retry id={} last_index={} error={}",
                    self.id, pending.last_index, err
                );
                pending.attempts = 1;
                self.io.append(&pending.entries)?;
                self.pending_writes.push_front(pending);
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=append_failed id={} last_index={} error={}",
                    self.id, pending.last_index, err
                );
                Err(RaftError::Io(err))
            }
            Ok(()) => match pending.origin {
                WriteOrigin::Leader => {
                    if let Some(leader) = self.leader_state_mut() {
                        leader.last_stored = leader.last_stored.max(pending.last_index);
                    }
                    self.leader_maybe_commit()
                }
                WriteOrigin::Follower {
                    leader_id,
                    address,
                    leader_commit,
                } => {
                    let last_new = pending.last_index;
                    // A newer leader may have replaced the suffix while the
                    // write was in flight; acknowledge only what survived.
                    if self.log.last_index() >= last_new {
                        self.update_commit(leader_commit.min(last_new))?;
                        let result = AppendEntriesResult {
                            term: self.current_term,
                            success: true,
                            last_log_index: last_new,
                        };
                        self.send_message(
                            leader_id,
                            &address,
                            Message::AppendEntriesResult(result),
                        );
                    }
                    Ok(())
                }
            },
        }
    }

    /// Completion of an asynchronous send to `to`. A failure demotes the
    /// peer back to probing; nothing is retried eagerly.
    pub fn send_done(
        &mut self,
        to: ServerId,
        status: Result<(), IoError>,
    ) -> Result<(), RaftError> {
        self.check_available()?;
        if let Err(err) = status {
            warn!("event=send_failed id={} to={} error={}", self.id, to, err);
            if let Some(leader) = self.leader_state_mut() {
                if let Some(progress) = leader.progress.get_mut(&to) {
                    progress.reset_after_failure();
                }
            }
        }
        Ok(())
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.role.kind(),
            current_term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader(),
            configuration: self.configuration.clone(),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn role(&self) -> RoleKind {
        self.role.kind()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn current_leader(&self) -> Option<ServerId> {
        match &self.role {
            RoleState::Follower(follower) => follower.current_leader,
            RoleState::Leader(_) => Some(self.id),
            _ => None,
        }
    }

    pub(crate) fn check_available(&self) -> Result<(), RaftError> {
        if self.shutdown {
            return Err(RaftError::Shutdown);
        }
        if matches!(self.role, RoleState::Unavailable) {
            return Err(RaftError::BadState);
        }
        Ok(())
    }

    /// Protocol-detected corruption: go unavailable for good. Entry buffers
    /// owned by in-flight work are dropped here.
    pub(crate) fn enter_shutdown(&mut self) {
        error!(
            "event=shutdown id={} term={} commit_index={}",
            self.id, self.current_term, self.commit_index
        );
        self.shutdown = true;
        self.pending_writes.clear();
        self.set_role(RoleState::Unavailable);
    }

    pub(crate) fn submit_leader_write(&mut self, entries: Vec<Entry>) -> Result<(), RaftError> {
        let last_index = entries.last().map(|entry| entry.index).unwrap_or(0);
        self.io.append(&entries)?;
        self.pending_writes.push_back(PendingWrite {
            entries,
            last_index,
            attempts: 0,
            origin: WriteOrigin::Leader,
        });
        Ok(())
    }

    pub(crate) fn submit_follower_write(
        &mut self,
        entries: Vec<Entry>,
        leader_id: ServerId,
        address: String,
        leader_commit: u64,
    ) -> Result<(), RaftError> {
        let last_index = entries.last().map(|entry| entry.index).unwrap_or(0);
        self.io.append(&entries)?;
        self.pending_writes.push_back(PendingWrite {
            entries,
            last_index,
            attempts: 0,
            origin: WriteOrigin::Follower {
                leader_id,
                address,
                leader_commit,
            },
        });
        Ok(())
    }

    /// Fire-and-forget send; a synchronous refusal is logged and otherwise
    /// treated like any other lost message.
    pub(crate) fn send_message(&mut self, to: ServerId, address: &str, message: Message) {
        if let Err(err) = self.io.send(to, address, &message) {
            warn!(
                "event=send_rejected id={} to={} address={} error={}",
                self.id, to, address, err
            );
        }
    }
}
