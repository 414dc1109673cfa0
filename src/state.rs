//! Role state and the transitions between roles.

use crate::config::ServerId;
use crate::error::RaftError;
use crate::io::{Fsm, Io};
use crate::raft_log::{EntryBuf, EntryKind};
use crate::progress::Progress;
use crate::raft::Raft;
use log::info;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// The four roles a server moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleKind {
    Unavailable,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Unavailable => "unavailable",
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Role plus its per-role scratch state.
#[derive(Debug)]
pub(crate) enum RoleState {
    Unavailable,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl RoleState {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            RoleState::Unavailable => RoleKind::Unavailable,
            RoleState::Follower(_) => RoleKind::Follower,
            RoleState::Candidate(_) => RoleKind::Candidate,
            RoleState::Leader(_) => RoleKind::Leader,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FollowerState {
    pub(crate) current_leader: Option<ServerId>,
}

#[derive(Debug, Default)]
pub(crate) struct CandidateState {
    pub(crate) votes_granted: HashSet<ServerId>,
}

#[derive(Debug, Default)]
pub(crate) struct LeaderState {
    pub(crate) progress: HashMap<ServerId, Progress>,
    pub(crate) promotion: Option<Promotion>,
    /// Highest own log index confirmed durable; the leader's contribution to
    /// quorum counting.
    pub(crate) last_stored: u64,
    pub(crate) transfer_to: Option<ServerId>,
}

/// Catch-up bookkeeping for a non-voter being promoted.
#[derive(Debug, Clone)]
pub(crate) struct Promotion {
    pub(crate) id: ServerId,
    pub(crate) round_number: u8,
    /// The leader's last index as observed when the round started; the round
    /// completes once the promotee's match index reaches it.
    pub(crate) round_index: u64,
    pub(crate) round_duration_ms: u64,
    pub(crate) total_duration_ms: u64,
}

impl Promotion {
    pub(crate) fn new(id: ServerId, round_index: u64) -> Self {
        Self {
            id,
            round_number: 1,
            round_index,
            round_duration_ms: 0,
            total_duration_ms: 0,
        }
    }
}

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Swaps the role in place, notifying observers when the kind changes.
    pub(crate) fn set_role(&mut self, role: RoleState) {
        let old = self.role.kind();
        let new = role.kind();
        self.role = role;
        if old != new {
            info!(
                "event=role_changed id={} old={} new={} term={}",
                self.id, old, new, self.current_term
            );
            for watch in &mut self.watchers {
                watch.role_changed(old, new);
            }
        }
    }

    /// Steps down (or sideways) into follower state. A `term` above the
    /// current one is persisted first and clears the vote.
    pub(crate) fn convert_to_follower(
        &mut self,
        term: u64,
        leader: Option<ServerId>,
    ) -> Result<(), RaftError> {
        if term > self.current_term {
            self.bump_term(term)?;
        }
        self.set_role(RoleState::Follower(FollowerState {
            current_leader: leader,
        }));
        self.reset_election_timer();
        Ok(())
    }

    /// Persists and adopts a higher term, clearing the vote.
    pub(crate) fn bump_term(&mut self, term: u64) -> Result<(), RaftError> {
        debug_assert!(term > self.current_term);
        self.io.set_term(term)?;
        self.current_term = term;
        if self.voted_for.is_some() {
            self.io.set_vote(None)?;
            self.voted_for = None;
        }
        Ok(())
    }

    /// A candidate that reached quorum becomes leader: per-peer progress is
    /// reset to probing from the end of the log, a no-op entry is appended in
    /// the new term and replication starts immediately.
    pub(crate) fn convert_to_leader(&mut self) -> Result<(), RaftError> {
        debug_assert!(matches!(self.role, RoleState::Candidate(_)));
        let next_index = self.log.last_index() + 1;
        let mut progress = HashMap::new();
        for server in self.configuration.servers() {
            if server.id() != self.id {
                progress.insert(server.id(), Progress::new(next_index));
            }
        }
        self.set_role(RoleState::Leader(LeaderState {
            progress,
            promotion: None,
            last_stored: self.log.last_index(),
            transfer_to: None,
        }));
        self.timer_ms = 0;

        info!(
            "event=become_leader id={} term={} last_log_index={}",
            self.id,
            self.current_term,
            self.log.last_index()
        );

        // The no-op barrier makes prior-term entries committable.
        let index = self
            .log
            .append(self.current_term, EntryKind::Command, EntryBuf::empty());
        let entry = self.log.get(index)?.clone();
        self.submit_leader_write(vec![entry])?;
        self.replication_trigger()
    }

    /// Leader scratch state, when leading.
    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match &mut self.role {
            RoleState::Leader(leader) => Some(leader),
            _ => None,
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderState> {
        match &self.role {
            RoleState::Leader(leader) => Some(leader),
            _ => None,
        }
    }
}
