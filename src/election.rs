//! Leader election: candidacy, vote granting and vote tallying.

use crate::config::{ConfigError, ServerId};
use crate::error::RaftError;
use crate::io::{Fsm, Io};
use crate::raft::Raft;
use crate::rpc::{Message, RequestVote, RequestVoteResult};
use crate::state::{CandidateState, RoleState};
use log::{debug, info};
use rand::Rng;
use std::collections::HashSet;

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Restarts the election timer with a fresh timeout drawn uniformly from
    /// `[election_timeout, 2 * election_timeout)`.
    pub(crate) fn reset_election_timer(&mut self) {
        self.timer_ms = 0;
        let base = self.options.election_timeout_ms;
        self.election_timeout_rand_ms = self.rng.gen_range(base..base * 2);
    }

    /// Enters (or renews) candidacy: bumps the term, votes for itself and
    /// asks every other voter for their vote. Both persisted writes land
    /// before any request goes out.
    pub(crate) fn election_start(&mut self) -> Result<(), RaftError> {
        let term = self.current_term + 1;
        self.io.set_term(term)?;
        self.current_term = term;
        self.io.set_vote(Some(self.id))?;
        self.voted_for = Some(self.id);
        self.reset_election_timer();

        let mut votes_granted = HashSet::new();
        votes_granted.insert(self.id);
        self.set_role(RoleState::Candidate(CandidateState { votes_granted }));
        info!(
            "event=election_start id={} term={} last_log_index={} last_log_term={}",
            self.id,
            term,
            self.log.last_index(),
            self.log.last_term()
        );

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        let peers: Vec<(ServerId, String)> = self
            .configuration
            .voters()
            .filter(|server| server.id() != self.id)
            .map(|server| (server.id(), server.address().to_string()))
            .collect();
        for (id, address) in peers {
            self.send_message(id, &address, Message::RequestVote(request.clone()));
        }
        self.maybe_win_election()
    }

    fn maybe_win_election(&mut self) -> Result<(), RaftError> {
        let quorum = self.configuration.quorum();
        let won = matches!(
            &self.role,
            RoleState::Candidate(candidate) if candidate.votes_granted.len() >= quorum
        );
        if won {
            self.convert_to_leader()
        } else {
            Ok(())
        }
    }

    pub(crate) fn recv_request_vote(
        &mut self,
        from: ServerId,
        address: &str,
        request: RequestVote,
    ) -> Result<(), RaftError> {
        if request.term < self.current_term {
            debug!(
                "event=vote_rejected id={} candidate={} reason=stale_term observed={} current={}",
                self.id, request.candidate_id, request.term, self.current_term
            );
            let result = RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
            self.send_message(from, address, Message::RequestVoteResult(result));
            return Ok(());
        }
        if request.term > self.current_term {
            self.convert_to_follower(request.term, None)?;
        }

        // Grant iff unvoted this term (or repeating the same vote) and the
        // candidate's log is at least as up to date as ours.
        let log_up_to_date = request.last_log_term > self.log.last_term()
            || (request.last_log_term == self.log.last_term()
                && request.last_log_index >= self.log.last_index());
        let unvoted =
            self.voted_for.is_none() || self.voted_for == Some(request.candidate_id);
        let vote_granted = unvoted && log_up_to_date;
        if vote_granted {
            // The vote must be durable before the reply leaves the server.
            self.io.set_vote(Some(request.candidate_id))?;
            self.voted_for = Some(request.candidate_id);
            self.reset_election_timer();
        }
        info!(
            "event=vote id={} candidate={} term={} granted={}",
            self.id, request.candidate_id, self.current_term, vote_granted
        );
        let result = RequestVoteResult {
            term: self.current_term,
            vote_granted,
        };
        self.send_message(from, address, Message::RequestVoteResult(result));
        Ok(())
    }

    pub(crate) fn recv_request_vote_result(
        &mut self,
        from: ServerId,
        result: RequestVoteResult,
    ) -> Result<(), RaftError> {
        if result.term > self.current_term {
            info!(
                "event=step_down id={} reason=vote_result_term observed={} current={}",
                self.id, result.term, self.current_term
            );
            return self.convert_to_follower(result.term, None);
        }
        if result.term < self.current_term {
            debug!(
                "event=vote_result_ignored id={} from={} reason=stale_term",
                self.id, from
            );
            return Ok(());
        }
        if !self.configuration.is_voter(from) {
            debug!(
                "event=vote_result_ignored id={} from={} reason=not_a_voter",
                self.id, from
            );
            return Ok(());
        }
        match &mut self.role {
            RoleState::Candidate(candidate) if result.vote_granted => {
                candidate.votes_granted.insert(from);
            }
            _ => {
                debug!(
                    "event=vote_result_ignored id={} from={} granted={}",
                    self.id, from, result.vote_granted
                );
                return Ok(());
            }
        }
        self.maybe_win_election()
    }

    /// Hands leadership to `to`: new commands are refused, the target is
    /// brought fully up to date, and once its match index reaches the end of
    /// the log this server steps down so the target's election can succeed.
    pub fn transfer_leadership(&mut self, to: impl Into<ServerId>) -> Result<(), RaftError> {
        self.check_available()?;
        let to = to.into();
        if self.leader_state().is_none() {
            return Err(RaftError::NotLeader);
        }
        if to == self.id {
            return Err(RaftError::BadState);
        }
        if !self.configuration.contains(to) {
            return Err(RaftError::Config(ConfigError::UnknownId { id: to }));
        }
        if !self.configuration.is_voter(to) {
            return Err(RaftError::BadState);
        }
        info!(
            "event=transfer_leadership id={} target={} term={}",
            self.id, to, self.current_term
        );
        if let Some(leader) = self.leader_state_mut() {
            leader.transfer_to = Some(to);
        }
        self.replication_send(to)?;
        self.maybe_finish_transfer()
    }

    /// Steps down once the transfer target holds the whole log.
    pub(crate) fn maybe_finish_transfer(&mut self) -> Result<(), RaftError> {
        let last_index = self.log.last_index();
        let mut ready = None;
        let mut orphaned = false;
        if let Some(leader) = self.leader_state() {
            if let Some(target) = leader.transfer_to {
                match leader.progress.get(&target) {
                    Some(progress) if progress.match_index >= last_index => ready = Some(target),
                    Some(_) => {}
                    None => orphaned = true,
                }
            }
        }
        if orphaned {
            // Target left the configuration; give up on the transfer.
            if let Some(leader) = self.leader_state_mut() {
                leader.transfer_to = None;
            }
            return Ok(());
        }
        if let Some(target) = ready {
            info!(
                "event=transfer_leadership_step_down id={} target={} term={}",
                self.id, target, self.current_term
            );
            self.convert_to_follower(self.current_term, None)?;
        }
        Ok(())
    }
}
