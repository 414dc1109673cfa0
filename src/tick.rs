//! Time-driven rules: election timeouts, heartbeats and the promotion round
//! clock. The driver reports elapsed milliseconds; the engine never reads a
//! clock itself.

use crate::error::RaftError;
use crate::io::{Fsm, Io};
use crate::membership::{MAX_CATCH_UP_MS, MAX_CATCH_UP_ROUNDS};
use crate::raft::Raft;
use crate::state::{RoleKind, RoleState};
use log::info;

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Advances the engine's notion of time by `msec_since_last_tick`.
    pub fn tick(&mut self, msec_since_last_tick: u64) -> Result<(), RaftError> {
        if self.shutdown {
            return Err(RaftError::Shutdown);
        }
        if matches!(self.role, RoleState::Unavailable) {
            return Ok(());
        }
        self.timer_ms += msec_since_last_tick;
        match self.role.kind() {
            RoleKind::Follower => self.tick_follower(),
            RoleKind::Candidate => self.tick_candidate(),
            RoleKind::Leader => self.tick_leader(msec_since_last_tick),
            RoleKind::Unavailable => Ok(()),
        }
    }

    fn tick_follower(&mut self) -> Result<(), RaftError> {
        // Not configured (yet, or anymore) or configured as a non-voter: wait
        // for RPCs.
        if !self.configuration.is_voter(self.id) {
            return Ok(());
        }
        if self.configuration.n_voting() == 1 {
            info!("event=self_elect id={} term={}", self.id, self.current_term);
            return self.election_start();
        }
        if self.timer_ms > self.election_timeout_rand_ms {
            info!(
                "event=election_timeout id={} term={} elapsed_ms={}",
                self.id, self.current_term, self.timer_ms
            );
            return self.election_start();
        }
        Ok(())
    }

    fn tick_candidate(&mut self) -> Result<(), RaftError> {
        // A split or lost election resolves here: a fresh term, a fresh
        // randomized timeout.
        if self.timer_ms > self.election_timeout_rand_ms {
            info!(
                "event=election_retry id={} term={} elapsed_ms={}",
                self.id, self.current_term, self.timer_ms
            );
            return self.election_start();
        }
        Ok(())
    }

    fn tick_leader(&mut self, msec_since_last_tick: u64) -> Result<(), RaftError> {
        // Entries deferred by a refusing FSM get another chance here.
        if self.last_applied < self.commit_index {
            self.apply_committed()?;
        }

        if self.timer_ms > self.options.heartbeat_ms {
            self.replication_heartbeat()?;
            self.timer_ms = 0;
        }

        // Promotion round clock: the last round aborts once it outlives an
        // election timeout, and the whole catch-up aborts at the hard
        // ceiling.
        let election_timeout = self.options.election_timeout_ms;
        let aborted = match self.leader_state_mut() {
            Some(leader) => match &mut leader.promotion {
                Some(promotion) => {
                    promotion.round_duration_ms += msec_since_last_tick;
                    promotion.total_duration_ms += msec_since_last_tick;
                    let too_slow = promotion.round_number >= MAX_CATCH_UP_ROUNDS
                        && promotion.round_duration_ms > election_timeout;
                    let unresponsive = promotion.total_duration_ms > MAX_CATCH_UP_MS;
                    if too_slow || unresponsive {
                        Some(promotion.id)
                    } else {
                        None
                    }
                }
                None => None,
            },
            None => None,
        };
        if let Some(id) = aborted {
            self.abort_promotion(id);
        }
        Ok(())
    }
}
