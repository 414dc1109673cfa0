//! Single-server membership changes and the catch-up rounds that gate the
//! promotion of a non-voter.

use crate::config::{ConfigError, Configuration, ServerId};
use crate::error::RaftError;
use crate::io::{Fsm, Io};
use crate::raft_log::{EntryBuf, EntryKind};
use crate::progress::Progress;
use crate::raft::Raft;
use crate::state::{Promotion, RoleState};
use log::{info, warn};

/// Ceiling on the total time a promotion may spend catching up before the
/// server is treated as unresponsive.
pub(crate) const MAX_CATCH_UP_MS: u64 = 30_000;

/// Number of catch-up rounds granted to a non-voter before promotion is
/// decided one way or the other.
pub(crate) const MAX_CATCH_UP_ROUNDS: u8 = 10;

enum RoundOutcome {
    None,
    NextRound,
    Promote(ServerId),
    Abort(ServerId),
}

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Adds `id` as a non-voting server. One membership change at a time.
    pub fn add_server(
        &mut self,
        id: impl Into<ServerId>,
        address: impl Into<String>,
    ) -> Result<(), RaftError> {
        self.check_available()?;
        self.check_leader_for_change()?;
        let id = id.into();
        let mut configuration = self.configuration.clone();
        configuration.add(id, address, false)?;
        info!(
            "event=membership_add id={} server={} term={}",
            self.id, id, self.current_term
        );
        self.append_configuration(configuration)?;
        self.replication_trigger()
    }

    /// Starts promoting the non-voter `id` to voter. When the server is
    /// already caught up the configuration entry is appended immediately;
    /// otherwise up to [`MAX_CATCH_UP_ROUNDS`] catch-up rounds run first.
    pub fn promote(&mut self, id: impl Into<ServerId>) -> Result<(), RaftError> {
        self.check_available()?;
        self.check_leader_for_change()?;
        let id = id.into();
        let server = self
            .configuration
            .get(id)
            .ok_or(ConfigError::UnknownId { id })?;
        if server.voting() {
            return Err(RaftError::BadState);
        }
        let caught_up = self
            .leader_state()
            .and_then(|leader| leader.progress.get(&id))
            .map(|progress| progress.match_index >= self.log.last_index())
            .unwrap_or(false);
        if caught_up {
            let mut configuration = self.configuration.clone();
            configuration.promote(id)?;
            info!(
                "event=membership_promote id={} server={} term={} caught_up=true",
                self.id, id, self.current_term
            );
            self.append_configuration(configuration)?;
            return self.replication_trigger();
        }

        let round_index = self.log.last_index();
        info!(
            "event=promotion_start id={} server={} round=1 round_index={}",
            self.id, id, round_index
        );
        if let Some(leader) = self.leader_state_mut() {
            leader.promotion = Some(Promotion::new(id, round_index));
        }
        self.replication_send(id)
    }

    /// Removes `id` from the configuration. A leader that removes itself
    /// keeps leading until the removal entry commits, then steps down.
    pub fn remove_server(&mut self, id: impl Into<ServerId>) -> Result<(), RaftError> {
        self.check_available()?;
        self.check_leader_for_change()?;
        let id = id.into();
        let mut configuration = self.configuration.clone();
        configuration.remove(id)?;
        info!(
            "event=membership_remove id={} server={} term={}",
            self.id, id, self.current_term
        );
        self.append_configuration(configuration)?;
        self.replication_trigger()
    }

    fn check_leader_for_change(&self) -> Result<(), RaftError> {
        let leader = self.leader_state().ok_or(RaftError::NotLeader)?;
        if self.pending_configuration_index != 0 || leader.promotion.is_some() {
            return Err(RaftError::ConfigBusy);
        }
        Ok(())
    }

    /// Appends a configuration entry, activates it immediately and submits
    /// the durable write. Returns the entry's index.
    pub(crate) fn append_configuration(
        &mut self,
        configuration: Configuration,
    ) -> Result<u64, RaftError> {
        let payload = EntryBuf::new(configuration.encode());
        let index = self
            .log
            .append(self.current_term, EntryKind::Configuration, payload);
        self.activate_configuration(index, configuration);
        let entry = self.log.get(index)?.clone();
        self.submit_leader_write(vec![entry])?;
        Ok(index)
    }

    /// Makes `configuration` the active one as of `index`. Configuration
    /// entries take effect when appended, not when committed; the entry stays
    /// accounted as in flight until commit. A leader also reconciles its
    /// progress map with the new membership.
    pub(crate) fn activate_configuration(&mut self, index: u64, configuration: Configuration) {
        info!(
            "event=configuration_activate id={} index={} servers={} voters={}",
            self.id,
            index,
            configuration.len(),
            configuration.n_voting()
        );
        self.configuration = configuration;
        self.configuration_index = index;
        self.pending_configuration_index = index;

        let member_ids: Vec<ServerId> = self
            .configuration
            .servers()
            .iter()
            .map(|server| server.id())
            .collect();
        let self_id = self.id;
        let next_index = self.log.last_index() + 1;
        if let Some(leader) = self.leader_state_mut() {
            leader.progress.retain(|id, _| member_ids.contains(id));
            for id in member_ids {
                if id != self_id && !leader.progress.contains_key(&id) {
                    leader.progress.insert(id, Progress::new(next_index));
                }
            }
        }
    }

    /// A configuration entry reached the commit index: the change is no
    /// longer in flight, and a leader that removed itself steps down.
    pub(crate) fn configuration_committed(&mut self, index: u64) -> Result<(), RaftError> {
        if self.pending_configuration_index == index {
            self.pending_configuration_index = 0;
        }
        info!(
            "event=configuration_commit id={} index={}",
            self.id, index
        );
        // The step-down rule applies when the entry that removed this leader
        // is the one reaching the commit index, not when an older
        // configuration entry commits underneath a newer change.
        if index == self.configuration_index
            && matches!(self.role, RoleState::Leader(_))
            && !self.configuration.contains(self.id)
        {
            info!(
                "event=leader_removed id={} term={} index={}",
                self.id, self.current_term, index
            );
            self.convert_to_follower(self.current_term, None)?;
        }
        Ok(())
    }

    /// Truncates the suffix from `index` and rolls the configuration back to
    /// the closest surviving one when a configuration entry was dropped.
    pub(crate) fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        let dropped = self.log.truncate_suffix(index)?;
        if self.pending_configuration_index >= index {
            self.pending_configuration_index = 0;
        }
        let dropped_configuration = dropped
            .iter()
            .any(|entry| entry.kind == EntryKind::Configuration);
        if dropped_configuration && self.configuration_index >= index {
            let restored = match self.log.newest_configuration_at_or_below(self.log.last_index())
            {
                Some(entry) => Some((
                    entry.index,
                    Configuration::decode(entry.payload.as_slice())?,
                )),
                None => self.snapshot_configuration.clone(),
            };
            match restored {
                Some((configuration_index, configuration)) => {
                    warn!(
                        "event=configuration_rollback id={} from_index={} to_index={}",
                        self.id, self.configuration_index, configuration_index
                    );
                    self.configuration = configuration;
                    self.configuration_index = configuration_index;
                }
                None => warn!(
                    "event=configuration_rollback_missing id={} truncate_index={}",
                    self.id, index
                ),
            }
        }
        Ok(())
    }

    /// Round bookkeeping, run after a successful acknowledgement from the
    /// promotee. A round that completed within one election timeout finishes
    /// the promotion; a slow round either starts the next one or, at the
    /// last round, aborts.
    pub(crate) fn membership_update_round(&mut self, from: ServerId) -> Result<(), RaftError> {
        let election_timeout = self.options.election_timeout_ms;
        let last_index = self.log.last_index();
        let outcome = {
            let leader = match self.leader_state_mut() {
                Some(leader) => leader,
                None => return Ok(()),
            };
            let match_index = leader
                .progress
                .get(&from)
                .map(|progress| progress.match_index)
                .unwrap_or(0);
            match &mut leader.promotion {
                Some(promotion)
                    if promotion.id == from && match_index >= promotion.round_index =>
                {
                    if promotion.round_duration_ms <= election_timeout {
                        RoundOutcome::Promote(from)
                    } else if promotion.round_number >= MAX_CATCH_UP_ROUNDS {
                        RoundOutcome::Abort(from)
                    } else {
                        promotion.round_number += 1;
                        promotion.round_index = last_index;
                        promotion.round_duration_ms = 0;
                        RoundOutcome::NextRound
                    }
                }
                _ => RoundOutcome::None,
            }
        };
        match outcome {
            RoundOutcome::None => Ok(()),
            RoundOutcome::NextRound => {
                if let Some(promotion) =
                    self.leader_state().and_then(|leader| leader.promotion.as_ref())
                {
                    info!(
                        "event=promotion_round id={} server={} round={} round_index={}",
                        self.id, promotion.id, promotion.round_number, promotion.round_index
                    );
                }
                Ok(())
            }
            RoundOutcome::Promote(id) => {
                if let Some(leader) = self.leader_state_mut() {
                    leader.promotion = None;
                }
                let mut configuration = self.configuration.clone();
                configuration.promote(id)?;
                info!(
                    "event=membership_promote id={} server={} term={} caught_up=true",
                    self.id, id, self.current_term
                );
                self.append_configuration(configuration)?;
                self.replication_trigger()
            }
            RoundOutcome::Abort(id) => {
                self.abort_promotion(id);
                Ok(())
            }
        }
    }

    pub(crate) fn abort_promotion(&mut self, id: ServerId) {
        warn!(
            "event=promotion_aborted id={} server={} term={}",
            self.id, id, self.current_term
        );
        if let Some(leader) = self.leader_state_mut() {
            leader.promotion = None;
        }
        for watch in &mut self.watchers {
            watch.promotion_aborted(id);
        }
    }
}
