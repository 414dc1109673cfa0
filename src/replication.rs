//! Log replication: AppendEntries on both sides, commit-index advancement,
//! apply dispatch and the snapshot fallback for peers whose needed prefix
//! was compacted.

use crate::config::{Configuration, ServerId};
use crate::error::RaftError;
use crate::io::{Fsm, Io};
use crate::raft_log::{EntryKind, TermOf};
use crate::progress::ProgressMode;
use crate::raft::Raft;
use crate::rpc::{AppendEntries, AppendEntriesResult, InstallSnapshot, Message};
use crate::state::RoleState;
use log::{debug, info, warn};

enum ReplyAction {
    /// Out-of-order or otherwise unmatchable reply.
    Ignore,
    /// Progress moved backwards or a snapshot finished; push the next request.
    Resend,
    /// A request was acknowledged; commit counting and follow-up work apply.
    Acked,
}

impl<I: Io, F: Fsm> Raft<I, F> {
    /// Sends the next AppendEntries (or InstallSnapshot) to every peer.
    pub(crate) fn replication_trigger(&mut self) -> Result<(), RaftError> {
        let peers: Vec<ServerId> = match self.leader_state() {
            Some(leader) => leader.progress.keys().copied().collect(),
            None => return Ok(()),
        };
        for to in peers {
            self.replication_send(to)?;
        }
        Ok(())
    }

    /// Heartbeat-driven trigger. A probe request still outstanding after a
    /// full heartbeat interval counts as lost and is retransmitted.
    pub(crate) fn replication_heartbeat(&mut self) -> Result<(), RaftError> {
        let peers: Vec<ServerId> = match self.leader_state() {
            Some(leader) => leader.progress.keys().copied().collect(),
            None => return Ok(()),
        };
        for to in peers {
            if let Some(leader) = self.leader_state_mut() {
                if let Some(progress) = leader.progress.get_mut(&to) {
                    if progress.mode == ProgressMode::Probe && progress.inflight_len() > 0 {
                        progress.retransmit();
                    }
                }
            }
            self.replication_send(to)?;
        }
        Ok(())
    }

    /// Builds and sends one request for `to`, honoring its progress mode.
    /// Probing sends a single entry; pipeline batches up to `max_batch`.
    pub(crate) fn replication_send(&mut self, to: ServerId) -> Result<(), RaftError> {
        let address = match self.configuration.get(to) {
            Some(server) => server.address().to_string(),
            None => return Ok(()),
        };
        let (next_index, probing) = {
            let leader = match self.leader_state_mut() {
                Some(leader) => leader,
                None => return Ok(()),
            };
            let progress = match leader.progress.get_mut(&to) {
                Some(progress) => progress,
                None => return Ok(()),
            };
            if !progress.can_send() {
                return Ok(());
            }
            (progress.next_index, progress.mode == ProgressMode::Probe)
        };

        let prev_log_index = next_index - 1;
        if prev_log_index < self.log.snapshot_last_index() {
            // The entries this peer needs are gone; only a snapshot helps.
            return self.send_snapshot(to, &address);
        }
        let prev_log_term = match self.log.term_of(prev_log_index) {
            TermOf::Term(term) => term,
            TermOf::Compacted => return self.send_snapshot(to, &address),
            TermOf::Missing => {
                return Err(RaftError::Internal("peer next index beyond local log"))
            }
        };
        let max = if probing { 1 } else { self.options.max_batch };
        let entries = self.log.entries_from(next_index, max)?;
        let last_index_sent = prev_log_index + entries.len() as u64;
        if let Some(leader) = self.leader_state_mut() {
            if let Some(progress) = leader.progress.get_mut(&to) {
                progress.record_sent(last_index_sent);
            }
        }
        debug!(
            "event=append_send id={} to={} term={} prev_log_index={} n_entries={} commit={}",
            self.id,
            to,
            self.current_term,
            prev_log_index,
            entries.len(),
            self.commit_index
        );
        let message = Message::AppendEntries(AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        });
        self.send_message(to, &address, message);
        Ok(())
    }

    pub(crate) fn recv_append_entries(
        &mut self,
        from: ServerId,
        address: &str,
        request: AppendEntries,
    ) -> Result<(), RaftError> {
        if request.term < self.current_term {
            debug!(
                "event=append_rejected id={} leader={} reason=stale_term observed={} current={}",
                self.id, from, request.term, self.current_term
            );
            self.reject_append(from, address);
            return Ok(());
        }
        if request.term > self.current_term || !matches!(self.role, RoleState::Follower(_)) {
            self.convert_to_follower(request.term, Some(from))?;
        } else if let RoleState::Follower(follower) = &mut self.role {
            follower.current_leader = Some(from);
        }
        self.reset_election_timer();

        // Log matching check on the entry preceding the batch.
        if request.prev_log_index > 0 {
            match self.log.term_of(request.prev_log_index) {
                TermOf::Missing => {
                    debug!(
                        "event=append_rejected id={} leader={} reason=missing_prefix prev_log_index={} last_log_index={}",
                        self.id,
                        from,
                        request.prev_log_index,
                        self.log.last_index()
                    );
                    self.reject_append(from, address);
                    return Ok(());
                }
                TermOf::Term(term) if term != request.prev_log_term => {
                    if request.prev_log_index <= self.commit_index {
                        // A committed entry disagrees with the leader: local
                        // state is corrupt and no reply can be trusted.
                        self.enter_shutdown();
                        return Err(RaftError::Shutdown);
                    }
                    debug!(
                        "event=append_rejected id={} leader={} reason=term_mismatch prev_log_index={} expected={} observed={}",
                        self.id, from, request.prev_log_index, request.prev_log_term, term
                    );
                    self.reject_append(from, address);
                    return Ok(());
                }
                TermOf::Term(_) => {}
                TermOf::Compacted => {
                    debug!(
                        "event=append_ignored id={} leader={} reason=prefix_compacted prev_log_index={} first_index={}",
                        self.id,
                        from,
                        request.prev_log_index,
                        self.log.first_index()
                    );
                    return Ok(());
                }
            }
        }

        // Skip entries we already hold; a term conflict truncates the
        // uncommitted suffix and everything from there on is appended.
        let mut entries = request.entries;
        let mut append_from = entries.len();
        for (position, entry) in entries.iter().enumerate() {
            let index = request.prev_log_index + 1 + position as u64;
            debug_assert_eq!(entry.index, index);
            match self.log.term_of(index) {
                TermOf::Term(term) if term == entry.term => continue,
                TermOf::Term(_) => {
                    if index <= self.commit_index {
                        self.enter_shutdown();
                        return Err(RaftError::Shutdown);
                    }
                    warn!(
                        "event=log_truncate id={} from_index={} last_log_index={} leader_term={}",
                        self.id,
                        index,
                        self.log.last_index(),
                        request.term
                    );
                    self.truncate_from(index)?;
                    append_from = position;
                    break;
                }
                TermOf::Missing => {
                    append_from = position;
                    break;
                }
                TermOf::Compacted => continue,
            }
        }

        let last_new_index = request.prev_log_index + entries.len() as u64;
        if append_from >= entries.len() {
            // Nothing new to persist: acknowledge right away. This also makes
            // a duplicated request idempotent.
            self.update_commit(request.leader_commit.min(last_new_index))?;
            let result = AppendEntriesResult {
                term: self.current_term,
                success: true,
                last_log_index: last_new_index,
            };
            self.send_message(from, address, Message::AppendEntriesResult(result));
            return Ok(());
        }

        let new_entries = entries.split_off(append_from);
        self.log.append_batch(new_entries.clone())?;
        for entry in &new_entries {
            if entry.kind == EntryKind::Configuration {
                let configuration = Configuration::decode(entry.payload.as_slice())?;
                self.activate_configuration(entry.index, configuration);
            }
        }
        // Persist asynchronously; the success reply leaves in `append_done`
        // once the entries are fsynced.
        self.submit_follower_write(new_entries, from, address.to_string(), request.leader_commit)
    }

    fn reject_append(&mut self, to: ServerId, address: &str) {
        let result = AppendEntriesResult {
            term: self.current_term,
            success: false,
            last_log_index: self.log.last_index(),
        };
        self.send_message(to, address, Message::AppendEntriesResult(result));
    }

    pub(crate) fn recv_append_entries_result(
        &mut self,
        from: ServerId,
        result: AppendEntriesResult,
    ) -> Result<(), RaftError> {
        if result.term > self.current_term {
            info!(
                "event=step_down id={} reason=append_result_term observed={} current={}",
                self.id, result.term, self.current_term
            );
            return self.convert_to_follower(result.term, None);
        }
        if !matches!(self.role, RoleState::Leader(_)) {
            debug!(
                "event=append_result_ignored id={} from={} reason=not_leader",
                self.id, from
            );
            return Ok(());
        }
        if result.term < self.current_term {
            debug!(
                "event=append_result_ignored id={} from={} reason=stale_term",
                self.id, from
            );
            return Ok(());
        }

        let action = {
            let leader = match self.leader_state_mut() {
                Some(leader) => leader,
                None => return Ok(()),
            };
            let progress = match leader.progress.get_mut(&from) {
                Some(progress) => progress,
                None => {
                    debug!("event=append_result_ignored from={} reason=unknown_peer", from);
                    return Ok(());
                }
            };
            if let ProgressMode::Snapshot { index } = progress.mode {
                if result.success && result.last_log_index >= index {
                    progress.snapshot_installed(index);
                } else {
                    progress.rewind(result.last_log_index);
                }
                ReplyAction::Resend
            } else {
                match progress.take_reply() {
                    None => ReplyAction::Ignore,
                    Some(marker) => {
                        if result.success {
                            progress.acked(marker);
                            ReplyAction::Acked
                        } else {
                            progress.rewind(result.last_log_index);
                            ReplyAction::Resend
                        }
                    }
                }
            }
        };

        match action {
            ReplyAction::Ignore => {
                debug!(
                    "event=append_result_ignored id={} from={} reason=out_of_order",
                    self.id, from
                );
                Ok(())
            }
            ReplyAction::Resend => self.replication_send(from),
            ReplyAction::Acked => {
                self.leader_maybe_commit()?;
                self.membership_update_round(from)?;
                self.maybe_finish_transfer()?;
                let behind = self
                    .leader_state()
                    .and_then(|leader| leader.progress.get(&from))
                    .map(|progress| progress.next_index <= self.log.last_index())
                    .unwrap_or(false);
                if behind {
                    self.replication_send(from)?;
                }
                Ok(())
            }
        }
    }

    /// Advances the commit index to the highest entry of the current term
    /// replicated on a quorum of voters, then applies.
    pub(crate) fn leader_maybe_commit(&mut self) -> Result<(), RaftError> {
        let quorum = self.configuration.quorum();
        let mut new_commit = self.commit_index;
        {
            let leader = match self.leader_state() {
                Some(leader) => leader,
                None => return Ok(()),
            };
            for index in (self.commit_index + 1)..=self.log.last_index() {
                // Only entries of the current term count towards commit; a
                // quorum on an older-term entry does not make it safe.
                match self.log.term_of(index) {
                    TermOf::Term(term) if term == self.current_term => {}
                    _ => continue,
                }
                let mut replicated = 0;
                for server in self.configuration.voters() {
                    let match_index = if server.id() == self.id {
                        leader.last_stored
                    } else {
                        leader
                            .progress
                            .get(&server.id())
                            .map(|progress| progress.match_index)
                            .unwrap_or(0)
                    };
                    if match_index >= index {
                        replicated += 1;
                    }
                }
                if replicated >= quorum {
                    new_commit = index;
                }
            }
        }
        if new_commit > self.commit_index {
            info!(
                "event=commit_advance id={} term={} commit_index={} previous={}",
                self.id, self.current_term, new_commit, self.commit_index
            );
            self.update_commit(new_commit)?;
        }
        Ok(())
    }

    /// Raises the commit index and feeds newly committed entries to the FSM.
    pub(crate) fn update_commit(&mut self, index: u64) -> Result<(), RaftError> {
        if index <= self.commit_index {
            return Ok(());
        }
        debug_assert!(index <= self.log.last_index());
        self.commit_index = index;
        for watch in &mut self.watchers {
            watch.committed(index);
        }
        self.apply_committed()
    }

    /// Applies entries `last_applied+1 ..= commit_index` in order. An FSM
    /// refusal leaves `last_applied` untouched so the entry is retried on the
    /// next tick.
    pub(crate) fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get(index)?.clone();
            match entry.kind {
                // The no-op barrier advances silently.
                EntryKind::Command if entry.payload.is_empty() => {}
                EntryKind::Command => {
                    if let Err(err) = self.fsm.apply(index, entry.payload.as_slice()) {
                        warn!(
                            "event=apply_deferred id={} index={} error={}",
                            self.id, index, err
                        );
                        return Ok(());
                    }
                }
                EntryKind::Configuration => self.configuration_committed(index)?,
            }
            self.last_applied = index;
        }
        Ok(())
    }

    /// Compacts the applied prefix after the application took a snapshot of
    /// its state up to `up_to_index`.
    pub fn compact(&mut self, up_to_index: u64) -> Result<(), RaftError> {
        self.check_available()?;
        if up_to_index > self.last_applied {
            return Err(RaftError::BadState);
        }
        self.log.truncate_prefix(up_to_index)?;
        self.snapshot_configuration = Some((up_to_index, self.configuration.clone()));
        info!(
            "event=log_compact id={} up_to_index={} first_index={}",
            self.id,
            up_to_index,
            self.log.first_index()
        );
        Ok(())
    }

    /// The prefix a peer needs is gone; ship the whole snapshot instead.
    fn send_snapshot(&mut self, to: ServerId, address: &str) -> Result<(), RaftError> {
        let data = self.fsm.snapshot()?;
        let last_included_index = self.log.snapshot_last_index();
        let last_included_term = self.log.snapshot_last_term();
        let configuration = match &self.snapshot_configuration {
            Some((index, configuration)) if *index == last_included_index => configuration.clone(),
            _ => self.configuration.clone(),
        };
        if let Some(leader) = self.leader_state_mut() {
            if let Some(progress) = leader.progress.get_mut(&to) {
                progress.begin_snapshot(last_included_index);
            }
        }
        info!(
            "event=snapshot_send id={} to={} last_included_index={} last_included_term={}",
            self.id, to, last_included_index, last_included_term
        );
        let message = Message::InstallSnapshot(InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_included_index,
            last_included_term,
            configuration,
            data,
        });
        self.send_message(to, address, message);
        Ok(())
    }

    pub(crate) fn recv_install_snapshot(
        &mut self,
        from: ServerId,
        address: &str,
        request: InstallSnapshot,
    ) -> Result<(), RaftError> {
        if request.term < self.current_term {
            debug!(
                "event=snapshot_rejected id={} leader={} reason=stale_term observed={} current={}",
                self.id, from, request.term, self.current_term
            );
            self.reject_append(from, address);
            return Ok(());
        }
        if request.term > self.current_term || !matches!(self.role, RoleState::Follower(_)) {
            self.convert_to_follower(request.term, Some(from))?;
        } else if let RoleState::Follower(follower) = &mut self.role {
            follower.current_leader = Some(from);
        }
        self.reset_election_timer();

        if request.last_included_index <= self.commit_index {
            // Everything the snapshot covers is already committed locally.
            let result = AppendEntriesResult {
                term: self.current_term,
                success: true,
                last_log_index: self.log.last_index(),
            };
            self.send_message(from, address, Message::AppendEntriesResult(result));
            return Ok(());
        }

        self.fsm.restore(&request.data)?;
        self.log
            .reset(request.last_included_index, request.last_included_term);
        self.configuration = request.configuration.clone();
        self.configuration_index = request.last_included_index;
        self.pending_configuration_index = 0;
        self.snapshot_configuration =
            Some((request.last_included_index, request.configuration));
        self.commit_index = request.last_included_index;
        self.last_applied = request.last_included_index;
        for watch in &mut self.watchers {
            watch.committed(request.last_included_index);
        }
        info!(
            "event=snapshot_installed id={} leader={} last_included_index={} last_included_term={}",
            self.id, from, request.last_included_index, request.last_included_term
        );
        let result = AppendEntriesResult {
            term: self.current_term,
            success: true,
            last_log_index: request.last_included_index,
        };
        self.send_message(from, address, Message::AppendEntriesResult(result));
        Ok(())
    }
}
