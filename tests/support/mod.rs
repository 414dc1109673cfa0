//! Shared test harness: an in-memory I/O stub that records every intent the
//! engine emits, a small state machine, and cluster bootstrap helpers.
#![allow(dead_code)]

use skiff::{
    Configuration, Entry, EntryKind, Fsm, FsmError, Io, IoError, Message, PersistedState, Raft,
    RaftOptions, RequestVoteResult, ServerId,
};

pub type TestRaft = Raft<StubIo, StubFsm>;

/// Records every intent; completions are driven explicitly by the tests
/// through `append_done` / `send_done`.
#[derive(Default)]
pub struct StubIo {
    pub started: bool,
    pub stopped: bool,
    pub term: u64,
    pub vote: Option<ServerId>,
    pub bootstrapped: Option<Configuration>,
    /// Explicit restart state; overrides the bootstrap-derived load result.
    pub load_state: Option<PersistedState>,
    /// Append submissions in order; `completed` counts delivered completions.
    pub appended: Vec<Vec<Entry>>,
    pub completed: usize,
    pub sent: Vec<(ServerId, String, Message)>,
    pub fail_next_append: bool,
    /// Ordered trace of intents, used to assert durability ordering.
    pub journal: Vec<String>,
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::RequestVote(_) => "request_vote",
        Message::RequestVoteResult(_) => "request_vote_result",
        Message::AppendEntries(_) => "append_entries",
        Message::AppendEntriesResult(_) => "append_entries_result",
        Message::InstallSnapshot(_) => "install_snapshot",
    }
}

impl Io for StubIo {
    fn start(&mut self, _id: ServerId, _address: &str, _heartbeat_ms: u64) -> Result<(), IoError> {
        self.started = true;
        Ok(())
    }

    fn load(&mut self) -> Result<PersistedState, IoError> {
        if let Some(state) = &self.load_state {
            return Ok(state.clone());
        }
        match &self.bootstrapped {
            Some(configuration) => Ok(PersistedState {
                term: self.term,
                voted_for: self.vote,
                start_index: 1,
                snapshot_last_term: 0,
                entries: vec![Entry::new(
                    1,
                    1,
                    EntryKind::Configuration,
                    skiff::EntryBuf::new(configuration.encode()),
                )],
            }),
            None => Ok(PersistedState::default()),
        }
    }

    fn bootstrap(&mut self, configuration: &Configuration) -> Result<(), IoError> {
        if self.bootstrapped.is_some() {
            return Err(IoError::AlreadyBootstrapped);
        }
        self.term = 1;
        self.bootstrapped = Some(configuration.clone());
        Ok(())
    }

    fn set_term(&mut self, term: u64) -> Result<(), IoError> {
        self.term = term;
        self.journal.push(format!("set_term {term}"));
        Ok(())
    }

    fn set_vote(&mut self, vote: Option<ServerId>) -> Result<(), IoError> {
        self.vote = vote;
        match vote {
            Some(id) => self.journal.push(format!("set_vote {id}")),
            None => self.journal.push("set_vote none".to_string()),
        }
        Ok(())
    }

    fn append(&mut self, entries: &[Entry]) -> Result<(), IoError> {
        if self.fail_next_append {
            self.fail_next_append = false;
            return Err(IoError::Storage("injected append refusal".into()));
        }
        self.journal.push(format!("append {}", entries.len()));
        self.appended.push(entries.to_vec());
        Ok(())
    }

    fn send(&mut self, to: ServerId, address: &str, message: &Message) -> Result<(), IoError> {
        self.journal
            .push(format!("send {} {}", message_kind(message), to));
        self.sent.push((to, address.to_string(), message.clone()));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), IoError> {
        self.stopped = true;
        Ok(())
    }
}

/// Applies commands by recording them; snapshots are the JSON of the applied
/// list so restores can be compared structurally.
#[derive(Default)]
pub struct StubFsm {
    pub applied: Vec<(u64, Vec<u8>)>,
    pub restored: Option<Vec<u8>>,
    pub fail_next_apply: bool,
}

impl Fsm for StubFsm {
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<(), FsmError> {
        if self.fail_next_apply {
            self.fail_next_apply = false;
            return Err(FsmError("injected apply refusal".into()));
        }
        self.applied.push((index, command.to_vec()));
        Ok(())
    }

    fn snapshot(&mut self) -> Result<Vec<u8>, FsmError> {
        serde_json::to_vec(&self.applied).map_err(|err| FsmError(err.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), FsmError> {
        self.applied =
            serde_json::from_slice(data).map_err(|err| FsmError(err.to_string()))?;
        self.restored = Some(data.to_vec());
        Ok(())
    }
}

pub fn make_raft(id: u64) -> TestRaft {
    Raft::new(
        id,
        id.to_string(),
        StubIo::default(),
        StubFsm::default(),
        RaftOptions::default(),
    )
}

/// Servers `1..=n` with addresses equal to their ids; ids in
/// `voting_from..=voting_to` vote.
pub fn cluster_configuration(n: u64, voting_from: u64, voting_to: u64) -> Configuration {
    let mut configuration = Configuration::new();
    for id in 1..=n {
        let voting = id >= voting_from && id <= voting_to;
        configuration.add(id, id.to_string(), voting).unwrap();
    }
    configuration
}

pub fn bootstrap_and_start(raft: &mut TestRaft, n: u64, voting_from: u64, voting_to: u64) {
    let configuration = cluster_configuration(n, voting_from, voting_to);
    raft.bootstrap(&configuration).unwrap();
    raft.start().unwrap();
}

/// One oversized tick; the randomized timeout never exceeds twice the base.
pub fn become_candidate(raft: &mut TestRaft) {
    raft.tick(400).unwrap();
    assert_eq!(raft.role(), skiff::RoleKind::Candidate);
}

/// Candidacy plus the vote of server 2, enough for quorum in the two- and
/// three-server clusters the tests use. Flushes the new leader's no-op write.
pub fn become_leader(raft: &mut TestRaft) {
    become_candidate(raft);
    let term = raft.current_term();
    raft.recv(
        ServerId::new(2),
        "2",
        Message::RequestVoteResult(RequestVoteResult {
            term,
            vote_granted: true,
        }),
    )
    .unwrap();
    assert_eq!(raft.role(), skiff::RoleKind::Leader);
    flush_appends(raft);
}

/// Completes every outstanding storage append successfully.
pub fn flush_appends(raft: &mut TestRaft) -> usize {
    let mut flushed = 0;
    while raft.io().appended.len() > raft.io().completed {
        raft.io_mut().completed += 1;
        raft.append_done(Ok(())).unwrap();
        flushed += 1;
    }
    flushed
}

pub fn take_sent(raft: &mut TestRaft) -> Vec<(ServerId, String, Message)> {
    std::mem::take(&mut raft.io_mut().sent)
}

/// Last message sent, as an AppendEntriesResult.
pub fn last_append_result(raft: &TestRaft) -> skiff::AppendEntriesResult {
    match raft.io().sent.last() {
        Some((_, _, Message::AppendEntriesResult(result))) => *result,
        other => panic!("expected an AppendEntriesResult, got {other:?}"),
    }
}

pub fn sid(raw: u64) -> ServerId {
    ServerId::new(raw)
}
