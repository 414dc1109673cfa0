//! Single-server membership changes: add, promote with catch-up rounds,
//! remove, the one-change-at-a-time rule and configuration rollback.

mod support;

use skiff::{
    AppendEntries, AppendEntriesResult, ConfigError, Entry, EntryBuf, EntryKind, Message,
    RaftError, RoleKind, ServerId, Watch,
};
use std::cell::RefCell;
use std::rc::Rc;
use support::*;

#[derive(Default)]
struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl Watch for Recorder {
    fn role_changed(&mut self, old: RoleKind, new: RoleKind) {
        self.events.borrow_mut().push(format!("role {old}->{new}"));
    }

    fn committed(&mut self, index: u64) {
        self.events.borrow_mut().push(format!("commit {index}"));
    }

    fn promotion_aborted(&mut self, id: ServerId) {
        self.events
            .borrow_mut()
            .push(format!("promotion_aborted {id}"));
    }
}

fn ack(raft: &mut TestRaft, from: u64, last_log_index: u64) {
    let term = raft.current_term();
    raft.recv(
        sid(from),
        &from.to_string(),
        Message::AppendEntriesResult(AppendEntriesResult {
            term,
            success: true,
            last_log_index,
        }),
    )
    .unwrap();
}

#[test]
fn add_server_joins_as_non_voter() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_leader(&mut raft);

    raft.add_server(4, "4").unwrap();

    let configuration = raft.configuration();
    assert!(configuration.contains(sid(4)));
    assert!(!configuration.is_voter(sid(4)));
    assert_eq!(configuration.n_voting(), 3, "quorum size unchanged");
    assert_eq!(
        raft.log().get(3).unwrap().kind,
        EntryKind::Configuration,
        "change encoded as a configuration entry"
    );
}

#[test]
fn one_membership_change_at_a_time() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_leader(&mut raft);

    raft.add_server(4, "4").unwrap();
    assert!(matches!(raft.add_server(5, "5"), Err(RaftError::ConfigBusy)));
    assert!(matches!(raft.remove_server(2), Err(RaftError::ConfigBusy)));
    assert!(matches!(raft.promote(4), Err(RaftError::ConfigBusy)));

    // Committing the entry releases the gate.
    flush_appends(&mut raft);
    ack(&mut raft, 2, 2);
    ack(&mut raft, 2, 3);
    assert_eq!(raft.commit_index(), 3);
    raft.add_server(5, "5").unwrap();
}

#[test]
fn membership_changes_require_leadership() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);

    assert!(matches!(raft.add_server(4, "4"), Err(RaftError::NotLeader)));
    assert!(matches!(raft.promote(3), Err(RaftError::NotLeader)));
    assert!(matches!(raft.remove_server(2), Err(RaftError::NotLeader)));
}

#[test]
fn configuration_edit_errors_pass_through() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_leader(&mut raft);

    assert!(matches!(
        raft.add_server(2, "2"),
        Err(RaftError::Config(ConfigError::DuplicateId { .. }))
    ));
    assert!(matches!(
        raft.remove_server(9),
        Err(RaftError::Config(ConfigError::UnknownId { .. }))
    ));
    assert!(matches!(
        raft.promote(9),
        Err(RaftError::Config(ConfigError::UnknownId { .. }))
    ));
    // Promoting a voter is meaningless.
    assert!(matches!(raft.promote(2), Err(RaftError::BadState)));
}

#[test]
fn caught_up_server_is_promoted_immediately() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 2);
    become_leader(&mut raft);
    ack(&mut raft, 3, 2);

    raft.promote(3).unwrap();

    assert!(raft.configuration().is_voter(sid(3)));
    assert_eq!(raft.configuration().quorum(), 2);
    assert!(matches!(raft.add_server(5, "5"), Err(RaftError::ConfigBusy)));
}

/// Drives the promotion of server 3 to its final catch-up round: each cycle
/// lets a heartbeat interval's worth of time pass, then has the promotee
/// acknowledge, which completes a too-slow round and starts the next one.
fn drive_to_last_round(raft: &mut TestRaft) {
    raft.promote(3).unwrap();
    for _ in 0..9 {
        raft.tick(200).unwrap();
        ack(raft, 3, 2);
    }
}

#[test]
fn slow_tenth_round_aborts_the_promotion() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut raft = make_raft(1);
    raft.watch(Box::new(Recorder {
        events: Rc::clone(&events),
    }));
    bootstrap_and_start(&mut raft, 3, 1, 2);
    become_leader(&mut raft);
    drive_to_last_round(&mut raft);

    // One past the election timeout on the final round: give up.
    raft.tick(151).unwrap();

    assert!(!raft.configuration().is_voter(sid(3)));
    assert!(events
        .borrow()
        .iter()
        .any(|event| event == "promotion_aborted 3"));
    raft.add_server(4, "4").unwrap();
}

#[test]
fn tenth_round_at_exactly_the_election_timeout_succeeds() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 2);
    become_leader(&mut raft);
    drive_to_last_round(&mut raft);

    raft.tick(150).unwrap();
    ack(&mut raft, 3, 2);

    assert!(raft.configuration().is_voter(sid(3)));
}

#[test]
fn unresponsive_promotee_aborts_at_the_hard_ceiling() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut raft = make_raft(1);
    raft.watch(Box::new(Recorder {
        events: Rc::clone(&events),
    }));
    bootstrap_and_start(&mut raft, 3, 1, 2);
    become_leader(&mut raft);
    raft.promote(3).unwrap();

    for _ in 0..31 {
        raft.tick(1_000).unwrap();
    }

    assert!(!raft.configuration().is_voter(sid(3)));
    assert!(events
        .borrow()
        .iter()
        .any(|event| event == "promotion_aborted 3"));
}

#[test]
fn leader_steps_down_after_committing_its_own_removal() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_leader(&mut raft);

    raft.remove_server(1).unwrap();
    assert!(!raft.configuration().contains(sid(1)), "active immediately");
    assert_eq!(raft.role(), RoleKind::Leader, "keeps leading until commit");
    flush_appends(&mut raft);

    ack(&mut raft, 2, 2);
    ack(&mut raft, 3, 2);
    assert_eq!(raft.commit_index(), 2);
    assert_eq!(raft.role(), RoleKind::Leader);

    ack(&mut raft, 2, 3);
    ack(&mut raft, 3, 3);
    assert_eq!(raft.commit_index(), 3);
    assert_eq!(raft.role(), RoleKind::Follower, "removal entry committed");
}

#[test]
fn truncated_configuration_entry_rolls_back() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);

    let mut with_nine = cluster_configuration(2, 1, 2);
    with_nine.add(9, "9", false).unwrap();
    raft.recv(
        sid(2),
        "2",
        Message::AppendEntries(AppendEntries {
            term: 1,
            leader_id: sid(2),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![Entry::new(
                2,
                1,
                EntryKind::Configuration,
                EntryBuf::new(with_nine.encode()),
            )],
            leader_commit: 1,
        }),
    )
    .unwrap();
    flush_appends(&mut raft);
    assert!(raft.configuration().contains(sid(9)), "active on append");

    // A newer leader overwrites index 2 before the change ever commits.
    raft.recv(
        sid(2),
        "2",
        Message::AppendEntries(AppendEntries {
            term: 2,
            leader_id: sid(2),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![Entry::command(2, 2, vec![7])],
            leader_commit: 1,
        }),
    )
    .unwrap();

    assert!(
        !raft.configuration().contains(sid(9)),
        "rolled back to the bootstrap configuration"
    );
    assert_eq!(raft.configuration().len(), 2);
}
