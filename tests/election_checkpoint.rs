//! Vote granting, vote tallying and the timeout-driven candidacy cycle.

mod support;

use skiff::{Message, RequestVote, RequestVoteResult, RoleKind};
use support::*;

fn request_vote(term: u64, candidate: u64, last_log_index: u64, last_log_term: u64) -> Message {
    Message::RequestVote(RequestVote {
        term,
        candidate_id: sid(candidate),
        last_log_index,
        last_log_term,
    })
}

fn vote_result(term: u64, vote_granted: bool) -> Message {
    Message::RequestVoteResult(RequestVoteResult { term, vote_granted })
}

fn last_vote_result(raft: &TestRaft) -> RequestVoteResult {
    match raft.io().sent.last() {
        Some((_, _, Message::RequestVoteResult(result))) => *result,
        other => panic!("expected a RequestVoteResult, got {other:?}"),
    }
}

#[test]
fn election_timeout_starts_a_candidacy() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);

    raft.tick(400).unwrap();

    assert_eq!(raft.role(), RoleKind::Candidate);
    assert_eq!(raft.current_term(), 2);
    assert_eq!(raft.status().voted_for, Some(sid(1)));
    let requests: Vec<_> = raft
        .io()
        .sent
        .iter()
        .filter(|(to, _, message)| {
            *to == sid(2) && matches!(message, Message::RequestVote(_))
        })
        .collect();
    assert_eq!(requests.len(), 1, "one vote request per other voter");
}

#[test]
fn short_ticks_do_not_trigger_an_election() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);

    // The randomized timeout is at least the base timeout.
    raft.tick(100).unwrap();

    assert_eq!(raft.role(), RoleKind::Follower);
}

#[test]
fn non_voter_never_starts_an_election() {
    let mut raft = make_raft(3);
    bootstrap_and_start(&mut raft, 3, 1, 2);

    raft.tick(10_000).unwrap();

    assert_eq!(raft.role(), RoleKind::Follower);
    assert_eq!(raft.current_term(), 1);
}

#[test]
fn vote_granted_to_up_to_date_candidate_and_persisted_first() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);

    raft.recv(sid(2), "2", request_vote(2, 2, 1, 1)).unwrap();

    let result = last_vote_result(&raft);
    assert!(result.vote_granted);
    assert_eq!(result.term, 2);
    assert_eq!(raft.status().voted_for, Some(sid(2)));

    // Durability ordering: the vote hits storage before the reply leaves.
    let journal = &raft.io().journal;
    let vote_at = journal
        .iter()
        .position(|line| line == "set_vote 2")
        .expect("vote persisted");
    let reply_at = journal
        .iter()
        .position(|line| line == "send request_vote_result 2")
        .expect("reply sent");
    assert!(vote_at < reply_at);
}

#[test]
fn vote_rejected_for_stale_term() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);
    become_candidate(&mut raft);
    take_sent(&mut raft);

    raft.recv(sid(2), "2", request_vote(1, 2, 1, 1)).unwrap();

    let result = last_vote_result(&raft);
    assert!(!result.vote_granted);
    assert_eq!(result.term, 2, "reply carries the newer local term");
}

#[test]
fn vote_rejected_when_candidate_log_is_behind() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);

    raft.recv(sid(2), "2", request_vote(2, 2, 0, 0)).unwrap();

    let result = last_vote_result(&raft);
    assert!(!result.vote_granted, "local log has entry 1 at term 1");
    assert_eq!(raft.current_term(), 2, "term still adopted");
    assert_eq!(raft.status().voted_for, None);
}

#[test]
fn at_most_one_vote_per_term() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);

    raft.recv(sid(2), "2", request_vote(2, 2, 1, 1)).unwrap();
    assert!(last_vote_result(&raft).vote_granted);

    raft.recv(sid(3), "3", request_vote(2, 3, 1, 1)).unwrap();
    assert!(
        !last_vote_result(&raft).vote_granted,
        "second candidate in the same term is refused"
    );

    // Repeating the original candidate's request is answered consistently.
    raft.recv(sid(2), "2", request_vote(2, 2, 1, 1)).unwrap();
    assert!(last_vote_result(&raft).vote_granted);
}

#[test]
fn empty_log_grants_to_any_same_or_higher_term_candidate() {
    let mut raft = make_raft(1);
    raft.start().unwrap();
    assert_eq!(raft.log().last_index(), 0);

    raft.recv(sid(2), "2", request_vote(1, 2, 0, 0)).unwrap();

    let result = last_vote_result(&raft);
    assert!(result.vote_granted);
    assert_eq!(result.term, 1);
}

#[test]
fn quorum_of_grants_wins_the_election() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_candidate(&mut raft);

    raft.recv(sid(2), "2", vote_result(2, false)).unwrap();
    assert_eq!(raft.role(), RoleKind::Candidate);

    raft.recv(sid(3), "3", vote_result(2, true)).unwrap();
    assert_eq!(raft.role(), RoleKind::Leader, "self plus one grant is quorum");
}

#[test]
fn stale_or_foreign_vote_results_are_ignored() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_candidate(&mut raft);

    // Stale term.
    raft.recv(sid(2), "2", vote_result(1, true)).unwrap();
    assert_eq!(raft.role(), RoleKind::Candidate);

    // Grants only count once per voter.
    raft.recv(sid(2), "2", vote_result(2, true)).unwrap();
    assert_eq!(raft.role(), RoleKind::Leader);
}

#[test]
fn higher_term_vote_result_steps_candidate_down() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 2, 1, 2);
    become_candidate(&mut raft);

    raft.recv(sid(2), "2", vote_result(5, false)).unwrap();

    assert_eq!(raft.role(), RoleKind::Follower);
    assert_eq!(raft.current_term(), 5);
}

#[test]
fn split_vote_restarts_with_a_fresh_term() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_candidate(&mut raft);
    assert_eq!(raft.current_term(), 2);
    take_sent(&mut raft);

    raft.tick(400).unwrap();

    assert_eq!(raft.role(), RoleKind::Candidate);
    assert_eq!(raft.current_term(), 3, "retry increments the term");
    let new_requests = raft
        .io()
        .sent
        .iter()
        .filter(|(_, _, message)| {
            matches!(message, Message::RequestVote(request) if request.term == 3)
        })
        .count();
    assert_eq!(new_requests, 2, "both other voters asked again");
}

#[test]
fn transfer_leadership_steps_down_once_target_is_caught_up() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 3);
    become_leader(&mut raft);

    raft.transfer_leadership(2).unwrap();
    assert!(matches!(
        raft.accept(vec![1]),
        Err(skiff::RaftError::LeadershipLost)
    ));

    raft.recv(
        sid(2),
        "2",
        Message::AppendEntriesResult(skiff::AppendEntriesResult {
            term: 2,
            success: true,
            last_log_index: 2,
        }),
    )
    .unwrap();

    assert_eq!(raft.role(), RoleKind::Follower, "handed off");
}

#[test]
fn transfer_leadership_rejects_non_voters_and_unknown_servers() {
    let mut raft = make_raft(1);
    bootstrap_and_start(&mut raft, 3, 1, 2);
    become_leader(&mut raft);

    assert!(matches!(
        raft.transfer_leadership(3),
        Err(skiff::RaftError::BadState)
    ));
    assert!(matches!(
        raft.transfer_leadership(9),
        Err(skiff::RaftError::Config(skiff::ConfigError::UnknownId { .. }))
    ));
    assert!(matches!(
        raft.transfer_leadership(1),
        Err(skiff::RaftError::BadState)
    ));
}
