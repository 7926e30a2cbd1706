//! Leader election: single leader per term, vote persistence, pre-vote.

mod fixtures;

use std::time::Duration;
use std::time::Instant;

use fibraft::net::VoteReq;
use fibraft::testing::MemRaftLog;
use fibraft::NodeId;
use fibraft::RaftRole;

use fixtures::*;

fn vote_req(term: u64, candidate: NodeId, pre_vote: bool) -> VoteReq {
    VoteReq {
        group_id: GROUP,
        term,
        candidate_id: candidate,
        // a log far ahead of anything in the cluster
        last_log_index: 1_000,
        last_log_term: 1_000,
        pre_vote,
    }
}

async fn wait_follower_sees_leader(c: &Cluster, follower: NodeId, leader: NodeId) {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if c.node(follower).handle().status().leader == Some(leader) {
            return;
        }
        if Instant::now() > deadline {
            panic!("node {} never saw leader {}", follower, leader);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_single_voter_elects_itself() {
    let c = Cluster::of(&[1]).await;
    assert_eq!(1, c.wait_leader().await);
    let out = c.node(1).handle().submit(b"a=1".to_vec()).await.unwrap();
    assert!(out.is_empty());
    c.wait_dumps_equal(&kv(&[("a", "1")])).await;
    c.shutdown();
}

#[tokio::test]
async fn test_election_survives_vote_persist_failure() {
    // the first vote round dies at the persist step; the next election
    // timeout must stand again instead of staying stuck mid-round
    let c = ClusterBuilder::new(&[1])
        .log_factory(|_| MemRaftLog::with_vote_save_failures(1))
        .build()
        .await;
    assert_eq!(1, c.wait_leader().await);
    let (term, voted_for) = c.node(1).log.persisted_vote();
    assert!(term > 0);
    assert_eq!(Some(1), voted_for);
    c.node(1).handle().submit(b"a=1".to_vec()).await.unwrap();
    c.wait_dumps_equal(&kv(&[("a", "1")])).await;
    c.shutdown();
}

#[tokio::test]
async fn test_exactly_one_leader_among_three() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    for n in &c.nodes {
        if n.id != leader {
            wait_follower_sees_leader(&c, n.id, leader).await;
        }
    }
    let leaders = c
        .nodes
        .iter()
        .filter(|n| n.handle().status().role == RaftRole::Leader)
        .count();
    assert_eq!(1, leaders);
    c.shutdown();
}

#[tokio::test]
async fn test_vote_granted_once_per_term_and_persisted_first() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let term = c.node(leader).handle().status().term;
    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();

    let r1 = c.node(f).server.handle_vote(vote_req(term + 10, 100, false)).await.unwrap();
    assert!(r1.vote_granted);
    // the grant was durable before the response came back
    assert_eq!((term + 10, Some(100)), c.node(f).log.persisted_vote());

    // a competing candidate of the same term is refused
    let r2 = c.node(f).server.handle_vote(vote_req(term + 10, 101, false)).await.unwrap();
    assert!(!r2.vote_granted);
    assert_eq!(term + 10, r2.term);
    assert_eq!((term + 10, Some(100)), c.node(f).log.persisted_vote());
    c.shutdown();
}

#[tokio::test]
async fn test_revote_for_same_candidate_is_granted() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let term = c.node(leader).handle().status().term;
    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();

    let r1 = c.node(f).server.handle_vote(vote_req(term + 10, 100, false)).await.unwrap();
    assert!(r1.vote_granted);
    // a retransmitted request from the same candidate succeeds again
    let r2 = c.node(f).server.handle_vote(vote_req(term + 10, 100, false)).await.unwrap();
    assert!(r2.vote_granted);
    c.shutdown();
}

#[tokio::test]
async fn test_pre_vote_mutates_nothing_and_respects_live_leader() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();
    wait_follower_sees_leader(&c, f, leader).await;

    let before = c.node(f).log.persisted_vote();
    let r = c.node(f).server.handle_vote(vote_req(before.0 + 50, 42, true)).await.unwrap();
    // the leader is alive, so the probe is refused even with a better log
    assert!(!r.vote_granted);
    assert_eq!(before.0, r.term);
    assert_eq!(before, c.node(f).log.persisted_vote());
    c.shutdown();
}
