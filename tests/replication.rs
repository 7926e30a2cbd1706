//! Log replication: quorum commit, log matching, deferred durable responses,
//! flow control and lease reads.

mod fixtures;

use std::time::Duration;
use std::time::Instant;

use fibraft::testing::MemRaftLog;
use fibraft::RaftError;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use fixtures::*;

#[tokio::test]
async fn test_commit_needs_quorum_of_five() {
    let c = Cluster::of(&[1, 2, 3, 4, 5]).await;
    let leader = c.wait_leader().await;
    let h = c.node(leader).handle();

    let out = h.submit(b"k=v1".to_vec()).await.unwrap();
    assert!(out.is_empty());
    // the second write returns the first one's value
    let out = h.submit(b"k=v2".to_vec()).await.unwrap();
    assert_eq!(b"v1".to_vec(), out);
    c.wait_dumps_equal(&kv(&[("k", "v2")])).await;
    c.shutdown();
}

#[tokio::test]
async fn test_logs_match_across_all_nodes() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let h = c.node(leader).handle();
    for i in 1..=5 {
        h.submit(format!("k{}={}", i, i).into_bytes()).await.unwrap();
    }
    c.wait_dumps_equal(&kv(&[
        ("k1", "1"),
        ("k2", "2"),
        ("k3", "3"),
        ("k4", "4"),
        ("k5", "5"),
    ]))
    .await;

    let deadline = Instant::now() + DEADLINE;
    loop {
        let first = c.nodes[0].log.entries();
        if !first.is_empty() && c.nodes.iter().all(|n| n.log.entries() == first) {
            break;
        }
        if Instant::now() > deadline {
            for n in &c.nodes {
                eprintln!("node {}: {:?}", n.id, n.log.entries());
            }
            panic!("logs did not match");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    c.shutdown();
}

#[tokio::test]
async fn test_append_response_deferred_until_durable() {
    let delay = Duration::from_millis(100);
    let c = ClusterBuilder::new(&[1, 2, 3])
        .log_factory(move |_| MemRaftLog::with_persist_delay(delay))
        .build()
        .await;
    let leader = c.wait_leader().await;
    let h = c.node(leader).handle();

    let t0 = Instant::now();
    h.submit(b"a=1".to_vec()).await.unwrap();
    // the commit could not have happened before a quorum persisted
    assert!(t0.elapsed() >= Duration::from_millis(80), "elapsed {:?}", t0.elapsed());
    c.wait_dumps_equal(&kv(&[("a", "1")])).await;
    c.shutdown();
}

#[tokio::test]
async fn test_submit_on_follower_redirects_to_leader() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();

    let deadline = Instant::now() + DEADLINE;
    loop {
        match c.node(f).handle().submit(b"x=1".to_vec()).await {
            Err(RaftError::NotLeader { group_id, leader: Some(hint) }) => {
                assert_eq!(GROUP, group_id);
                assert_eq!(leader, hint);
                break;
            }
            Err(RaftError::NotLeader { leader: None, .. }) if Instant::now() < deadline => {
                // the follower has not learned the leader yet
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            r => panic!("unexpected submit result: {:?}", r.map(|_| ())),
        }
    }
    c.shutdown();
}

#[tokio::test]
async fn test_flow_control_rejects_oversized_submission() {
    let c = ClusterBuilder::new(&[1])
        .config(|cfg| cfg.max_pending_bytes = 16)
        .build()
        .await;
    c.wait_leader().await;
    let h = c.node(1).handle();

    let err = h.submit(vec![b'x'; 64]).await.unwrap_err();
    assert!(
        matches!(err, RaftError::FlowControlExceeded { .. }),
        "unexpected error: {:?}",
        err
    );
    // a submission within budget still goes through
    h.submit(b"a=1".to_vec()).await.unwrap();
    c.shutdown();
}

#[tokio::test]
async fn test_internal_entries_do_not_consume_flow_budget() {
    let c = Cluster::of(&[1]).await;
    c.wait_leader().await;
    let h = c.node(1).handle();
    // the leader's own empty entry applies without a client budget slot
    h.wait_status(|s| s.last_applied >= 1).await.unwrap();
    h.submit(b"a=1".to_vec()).await.unwrap();

    // config-change entries are internal too
    let server = &c.node(1).server;
    server.prepare_change(GROUP, btreeset! {1}, btreeset! {}).await.unwrap();
    server.commit_change(GROUP).await.unwrap();
    h.submit(b"b=2".to_vec()).await.unwrap();
    c.wait_dumps_equal(&kv(&[("a", "1"), ("b", "2")])).await;
    c.shutdown();
}

#[tokio::test]
async fn test_read_index_on_leader_and_follower() {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let h = c.node(leader).handle();

    h.submit(b"a=1".to_vec()).await.unwrap();
    let idx = h.read_index().await.unwrap();
    assert!(idx >= 1);
    assert!(idx <= h.status().commit_index);

    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();
    let err = c.node(f).handle().read_index().await.unwrap_err();
    assert!(matches!(err, RaftError::NotLeader { .. }), "unexpected error: {:?}", err);
    c.shutdown();
}
