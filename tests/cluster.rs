//! Cluster scenarios: partitions, re-election, leadership transfer, joint
//! membership change and observers.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use fibraft::net::QueryStatusReq;
use fibraft::testing::MemRaftLog;
use fibraft::testing::MemStateMachine;
use fibraft::GroupConfig;
use fibraft::RaftRole;
use fibraft::RaftServer;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use fixtures::*;

#[tokio::test]
async fn test_partitioned_follower_catches_up() -> anyhow::Result<()> {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    let f = c.nodes.iter().map(|n| n.id).find(|&id| id != leader).unwrap();

    c.router.isolate(f);
    let h = c.node(leader).handle();
    // two of three still form a quorum
    let mut expected = std::collections::BTreeMap::new();
    for i in 0..10 {
        h.submit(format!("k{}={}", i, i).into_bytes()).await?;
        expected.insert(format!("k{}", i), i.to_string());
    }

    // replay through AppendEntries, no snapshot involved
    c.router.heal(f);
    c.wait_dumps_equal(&expected).await;
    assert!(c.node(f).log.entries().len() >= 10);
    c.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_leader_isolation_triggers_reelection() -> anyhow::Result<()> {
    let c = Cluster::of(&[1, 2, 3]).await;
    let old = c.wait_leader().await;
    let old_term = c.node(old).handle().status().term;

    c.router.isolate(old);
    let new = c.wait_leader_where(|id| id != old).await;
    let new_term = c.node(new).handle().status().term;
    assert!(new_term > old_term, "{} vs {}", new_term, old_term);

    c.node(new).handle().submit(b"a=1".to_vec()).await?;

    // the deposed leader rejoins and adopts the new term
    c.router.heal(old);
    c.wait_dumps_equal(&kv(&[("a", "1")])).await;
    let deadline = Instant::now() + DEADLINE;
    loop {
        let s = c.node(old).handle().status();
        if s.term >= new_term && s.role != RaftRole::Leader {
            break;
        }
        if Instant::now() > deadline {
            panic!("old leader never stepped down: {:?}", s);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    c.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_transfer_leader() -> anyhow::Result<()> {
    let c = Cluster::of(&[1, 2, 3]).await;
    let old = c.wait_leader().await;
    let target = c.nodes.iter().map(|n| n.id).find(|&id| id != old).unwrap();

    c.node(old).server.transfer_leader(GROUP, target).await?;
    let new = c.wait_leader_where(|id| id == target).await;
    assert_eq!(target, new);

    c.node(new).handle().submit(b"a=1".to_vec()).await?;
    c.wait_dumps_equal(&kv(&[("a", "1")])).await;
    c.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_joint_change_adds_member() -> anyhow::Result<()> {
    let c = Cluster::of(&[1, 2, 3]).await;
    let leader = c.wait_leader().await;
    c.node(leader).handle().submit(b"a=1".to_vec()).await?;

    // node 4 starts hosting the group before it is voted in
    let server4 = Arc::new(RaftServer::new(base_config(4))?);
    c.router.register(4, server4.clone());
    let sm4 = MemStateMachine::new();
    server4
        .add_group(
            GroupConfig {
                group_id: GROUP,
                node_ids: vec![1, 2, 3, 4],
                observer_ids: vec![],
            },
            Box::new(MemRaftLog::new()),
            Box::new(sm4.clone()),
            c.router.transport(4),
        )
        .await?;

    let leader_server = &c.node(leader).server;
    leader_server
        .prepare_change(GROUP, btreeset! {1, 2, 3, 4}, btreeset! {})
        .await?;
    leader_server.commit_change(GROUP).await?;

    c.node(leader).handle().submit(b"b=2".to_vec()).await?;

    // the new member catches up on the full history
    let expected = kv(&[("a", "1"), ("b", "2")]);
    let deadline = Instant::now() + DEADLINE;
    while sm4.dump() != expected {
        if Instant::now() > deadline {
            panic!("node 4 never caught up: {:?}", sm4.dump());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    c.wait_dumps_equal(&expected).await;

    let status = leader_server
        .handle_query_status(QueryStatusReq { group_id: GROUP })
        .await?;
    assert_eq!(btreeset! {1, 2, 3, 4}, status.members);
    server4.shutdown();
    c.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_observer_replicates_without_voting() -> anyhow::Result<()> {
    let c = ClusterBuilder::new(&[1, 2]).observers(&[3]).build().await;
    let leader = c.wait_leader().await;
    assert_ne!(3, leader);

    let h = c.node(leader).handle();
    h.submit(b"a=1".to_vec()).await?;
    h.submit(b"b=2".to_vec()).await?;
    c.wait_dumps_equal(&kv(&[("a", "1"), ("b", "2")])).await;

    let s = c.node(3).handle().status();
    assert_eq!(RaftRole::Observer, s.role);
    c.shutdown();
    Ok(())
}
