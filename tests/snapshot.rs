//! Snapshot transfer: leader-driven chunked shipping to a lagging node, and
//! follower-side stream restart semantics.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use fibraft::net::InstallSnapshotReq;
use fibraft::sm::SnapshotMeta;
use fibraft::testing::MemStateMachine;
use fibraft::MemberSets;
use fibraft::RaftServer;
use fibraft::Snapshot;
use fibraft::StateMachine;
use fibraft::Term;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use fixtures::*;

/// Serialized snapshot of a state machine holding `pairs`, applied in order
/// at indices `1..=pairs.len()`.
async fn snapshot_bytes(pairs: &[(&str, &str)]) -> Vec<u8> {
    let sm = MemStateMachine::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        sm.exec(i as u64 + 1, format!("{}={}", k, v).into_bytes())
            .await
            .unwrap();
    }
    let meta = SnapshotMeta {
        last_included_index: pairs.len() as u64,
        last_included_term: 1,
        members: MemberSets::default(),
    };
    let snap = sm.take_snapshot(meta).await.unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = snap.read_next(1024).await.unwrap();
        out.extend(chunk.data);
        if chunk.done {
            return out;
        }
    }
}

/// Stream `data` into `server` in `chunk_size` pieces. Returns false as soon
/// as the receiver rejects a chunk.
async fn install(
    server: &RaftServer,
    term: Term,
    last_index: u64,
    last_term: Term,
    members: &MemberSets,
    data: &[u8],
    chunk_size: usize,
) -> bool {
    let mut offset = 0usize;
    loop {
        let end = (offset + chunk_size).min(data.len());
        let req = InstallSnapshotReq {
            group_id: GROUP,
            term,
            leader_id: 99,
            last_included_index: last_index,
            last_included_term: last_term,
            offset: offset as u64,
            members: if offset == 0 { Some(members.clone()) } else { None },
            data: data[offset..end].to_vec(),
            done: end == data.len(),
        };
        let resp = server.handle_install_snapshot(req).await.unwrap();
        if !resp.success {
            return false;
        }
        if end == data.len() {
            return true;
        }
        offset = end;
    }
}

#[tokio::test]
async fn test_leader_ships_snapshot_to_lagging_node() {
    let pairs = [("k1", "1"), ("k2", "2"), ("k3", "3"), ("k4", "4"), ("k5", "5")];
    let data = snapshot_bytes(&pairs).await;
    let members = MemberSets {
        members: btreeset! {1, 2, 3},
        ..MemberSets::default()
    };

    // node 3 hosts a server but has not joined the group yet
    let mut c = ClusterBuilder::new(&[1, 2, 3])
        .deferred(&[3])
        .config(|cfg| cfg.snapshot_chunk_bytes = 16)
        .build()
        .await;

    // nodes 1 and 2 start from a snapshot-only state, log compacted away
    for id in [1, 2] {
        let ok = install(&c.node(id).server, 10, 5, 1, &members, &data, data.len()).await;
        assert!(ok, "seeding node {} failed", id);
    }
    let leader = c.wait_leader().await;
    assert_ne!(3, leader);

    // the joiner is too far behind for log replication; only a snapshot helps
    c.join(3).await;
    c.wait_dumps_equal(&kv(&pairs)).await;
    assert!(c.node(3).sm.applied_index() >= 5);

    // the group keeps working after the transfer
    c.node(leader).handle().submit(b"k6=6".to_vec()).await.unwrap();
    let mut expected = kv(&pairs);
    expected.insert("k6".to_string(), "6".to_string());
    c.wait_dumps_equal(&expected).await;
    c.shutdown();
}

#[tokio::test]
async fn test_install_restart_replaces_partial_state() {
    let pairs = [("a", "1"), ("b", "2")];
    let data = snapshot_bytes(&pairs).await;
    let members = MemberSets {
        members: btreeset! {1},
        ..MemberSets::default()
    };

    let c = Cluster::of(&[1]).await;
    c.wait_leader().await;
    let server: Arc<RaftServer> = c.node(1).server.clone();
    let term = c.node(1).handle().status().term + 10;

    // a partial stream, abandoned by its leader
    let half = data.len() / 2;
    let req = InstallSnapshotReq {
        group_id: GROUP,
        term,
        leader_id: 99,
        last_included_index: 50,
        last_included_term: term,
        offset: 0,
        members: Some(members.clone()),
        data: data[..half].to_vec(),
        done: false,
    };
    assert!(server.handle_install_snapshot(req).await.unwrap().success);

    // a chunk that skips bytes is rejected, not applied
    let req = InstallSnapshotReq {
        group_id: GROUP,
        term,
        leader_id: 99,
        last_included_index: 50,
        last_included_term: term,
        offset: half as u64 + 3,
        members: None,
        data: data[half..].to_vec(),
        done: true,
    };
    assert!(!server.handle_install_snapshot(req).await.unwrap().success);

    // a restarted stream from offset 0 replaces the partial state
    assert!(install(&server, term, 50, term, &members, &data, 16).await);
    assert_eq!(kv(&pairs), c.node(1).sm.dump());
    assert_eq!(50, c.node(1).sm.applied_index());

    // re-sending the same snapshot is harmless
    let deadline = Instant::now() + DEADLINE;
    loop {
        let term = c.node(1).handle().status().term + 10;
        if install(&server, term, 50, term, &members, &data, 16).await {
            break;
        }
        if Instant::now() > deadline {
            panic!("repeated install never succeeded");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(kv(&pairs), c.node(1).sm.dump());
    c.shutdown();
}
