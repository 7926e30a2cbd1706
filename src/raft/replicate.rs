//! Leader-side replication: one fiber per peer ships log entries, falls back
//! to chunked snapshot transfer when the peer's log is too far behind, and
//! sends empty AppendEntries as heartbeats when idle.
//!
//! Fibers are cancelled by epoch bump: stepping down or resetting cursors
//! increments every peer's `repl_epoch` and the stale fiber exits at its next
//! checkpoint. In-flight RPCs are never aborted; their results are dropped.

use std::rc::Rc;
use std::time::Instant;

use crate::error::Fatal;
use crate::error::RaftError;
use crate::net::AppendCode;
use crate::net::AppendReq;
use crate::net::InstallSnapshotReq;
use crate::raft::status::RaftRole;
use crate::raft::vote;
use crate::raft::GroupComponents;
use crate::sm::SnapshotMeta;
use crate::NodeId;

pub(crate) fn start_replicate_fibers(gc: &Rc<GroupComponents>) {
    let targets = gc.status.borrow().replicate_targets();
    for t in targets {
        start_replicate_fiber(gc, t);
    }
}

/// Start one peer's replicate fiber if it is not already running.
pub(crate) fn start_replicate_fiber(gc: &Rc<GroupComponents>, target: NodeId) {
    let epoch = {
        let mut st = gc.status.borrow_mut();
        if st.role != RaftRole::Leader {
            return;
        }
        let p = match st.peer_mut(target) {
            Some(p) => p,
            None => return,
        };
        if p.repl_running {
            return;
        }
        p.repl_running = true;
        p.repl_epoch
    };
    let gc2 = gc.clone();
    super::spawn_raft(gc, format!("replicate-{}", target), true, async move {
        let res = replicate_loop(&gc2, target, epoch).await;
        if let Some(p) = gc2.status.borrow_mut().peer_mut(target) {
            p.repl_running = false;
        }
        res
    });
}

/// True while this fiber is still the peer's current replicator.
fn still_current(gc: &GroupComponents, target: NodeId, epoch: u64) -> bool {
    let st = gc.status.borrow();
    st.role == RaftRole::Leader
        && st.peers.get(&target).map(|p| p.repl_epoch) == Some(epoch)
}

async fn replicate_loop(
    gc: &Rc<GroupComponents>,
    target: NodeId,
    epoch: u64,
) -> Result<(), RaftError> {
    tracing::info!(group_id = gc.group_id, target, epoch, "replicate fiber start");
    loop {
        if !still_current(gc, target, epoch) {
            tracing::info!(group_id = gc.group_id, target, epoch, "replicate fiber exit");
            return Ok(());
        }
        let (installing, next_index, last_persist) = {
            let st = gc.status.borrow();
            let p = match st.peers.get(&target) {
                Some(p) => p,
                None => return Ok(()),
            };
            (p.installing_snapshot, p.next_index, st.last_persist_index)
        };
        if installing {
            install_snapshot_to(gc, target, epoch).await?;
            continue;
        }
        if next_index > last_persist {
            // idle: a timeout here means the heartbeat interval passed
            // without new entries
            let outcome = gc
                .repl_cond
                .wait_timeout(gc.cfg.heartbeat_interval())
                .await?;
            if outcome == crate::fiber::WaitOutcome::TimedOut {
                send_append(gc, target, epoch, true).await?;
            }
            continue;
        }
        send_append(gc, target, epoch, false).await?;
    }
}

async fn prev_term_of(gc: &Rc<GroupComponents>, prev: u64) -> Result<Option<u64>, RaftError> {
    if prev == 0 {
        return Ok(Some(0));
    }
    {
        let st = gc.status.borrow();
        if prev == st.last_log_index {
            return Ok(Some(st.last_log_term));
        }
        if prev == st.last_applied {
            return Ok(Some(st.last_applied_term));
        }
    }
    let items = gc
        .raft_log
        .read(prev, 1, u64::MAX)
        .await
        .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
    match items.first() {
        Some(i) if i.index == prev => Ok(Some(i.term)),
        _ => Ok(None),
    }
}

async fn send_append(
    gc: &Rc<GroupComponents>,
    target: NodeId,
    epoch: u64,
    heartbeat: bool,
) -> Result<(), RaftError> {
    let prev = {
        let st = gc.status.borrow();
        match st.peers.get(&target) {
            Some(p) => p.next_index - 1,
            None => return Ok(()),
        }
    };
    let prev_term = match prev_term_of(gc, prev).await? {
        Some(t) => t,
        None => {
            // compacted away; only a snapshot can help
            if let Some(p) = gc.status.borrow_mut().peer_mut(target) {
                p.installing_snapshot = true;
            }
            return Ok(());
        }
    };
    let entries = if heartbeat {
        Vec::new()
    } else {
        let items = gc
            .raft_log
            .read(
                prev + 1,
                gc.cfg.max_replicate_items,
                gc.cfg.max_replicate_bytes,
            )
            .await
            .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
        if items.is_empty() {
            return Ok(());
        }
        match items.first() {
            // a gap after prev means the range was compacted into a snapshot
            Some(first) if first.index != prev + 1 => {
                if let Some(p) = gc.status.borrow_mut().peer_mut(target) {
                    p.installing_snapshot = true;
                }
                return Ok(());
            }
            _ => {}
        }
        items
    };
    if !still_current(gc, target, epoch) {
        return Ok(());
    }
    let req = {
        let st = gc.status.borrow();
        AppendReq {
            group_id: gc.group_id,
            term: st.current_term,
            leader_id: gc.node_id,
            prev_log_index: prev,
            prev_log_term: prev_term,
            leader_commit: st.commit_index,
            entries,
        }
    };
    let send_time = gc.fg.shared().ts.now();
    let res = gc.transport.append(target, req, gc.cfg.rpc_timeout()).await;
    if !still_current(gc, target, epoch) {
        return Ok(());
    }
    let resp = match res {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(group_id = gc.group_id, target, error = %e, "append rpc failed");
            gc.fg.sleep(gc.cfg.heartbeat_interval()).await?;
            return Ok(());
        }
    };
    if resp.term > gc.status.borrow().current_term {
        vote::observe_term(gc, resp.term, None).await?;
        return Ok(());
    }
    match resp.code {
        AppendCode::Success => on_append_success(gc, target, resp.last_log_index, send_time),
        AppendCode::LogNotMatch | AppendCode::PrevLogIndexLessThanLocalCommit => {
            tracing::info!(
                group_id = gc.group_id,
                target,
                suggest_index = resp.suggest_index,
                code = ?resp.code,
                "peer log mismatch, backtracking"
            );
            if let Some(p) = gc.status.borrow_mut().peer_mut(target) {
                p.next_index = resp.suggest_index + 1;
            }
        }
        AppendCode::InstallSnapshot => {
            if let Some(p) = gc.status.borrow_mut().peer_mut(target) {
                p.installing_snapshot = true;
            }
        }
        AppendCode::ReqError | AppendCode::NotMemberInGroup | AppendCode::ServerError => {
            tracing::warn!(group_id = gc.group_id, target, code = ?resp.code, "append rejected");
            gc.fg.sleep(gc.cfg.heartbeat_interval()).await?;
        }
    }
    Ok(())
}

fn on_append_success(
    gc: &Rc<GroupComponents>,
    target: NodeId,
    last_log_index: u64,
    send_time: Instant,
) {
    let advanced = {
        let mut st = gc.status.borrow_mut();
        let mut advanced = false;
        if let Some(p) = st.peer_mut(target) {
            if p.last_confirm_req.map(|t| t < send_time).unwrap_or(true) {
                p.last_confirm_req = Some(send_time);
            }
            if last_log_index > p.match_index {
                p.match_index = last_log_index;
                advanced = true;
            }
            if last_log_index + 1 > p.next_index {
                p.next_index = last_log_index + 1;
            }
        }
        let now = gc.fg.shared().ts.now();
        st.update_lease(now);
        advanced
    };
    // a lease refresh alone also matters to readers
    gc.publish_status();
    if advanced {
        gc.persist_cond.signal_all();
    }
}

/// Ship a full snapshot to one peer, chunk by chunk. Any failure abandons the
/// attempt; the next loop iteration starts over from offset 0.
async fn install_snapshot_to(
    gc: &Rc<GroupComponents>,
    target: NodeId,
    epoch: u64,
) -> Result<(), RaftError> {
    let meta = {
        let st = gc.status.borrow();
        SnapshotMeta {
            last_included_index: st.last_applied,
            last_included_term: st.last_applied_term,
            members: st.member_sets(),
        }
    };
    tracing::info!(
        group_id = gc.group_id,
        target,
        last_included_index = meta.last_included_index,
        "start snapshot transfer"
    );
    let snap = match gc.state_machine.take_snapshot(meta).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(group_id = gc.group_id, error = %e, "take snapshot failed");
            gc.fg.sleep(gc.cfg.heartbeat_interval()).await?;
            return Ok(());
        }
    };
    let meta = snap.meta().clone();
    let mut offset = 0u64;
    loop {
        if !still_current(gc, target, epoch) {
            return Ok(());
        }
        let chunk = match snap.read_next(gc.cfg.snapshot_chunk_bytes as usize).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(group_id = gc.group_id, error = %e, "snapshot read failed");
                return Ok(());
            }
        };
        let chunk_len = chunk.data.len() as u64;
        let req = InstallSnapshotReq {
            group_id: gc.group_id,
            term: gc.status.borrow().current_term,
            leader_id: gc.node_id,
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            offset,
            members: if offset == 0 { Some(meta.members.clone()) } else { None },
            data: chunk.data,
            done: chunk.done,
        };
        let res = gc
            .transport
            .install_snapshot(target, req, gc.cfg.rpc_timeout())
            .await;
        if !still_current(gc, target, epoch) {
            return Ok(());
        }
        let resp = match res {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(group_id = gc.group_id, target, error = %e, "install rpc failed");
                gc.fg.sleep(gc.cfg.heartbeat_interval()).await?;
                return Ok(());
            }
        };
        if resp.term > gc.status.borrow().current_term {
            vote::observe_term(gc, resp.term, None).await?;
            return Ok(());
        }
        if !resp.success {
            tracing::warn!(group_id = gc.group_id, target, "install chunk rejected, restarting");
            gc.fg.sleep(gc.cfg.heartbeat_interval()).await?;
            return Ok(());
        }
        offset += chunk_len;
        if chunk.done {
            {
                let mut st = gc.status.borrow_mut();
                if let Some(p) = st.peer_mut(target) {
                    p.installing_snapshot = false;
                    if meta.last_included_index > p.match_index {
                        p.match_index = meta.last_included_index;
                    }
                    p.next_index = meta.last_included_index + 1;
                }
            }
            gc.persist_cond.signal_all();
            tracing::info!(group_id = gc.group_id, target, "snapshot transfer complete");
            return Ok(());
        }
    }
}
