//! Membership: joint-consensus prepare/commit/abort and leadership transfer.
//!
//! A change is replicated as a config entry and takes effect when that entry
//! applies. Between PrepareChange and CommitChange/AbortChange the prepared
//! sets are non-empty and every quorum check runs over both sets.

use std::collections::BTreeSet;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::fiber::WaitOutcome;
use crate::net::TransferLeaderReq;
use crate::raft::entry::MemberSets;
use crate::raft::entry::Payload;
use crate::raft::entry::TaskResponder;
use crate::raft::replicate;
use crate::raft::status::RaftRole;
use crate::raft::task;
use crate::raft::vote;
use crate::raft::GroupComponents;
use crate::LogIndex;
use crate::NodeId;

fn require_leader(gc: &GroupComponents) -> Result<(), RaftError> {
    let st = gc.status.borrow();
    if st.role != RaftRole::Leader {
        return Err(RaftError::NotLeader { group_id: gc.group_id, leader: st.leader });
    }
    Ok(())
}

pub(crate) fn prepare_change(
    gc: &Rc<GroupComponents>,
    members: BTreeSet<NodeId>,
    observers: BTreeSet<NodeId>,
    resp: oneshot::Sender<Result<LogIndex, RaftError>>,
) {
    let check = || -> Result<MemberSets, RaftError> {
        require_leader(gc)?;
        let st = gc.status.borrow();
        if !st.prepared_members.is_empty() || st.prepared_at != 0 {
            return Err(RaftError::ChangeRejected("another change is in flight".to_string()));
        }
        if members.is_empty() {
            return Err(RaftError::ChangeRejected("empty member set".to_string()));
        }
        Ok(MemberSets {
            members: st.members.clone(),
            observers: st.observers.clone(),
            prepared_members: members.clone(),
            prepared_observers: observers.clone(),
        })
    };
    match check() {
        Ok(sets) => {
            task::submit_internal(gc, Payload::PrepareChange(sets), Some(TaskResponder::Admin(resp)));
        }
        Err(e) => {
            let _ = resp.send(Err(e));
        }
    }
}

pub(crate) fn commit_change(
    gc: &Rc<GroupComponents>,
    resp: oneshot::Sender<Result<LogIndex, RaftError>>,
) {
    let check = || -> Result<MemberSets, RaftError> {
        require_leader(gc)?;
        let st = gc.status.borrow();
        if st.prepared_members.is_empty() || st.prepared_at == 0 {
            return Err(RaftError::ChangeRejected("no change in flight".to_string()));
        }
        Ok(MemberSets {
            members: st.prepared_members.clone(),
            observers: st.prepared_observers.clone(),
            prepared_members: BTreeSet::new(),
            prepared_observers: BTreeSet::new(),
        })
    };
    match check() {
        Ok(sets) => {
            task::submit_internal(gc, Payload::CommitChange(sets), Some(TaskResponder::Admin(resp)));
        }
        Err(e) => {
            let _ = resp.send(Err(e));
        }
    }
}

pub(crate) fn abort_change(
    gc: &Rc<GroupComponents>,
    resp: oneshot::Sender<Result<LogIndex, RaftError>>,
) {
    let check = || -> Result<MemberSets, RaftError> {
        require_leader(gc)?;
        let st = gc.status.borrow();
        if st.prepared_members.is_empty() {
            return Err(RaftError::ChangeRejected("no change in flight".to_string()));
        }
        Ok(MemberSets {
            members: st.members.clone(),
            observers: st.observers.clone(),
            prepared_members: BTreeSet::new(),
            prepared_observers: BTreeSet::new(),
        })
    };
    match check() {
        Ok(sets) => {
            task::submit_internal(gc, Payload::AbortChange(sets), Some(TaskResponder::Admin(resp)));
        }
        Err(e) => {
            let _ = resp.send(Err(e));
        }
    }
}

/// Make a replicated config entry effective. Runs in the apply fiber.
pub(crate) fn apply_config_change(gc: &Rc<GroupComponents>, index: LogIndex, payload: &Payload) {
    {
        let mut st = gc.status.borrow_mut();
        match payload {
            Payload::PrepareChange(sets) => {
                tracing::info!(
                    group_id = gc.group_id,
                    index,
                    prepared_members = ?sets.prepared_members,
                    "prepare config change"
                );
                st.apply_member_sets(sets);
                st.prepared_at = index;
            }
            Payload::CommitChange(sets) | Payload::AbortChange(sets) => {
                tracing::info!(group_id = gc.group_id, index, members = ?sets.members, "config change settled");
                st.apply_member_sets(sets);
                st.prepared_at = 0;
            }
            _ => return,
        }
    }
    step_down_if_removed(gc);
    if gc.status.borrow().role == RaftRole::Leader {
        // new targets need replicate fibers; removed ones lost their peer
        // entry and exit on their own
        replicate::start_replicate_fibers(gc);
    }
    gc.publish_status();
}

/// A leader that is no longer a voting member abdicates.
fn step_down_if_removed(gc: &Rc<GroupComponents>) {
    let stepped = {
        let mut st = gc.status.borrow_mut();
        if st.role != RaftRole::Leader || st.is_voting_member(gc.node_id) {
            return;
        }
        tracing::info!(group_id = gc.group_id, "removed from members, stepping down");
        st.role = if st.observers.contains(&gc.node_id) || st.prepared_observers.contains(&gc.node_id)
        {
            RaftRole::Observer
        } else {
            RaftRole::Follower
        };
        st.leader = None;
        st.lease_start = None;
        st.group_ready_index = 0;
        st.last_elect_time = gc.fg.shared().ts.now();
        for p in st.peers.values_mut() {
            p.repl_epoch += 1;
        }
        st.mark_dirty();
        true
    };
    if stepped {
        vote::cancel_vote(gc, "stepped down");
        task::flush_pending(gc, "stepped down");
    }
}

pub(crate) fn transfer_leader(
    gc: &Rc<GroupComponents>,
    target: NodeId,
    resp: oneshot::Sender<Result<(), RaftError>>,
) {
    let check = || -> Result<(), RaftError> {
        require_leader(gc)?;
        let st = gc.status.borrow();
        if !st.is_voting_member(target) || target == gc.node_id {
            return Err(RaftError::ChangeRejected(format!("invalid transfer target {}", target)));
        }
        if st.transfer_target.is_some() {
            return Err(RaftError::ChangeRejected("transfer already in flight".to_string()));
        }
        Ok(())
    };
    if let Err(e) = check() {
        let _ = resp.send(Err(e));
        return;
    }
    gc.status.borrow_mut().transfer_target = Some(target);
    let gc2 = gc.clone();
    super::spawn_raft(gc, format!("transfer-{}", target), true, async move {
        let r = run_transfer(&gc2, target).await;
        gc2.status.borrow_mut().transfer_target = None;
        let _ = resp.send(r);
        Ok(())
    });
}

/// Wait until the target caught up, then nudge it to elect itself and step
/// down locally.
async fn run_transfer(gc: &Rc<GroupComponents>, target: NodeId) -> Result<(), RaftError> {
    let timeout = gc.cfg.elect_timeout();
    let deadline = gc.fg.shared().ts.now() + timeout;
    loop {
        let (caught_up, last_index, term) = {
            let st = gc.status.borrow();
            if st.role != RaftRole::Leader || st.transfer_target != Some(target) {
                return Err(RaftError::NotLeader { group_id: gc.group_id, leader: st.leader });
            }
            let matched = st.peers.get(&target).map(|p| p.match_index).unwrap_or(0);
            (matched >= st.last_log_index, st.last_log_index, st.current_term)
        };
        if caught_up {
            let req = TransferLeaderReq {
                group_id: gc.group_id,
                term,
                old_leader: gc.node_id,
                new_leader: target,
                log_index: last_index,
            };
            gc.transport
                .transfer_leader(target, req, gc.cfg.rpc_timeout())
                .await
                .map_err(RaftError::Network)?;
            abdicate(gc, target);
            return Ok(());
        }
        let now = gc.fg.shared().ts.now();
        if now >= deadline {
            return Err(RaftError::Timeout(timeout));
        }
        let outcome = gc.persist_cond.wait_timeout(deadline - now).await?;
        if outcome == WaitOutcome::TimedOut {
            return Err(RaftError::Timeout(timeout));
        }
    }
}

fn abdicate(gc: &Rc<GroupComponents>, target: NodeId) {
    tracing::info!(group_id = gc.group_id, target, "leadership handed over");
    {
        let mut st = gc.status.borrow_mut();
        st.role = RaftRole::Follower;
        st.leader = None;
        st.lease_start = None;
        st.group_ready_index = 0;
        // give the target a full timeout to win before standing again
        st.last_elect_time = gc.fg.shared().ts.now();
        for p in st.peers.values_mut() {
            p.repl_epoch += 1;
        }
        st.mark_dirty();
    }
    task::flush_pending(gc, "leadership transferred");
    gc.publish_status();
}
