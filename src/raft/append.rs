//! Follower-side AppendEntries and InstallSnapshot processing.
//!
//! One fiber drains the group's rpc channel and processes requests
//! sequentially, so log examination and truncation never interleave. Append
//! responses for real entries are deferred: they fire from the commit fiber
//! once the batch's last index is durable, never on mere receipt.

use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::Fatal;
use crate::error::RaftError;
use crate::net::AppendCode;
use crate::net::AppendReq;
use crate::net::AppendResp;
use crate::net::InstallSnapshotReq;
use crate::net::InstallSnapshotResp;
use crate::net::QueryStatusResp;
use crate::raft::commit::DeferredResp;
use crate::raft::entry::LogItem;
use crate::raft::task;
use crate::raft::vote;
use crate::raft::GroupComponents;
use crate::raft::GroupMsg;
use crate::LogIndex;
use crate::Term;

/// Storage failures while serving RPCs take the whole group down.
fn promote(e: RaftError) -> RaftError {
    match e {
        RaftError::Storage(s) => RaftError::Fatal(Fatal::Storage(s)),
        e => e,
    }
}

pub(crate) async fn rpc_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        let msg = gc.rpc_chan.take().await?;
        match msg {
            GroupMsg::Vote(req, tx) => {
                let resp = vote::handle_vote_req(&gc, req).await.map_err(promote)?;
                let _ = tx.send(resp);
            }
            GroupMsg::Append(req, tx) => handle_append(&gc, req, tx).await.map_err(promote)?,
            GroupMsg::Install(req, tx) => handle_install(&gc, req, tx).await.map_err(promote)?,
            GroupMsg::Query(_, tx) => {
                let _ = tx.send(query_status(&gc));
            }
            GroupMsg::Transfer(req, tx) => match vote::handle_transfer_req(&gc, req).await {
                Err(e @ RaftError::Storage(_)) => return Err(promote(e)),
                Err(e) if e.is_fatal() => return Err(e),
                r => {
                    let _ = tx.send(r);
                }
            },
        }
    }
}

fn query_status(gc: &GroupComponents) -> QueryStatusResp {
    let st = gc.status.borrow();
    QueryStatusResp {
        term: st.current_term,
        leader: st.leader,
        commit_index: st.commit_index,
        last_applied: st.last_applied,
        last_log_index: st.last_log_index,
        members: st.members.clone(),
        observers: st.observers.clone(),
    }
}

/// The term recorded at `index` in the local log. Indices below the snapshot
/// boundary cannot be asked for here; callers reject those earlier.
async fn term_at(gc: &Rc<GroupComponents>, index: LogIndex) -> Result<Term, RaftError> {
    if index == 0 {
        return Ok(0);
    }
    {
        let st = gc.status.borrow();
        if index == st.last_log_index {
            return Ok(st.last_log_term);
        }
        if index == st.last_applied {
            return Ok(st.last_applied_term);
        }
    }
    let items = gc
        .raft_log
        .read(index, 1, u64::MAX)
        .await
        .map_err(RaftError::Storage)?;
    Ok(items.first().map(|i| i.term).unwrap_or(0))
}

async fn handle_append(
    gc: &Rc<GroupComponents>,
    req: AppendReq,
    tx: oneshot::Sender<AppendResp>,
) -> Result<(), RaftError> {
    {
        let st = gc.status.borrow();
        if req.term < st.current_term {
            let _ = tx.send(AppendResp::fail(st.current_term, AppendCode::ReqError));
            return Ok(());
        }
    }
    if req.term > gc.status.borrow().current_term {
        vote::observe_term(gc, req.term, Some(req.leader_id)).await?;
    }
    vote::observe_leader(gc, req.leader_id);

    {
        let st = gc.status.borrow();
        if !st.is_any_member(gc.node_id) {
            let _ = tx.send(AppendResp::fail(st.current_term, AppendCode::NotMemberInGroup));
            return Ok(());
        }
        if st.installing_snapshot {
            let _ = tx.send(AppendResp::fail(st.current_term, AppendCode::InstallSnapshot));
            return Ok(());
        }
        // never truncate or re-examine committed entries
        if req.prev_log_index < st.commit_index {
            let mut r = AppendResp::fail(st.current_term, AppendCode::PrevLogIndexLessThanLocalCommit);
            r.suggest_index = st.commit_index;
            let _ = tx.send(r);
            return Ok(());
        }
    }

    // storage reads below see every entry once the append buffer drained
    if req.prev_log_index < gc.status.borrow().last_log_index {
        task::wait_write_finish(gc).await?;
    }

    let (prev_ok, term) = {
        let last_index = gc.status.borrow().last_log_index;
        if req.prev_log_index > last_index {
            (false, gc.status.borrow().current_term)
        } else {
            let t = term_at(gc, req.prev_log_index).await?;
            (t == req.prev_log_term, gc.status.borrow().current_term)
        }
    };
    if !prev_ok {
        let pos = gc
            .raft_log
            .try_find_match_pos(req.prev_log_term, req.prev_log_index)
            .await
            .map_err(RaftError::Storage)?;
        let resp = match pos {
            Some((t, i)) => AppendResp {
                term,
                code: AppendCode::LogNotMatch,
                last_log_index: 0,
                suggest_term: t,
                suggest_index: i,
            },
            None => AppendResp::fail(term, AppendCode::InstallSnapshot),
        };
        tracing::debug!(
            group_id = gc.group_id,
            prev_log_index = req.prev_log_index,
            prev_log_term = req.prev_log_term,
            code = ?resp.code,
            "append prev position mismatch"
        );
        let _ = tx.send(resp);
        return Ok(());
    }

    {
        let mut st = gc.status.borrow_mut();
        if req.leader_commit > st.leader_commit {
            st.leader_commit = req.leader_commit;
        }
    }

    if req.entries.is_empty() {
        // heartbeat: confirm the durable prefix that matches the leader
        let resp = {
            let st = gc.status.borrow();
            AppendResp::success(st.current_term, st.last_persist_index.min(req.prev_log_index))
        };
        let _ = tx.send(resp);
        gc.persist_cond.signal_all();
        return Ok(());
    }

    let last_entry_index = match req.entries.last() {
        Some(e) => e.index,
        None => req.prev_log_index,
    };

    // find the first entry that is actually new, truncating a conflicting tail
    let mut new_entries: Vec<LogItem> = Vec::with_capacity(req.entries.len());
    let mut conflict: Option<LogIndex> = None;
    {
        let last_index = gc.status.borrow().last_log_index;
        for e in &req.entries {
            if e.index > last_index {
                new_entries.extend(req.entries.iter().filter(|x| x.index >= e.index).cloned());
                break;
            }
            let local_term = term_at(gc, e.index).await?;
            if local_term != e.term {
                conflict = Some(e.index);
                new_entries.extend(req.entries.iter().filter(|x| x.index >= e.index).cloned());
                break;
            }
        }
    }

    if let Some(ci) = conflict {
        truncate_tail(gc, ci, &req).await?;
    }

    if new_entries.is_empty() {
        // everything already present with matching terms
        let resp = {
            let st = gc.status.borrow();
            AppendResp::success(st.current_term, st.last_persist_index.min(last_entry_index))
        };
        let _ = tx.send(resp);
        gc.persist_cond.signal_all();
        return Ok(());
    }

    {
        let mut st = gc.status.borrow_mut();
        let mut tasks = gc.tasks.borrow_mut();
        for e in new_entries {
            st.last_log_index = e.index;
            st.last_log_term = e.term;
            tasks.push_replicated(e);
        }
    }
    gc.append_cond.signal_all();

    // respond only once the last index is durable
    let term_now = gc.status.borrow().current_term;
    gc.commit.borrow_mut().resp_queue.push_back(DeferredResp {
        index: last_entry_index,
        term: term_now,
        tx,
    });
    Ok(())
}

/// Drop the local tail from `index` on. The write pipeline is already idle
/// because the caller waited for write-finish.
async fn truncate_tail(
    gc: &Rc<GroupComponents>,
    index: LogIndex,
    req: &AppendReq,
) -> Result<(), RaftError> {
    tracing::warn!(
        group_id = gc.group_id,
        truncate_from = index,
        "truncating conflicting log tail"
    );
    gc.raft_log
        .truncate_tail(index)
        .await
        .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
    let prev_term = if index - 1 == req.prev_log_index {
        req.prev_log_term
    } else {
        match req.entries.iter().find(|e| e.index == index - 1) {
            Some(e) => e.term,
            None => term_at(gc, index - 1).await?,
        }
    };
    {
        let mut st = gc.status.borrow_mut();
        st.last_log_index = index - 1;
        st.last_log_term = prev_term;
        if st.last_persist_index > index - 1 {
            st.last_persist_index = index - 1;
        }
        if st.group_ready_index > index - 1 {
            st.group_ready_index = 0;
        }
        st.mark_dirty();
    }
    // deferred responses for truncated indices would lie
    gc.commit.borrow_mut().resp_queue.retain(|r| r.index < index);
    Ok(())
}

async fn handle_install(
    gc: &Rc<GroupComponents>,
    req: InstallSnapshotReq,
    tx: oneshot::Sender<InstallSnapshotResp>,
) -> Result<(), RaftError> {
    {
        let st = gc.status.borrow();
        if req.term < st.current_term {
            let _ = tx.send(InstallSnapshotResp { term: st.current_term, success: false });
            return Ok(());
        }
    }
    if req.term > gc.status.borrow().current_term {
        vote::observe_term(gc, req.term, Some(req.leader_id)).await?;
    }
    vote::observe_leader(gc, req.leader_id);

    if req.offset == 0 {
        vote::cancel_vote(gc, "installing snapshot");
        {
            let mut st = gc.status.borrow_mut();
            st.installing_snapshot = true;
            if let Some(sets) = &req.members {
                st.apply_member_sets(sets);
                st.prepared_at = if sets.prepared_members.is_empty() {
                    0
                } else {
                    req.last_included_index
                };
            }
            st.mark_dirty();
        }
        gc.commit.borrow_mut().flush_resp_queue();
        task::wait_write_finish(gc).await?;
        gc.raft_log
            .begin_install()
            .await
            .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
        tracing::info!(
            group_id = gc.group_id,
            last_included_index = req.last_included_index,
            "begin snapshot install"
        );
    }

    let res = gc
        .state_machine
        .install_snapshot(
            req.last_included_index,
            req.last_included_term,
            req.offset,
            req.done,
            req.data,
        )
        .await;
    if let Err(e) = res {
        // leader restarts the stream from offset 0
        tracing::error!(group_id = gc.group_id, error = %e, "snapshot chunk failed");
        let term = gc.status.borrow().current_term;
        let _ = tx.send(InstallSnapshotResp { term, success: false });
        return Ok(());
    }

    if req.done {
        {
            let mut st = gc.status.borrow_mut();
            st.last_applied = req.last_included_index;
            st.last_applied_term = req.last_included_term;
            st.last_log_index = req.last_included_index;
            st.last_log_term = req.last_included_term;
            st.last_persist_index = req.last_included_index;
            if req.last_included_index > st.commit_index {
                st.commit_index = req.last_included_index;
            }
            if req.last_included_index > st.leader_commit {
                st.leader_commit = req.last_included_index;
            }
            st.installing_snapshot = false;
            st.mark_dirty();
        }
        gc.raft_log
            .finish_install(req.last_included_index + 1, req.last_included_term)
            .await
            .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
        gc.publish_status();
        tracing::info!(
            group_id = gc.group_id,
            last_included_index = req.last_included_index,
            "snapshot install finished"
        );
    }
    let term = gc.status.borrow().current_term;
    let _ = tx.send(InstallSnapshotResp { term, success: true });
    Ok(())
}
