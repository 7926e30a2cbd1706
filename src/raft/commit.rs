//! The commit manager.
//!
//! Wakes whenever the durable index or a peer's match index advances. A
//! leader counts quorum over match indices, floored at the group-ready index
//! so prior-term entries commit only transitively. A follower follows
//! `leader_commit`, and drains the deferred append responses whose entries
//! became durable.

use std::collections::VecDeque;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::net::AppendResp;
use crate::quorum;
use crate::raft::status::RaftRole;
use crate::raft::GroupComponents;
use crate::LogIndex;
use crate::Term;

/// A follower-side append response held back until the batch's last index is
/// durable.
pub(crate) struct DeferredResp {
    pub index: LogIndex,
    pub term: Term,
    pub tx: oneshot::Sender<AppendResp>,
}

pub(crate) struct CommitState {
    /// FIFO by registration, which is also index order.
    pub resp_queue: VecDeque<DeferredResp>,
}

impl CommitState {
    pub(crate) fn new() -> Self {
        Self { resp_queue: VecDeque::new() }
    }

    /// Drop every deferred response; the leader sees the rpc fail and
    /// retries. Called on term change and snapshot install.
    pub(crate) fn flush_resp_queue(&mut self) {
        self.resp_queue.clear();
    }
}

pub(crate) async fn commit_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        gc.persist_cond.wait().await?;
        on_persist_advance(&gc);
    }
}

/// One round of commit work after a wake.
pub(crate) fn on_persist_advance(gc: &Rc<GroupComponents>) {
    let became_ready = {
        let mut st = gc.status.borrow_mut();
        let was_ready = st.group_ready();
        match st.role {
            RaftRole::Leader => {
                let node_id = st.node_id;
                let persisted = st.last_persist_index;
                if let Some(p) = st.peers.get_mut(&node_id) {
                    if persisted > p.match_index {
                        p.match_index = persisted;
                    }
                }
                let now = gc.fg.shared().ts.now();
                st.update_lease(now);
                leader_try_commit(&mut st);
            }
            _ => {
                let c = st.last_persist_index.min(st.leader_commit);
                if c > st.commit_index {
                    st.commit_index = c;
                    st.mark_dirty();
                }
            }
        }
        !was_ready && st.group_ready()
    };

    drain_resp_queue(gc);

    let signal_apply = {
        let st = gc.status.borrow();
        st.commit_index > st.last_applied
    };
    if signal_apply {
        gc.apply_cond.signal_all();
    }
    if became_ready {
        tracing::info!(group_id = gc.group_id, "group ready");
        gc.ready_cond.signal_all();
    }
    gc.publish_status();
}

fn leader_try_commit(st: &mut crate::raft::status::RaftStatus) {
    let matched = |id| st.peers.get(&id).map(|p| p.match_index).unwrap_or(0);
    let idx = match quorum::joint_quorum_value(&st.members, &st.prepared_members, matched) {
        Some(i) => i,
        None => return,
    };
    // entries above the local durable index cannot be applied yet
    let idx = idx.min(st.last_persist_index);
    if idx > st.commit_index && idx >= st.group_ready_index {
        st.commit_index = idx;
        st.mark_dirty();
    }
}

/// Fire deferred append responses in index order, stopping at the first index
/// that is not yet durable. Responses registered under an older term were
/// flushed when the term changed.
fn drain_resp_queue(gc: &Rc<GroupComponents>) {
    let mut commit = gc.commit.borrow_mut();
    let st = gc.status.borrow();
    while let Some(front) = commit.resp_queue.front() {
        if front.index > st.last_persist_index {
            break;
        }
        let r = match commit.resp_queue.pop_front() {
            Some(r) => r,
            None => break,
        };
        if r.term != st.current_term {
            continue;
        }
        let _ = r.tx.send(AppendResp::success(st.current_term, r.index));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use maplit::btreeset;

    use super::*;
    use crate::raft::status::RaftStatus;

    fn leader_status(members: std::collections::BTreeSet<crate::NodeId>) -> RaftStatus {
        let mut st = RaftStatus::new(1, 1, Instant::now(), Duration::from_millis(150));
        st.members = members;
        st.sync_peers();
        st.role = RaftRole::Leader;
        st.current_term = 3;
        st
    }

    #[test]
    fn test_two_of_five_acks_do_not_commit() {
        let mut st = leader_status(btreeset! {1, 2, 3, 4, 5});
        st.last_log_index = 10;
        st.last_persist_index = 10;
        st.group_ready_index = 1;
        st.peers.get_mut(&1).unwrap().match_index = 10;
        st.peers.get_mut(&2).unwrap().match_index = 10;
        leader_try_commit(&mut st);
        assert_eq!(0, st.commit_index);

        st.peers.get_mut(&3).unwrap().match_index = 10;
        leader_try_commit(&mut st);
        assert_eq!(10, st.commit_index);
    }

    #[test]
    fn test_commit_floored_at_group_ready_index() {
        // entries 1..=4 are from an older term; the new leader's first own
        // entry is at 5 and nothing commits until it is covered
        let mut st = leader_status(btreeset! {1, 2, 3});
        st.last_log_index = 5;
        st.last_persist_index = 5;
        st.group_ready_index = 5;
        st.peers.get_mut(&1).unwrap().match_index = 5;
        st.peers.get_mut(&2).unwrap().match_index = 4;
        leader_try_commit(&mut st);
        assert_eq!(0, st.commit_index);

        st.peers.get_mut(&2).unwrap().match_index = 5;
        leader_try_commit(&mut st);
        assert_eq!(5, st.commit_index);
    }

    #[test]
    fn test_joint_commit_needs_both_sets() {
        let mut st = leader_status(btreeset! {1, 2, 3});
        st.prepared_members = btreeset! {3, 4, 5};
        st.sync_peers();
        st.last_log_index = 7;
        st.last_persist_index = 7;
        st.group_ready_index = 1;
        for id in [1, 2] {
            st.peers.get_mut(&id).unwrap().match_index = 7;
        }
        leader_try_commit(&mut st);
        // old set has quorum, prepared set does not
        assert_eq!(0, st.commit_index);

        for id in [3, 4] {
            st.peers.get_mut(&id).unwrap().match_index = 7;
        }
        leader_try_commit(&mut st);
        assert_eq!(7, st.commit_index);
    }

    #[test]
    fn test_commit_clamped_to_local_durable_index() {
        let mut st = leader_status(btreeset! {1, 2, 3});
        st.last_log_index = 9;
        st.last_persist_index = 4;
        st.group_ready_index = 1;
        for id in [1, 2, 3] {
            st.peers.get_mut(&id).unwrap().match_index = 9;
        }
        leader_try_commit(&mut st);
        assert_eq!(4, st.commit_index);
    }
}
