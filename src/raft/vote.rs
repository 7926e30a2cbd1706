//! Election: pre-vote and vote rounds, role transitions, vote persistence.
//!
//! Every round carries a `vote_id`; a response whose id no longer matches the
//! active round is dropped, which is the only cancellation mechanism needed.
//! A real vote mutates persistent state through `save_vote_state` and the
//! write completes before any vote RPC or response leaves this node.

use std::collections::BTreeSet;
use std::rc::Rc;

use crate::error::RaftError;
use crate::net::TransferLeaderReq;
use crate::net::VoteReq;
use crate::net::VoteResp;
use crate::quorum;
use crate::raft::entry::Payload;
use crate::raft::replicate;
use crate::raft::status::RaftRole;
use crate::raft::status::RaftStatus;
use crate::raft::task;
use crate::raft::GroupComponents;
use crate::NodeId;

pub(crate) struct VoteState {
    pub voting: bool,
    pub pre_vote: bool,
    pub vote_id: u64,
    pub votes: BTreeSet<NodeId>,
    pub pending: usize,
}

impl VoteState {
    pub(crate) fn new() -> Self {
        Self {
            voting: false,
            pre_vote: false,
            vote_id: 0,
            votes: BTreeSet::new(),
            pending: 0,
        }
    }
}

pub(crate) fn cancel_vote(gc: &GroupComponents, reason: &str) {
    let mut v = gc.vote.borrow_mut();
    if v.voting {
        tracing::info!(group_id = gc.group_id, vote_id = v.vote_id, reason, "cancel vote round");
        v.voting = false;
        v.vote_id += 1;
        v.votes.clear();
        v.pending = 0;
    }
}

fn vote_success(st: &RaftStatus, votes: &BTreeSet<NodeId>) -> bool {
    quorum::is_joint_quorum(&st.members, &st.prepared_members, votes)
}

/// Adopt a higher term seen from any peer: step down, clear the vote, flush
/// everything keyed to the old leadership, persist.
pub(crate) async fn observe_term(
    gc: &Rc<GroupComponents>,
    term: u64,
    leader: Option<NodeId>,
) -> Result<(), RaftError> {
    {
        let st = gc.status.borrow();
        if term <= st.current_term {
            return Ok(());
        }
        tracing::info!(
            group_id = gc.group_id,
            old_term = st.current_term,
            new_term = term,
            "observed higher term"
        );
    }
    cancel_vote(gc, "higher term");
    let was_leader = {
        let mut st = gc.status.borrow_mut();
        let was_leader = st.role == RaftRole::Leader;
        st.current_term = term;
        st.voted_for = None;
        st.leader = leader;
        if st.role != RaftRole::Observer {
            st.role = RaftRole::Follower;
        }
        st.group_ready_index = 0;
        st.lease_start = None;
        st.transfer_target = None;
        st.last_elect_time = gc.fg.shared().ts.now();
        for p in st.peers.values_mut() {
            p.repl_epoch += 1;
        }
        st.mark_dirty();
        was_leader
    };
    if was_leader {
        task::flush_pending(gc, "lost leadership");
    }
    gc.commit.borrow_mut().flush_resp_queue();
    gc.raft_log
        .save_vote_state(term, None)
        .await
        .map_err(RaftError::Storage)?;
    gc.publish_status();
    Ok(())
}

/// A leader of the same term exists; candidates and voting rounds yield.
pub(crate) fn observe_leader(gc: &GroupComponents, leader: NodeId) {
    cancel_vote(gc, "leader active");
    let mut st = gc.status.borrow_mut();
    if st.role == RaftRole::Candidate {
        st.role = RaftRole::Follower;
    }
    if st.leader != Some(leader) {
        st.leader = Some(leader);
        st.mark_dirty();
    }
    st.last_elect_time = gc.fg.shared().ts.now();
}

fn to_leader(gc: &Rc<GroupComponents>) {
    {
        let mut st = gc.status.borrow_mut();
        tracing::info!(
            group_id = gc.group_id,
            node_id = gc.node_id,
            term = st.current_term,
            "become leader"
        );
        st.role = RaftRole::Leader;
        st.leader = Some(gc.node_id);
        st.group_ready_index = st.last_log_index + 1;
        st.transfer_target = None;
        st.lease_start = None;
        st.reset_peer_cursors();
        st.mark_dirty();
    }
    {
        let mut v = gc.vote.borrow_mut();
        v.voting = false;
        v.vote_id += 1;
        v.votes.clear();
        v.pending = 0;
    }
    // the empty own-term entry that makes direct commit possible
    task::submit_internal(gc, Payload::Heartbeat, None);
    replicate::start_replicate_fibers(gc);
    gc.publish_status();
}

/// The election timer. Sleeps until the randomized deadline, then starts a
/// pre-vote round if this node may stand for election.
pub(crate) async fn vote_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        let jitter = gc.cfg.new_rand_elect_timeout();
        let now = gc.fg.shared().ts.now();
        let deadline = gc.status.borrow().last_elect_time + jitter;
        if now < deadline {
            gc.fg.sleep(deadline - now).await?;
            continue;
        }
        let eligible = {
            let st = gc.status.borrow();
            st.role != RaftRole::Leader
                && st.role != RaftRole::Observer
                && st.is_voting_member(gc.node_id)
                && !st.installing_snapshot
                && !gc.vote.borrow().voting
        };
        gc.status.borrow_mut().last_elect_time = now;
        if eligible {
            start_pre_vote(&gc);
        }
    }
}

fn vote_targets(st: &RaftStatus, self_id: NodeId) -> Vec<NodeId> {
    let mut ids: BTreeSet<NodeId> = st.members.clone();
    ids.extend(&st.prepared_members);
    ids.remove(&self_id);
    ids.into_iter().collect()
}

fn start_pre_vote(gc: &Rc<GroupComponents>) {
    let (req, targets, vote_id) = {
        let st = gc.status.borrow();
        let mut v = gc.vote.borrow_mut();
        v.voting = true;
        v.pre_vote = true;
        v.vote_id += 1;
        v.votes.clear();
        v.votes.insert(gc.node_id);
        let targets = vote_targets(&st, gc.node_id);
        v.pending = targets.len();
        let req = VoteReq {
            group_id: gc.group_id,
            term: st.current_term + 1,
            candidate_id: gc.node_id,
            last_log_index: st.last_log_index,
            last_log_term: st.last_log_term,
            pre_vote: true,
        };
        (req, targets, v.vote_id)
    };
    tracing::info!(
        group_id = gc.group_id,
        term = req.term,
        vote_id,
        "start pre-vote"
    );
    if targets.is_empty() {
        // single voter: pre-vote trivially succeeds
        let gc2 = gc.clone();
        super::spawn_raft(gc, "pre-vote-self", true, async move {
            start_real_vote(&gc2).await
        });
        return;
    }
    for target in targets {
        let gc2 = gc.clone();
        let req2 = req.clone();
        super::spawn_raft(
            gc,
            format!("vote-resp-{}", target),
            true,
            async move { vote_resp_fiber(gc2, target, req2, vote_id).await },
        );
    }
}

async fn start_real_vote(gc: &Rc<GroupComponents>) -> Result<(), RaftError> {
    let (req, targets, vote_id) = {
        let mut st = gc.status.borrow_mut();
        let mut v = gc.vote.borrow_mut();
        st.current_term += 1;
        st.voted_for = Some(gc.node_id);
        st.role = RaftRole::Candidate;
        st.leader = None;
        st.mark_dirty();
        v.voting = true;
        v.pre_vote = false;
        v.vote_id += 1;
        v.votes.clear();
        v.votes.insert(gc.node_id);
        let targets = vote_targets(&st, gc.node_id);
        v.pending = targets.len();
        let req = VoteReq {
            group_id: gc.group_id,
            term: st.current_term,
            candidate_id: gc.node_id,
            last_log_index: st.last_log_index,
            last_log_term: st.last_log_term,
            pre_vote: false,
        };
        (req, targets, v.vote_id)
    };
    tracing::info!(group_id = gc.group_id, term = req.term, vote_id, "start vote");
    // the vote for self must be durable before any vote RPC is sent
    if let Err(e) = gc.raft_log.save_vote_state(req.term, Some(gc.node_id)).await {
        // abandon the round so the next election timeout can stand again
        cancel_vote(gc, "vote persist failed");
        return Err(RaftError::Storage(e));
    }
    if gc.vote.borrow().vote_id != vote_id {
        return Ok(());
    }
    gc.publish_status();
    if vote_success(&gc.status.borrow(), &gc.vote.borrow().votes) {
        to_leader(gc);
        return Ok(());
    }
    for target in targets {
        let gc2 = gc.clone();
        let req2 = req.clone();
        super::spawn_raft(
            gc,
            format!("vote-resp-{}", target),
            true,
            async move { vote_resp_fiber(gc2, target, req2, vote_id).await },
        );
    }
    Ok(())
}

/// One peer's slice of a vote round: send, await, tally.
async fn vote_resp_fiber(
    gc: Rc<GroupComponents>,
    target: NodeId,
    req: VoteReq,
    vote_id: u64,
) -> Result<(), RaftError> {
    let res = gc.transport.vote(target, req.clone(), gc.cfg.rpc_timeout()).await;
    if gc.vote.borrow().vote_id != vote_id {
        return Ok(());
    }
    let resp = match res {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(group_id = gc.group_id, target, error = %e, "vote rpc failed");
            desc_pending(&gc, vote_id);
            return Ok(());
        }
    };
    if resp.term > gc.status.borrow().current_term {
        cancel_vote(&gc, "higher term in vote response");
        observe_term(&gc, resp.term, None).await?;
        return Ok(());
    }
    let (granted_quorum, pre_vote) = {
        let mut v = gc.vote.borrow_mut();
        if resp.vote_granted {
            v.votes.insert(target);
        } else {
            tracing::debug!(group_id = gc.group_id, target, "vote not granted");
        }
        let st = gc.status.borrow();
        (vote_success(&st, &v.votes), v.pre_vote)
    };
    if granted_quorum {
        if pre_vote {
            start_real_vote(&gc).await?;
        } else {
            to_leader(&gc);
        }
        return Ok(());
    }
    desc_pending(&gc, vote_id);
    Ok(())
}

/// One fewer response outstanding; if the round ran out of peers without a
/// quorum, cancel it and push the election timer so we do not hot-loop.
fn desc_pending(gc: &GroupComponents, vote_id: u64) {
    let exhausted = {
        let mut v = gc.vote.borrow_mut();
        if v.vote_id != vote_id {
            return;
        }
        v.pending = v.pending.saturating_sub(1);
        v.pending == 0 && v.voting
    };
    if exhausted {
        cancel_vote(gc, "not enough votes");
        gc.status.borrow_mut().last_elect_time = gc.fg.shared().ts.now();
    }
}

fn log_up_to_date(st: &RaftStatus, req: &VoteReq) -> bool {
    req.last_log_term > st.last_log_term
        || (req.last_log_term == st.last_log_term && req.last_log_index >= st.last_log_index)
}

/// Follower side of RequestVote.
pub(crate) async fn handle_vote_req(
    gc: &Rc<GroupComponents>,
    req: VoteReq,
) -> Result<VoteResp, RaftError> {
    if req.pre_vote {
        let st = gc.status.borrow();
        if req.term < st.current_term {
            return Ok(VoteResp { term: st.current_term, vote_granted: false });
        }
        // do not help depose a live leader
        let leader_fresh = st.leader.is_some()
            && gc.fg.shared().ts.elapsed_since(st.last_elect_time) < st.elect_timeout;
        let grant = log_up_to_date(&st, &req) && !leader_fresh;
        return Ok(VoteResp { term: st.current_term, vote_granted: grant });
    }

    if req.term > gc.status.borrow().current_term {
        observe_term(gc, req.term, None).await?;
    }
    let (term, grant) = {
        let st = gc.status.borrow();
        if req.term < st.current_term {
            (st.current_term, false)
        } else {
            let free = st.voted_for.is_none() || st.voted_for == Some(req.candidate_id);
            (st.current_term, free && log_up_to_date(&st, &req))
        }
    };
    if !grant {
        return Ok(VoteResp { term, vote_granted: false });
    }
    cancel_vote(gc, "granting vote");
    {
        let mut st = gc.status.borrow_mut();
        st.voted_for = Some(req.candidate_id);
        st.last_elect_time = gc.fg.shared().ts.now();
        st.mark_dirty();
    }
    // persisted before the response is observable
    gc.raft_log
        .save_vote_state(term, Some(req.candidate_id))
        .await
        .map_err(RaftError::Storage)?;
    gc.publish_status();
    tracing::info!(
        group_id = gc.group_id,
        term,
        candidate = req.candidate_id,
        "vote granted"
    );
    Ok(VoteResp { term, vote_granted: true })
}

/// Receiver side of a leadership transfer: stand for election right away,
/// skipping pre-vote, provided the log caught up to the old leader.
pub(crate) async fn handle_transfer_req(
    gc: &Rc<GroupComponents>,
    req: TransferLeaderReq,
) -> Result<(), RaftError> {
    {
        let st = gc.status.borrow();
        if req.term != st.current_term || st.role == RaftRole::Leader {
            return Err(RaftError::ChangeRejected("transfer term mismatch".to_string()));
        }
        if st.last_log_index < req.log_index {
            return Err(RaftError::ChangeRejected("transfer target log behind".to_string()));
        }
        if !st.is_voting_member(gc.node_id) {
            return Err(RaftError::NotMember { group_id: gc.group_id, node_id: gc.node_id });
        }
    }
    cancel_vote(gc, "leadership transfer");
    start_real_vote(gc).await
}
