//! Lease-based linearizable reads.
//!
//! The fast path never enters the dispatcher: any thread checks the published
//! [`ShareStatus`] and, while the lease holds, uses `last_applied` as the
//! read index. The slow path queues inside the group until the lease is
//! (re)confirmed or the group becomes ready.

use std::rc::Rc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::raft::status::RaftRole;
use crate::raft::status::ShareStatus;
use crate::raft::GroupComponents;
use crate::LogIndex;

/// The lock-free read check against a published status snapshot.
pub fn lease_read_index(s: &ShareStatus, now: Instant) -> Option<LogIndex> {
    if s.role == RaftRole::Leader
        && s.group_ready
        && s.lease_end.map(|e| now < e).unwrap_or(false)
    {
        Some(s.last_applied)
    } else {
        None
    }
}

/// The in-group fallback: wait until leadership is confirmed, bounded by one
/// election timeout.
pub(crate) fn handle_read_index(
    gc: &Rc<GroupComponents>,
    resp: oneshot::Sender<Result<LogIndex, RaftError>>,
) {
    match try_read(gc) {
        Ok(Some(idx)) => {
            let _ = resp.send(Ok(idx));
            return;
        }
        Err(e) => {
            let _ = resp.send(Err(e));
            return;
        }
        Ok(None) => {}
    }
    let gc2 = gc.clone();
    super::spawn_raft(gc, "read-wait", true, async move {
        let r = wait_read(&gc2).await;
        let _ = resp.send(r);
        Ok(())
    });
}

fn try_read(gc: &GroupComponents) -> Result<Option<LogIndex>, RaftError> {
    let st = gc.status.borrow();
    if st.role != RaftRole::Leader {
        return Err(RaftError::NotLeader { group_id: gc.group_id, leader: st.leader });
    }
    let now = gc.fg.shared().ts.now();
    let lease_ok = st.lease_end().map(|e| now < e).unwrap_or(false);
    if st.group_ready() && lease_ok {
        Ok(Some(st.last_applied))
    } else {
        Ok(None)
    }
}

async fn wait_read(gc: &Rc<GroupComponents>) -> Result<LogIndex, RaftError> {
    let timeout = gc.cfg.elect_timeout();
    let deadline = gc.fg.shared().ts.now() + timeout;
    loop {
        if let Some(idx) = try_read(gc)? {
            return Ok(idx);
        }
        let now = gc.fg.shared().ts.now();
        if now >= deadline {
            return Err(RaftError::Timeout(timeout));
        }
        // lease refreshes do not signal ready_cond, so poll at heartbeat pace
        let wait = gc.cfg.heartbeat_interval().min(deadline - now);
        gc.ready_cond.wait_timeout(wait).await?;
    }
}
