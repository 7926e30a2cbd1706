//! The apply fiber: executes committed entries in strict index order, exactly
//! once, completes pending responders and publishes `last_applied`.

use std::rc::Rc;

use crate::error::Fatal;
use crate::error::RaftError;
use crate::raft::entry::Payload;
use crate::raft::entry::TaskResponder;
use crate::raft::member;
use crate::raft::task;
use crate::raft::GroupComponents;

pub(crate) async fn apply_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        loop {
            let behind = {
                let st = gc.status.borrow();
                st.last_applied < st.commit_index
            };
            if behind {
                break;
            }
            gc.apply_cond.wait().await?;
        }

        let (next, commit) = {
            let st = gc.status.borrow();
            (st.last_applied + 1, st.commit_index)
        };
        let items = gc
            .raft_log
            .read(next, gc.cfg.max_replicate_items, gc.cfg.max_replicate_bytes)
            .await
            .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
        if items.is_empty() {
            // committed entries are always durable, so this is transient
            gc.apply_cond.wait().await?;
            continue;
        }
        for item in items {
            if item.index > commit {
                break;
            }
            if item.index != gc.status.borrow().last_applied + 1 {
                return Err(RaftError::invariant(format!(
                    "apply order broken: entry {} after applied {}",
                    item.index,
                    gc.status.borrow().last_applied
                )));
            }
            let index = item.index;
            let term = item.term;
            let responder = task::take_responder(&gc, index);
            match item.payload {
                Payload::Normal(data) => {
                    let out = gc
                        .state_machine
                        .exec(index, data)
                        .await
                        .map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
                    if let Some(TaskResponder::Exec(tx)) = responder {
                        let _ = tx.send(Ok(out));
                    }
                }
                Payload::Heartbeat => {}
                p @ (Payload::PrepareChange(_)
                | Payload::CommitChange(_)
                | Payload::AbortChange(_)) => {
                    member::apply_config_change(&gc, index, &p);
                    if let Some(TaskResponder::Admin(tx)) = responder {
                        let _ = tx.send(Ok(index));
                    }
                }
            }
            {
                let mut st = gc.status.borrow_mut();
                st.last_applied = index;
                st.last_applied_term = term;
                st.mark_dirty();
            }
        }
        gc.publish_status();
    }
}
