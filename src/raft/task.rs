//! The linear task runner: index assignment, batching, flow control.
//!
//! All submissions funnel through one fiber so index assignment is totally
//! ordered. Appends are buffered here and handed to the log-append fiber,
//! which is the only caller of `RaftLog::append`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::rc::Rc;

use tokio::sync::oneshot;

use crate::error::Fatal;
use crate::error::RaftError;
use crate::raft::entry::LogItem;
use crate::raft::entry::Payload;
use crate::raft::entry::TaskResponder;
use crate::raft::member;
use crate::raft::read;
use crate::raft::status::RaftRole;
use crate::raft::GroupComponents;
use crate::LogIndex;
use crate::NodeId;

/// A submission crossing from a client thread into the group.
pub(crate) enum SubmitTask {
    Propose {
        data: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>, RaftError>>,
    },
    ReadIndex {
        resp: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    PrepareChange {
        members: BTreeSet<NodeId>,
        observers: BTreeSet<NodeId>,
        resp: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    CommitChange {
        resp: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    AbortChange {
        resp: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    TransferLeader {
        target: NodeId,
        resp: oneshot::Sender<Result<(), RaftError>>,
    },
    Stop,
}

struct PendingEntry {
    responder: Option<TaskResponder>,
    bytes: u64,
    /// The submitting client charged the flow-control budget for this entry.
    counted: bool,
}

pub(crate) struct TaskState {
    /// Entries assigned an index but not yet handed to storage.
    append_buf: Vec<LogItem>,
    /// A storage append is in flight; truncation must wait.
    pub appending: bool,
    /// Responders keyed by log index, completed by the apply fiber.
    pending: BTreeMap<LogIndex, PendingEntry>,
}

impl TaskState {
    pub(crate) fn new() -> Self {
        Self {
            append_buf: Vec::new(),
            appending: false,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn buffered(&self) -> bool {
        !self.append_buf.is_empty()
    }

    /// Buffer an entry received from the leader, already carrying its index
    /// and term.
    pub(crate) fn push_replicated(&mut self, item: LogItem) {
        self.append_buf.push(item);
    }
}

/// Append one entry to the local log tail, buffering it for the log-append
/// fiber. Runs only on the dispatcher thread.
pub(crate) fn submit_internal(
    gc: &Rc<GroupComponents>,
    payload: Payload,
    responder: Option<TaskResponder>,
) -> LogIndex {
    let bytes = payload.bytes_len();
    // only client proposals pass the budget gate in `submit`; internal
    // entries must not release budget they never took
    let counted = matches!(payload, Payload::Normal(_));
    let index = {
        let mut st = gc.status.borrow_mut();
        let index = st.last_log_index + 1;
        st.last_log_index = index;
        st.last_log_term = st.current_term;
        let item = LogItem::new(index, st.current_term, payload);
        let mut tasks = gc.tasks.borrow_mut();
        tasks.append_buf.push(item);
        tasks.pending.insert(index, PendingEntry { responder, bytes, counted });
        index
    };
    gc.append_cond.signal_all();
    gc.repl_cond.signal_all();
    index
}

/// Fail every pending responder, used when leadership is lost or the group
/// stops.
pub(crate) fn flush_pending(gc: &Rc<GroupComponents>, reason: &str) {
    let pending = std::mem::take(&mut gc.tasks.borrow_mut().pending);
    if pending.is_empty() {
        return;
    }
    tracing::info!(group_id = gc.group_id, count = pending.len(), reason, "flush pending tasks");
    let leader = gc.status.borrow().leader;
    for (_, e) in pending {
        if e.counted {
            gc.pending.decr(e.bytes);
        }
        if let Some(r) = e.responder {
            r.fail(RaftError::NotLeader { group_id: gc.group_id, leader });
        }
    }
}

/// Complete and remove the responder registered at `index`. The apply fiber
/// owns this path.
pub(crate) fn take_responder(gc: &GroupComponents, index: LogIndex) -> Option<TaskResponder> {
    let e = gc.tasks.borrow_mut().pending.remove(&index)?;
    if e.counted {
        gc.pending.decr(e.bytes);
    }
    e.responder
}

pub(crate) async fn task_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    let mut batch = Vec::new();
    loop {
        batch.clear();
        gc.submit_chan.take_all(&mut batch).await?;
        for t in batch.drain(..) {
            match t {
                SubmitTask::Propose { data, resp } => {
                    let (is_leader, leader) = {
                        let st = gc.status.borrow();
                        (st.role == RaftRole::Leader, st.leader)
                    };
                    if !is_leader {
                        gc.pending.decr(data.len() as u64);
                        let _ = resp.send(Err(RaftError::NotLeader {
                            group_id: gc.group_id,
                            leader,
                        }));
                        continue;
                    }
                    submit_internal(&gc, Payload::Normal(data), Some(TaskResponder::Exec(resp)));
                }
                SubmitTask::ReadIndex { resp } => read::handle_read_index(&gc, resp),
                SubmitTask::PrepareChange { members, observers, resp } => {
                    member::prepare_change(&gc, members, observers, resp);
                }
                SubmitTask::CommitChange { resp } => member::commit_change(&gc, resp),
                SubmitTask::AbortChange { resp } => member::abort_change(&gc, resp),
                SubmitTask::TransferLeader { target, resp } => {
                    member::transfer_leader(&gc, target, resp);
                }
                SubmitTask::Stop => {
                    tracing::info!(group_id = gc.group_id, "group stop requested");
                    flush_pending(&gc, "group stop");
                    gc.fg.request_stop();
                    return Ok(());
                }
            }
        }
    }
}

/// The only writer of the log. Drains the append buffer, awaits durability,
/// then publishes the new persisted index to the commit fiber.
pub(crate) async fn log_append_fiber(gc: Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        while !gc.tasks.borrow().buffered() {
            gc.append_cond.wait().await?;
        }
        let items = {
            let mut tasks = gc.tasks.borrow_mut();
            tasks.appending = true;
            std::mem::take(&mut tasks.append_buf)
        };
        let res = gc.raft_log.append(items).await;
        {
            let mut tasks = gc.tasks.borrow_mut();
            tasks.appending = false;
        }
        gc.write_finish_cond.signal_all();
        let ack = res.map_err(|e| RaftError::Fatal(Fatal::Storage(e)))?;
        let persisted = if gc.cfg.sync_force { ack.force_index } else { ack.write_index };
        {
            let mut st = gc.status.borrow_mut();
            if persisted > st.last_log_index {
                return Err(RaftError::invariant(format!(
                    "persisted index {} beyond last log index {}",
                    persisted, st.last_log_index
                )));
            }
            if persisted > st.last_persist_index {
                st.last_persist_index = persisted;
            }
        }
        gc.persist_cond.signal_all();
    }
}

/// Park until no storage append is in flight and nothing is buffered, so a
/// truncate cannot race a write.
pub(crate) async fn wait_write_finish(gc: &Rc<GroupComponents>) -> Result<(), RaftError> {
    loop {
        {
            let tasks = gc.tasks.borrow();
            if !tasks.appending && !tasks.buffered() {
                return Ok(());
            }
        }
        gc.write_finish_cond.wait().await?;
    }
}
