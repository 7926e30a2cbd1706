//! Per-group consensus engine.
//!
//! One raft group is a set of fibers sharing [`GroupComponents`] on a single
//! dispatcher thread. All mutation of [`RaftStatus`] happens on that thread;
//! other threads reach the group only through its channels and see state only
//! through the published [`ShareStatus`].

pub mod append;
pub mod apply;
pub mod commit;
pub mod entry;
pub mod member;
pub mod read;
pub mod replicate;
pub mod status;
pub mod task;
pub mod vote;

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::config::GroupConfig;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::fiber::ChannelSender;
use crate::fiber::FiberChannel;
use crate::fiber::FiberCondition;
use crate::fiber::FiberGroup;
use crate::net::AppendReq;
use crate::net::AppendResp;
use crate::net::InstallSnapshotReq;
use crate::net::InstallSnapshotResp;
use crate::net::QueryStatusReq;
use crate::net::QueryStatusResp;
use crate::net::Transport;
use crate::net::TransferLeaderReq;
use crate::net::VoteReq;
use crate::net::VoteResp;
use crate::raft::commit::CommitState;
use crate::raft::entry::PendingStat;
use crate::raft::status::RaftStatus;
use crate::raft::status::ShareStatus;
use crate::raft::task::SubmitTask;
use crate::raft::task::TaskState;
use crate::raft::vote::VoteState;
use crate::sm::StateMachine;
use crate::storage::RaftLog;
use crate::GroupId;
use crate::NodeId;

/// An inbound RPC handed to the group's rpc fiber.
pub(crate) enum GroupMsg {
    Vote(VoteReq, oneshot::Sender<VoteResp>),
    Append(AppendReq, oneshot::Sender<AppendResp>),
    Install(InstallSnapshotReq, oneshot::Sender<InstallSnapshotResp>),
    Query(QueryStatusReq, oneshot::Sender<QueryStatusResp>),
    Transfer(TransferLeaderReq, oneshot::Sender<Result<(), RaftError>>),
}

/// Everything the fibers of one group share.
pub(crate) struct GroupComponents {
    pub cfg: Arc<RaftConfig>,
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub fg: Rc<FiberGroup>,

    pub status: RefCell<RaftStatus>,
    pub vote: RefCell<VoteState>,
    pub commit: RefCell<CommitState>,
    pub tasks: RefCell<TaskState>,

    pub raft_log: Box<dyn RaftLog>,
    pub state_machine: Box<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,

    pub share_tx: watch::Sender<ShareStatus>,
    pub pending: Arc<PendingStat>,

    pub rpc_chan: FiberChannel<GroupMsg>,
    pub submit_chan: FiberChannel<SubmitTask>,

    /// Signaled when new entries were buffered for the log-append fiber.
    pub append_cond: FiberCondition,
    /// Signaled when the durable log index advances or a match index moved,
    /// waking the commit fiber.
    pub persist_cond: FiberCondition,
    /// Signaled when the commit index advances.
    pub apply_cond: FiberCondition,
    /// Signaled when the leader has new entries for its replicate fibers.
    pub repl_cond: FiberCondition,
    /// Signaled when the group becomes ready (own-term entry committed).
    pub ready_cond: FiberCondition,
    /// Signaled when the log-append fiber goes idle, so a truncate can run
    /// without racing an in-flight write.
    pub write_finish_cond: FiberCondition,
}

impl GroupComponents {
    pub(crate) fn publish_status(&self) {
        self.status.borrow_mut().copy_share_status(&self.share_tx);
    }
}

/// What the server needs to talk to a started group from other threads.
pub(crate) struct GroupHandleParts {
    pub rpc_tx: ChannelSender<GroupMsg>,
    pub submit_tx: ChannelSender<SubmitTask>,
    pub share_rx: watch::Receiver<ShareStatus>,
    pub pending: Arc<PendingStat>,
}

pub(crate) struct GroupDeps {
    pub cfg: Arc<RaftConfig>,
    pub group_cfg: GroupConfig,
    pub raft_log: Box<dyn RaftLog>,
    pub state_machine: Box<dyn StateMachine>,
    pub transport: Arc<dyn Transport>,
}

/// Spawn a consensus fiber. A non-fatal error ends that fiber only; a fatal
/// error stops the whole group.
pub(crate) fn spawn_raft<F>(gc: &Rc<GroupComponents>, name: impl Into<String>, daemon: bool, fut: F)
where
    F: Future<Output = Result<(), RaftError>> + 'static,
{
    let fg = gc.fg.clone();
    let group_id = gc.group_id;
    let fiber_name = name.into();
    let spawn_name = fiber_name.clone();
    let body = {
        let fg = fg.clone();
        async move {
            match fut.await {
                Ok(()) => {}
                Err(RaftError::GroupStopped) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(group_id, fiber = %fiber_name, error = %e, "fatal error, stopping group");
                    fg.request_stop();
                }
                Err(e) => {
                    tracing::warn!(group_id, fiber = %fiber_name, error = %e, "fiber ended with error");
                }
            }
        }
    };
    if daemon {
        fg.spawn_daemon(spawn_name, body);
    } else {
        fg.spawn(spawn_name, body);
    }
}

/// Build and start one raft group on `fg`. Runs on the dispatcher thread;
/// `ready_tx` resolves once storage init completed and all fibers run.
pub(crate) fn start_group(
    fg: &Rc<FiberGroup>,
    deps: GroupDeps,
    ready_tx: oneshot::Sender<Result<GroupHandleParts, RaftError>>,
) {
    let GroupDeps { cfg, group_cfg, raft_log, state_machine, transport } = deps;
    let group_id = group_cfg.group_id;
    let node_id = cfg.node_id;

    let rpc_chan: FiberChannel<GroupMsg> = fg.new_channel();
    let submit_chan: FiberChannel<SubmitTask> = fg.new_channel();
    let (share_tx, share_rx) = status::share_status_channel();
    let pending = PendingStat::new();

    let mut st = RaftStatus::new(group_id, node_id, fg.shared().ts.now(), cfg.elect_timeout());
    st.members = group_cfg.node_ids.iter().copied().collect();
    st.observers = group_cfg.observer_ids.iter().copied().collect();
    if st.observers.contains(&node_id) {
        st.role = status::RaftRole::Observer;
    }
    st.sync_peers();

    let parts = GroupHandleParts {
        rpc_tx: rpc_chan.sender(),
        submit_tx: submit_chan.sender(),
        share_rx,
        pending: pending.clone(),
    };

    let gc = Rc::new(GroupComponents {
        cfg,
        group_id,
        node_id,
        fg: fg.clone(),
        status: RefCell::new(st),
        vote: RefCell::new(VoteState::new()),
        commit: RefCell::new(CommitState::new()),
        tasks: RefCell::new(TaskState::new()),
        raft_log,
        state_machine,
        transport,
        share_tx,
        pending,
        rpc_chan,
        submit_chan,
        append_cond: fg.new_condition("append"),
        persist_cond: fg.new_condition("persist"),
        apply_cond: fg.new_condition("apply"),
        repl_cond: fg.new_condition("replicate"),
        ready_cond: fg.new_condition("group-ready"),
        write_finish_cond: fg.new_condition("write-finish"),
    });

    let init_gc = gc.clone();
    fg.spawn("init", async move {
        match init_group(&init_gc).await {
            Ok(()) => {
                let _ = ready_tx.send(Ok(parts));
            }
            Err(e) => {
                tracing::error!(group_id, error = %e, "group init failed, stopping group");
                init_gc.fg.request_stop();
                let _ = ready_tx.send(Err(e));
            }
        }
    });
}

async fn init_group(gc: &Rc<GroupComponents>) -> Result<(), RaftError> {
    let init = gc.raft_log.init().await.map_err(RaftError::Storage)?;
    {
        let mut st = gc.status.borrow_mut();
        st.current_term = init.current_term;
        st.voted_for = init.voted_for;
        st.last_log_index = init.last_index;
        st.last_log_term = init.last_term;
        st.last_persist_index = init.last_index;
        st.mark_dirty();
    }
    gc.publish_status();
    tracing::info!(
        group_id = gc.group_id,
        node_id = gc.node_id,
        term = gc.status.borrow().current_term,
        last_log_index = gc.status.borrow().last_log_index,
        "raft group initialized"
    );

    spawn_raft(gc, "vote", true, vote::vote_fiber(gc.clone()));
    spawn_raft(gc, "rpc", true, append::rpc_fiber(gc.clone()));
    spawn_raft(gc, "task-runner", true, task::task_fiber(gc.clone()));
    spawn_raft(gc, "log-append", true, task::log_append_fiber(gc.clone()));
    spawn_raft(gc, "commit", true, commit::commit_fiber(gc.clone()));
    spawn_raft(gc, "apply", true, apply::apply_fiber(gc.clone()));
    Ok(())
}
