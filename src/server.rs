//! The multi-group raft server: owns the dispatcher threads, hosts groups,
//! routes inbound RPCs and serializes admin operations.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;

use crate::config::GroupConfig;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::fiber::ChannelSender;
use crate::fiber::Dispatcher;
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
use crate::raft;
use crate::raft::entry::PendingStat;
use crate::raft::read;
use crate::raft::status::ShareStatus;
use crate::raft::task::SubmitTask;
use crate::raft::GroupMsg;
use crate::sm::StateMachine;
use crate::storage::RaftLog;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;

/// Client- and transport-facing handle to one hosted group. Cheap to clone;
/// usable from any thread.
#[derive(Clone)]
pub struct RaftGroupHandle {
    group_id: GroupId,
    cfg: Arc<RaftConfig>,
    rpc_tx: ChannelSender<GroupMsg>,
    submit_tx: ChannelSender<SubmitTask>,
    share_rx: watch::Receiver<ShareStatus>,
    pending: Arc<PendingStat>,
}

impl RaftGroupHandle {
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// The latest published status snapshot.
    pub fn status(&self) -> ShareStatus {
        self.share_rx.borrow().clone()
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_status<F>(&self, mut pred: F) -> Result<ShareStatus, RaftError>
    where
        F: FnMut(&ShareStatus) -> bool,
    {
        let mut rx = self.share_rx.clone();
        loop {
            {
                let s = rx.borrow_and_update();
                if pred(&s) {
                    return Ok(s.clone());
                }
            }
            rx.changed().await.map_err(|_| RaftError::GroupStopped)?;
        }
    }

    /// Propose one entry and wait for the state machine output. Rejected up
    /// front when the group's pending budget is exhausted.
    pub async fn submit(&self, data: Vec<u8>) -> Result<Vec<u8>, RaftError> {
        let bytes = data.len() as u64;
        let tasks = self.pending.tasks();
        let pending_bytes = self.pending.bytes();
        if tasks >= self.cfg.max_pending_tasks as u64
            || pending_bytes + bytes > self.cfg.max_pending_bytes
        {
            return Err(RaftError::FlowControlExceeded {
                group_id: self.group_id,
                tasks: tasks as i64,
                bytes: pending_bytes as i64,
            });
        }
        self.pending.incr(bytes);
        let (tx, rx) = oneshot::channel();
        self.submit_tx.send(SubmitTask::Propose { data, resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    /// A linearizable read index. The fast path answers from the published
    /// lease without entering the dispatcher.
    pub async fn read_index(&self) -> Result<LogIndex, RaftError> {
        if let Some(idx) = read::lease_read_index(&self.share_rx.borrow(), Instant::now()) {
            return Ok(idx);
        }
        let (tx, rx) = oneshot::channel();
        self.submit_tx.send(SubmitTask::ReadIndex { resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    async fn rpc<T>(&self, msg: GroupMsg, rx: oneshot::Receiver<T>) -> Result<T, RaftError> {
        self.rpc_tx.send(msg);
        rx.await.map_err(|_| RaftError::GroupStopped)
    }
}

/// Hosts raft groups across a fixed pool of dispatcher threads.
pub struct RaftServer {
    cfg: Arc<RaftConfig>,
    dispatchers: Vec<Dispatcher>,
    groups: StdMutex<HashMap<GroupId, RaftGroupHandle>>,
    /// Structural changes (membership, transfer, group add/remove) run one
    /// at a time.
    change_lock: Mutex<()>,
}

impl RaftServer {
    pub fn new(cfg: RaftConfig) -> std::io::Result<RaftServer> {
        let cfg = Arc::new(cfg);
        let mut dispatchers = Vec::with_capacity(cfg.dispatchers);
        for i in 0..cfg.dispatchers {
            dispatchers.push(Dispatcher::spawn(format!("fibraft-{}-{}", cfg.node_id, i))?);
        }
        Ok(RaftServer {
            cfg,
            dispatchers,
            groups: StdMutex::new(HashMap::new()),
            change_lock: Mutex::new(()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.cfg
    }

    fn groups_guard(&self) -> std::sync::MutexGuard<'_, HashMap<GroupId, RaftGroupHandle>> {
        match self.groups.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub fn group(&self, group_id: GroupId) -> Result<RaftGroupHandle, RaftError> {
        self.groups_guard()
            .get(&group_id)
            .cloned()
            .ok_or(RaftError::GroupNotFound(group_id))
    }

    /// Start hosting a group. Resolves once storage init completed and the
    /// group's fibers run.
    pub async fn add_group(
        &self,
        group_cfg: GroupConfig,
        raft_log: Box<dyn RaftLog>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<RaftGroupHandle, RaftError> {
        let _g = self.change_lock.lock().await;
        let group_id = group_cfg.group_id;
        if self.groups_guard().contains_key(&group_id) {
            return Err(RaftError::ChangeRejected(format!("group {} already hosted", group_id)));
        }
        let slot = self.groups_guard().len() % self.dispatchers.len();
        let deps = raft::GroupDeps {
            cfg: self.cfg.clone(),
            group_cfg,
            raft_log,
            state_machine,
            transport,
        };
        let (tx, rx) = oneshot::channel();
        self.dispatchers[slot].create_group(format!("raft-{}", group_id), move |fg| {
            raft::start_group(fg, deps, tx);
        });
        let parts = rx.await.map_err(|_| RaftError::GroupStopped)??;
        let handle = RaftGroupHandle {
            group_id,
            cfg: self.cfg.clone(),
            rpc_tx: parts.rpc_tx,
            submit_tx: parts.submit_tx,
            share_rx: parts.share_rx,
            pending: parts.pending,
        };
        self.groups_guard().insert(group_id, handle.clone());
        tracing::info!(group_id, node_id = self.cfg.node_id, "group added");
        Ok(handle)
    }

    /// Stop hosting a group and flush its pending work.
    pub async fn remove_group(&self, group_id: GroupId) -> Result<(), RaftError> {
        let _g = self.change_lock.lock().await;
        let handle = self
            .groups_guard()
            .remove(&group_id)
            .ok_or(RaftError::GroupNotFound(group_id))?;
        handle.submit_tx.send(SubmitTask::Stop);
        tracing::info!(group_id, node_id = self.cfg.node_id, "group removed");
        Ok(())
    }

    /// Begin a joint-consensus change toward the given member/observer sets.
    /// Resolves with the log index the prepare entry applied at.
    pub async fn prepare_change(
        &self,
        group_id: GroupId,
        members: BTreeSet<NodeId>,
        observers: BTreeSet<NodeId>,
    ) -> Result<LogIndex, RaftError> {
        let _g = self.change_lock.lock().await;
        let h = self.group(group_id)?;
        let (tx, rx) = oneshot::channel();
        h.submit_tx.send(SubmitTask::PrepareChange { members, observers, resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    /// Finish an in-flight change: the prepared sets become the only sets.
    pub async fn commit_change(&self, group_id: GroupId) -> Result<LogIndex, RaftError> {
        let _g = self.change_lock.lock().await;
        let h = self.group(group_id)?;
        let (tx, rx) = oneshot::channel();
        h.submit_tx.send(SubmitTask::CommitChange { resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    /// Abandon an in-flight change, restoring the old sets.
    pub async fn abort_change(&self, group_id: GroupId) -> Result<LogIndex, RaftError> {
        let _g = self.change_lock.lock().await;
        let h = self.group(group_id)?;
        let (tx, rx) = oneshot::channel();
        h.submit_tx.send(SubmitTask::AbortChange { resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    /// Hand leadership to `target` once it caught up.
    pub async fn transfer_leader(
        &self,
        group_id: GroupId,
        target: NodeId,
    ) -> Result<(), RaftError> {
        let _g = self.change_lock.lock().await;
        let h = self.group(group_id)?;
        let (tx, rx) = oneshot::channel();
        h.submit_tx.send(SubmitTask::TransferLeader { target, resp: tx });
        rx.await.map_err(|_| RaftError::GroupStopped)?
    }

    // Transport ingress: implementations deliver decoded RPCs here.

    pub async fn handle_vote(&self, req: VoteReq) -> Result<VoteResp, RaftError> {
        let h = self.group(req.group_id)?;
        let (tx, rx) = oneshot::channel();
        h.rpc(GroupMsg::Vote(req, tx), rx).await
    }

    pub async fn handle_append(&self, req: AppendReq) -> Result<AppendResp, RaftError> {
        let h = self.group(req.group_id)?;
        let (tx, rx) = oneshot::channel();
        h.rpc(GroupMsg::Append(req, tx), rx).await
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotReq,
    ) -> Result<InstallSnapshotResp, RaftError> {
        let h = self.group(req.group_id)?;
        let (tx, rx) = oneshot::channel();
        h.rpc(GroupMsg::Install(req, tx), rx).await
    }

    pub async fn handle_query_status(
        &self,
        req: QueryStatusReq,
    ) -> Result<QueryStatusResp, RaftError> {
        let h = self.group(req.group_id)?;
        let (tx, rx) = oneshot::channel();
        h.rpc(GroupMsg::Query(req, tx), rx).await
    }

    pub async fn handle_transfer_leader(&self, req: TransferLeaderReq) -> Result<(), RaftError> {
        let h = self.group(req.group_id)?;
        let (tx, rx) = oneshot::channel();
        h.rpc(GroupMsg::Transfer(req, tx), rx).await?
    }

    /// Stop every group and wait for the dispatcher threads to exit.
    pub fn shutdown(&self) {
        self.groups_guard().clear();
        for d in &self.dispatchers {
            d.request_shutdown();
        }
        for d in &self.dispatchers {
            d.join();
        }
    }
}
