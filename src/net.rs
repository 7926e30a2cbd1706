//! RPC message types and the transport collaborator.
//!
//! Byte-level encoding and connection management are outside this crate; a
//! [`Transport`] implementation owns both. Transport failures surface as
//! failed futures, never as panics inside a fiber.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::error::NetError;
use crate::raft::entry::LogItem;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReq {
    pub group_id: GroupId,
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Pre-vote probes the next term without mutating any persistent state.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResp {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    /// Empty for a heartbeat.
    pub entries: Vec<LogItem>,
}

/// Outcome codes of AppendEntries processing on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendCode {
    Success,
    /// `(prev_log_index, prev_log_term)` not found locally; the response
    /// carries a suggested retry position.
    LogNotMatch,
    /// Truncating below the local commit index is never allowed.
    PrevLogIndexLessThanLocalCommit,
    /// Stale term or malformed request.
    ReqError,
    /// No matching position exists at all; the leader must ship a snapshot.
    InstallSnapshot,
    NotMemberInGroup,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResp {
    pub term: Term,
    pub code: AppendCode,
    /// Receiver's last durable log index on success.
    pub last_log_index: LogIndex,
    /// On `LogNotMatch`, the latest `(term, index)` position at which the
    /// receiver's log agrees with the request, for nextIndex backtracking.
    pub suggest_term: Term,
    pub suggest_index: LogIndex,
}

impl AppendResp {
    pub fn success(term: Term, last_log_index: LogIndex) -> Self {
        Self {
            term,
            code: AppendCode::Success,
            last_log_index,
            suggest_term: 0,
            suggest_index: 0,
        }
    }

    pub fn fail(term: Term, code: AppendCode) -> Self {
        Self {
            term,
            code,
            last_log_index: 0,
            suggest_term: 0,
            suggest_index: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotReq {
    pub group_id: GroupId,
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub offset: u64,
    /// Full membership metadata, present on chunk 0 only.
    pub members: Option<crate::raft::entry::MemberSets>,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResp {
    pub term: Term,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatusReq {
    pub group_id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStatusResp {
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub members: BTreeSet<NodeId>,
    pub observers: BTreeSet<NodeId>,
}

/// Nudges the target to start an election immediately, sent by a leader
/// stepping down during leadership transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeaderReq {
    pub group_id: GroupId,
    pub term: Term,
    pub old_leader: NodeId,
    pub new_leader: NodeId,
    /// The transfer is only valid if the target's log reaches this index.
    pub log_index: LogIndex,
}

/// Per-peer request/response messaging.
///
/// Implementations must be callable from dispatcher threads without
/// blocking; the returned futures complete on arbitrary threads and re-enter
/// the group through its waker.
pub trait Transport: Send + Sync + 'static {
    fn vote(
        &self,
        target: NodeId,
        req: VoteReq,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<VoteResp, NetError>>;

    fn append(
        &self,
        target: NodeId,
        req: AppendReq,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<AppendResp, NetError>>;

    fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotReq,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<InstallSnapshotResp, NetError>>;

    fn query_status(
        &self,
        target: NodeId,
        req: QueryStatusReq,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<QueryStatusResp, NetError>>;

    fn transfer_leader(
        &self,
        target: NodeId,
        req: TransferLeaderReq,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<(), NetError>>;
}
