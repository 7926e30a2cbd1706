//! Error types exposed by this crate.

use std::time::Duration;

use anyerror::AnyError;

use crate::fiber::GroupStopped;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;

/// What storage object an error is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSubject {
    /// Error about persisting term/vote state.
    Vote,

    /// Error about a single log entry.
    Log(LogIndex),

    /// Error about a range of log entries.
    Logs,

    /// Error about a snapshot.
    Snapshot,

    /// Error about the state machine.
    StateMachine,

    /// Error about the store as a whole.
    Store,
}

/// What action a storage error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerb {
    Read,
    Write,
    Delete,
    Apply,
}

/// An error that occurred in the storage layer or the state machine.
///
/// The opaque cause is carried as an [`AnyError`] so that arbitrary
/// implementations can report failures without this crate knowing their
/// concrete error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("when {verb:?} {subject:?}: {source}")]
pub struct StorageError {
    pub subject: ErrorSubject,
    pub verb: ErrorVerb,
    pub source: AnyError,
}

impl StorageError {
    pub fn new(subject: ErrorSubject, verb: ErrorVerb, source: AnyError) -> Self {
        Self { subject, verb, source }
    }

    pub fn from_io_error(subject: ErrorSubject, verb: ErrorVerb, e: std::io::Error) -> Self {
        Self::new(subject, verb, AnyError::new(&e))
    }

    pub fn read_logs(e: impl std::error::Error + 'static) -> Self {
        Self::new(ErrorSubject::Logs, ErrorVerb::Read, AnyError::new(&e))
    }

    pub fn write_logs(e: impl std::error::Error + 'static) -> Self {
        Self::new(ErrorSubject::Logs, ErrorVerb::Write, AnyError::new(&e))
    }
}

/// Transport-level failure of a single RPC.
///
/// Transport failures always surface as failed futures, never as panics
/// inside a fiber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("rpc timeout after {0:?}")]
    Timeout(Duration),

    #[error("peer {0} not found")]
    PeerNotFound(NodeId),

    #[error("peer {node} unreachable: {source}")]
    Unreachable { node: NodeId, source: AnyError },

    #[error("remote error: {0}")]
    Remote(String),
}

/// Unrecoverable error: stops scheduling of the owning group, not the process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// The error returned by user facing APIs.
///
/// Variants are typed so callers can distinguish retryable outcomes
/// (`NotLeader` with a redirect hint, `FlowControlExceeded`) from
/// non-retryable ones.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RaftError {
    #[error("not leader of group {group_id}, current leader: {leader:?}")]
    NotLeader {
        group_id: GroupId,
        leader: Option<NodeId>,
    },

    #[error("flow control exceeded for group {group_id}: pending_tasks={tasks}, pending_bytes={bytes}")]
    FlowControlExceeded {
        group_id: GroupId,
        tasks: i64,
        bytes: i64,
    },

    #[error("node {node_id} is not a member of group {group_id}")]
    NotMember { group_id: GroupId, node_id: NodeId },

    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    #[error("raft group stopped")]
    GroupStopped,

    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("config change rejected: {0}")]
    ChangeRejected(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Fatal(#[from] Fatal),
}

impl RaftError {
    /// A fatal error aborts the owning group's scheduling.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Fatal(_))
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        RaftError::Fatal(Fatal::Invariant(msg.into()))
    }
}

impl From<GroupStopped> for RaftError {
    fn from(_: GroupStopped) -> Self {
        RaftError::GroupStopped
    }
}
