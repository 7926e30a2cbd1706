//! The state machine collaborator.

use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::raft::entry::MemberSets;
use crate::raft::entry::RaftOutput;
use crate::LogIndex;
use crate::Term;

/// Metadata of a finished snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub members: MemberSets,
}

/// A lazily-read snapshot cursor. Dropping it cancels the read.
pub trait Snapshot: Send + 'static {
    fn meta(&self) -> &SnapshotMeta;

    /// Next chunk of at most `max_bytes`. `done` on the final chunk.
    fn read_next(&self, max_bytes: usize) -> BoxFuture<'static, Result<SnapshotChunk, StorageError>>;
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotChunk {
    pub data: Vec<u8>,
    pub done: bool,
}

pub trait StateMachine: Send + 'static {
    /// Apply one committed entry. Called in strict index order, exactly once
    /// per index. An error here is fatal to the group.
    fn exec(
        &self,
        index: LogIndex,
        input: Vec<u8>,
    ) -> BoxFuture<'static, Result<RaftOutput, StorageError>>;

    /// Open a snapshot cursor over current state.
    fn take_snapshot(
        &self,
        meta: SnapshotMeta,
    ) -> BoxFuture<'static, Result<Box<dyn Snapshot>, StorageError>>;

    /// Stream one received chunk in. `offset` restarts from 0 on leader
    /// retry; implementations must treat a restarted stream as replacing any
    /// partial state. `done` finalizes the install.
    fn install_snapshot(
        &self,
        last_index: LogIndex,
        last_term: Term,
        offset: u64,
        done: bool,
        data: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), StorageError>>;
}
