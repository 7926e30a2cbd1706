//! The raft log collaborator.
//!
//! On-disk layout is outside this crate. Implementations take `&self` and
//! return `'static` futures; interior state is theirs to synchronize. All
//! calls originate from the owning dispatcher thread, and dropping a returned
//! future cancels the operation as far as the caller is concerned.

use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::raft::entry::LogItem;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// What the log recovers at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogInitState {
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Persisted term/vote, restored before any RPC is answered.
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Durability watermarks reported after an append. A log that syncs on every
/// write reports them equal; otherwise `force_index` trails `write_index` and
/// the config decides which one commit logic follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendAck {
    pub write_index: LogIndex,
    pub force_index: LogIndex,
}

pub trait RaftLog: Send + 'static {
    fn init(&self) -> BoxFuture<'static, Result<LogInitState, StorageError>>;

    /// Persist `items`. Resolves once the write completed, reporting both
    /// watermarks.
    fn append(&self, items: Vec<LogItem>) -> BoxFuture<'static, Result<AppendAck, StorageError>>;

    /// Read entries starting at `index`, bounded by both limits, at least one
    /// entry if any exists at `index`.
    fn read(
        &self,
        index: LogIndex,
        item_limit: usize,
        byte_limit: u64,
    ) -> BoxFuture<'static, Result<Vec<LogItem>, StorageError>>;

    /// Delete `index` and everything after it.
    fn truncate_tail(&self, index: LogIndex) -> BoxFuture<'static, Result<(), StorageError>>;

    /// Find the latest position at or before `(term, index)` where the local
    /// log agrees, for nextIndex backtracking. `None` means no common
    /// position exists and the caller needs a snapshot.
    fn try_find_match_pos(
        &self,
        term: Term,
        index: LogIndex,
    ) -> BoxFuture<'static, Result<Option<(Term, LogIndex)>, StorageError>>;

    /// Persist term and vote. Completion is required before a vote response
    /// or a real-vote RPC may be observed externally.
    fn save_vote_state(
        &self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> BoxFuture<'static, Result<(), StorageError>>;

    /// Stop serving reads/appends while a snapshot is being installed.
    fn begin_install(&self) -> BoxFuture<'static, Result<(), StorageError>>;

    /// Resume normal appends after the snapshot; the next appended entry will
    /// be `next_index`.
    fn finish_install(
        &self,
        next_index: LogIndex,
        last_term: Term,
    ) -> BoxFuture<'static, Result<(), StorageError>>;
}
