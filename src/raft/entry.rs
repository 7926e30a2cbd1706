use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// Member/observer sets carried by config-change entries and snapshot
/// metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSets {
    pub members: BTreeSet<NodeId>,
    pub observers: BTreeSet<NodeId>,
    pub prepared_members: BTreeSet<NodeId>,
    pub prepared_observers: BTreeSet<NodeId>,
}

/// What a log entry carries.
///
/// `Heartbeat` is the empty entry a new leader appends to establish its
/// group-ready index; periodic heartbeats are empty AppendEntries batches and
/// never reach the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Normal(Vec<u8>),
    Heartbeat,
    PrepareChange(MemberSets),
    CommitChange(MemberSets),
    AbortChange(MemberSets),
}

impl Payload {
    pub fn bytes_len(&self) -> u64 {
        match self {
            Payload::Normal(d) => d.len() as u64,
            _ => 0,
        }
    }

}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    pub index: LogIndex,
    pub term: Term,
    pub payload: Payload,
}

impl LogItem {
    pub fn new(index: LogIndex, term: Term, payload: Payload) -> Self {
        Self { index, term, payload }
    }
}

/// Result of applying one entry to the state machine, delivered to the
/// submitting client.
pub type RaftOutput = Vec<u8>;

/// Completion side of a pending submission. Client proposals resolve with the
/// state machine's output; admin config changes resolve with the log index
/// their entry applied at.
pub enum TaskResponder {
    Exec(oneshot::Sender<Result<RaftOutput, RaftError>>),
    Admin(oneshot::Sender<Result<LogIndex, RaftError>>),
}

impl TaskResponder {
    pub fn fail(self, err: RaftError) {
        match self {
            TaskResponder::Exec(tx) => {
                let _ = tx.send(Err(err));
            }
            TaskResponder::Admin(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Flow-control counters, the only group state touched by non-owning threads.
#[derive(Debug, Default)]
pub struct PendingStat {
    tasks: AtomicU64,
    bytes: AtomicU64,
}

impl PendingStat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tasks(&self) -> u64 {
        self.tasks.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn incr(&self, bytes: u64) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn decr(&self, bytes: u64) {
        self.tasks.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}
