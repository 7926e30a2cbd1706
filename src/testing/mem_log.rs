//! A `Vec`-backed raft log for tests, with an optional artificial persist
//! delay to exercise the deferred-response path.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::ErrorSubject;
use crate::error::ErrorVerb;
use crate::error::StorageError;
use crate::raft::entry::LogItem;
use crate::storage::AppendAck;
use crate::storage::LogInitState;
use crate::storage::RaftLog;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

#[derive(Default)]
struct Inner {
    /// Entries above the snapshot base, ascending by index.
    items: Vec<LogItem>,
    /// Highest index covered by an installed snapshot.
    base_index: LogIndex,
    base_term: Term,
    current_term: Term,
    voted_for: Option<NodeId>,
    installing: bool,
    /// Remaining `save_vote_state` calls to fail, for fault injection.
    vote_save_failures: u32,
}

impl Inner {
    fn last_index(&self) -> LogIndex {
        self.items.last().map(|i| i.index).unwrap_or(self.base_index)
    }

    fn last_term(&self) -> Term {
        self.items.last().map(|i| i.term).unwrap_or(self.base_term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.items
            .iter()
            .find(|i| i.index == index)
            .map(|i| i.term)
    }
}

/// In-memory [`RaftLog`].
#[derive(Clone, Default)]
pub struct MemRaftLog {
    inner: Arc<Mutex<Inner>>,
    persist_delay: Option<Duration>,
}

impl MemRaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every append acknowledgement by `d`, completing it from a
    /// separate thread.
    pub fn with_persist_delay(d: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            persist_delay: Some(d),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Fail the next `n` vote-state writes with a storage error.
    pub fn with_vote_save_failures(n: u32) -> Self {
        let log = Self::default();
        log.lock().vote_save_failures = n;
        log
    }

    /// All stored entries, for assertions.
    pub fn entries(&self) -> Vec<LogItem> {
        self.lock().items.clone()
    }

    pub fn persisted_vote(&self) -> (Term, Option<NodeId>) {
        let g = self.lock();
        (g.current_term, g.voted_for)
    }
}

fn ready<T: Send + 'static>(v: Result<T, StorageError>) -> BoxFuture<'static, Result<T, StorageError>> {
    Box::pin(async move { v })
}

impl RaftLog for MemRaftLog {
    fn init(&self) -> BoxFuture<'static, Result<LogInitState, StorageError>> {
        let g = self.lock();
        ready(Ok(LogInitState {
            last_index: g.last_index(),
            last_term: g.last_term(),
            current_term: g.current_term,
            voted_for: g.voted_for,
        }))
    }

    fn append(&self, items: Vec<LogItem>) -> BoxFuture<'static, Result<AppendAck, StorageError>> {
        let ack = {
            let mut g = self.lock();
            if g.installing {
                return ready(Err(StorageError::write_logs(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "append during snapshot install",
                ))));
            }
            for item in items {
                // a truncated tail may be overwritten in place
                g.items.retain(|i| i.index < item.index);
                g.items.push(item);
            }
            let last = g.last_index();
            AppendAck { write_index: last, force_index: last }
        };
        match self.persist_delay {
            None => ready(Ok(ack)),
            Some(d) => {
                let (tx, rx) = oneshot::channel();
                std::thread::spawn(move || {
                    std::thread::sleep(d);
                    let _ = tx.send(ack);
                });
                Box::pin(async move {
                    rx.await.map_err(|e| {
                        StorageError::new(ErrorSubject::Logs, ErrorVerb::Write, anyerror::AnyError::new(&e))
                    })
                })
            }
        }
    }

    fn read(
        &self,
        index: LogIndex,
        item_limit: usize,
        byte_limit: u64,
    ) -> BoxFuture<'static, Result<Vec<LogItem>, StorageError>> {
        let g = self.lock();
        let mut out = Vec::new();
        let mut bytes = 0u64;
        for i in g.items.iter().filter(|i| i.index >= index) {
            if !out.is_empty() && (out.len() >= item_limit || bytes >= byte_limit) {
                break;
            }
            bytes += i.payload.bytes_len();
            out.push(i.clone());
        }
        ready(Ok(out))
    }

    fn truncate_tail(&self, index: LogIndex) -> BoxFuture<'static, Result<(), StorageError>> {
        let mut g = self.lock();
        g.items.retain(|i| i.index < index);
        ready(Ok(()))
    }

    fn try_find_match_pos(
        &self,
        term: Term,
        index: LogIndex,
    ) -> BoxFuture<'static, Result<Option<(Term, LogIndex)>, StorageError>> {
        let g = self.lock();
        let mut i = index.min(g.last_index());
        while i > g.base_index {
            if let Some(t) = g.term_at(i) {
                if t <= term {
                    return ready(Ok(Some((t, i))));
                }
            }
            i -= 1;
        }
        if g.base_index > 0 && i == g.base_index {
            return ready(Ok(Some((g.base_term, g.base_index))));
        }
        if i == 0 {
            // empty prefix always matches
            return ready(Ok(Some((0, 0))));
        }
        ready(Ok(None))
    }

    fn save_vote_state(
        &self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        let mut g = self.lock();
        if g.vote_save_failures > 0 {
            g.vote_save_failures -= 1;
            return ready(Err(StorageError::new(
                ErrorSubject::Vote,
                ErrorVerb::Write,
                anyerror::AnyError::error("injected vote write failure"),
            )));
        }
        g.current_term = term;
        g.voted_for = voted_for;
        ready(Ok(()))
    }

    fn begin_install(&self) -> BoxFuture<'static, Result<(), StorageError>> {
        let mut g = self.lock();
        g.installing = true;
        ready(Ok(()))
    }

    fn finish_install(
        &self,
        next_index: LogIndex,
        last_term: Term,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        let mut g = self.lock();
        g.items.clear();
        g.base_index = next_index - 1;
        g.base_term = last_term;
        g.installing = false;
        ready(Ok(()))
    }
}
