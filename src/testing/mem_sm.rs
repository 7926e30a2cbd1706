//! A `BTreeMap` key-value state machine for tests.
//!
//! Inputs are `key=value` byte strings; applying one inserts the pair and
//! returns the previous value. Snapshots serialize the whole map with
//! `serde_json`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorSubject;
use crate::error::ErrorVerb;
use crate::error::StorageError;
use crate::raft::entry::RaftOutput;
use crate::sm::Snapshot;
use crate::sm::SnapshotChunk;
use crate::sm::SnapshotMeta;
use crate::sm::StateMachine;
use crate::LogIndex;
use crate::Term;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct KvData {
    applied_index: LogIndex,
    map: BTreeMap<String, String>,
}

#[derive(Default)]
struct Inner {
    data: KvData,
    /// Partial snapshot bytes while an install is streaming in.
    install_buf: Vec<u8>,
}

fn sm_err(msg: impl ToString) -> StorageError {
    StorageError::new(
        ErrorSubject::StateMachine,
        ErrorVerb::Apply,
        anyerror::AnyError::error(msg.to_string()),
    )
}

fn ready<T: Send + 'static>(v: Result<T, StorageError>) -> BoxFuture<'static, Result<T, StorageError>> {
    Box::pin(async move { v })
}

/// In-memory [`StateMachine`].
#[derive(Clone, Default)]
pub struct MemStateMachine {
    inner: Arc<Mutex<Inner>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub fn applied_index(&self) -> LogIndex {
        self.lock().data.applied_index
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().data.map.get(key).cloned()
    }

    /// Full state for cross-node comparisons.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.lock().data.map.clone()
    }
}

impl StateMachine for MemStateMachine {
    fn exec(
        &self,
        index: LogIndex,
        input: Vec<u8>,
    ) -> BoxFuture<'static, Result<RaftOutput, StorageError>> {
        let mut g = self.lock();
        if index <= g.data.applied_index {
            return ready(Err(sm_err(format!(
                "apply regression: {} after {}",
                index, g.data.applied_index
            ))));
        }
        let s = match std::str::from_utf8(&input) {
            Ok(s) => s,
            Err(e) => return ready(Err(sm_err(e))),
        };
        let (k, v) = match s.split_once('=') {
            Some(kv) => kv,
            None => return ready(Err(sm_err(format!("malformed input: {}", s)))),
        };
        let old = g.data.map.insert(k.to_string(), v.to_string());
        g.data.applied_index = index;
        ready(Ok(old.map(|v| v.into_bytes()).unwrap_or_default()))
    }

    fn take_snapshot(
        &self,
        meta: SnapshotMeta,
    ) -> BoxFuture<'static, Result<Box<dyn Snapshot>, StorageError>> {
        let g = self.lock();
        let data = match serde_json::to_vec(&g.data) {
            Ok(d) => d,
            Err(e) => return ready(Err(sm_err(e))),
        };
        let snap: Box<dyn Snapshot> = Box::new(MemSnapshot {
            meta,
            data,
            pos: Mutex::new(0),
        });
        ready(Ok(snap))
    }

    fn install_snapshot(
        &self,
        last_index: LogIndex,
        _last_term: Term,
        offset: u64,
        done: bool,
        data: Vec<u8>,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        let mut g = self.lock();
        if offset == 0 {
            // a restarted stream replaces any partial state
            g.install_buf.clear();
        } else if offset != g.install_buf.len() as u64 {
            return ready(Err(sm_err(format!(
                "chunk offset {} does not match buffered {}",
                offset,
                g.install_buf.len()
            ))));
        }
        g.install_buf.extend_from_slice(&data);
        if done {
            let buf = std::mem::take(&mut g.install_buf);
            let mut parsed: KvData = match serde_json::from_slice(&buf) {
                Ok(d) => d,
                Err(e) => return ready(Err(sm_err(e))),
            };
            parsed.applied_index = last_index;
            g.data = parsed;
        }
        ready(Ok(()))
    }
}

struct MemSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
    pos: Mutex<usize>,
}

impl Snapshot for MemSnapshot {
    fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    fn read_next(&self, max_bytes: usize) -> BoxFuture<'static, Result<SnapshotChunk, StorageError>> {
        let mut pos = match self.pos.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let end = (*pos + max_bytes.max(1)).min(self.data.len());
        let chunk = SnapshotChunk {
            data: self.data[*pos..end].to_vec(),
            done: end == self.data.len(),
        };
        *pos = end;
        ready(Ok(chunk))
    }
}
