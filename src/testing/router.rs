//! An in-process [`Transport`] connecting [`RaftServer`]s directly, with
//! per-link partition control.
//!
//! A cut link fails at send time with an unreachable error; requests already
//! in flight still complete. RPC timeouts are ignored since local delivery is
//! immediate.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyerror::AnyError;
use futures::future::BoxFuture;

use crate::error::NetError;
use crate::error::RaftError;
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
use crate::server::RaftServer;
use crate::NodeId;

#[derive(Default)]
struct Core {
    servers: Mutex<HashMap<NodeId, Arc<RaftServer>>>,
    /// Directed links that currently drop traffic.
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

impl Core {
    fn link(&self, from: NodeId, to: NodeId) -> Result<Arc<RaftServer>, NetError> {
        if lock(&self.blocked).contains(&(from, to)) {
            return Err(NetError::Unreachable {
                node: to,
                source: AnyError::error("link cut"),
            });
        }
        lock(&self.servers)
            .get(&to)
            .cloned()
            .ok_or(NetError::PeerNotFound(to))
    }
}

fn to_net(e: RaftError) -> NetError {
    NetError::Remote(e.to_string())
}

/// The cluster-wide fabric. Clone freely; all clones share link state.
#[derive(Clone, Default)]
pub struct Router {
    core: Arc<Core>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: NodeId, server: Arc<RaftServer>) {
        lock(&self.core.servers).insert(node_id, server);
    }

    /// The transport to hand to the server running as `from`.
    pub fn transport(&self, from: NodeId) -> Arc<dyn Transport> {
        Arc::new(NodeTransport { core: self.core.clone(), from })
    }

    /// Cut both directions between `a` and `b`.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut blocked = lock(&self.core.blocked);
        blocked.insert((a, b));
        blocked.insert((b, a));
    }

    /// Restore both directions between `a` and `b`.
    pub fn connect(&self, a: NodeId, b: NodeId) {
        let mut blocked = lock(&self.core.blocked);
        blocked.remove(&(a, b));
        blocked.remove(&(b, a));
    }

    /// Cut every link touching `node`.
    pub fn isolate(&self, node: NodeId) {
        let ids: Vec<NodeId> = lock(&self.core.servers).keys().copied().collect();
        let mut blocked = lock(&self.core.blocked);
        for other in ids {
            if other != node {
                blocked.insert((node, other));
                blocked.insert((other, node));
            }
        }
    }

    /// Restore every link touching `node`.
    pub fn heal(&self, node: NodeId) {
        lock(&self.core.blocked).retain(|(a, b)| *a != node && *b != node);
    }
}

struct NodeTransport {
    core: Arc<Core>,
    from: NodeId,
}

macro_rules! route {
    ($self:ident, $target:ident, $req:ident, $handler:ident) => {
        match $self.core.link($self.from, $target) {
            Err(e) => Box::pin(async move { Err(e) }),
            Ok(server) => Box::pin(async move { server.$handler($req).await.map_err(to_net) }),
        }
    };
}

impl Transport for NodeTransport {
    fn vote(
        &self,
        target: NodeId,
        req: VoteReq,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<VoteResp, NetError>> {
        route!(self, target, req, handle_vote)
    }

    fn append(
        &self,
        target: NodeId,
        req: AppendReq,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<AppendResp, NetError>> {
        route!(self, target, req, handle_append)
    }

    fn install_snapshot(
        &self,
        target: NodeId,
        req: InstallSnapshotReq,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<InstallSnapshotResp, NetError>> {
        route!(self, target, req, handle_install_snapshot)
    }

    fn query_status(
        &self,
        target: NodeId,
        req: QueryStatusReq,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<QueryStatusResp, NetError>> {
        route!(self, target, req, handle_query_status)
    }

    fn transfer_leader(
        &self,
        target: NodeId,
        req: TransferLeaderReq,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<(), NetError>> {
        route!(self, target, req, handle_transfer_leader)
    }
}
