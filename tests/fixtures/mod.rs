//! A multi-node in-process cluster harness built from the crate's testing
//! fixtures.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use std::time::Instant;

use fibraft::testing::MemRaftLog;
use fibraft::testing::MemStateMachine;
use fibraft::testing::Router;
use fibraft::GroupConfig;
use fibraft::NodeId;
use fibraft::RaftConfig;
use fibraft::RaftGroupHandle;
use fibraft::RaftRole;
use fibraft::RaftServer;

pub const GROUP: u32 = 1;
pub const DEADLINE: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route crate logs to the captured test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn base_config(node_id: NodeId) -> RaftConfig {
    let mut cfg = RaftConfig::default();
    cfg.node_id = node_id;
    cfg
}

pub struct Node {
    pub id: NodeId,
    pub server: Arc<RaftServer>,
    pub log: MemRaftLog,
    pub sm: MemStateMachine,
    pub handle: Option<RaftGroupHandle>,
}

impl Node {
    pub fn handle(&self) -> &RaftGroupHandle {
        match &self.handle {
            Some(h) => h,
            None => panic!("node {} has not joined the group", self.id),
        }
    }
}

pub struct ClusterBuilder {
    members: Vec<NodeId>,
    observers: Vec<NodeId>,
    deferred: Vec<NodeId>,
    log: Box<dyn Fn(NodeId) -> MemRaftLog>,
    tweak: Box<dyn Fn(&mut RaftConfig)>,
}

impl ClusterBuilder {
    pub fn new(members: &[NodeId]) -> Self {
        Self {
            members: members.to_vec(),
            observers: Vec::new(),
            deferred: Vec::new(),
            log: Box::new(|_| MemRaftLog::new()),
            tweak: Box::new(|_| {}),
        }
    }

    pub fn observers(mut self, ids: &[NodeId]) -> Self {
        self.observers = ids.to_vec();
        self
    }

    /// Nodes that host a server but do not join the group until
    /// [`Cluster::join`] is called for them.
    pub fn deferred(mut self, ids: &[NodeId]) -> Self {
        self.deferred = ids.to_vec();
        self
    }

    pub fn log_factory(mut self, f: impl Fn(NodeId) -> MemRaftLog + 'static) -> Self {
        self.log = Box::new(f);
        self
    }

    pub fn config(mut self, f: impl Fn(&mut RaftConfig) + 'static) -> Self {
        self.tweak = Box::new(f);
        self
    }

    pub async fn build(self) -> Cluster {
        init_tracing();
        let router = Router::new();
        let group_cfg = GroupConfig {
            group_id: GROUP,
            node_ids: self.members.clone(),
            observer_ids: self.observers.clone(),
        };
        let mut ids: Vec<NodeId> = self.members.clone();
        ids.extend(&self.observers);
        let mut nodes = Vec::new();
        for id in ids {
            let mut cfg = base_config(id);
            (self.tweak)(&mut cfg);
            let server = Arc::new(RaftServer::new(cfg).expect("spawn dispatchers"));
            router.register(id, server.clone());
            nodes.push(Node {
                id,
                server,
                log: (self.log)(id),
                sm: MemStateMachine::new(),
                handle: None,
            });
        }
        let mut cluster = Cluster { router, group_cfg, nodes };
        let join_now: Vec<NodeId> = cluster
            .nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !self.deferred.contains(id))
            .collect();
        for id in join_now {
            cluster.join(id).await;
        }
        cluster
    }
}

pub struct Cluster {
    pub router: Router,
    pub group_cfg: GroupConfig,
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub async fn of(members: &[NodeId]) -> Cluster {
        ClusterBuilder::new(members).build().await
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.iter().find(|n| n.id == id) {
            Some(n) => n,
            None => panic!("no node {}", id),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(n) => n,
            None => panic!("no node {}", id),
        }
    }

    /// Start hosting the group on a deferred node.
    pub async fn join(&mut self, id: NodeId) {
        let group_cfg = self.group_cfg.clone();
        let transport = self.router.transport(id);
        let (server, log, sm) = {
            let node = self.node(id);
            (node.server.clone(), node.log.clone(), node.sm.clone())
        };
        let handle = server
            .add_group(group_cfg, Box::new(log), Box::new(sm), transport)
            .await
            .expect("add group");
        self.node_mut(id).handle = Some(handle);
    }

    /// The current leader's node id, once a leader exists and committed an
    /// entry of its own term.
    pub async fn wait_leader(&self) -> NodeId {
        self.wait_leader_where(|_| true).await
    }

    pub async fn wait_leader_where(&self, pred: impl Fn(NodeId) -> bool) -> NodeId {
        let deadline = Instant::now() + DEADLINE;
        loop {
            for n in &self.nodes {
                if let Some(h) = &n.handle {
                    let s = h.status();
                    if s.role == RaftRole::Leader && s.group_ready && pred(n.id) {
                        return n.id;
                    }
                }
            }
            if Instant::now() > deadline {
                panic!("no leader within {:?}", DEADLINE);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until every node's state machine equals `expected`.
    pub async fn wait_dumps_equal(&self, expected: &BTreeMap<String, String>) {
        let deadline = Instant::now() + DEADLINE;
        loop {
            if self.nodes.iter().all(|n| &n.sm.dump() == expected) {
                return;
            }
            if Instant::now() > deadline {
                for n in &self.nodes {
                    eprintln!("node {}: {:?}", n.id, n.sm.dump());
                }
                panic!("state machines did not converge to {:?}", expected);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn shutdown(&self) {
        for n in &self.nodes {
            n.server.shutdown();
        }
    }
}

/// `k=v` pairs as a map, for expected-state assertions.
pub fn kv(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
