//! fibraft is a multi-group [Raft](https://raft.github.io/) consensus engine
//! built on a single-threaded cooperative fiber scheduler.
//!
//! A [`RaftServer`] hosts many raft groups on a small fixed pool of dispatcher
//! threads. All state of one group lives on exactly one thread and is mutated
//! only by that group's fibers, so the consensus code needs no locks at all.
//! Other threads talk to a group through channels and observe it through the
//! published [`ShareStatus`].
//!
//! The application plugs in three collaborators per group:
//!
//! - [`RaftLog`]: durable log and vote storage,
//! - [`StateMachine`]: applies committed entries and builds snapshots,
//! - [`Transport`]: delivers RPCs to peer servers.
//!
//! ```ignore
//! let server = RaftServer::new(RaftConfig::default())?;
//! let handle = server
//!     .add_group(GroupConfig::new(1, vec![1, 2, 3]), log, sm, transport)
//!     .await?;
//! let output = handle.submit(b"key=value".to_vec()).await?;
//! ```
//!
//! [`RaftLog`]: storage::RaftLog
//! [`StateMachine`]: sm::StateMachine
//! [`Transport`]: net::Transport

pub mod config;
pub mod error;
pub mod fiber;
pub mod net;
pub mod quorum;
pub mod raft;
pub mod server;
pub mod sm;
pub mod storage;
pub mod testing;

/// A node id, unique per server in the cluster.
pub type NodeId = u32;
/// A raft group id, unique per group on a server.
pub type GroupId = u32;
/// A raft election term.
pub type Term = u64;
/// An index into the raft log. Index 0 means "no entry".
pub type LogIndex = u64;

pub use config::GroupConfig;
pub use config::RaftConfig;
pub use error::Fatal;
pub use error::NetError;
pub use error::RaftError;
pub use error::StorageError;
pub use net::Transport;
pub use raft::entry::LogItem;
pub use raft::entry::MemberSets;
pub use raft::entry::Payload;
pub use raft::read::lease_read_index;
pub use raft::status::RaftRole;
pub use raft::status::ShareStatus;
pub use server::RaftGroupHandle;
pub use server::RaftServer;
pub use sm::Snapshot;
pub use sm::StateMachine;
pub use storage::RaftLog;
