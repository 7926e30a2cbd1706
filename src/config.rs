//! Runtime configuration for a raft server and its groups.

use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::GroupId;
use crate::NodeId;

/// Errors found when validating a config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("election timeout must be greater than 2 * heartbeat interval: elect={elect_timeout_ms}ms, heartbeat={heartbeat_interval_ms}ms")]
    ElectTimeoutTooSmall {
        elect_timeout_ms: u64,
        heartbeat_interval_ms: u64,
    },

    #[error("{field} must not be 0")]
    MustNotBeZero { field: &'static str },

    #[error("invalid number: {invalid}: {reason}")]
    InvalidNumber { invalid: String, reason: String },
}

/// Parse number with unit such as 5.3 KB
fn parse_bytes_with_unit(src: &str) -> Result<u64, ConfigError> {
    let res = byte_unit::Byte::from_str(src).map_err(|e| ConfigError::InvalidNumber {
        invalid: src.to_string(),
        reason: e.to_string(),
    })?;

    Ok(res.get_bytes() as u64)
}

/// Per-server configuration, shared by all raft groups hosted on the server.
///
/// Remember the inequality from the Raft paper:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. Keep the election timeout high
/// enough that normal replication round trips never trigger elections.
#[derive(Clone, Debug, Serialize, Deserialize, Parser)]
pub struct RaftConfig {
    /// The id of this node; must be unique in the cluster.
    #[clap(long, env = "RAFT_NODE_ID", default_value = "1")]
    pub node_id: NodeId,

    /// The base election timeout in milliseconds.
    ///
    /// Each election round uses a randomized timeout in
    /// `[elect_timeout_ms, 2 * elect_timeout_ms)`.
    #[clap(long, env = "RAFT_ELECT_TIMEOUT", default_value = "150")]
    pub elect_timeout_ms: u64,

    /// The heartbeat interval in milliseconds at which a leader pings idle
    /// followers.
    #[clap(long, env = "RAFT_HEARTBEAT_INTERVAL", default_value = "50")]
    pub heartbeat_interval_ms: u64,

    /// The timeout for a single RPC, in milliseconds.
    #[clap(long, env = "RAFT_RPC_TIMEOUT", default_value = "100")]
    pub rpc_timeout_ms: u64,

    /// Max number of log entries in one AppendEntries batch.
    #[clap(long, env = "RAFT_MAX_REPLICATE_ITEMS", default_value = "300")]
    pub max_replicate_items: usize,

    /// Max bytes in one AppendEntries batch.
    #[clap(long, env = "RAFT_MAX_REPLICATE_BYTES", default_value = "1MiB", value_parser = parse_bytes_with_unit)]
    pub max_replicate_bytes: u64,

    /// Max bytes in one InstallSnapshot chunk.
    #[clap(long, env = "RAFT_SNAPSHOT_CHUNK_BYTES", default_value = "3MiB", value_parser = parse_bytes_with_unit)]
    pub snapshot_chunk_bytes: u64,

    /// Max client tasks waiting to be applied, per group. Submissions beyond
    /// this are rejected with a flow-control error before touching the log.
    #[clap(long, env = "RAFT_MAX_PENDING_TASKS", default_value = "10000")]
    pub max_pending_tasks: i64,

    /// Max bytes of client tasks waiting to be applied, per group.
    #[clap(long, env = "RAFT_MAX_PENDING_BYTES", default_value = "256MiB", value_parser = parse_bytes_with_unit)]
    pub max_pending_bytes: u64,

    /// Whether the commit index follows the force-synced index (true) or the
    /// merely written index (false).
    #[clap(long, env = "RAFT_SYNC_FORCE", default_value = "true", action = clap::ArgAction::Set)]
    pub sync_force: bool,

    /// Number of dispatcher threads shared by all groups on this server.
    #[clap(long, env = "RAFT_DISPATCHERS", default_value = "1")]
    pub dispatchers: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl RaftConfig {
    pub fn build(args: &[&str]) -> Result<RaftConfig, ConfigError> {
        let config = <Self as Parser>::parse_from(args);
        config.validate()
    }

    /// Validate the state of this config.
    pub fn validate(self) -> Result<RaftConfig, ConfigError> {
        if self.elect_timeout_ms <= 2 * self.heartbeat_interval_ms {
            return Err(ConfigError::ElectTimeoutTooSmall {
                elect_timeout_ms: self.elect_timeout_ms,
                heartbeat_interval_ms: self.heartbeat_interval_ms,
            });
        }
        if self.max_replicate_items == 0 {
            return Err(ConfigError::MustNotBeZero {
                field: "max_replicate_items",
            });
        }
        if self.dispatchers == 0 {
            return Err(ConfigError::MustNotBeZero { field: "dispatchers" });
        }
        Ok(self)
    }

    pub fn elect_timeout(&self) -> Duration {
        Duration::from_millis(self.elect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Generate a new randomized election timeout for one election round.
    pub fn new_rand_elect_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.elect_timeout_ms..2 * self.elect_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Per-group configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group_id: GroupId,

    /// Voting members of the group.
    pub node_ids: Vec<NodeId>,

    /// Observers replicate the log but never vote and never count toward
    /// any quorum.
    pub observer_ids: Vec<NodeId>,
}

impl GroupConfig {
    pub fn new(group_id: GroupId, node_ids: Vec<NodeId>) -> Self {
        Self {
            group_id,
            node_ids,
            observer_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let c = RaftConfig::default();
        assert_eq!(150, c.elect_timeout_ms);
        c.validate().unwrap();
    }

    #[test]
    fn test_build_from_args() {
        let c = RaftConfig::build(&["fibraft", "--node-id", "3", "--elect-timeout-ms", "200"]).unwrap();
        assert_eq!(3, c.node_id);
        assert_eq!(200, c.elect_timeout_ms);
    }

    #[test]
    fn test_invalid_elect_timeout() {
        let r = RaftConfig::build(&["fibraft", "--elect-timeout-ms", "80", "--heartbeat-interval-ms", "50"]);
        assert!(matches!(r, Err(ConfigError::ElectTimeoutTooSmall { .. })));
    }

    #[test]
    fn test_rand_elect_timeout_in_range() {
        let c = RaftConfig::default();
        for _ in 0..100 {
            let t = c.new_rand_elect_timeout();
            assert!(t >= c.elect_timeout());
            assert!(t < 2 * c.elect_timeout());
        }
    }
}
