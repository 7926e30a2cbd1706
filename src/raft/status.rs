use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::watch;

use crate::quorum;
use crate::raft::entry::MemberSets;
use crate::GroupId;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
    Observer,
}

/// Leader-tracked replication state of one peer. The local node has an entry
/// too; its match index is the locally persisted index.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub node_id: NodeId,
    pub match_index: LogIndex,
    pub next_index: LogIndex,
    /// Bumped to cancel the peer's replicate fiber; stale fibers exit when
    /// their epoch no longer matches.
    pub repl_epoch: u64,
    /// A replicate fiber for this peer is alive.
    pub repl_running: bool,
    /// Send time of the most recent request this peer confirmed, feeding the
    /// lease computation.
    pub last_confirm_req: Option<Instant>,
    pub installing_snapshot: bool,
}

impl PeerState {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            match_index: 0,
            next_index: 1,
            repl_epoch: 0,
            repl_running: false,
            last_confirm_req: None,
            installing_snapshot: false,
        }
    }
}

/// Per-group mutable consensus state. Owned exclusively by the group's
/// dispatcher thread; other threads see only [`ShareStatus`] snapshots.
pub struct RaftStatus {
    pub group_id: GroupId,
    pub node_id: NodeId,

    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,

    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_applied_term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    /// Highest durable index acknowledged by storage.
    pub last_persist_index: LogIndex,
    /// Commit index advertised by the current leader.
    pub leader_commit: LogIndex,
    /// First index of the leader's current term; the leader only counts
    /// quorum directly at or above it.
    pub group_ready_index: LogIndex,

    pub members: BTreeSet<NodeId>,
    pub observers: BTreeSet<NodeId>,
    pub prepared_members: BTreeSet<NodeId>,
    pub prepared_observers: BTreeSet<NodeId>,
    /// Log index of the in-flight PrepareChange entry, 0 when none.
    pub prepared_at: LogIndex,
    pub peers: BTreeMap<NodeId, PeerState>,

    /// Last time an election timer was armed or leadership contact was seen.
    pub last_elect_time: Instant,
    pub elect_timeout: Duration,
    pub lease_start: Option<Instant>,

    pub transfer_target: Option<NodeId>,
    pub installing_snapshot: bool,

    share_dirty: bool,
}

/// Immutable snapshot of the fields non-owning threads need, published
/// through a `watch` channel on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareStatus {
    pub role: RaftRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub lease_end: Option<Instant>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    /// True once the leader committed an entry of its own term.
    pub group_ready: bool,
}

impl ShareStatus {
    fn initial() -> Self {
        Self {
            role: RaftRole::Follower,
            term: 0,
            leader: None,
            lease_end: None,
            commit_index: 0,
            last_applied: 0,
            group_ready: false,
        }
    }
}

pub fn share_status_channel() -> (watch::Sender<ShareStatus>, watch::Receiver<ShareStatus>) {
    watch::channel(ShareStatus::initial())
}

impl RaftStatus {
    pub fn new(group_id: GroupId, node_id: NodeId, now: Instant, elect_timeout: Duration) -> Self {
        Self {
            group_id,
            node_id,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            commit_index: 0,
            last_applied: 0,
            last_applied_term: 0,
            last_log_index: 0,
            last_log_term: 0,
            last_persist_index: 0,
            leader_commit: 0,
            group_ready_index: 0,
            members: BTreeSet::new(),
            observers: BTreeSet::new(),
            prepared_members: BTreeSet::new(),
            prepared_observers: BTreeSet::new(),
            prepared_at: 0,
            peers: BTreeMap::new(),
            last_elect_time: now,
            elect_timeout,
            lease_start: None,
            transfer_target: None,
            installing_snapshot: false,
            share_dirty: true,
        }
    }

    pub fn is_voting_member(&self, id: NodeId) -> bool {
        self.members.contains(&id) || self.prepared_members.contains(&id)
    }

    pub fn is_any_member(&self, id: NodeId) -> bool {
        self.is_voting_member(id)
            || self.observers.contains(&id)
            || self.prepared_observers.contains(&id)
    }

    /// Everyone the leader replicates to, self excluded.
    pub fn replicate_targets(&self) -> BTreeSet<NodeId> {
        let mut ids = BTreeSet::new();
        ids.extend(&self.members);
        ids.extend(&self.observers);
        ids.extend(&self.prepared_members);
        ids.extend(&self.prepared_observers);
        ids.remove(&self.node_id);
        ids
    }

    pub fn apply_member_sets(&mut self, sets: &MemberSets) {
        self.members = sets.members.clone();
        self.observers = sets.observers.clone();
        self.prepared_members = sets.prepared_members.clone();
        self.prepared_observers = sets.prepared_observers.clone();
        self.sync_peers();
        self.mark_dirty();
    }

    pub fn member_sets(&self) -> MemberSets {
        MemberSets {
            members: self.members.clone(),
            observers: self.observers.clone(),
            prepared_members: self.prepared_members.clone(),
            prepared_observers: self.prepared_observers.clone(),
        }
    }

    /// Rebuild the peer map after a membership change, preserving cursors of
    /// peers that remain.
    pub fn sync_peers(&mut self) {
        let mut ids = self.replicate_targets();
        ids.insert(self.node_id);
        self.peers.retain(|id, _| ids.contains(id));
        for id in ids {
            self.peers.entry(id).or_insert_with(|| PeerState::new(id));
        }
    }

    pub fn peer_mut(&mut self, id: NodeId) -> Option<&mut PeerState> {
        self.peers.get_mut(&id)
    }

    /// Reset all replication cursors, done when this node becomes leader.
    pub fn reset_peer_cursors(&mut self) {
        let next = self.last_log_index + 1;
        for p in self.peers.values_mut() {
            p.match_index = 0;
            p.next_index = next;
            p.repl_epoch += 1;
            p.last_confirm_req = None;
            p.installing_snapshot = false;
        }
    }

    /// Recompute the lease start from quorum-confirmed request times. The
    /// local node confirms its own requests instantly.
    pub fn update_lease(&mut self, now: Instant) {
        if self.role != RaftRole::Leader {
            self.lease_start = None;
            return;
        }
        if let Some(p) = self.peers.get_mut(&self.node_id) {
            p.last_confirm_req = Some(now);
        }
        let confirm = |id: NodeId| self.peers.get(&id).and_then(|p| p.last_confirm_req);
        let start =
            quorum::joint_quorum_value(&self.members, &self.prepared_members, confirm).flatten();
        if start != self.lease_start {
            self.lease_start = start;
            self.mark_dirty();
        }
    }

    pub fn lease_end(&self) -> Option<Instant> {
        self.lease_start.map(|s| s + self.elect_timeout)
    }

    pub fn group_ready(&self) -> bool {
        self.role == RaftRole::Leader
            && self.group_ready_index > 0
            && self.commit_index >= self.group_ready_index
    }

    pub fn mark_dirty(&mut self) {
        self.share_dirty = true;
    }

    /// Publish a fresh [`ShareStatus`] if anything changed since the last
    /// publication.
    pub fn copy_share_status(&mut self, tx: &watch::Sender<ShareStatus>) {
        if !self.share_dirty {
            return;
        }
        self.share_dirty = false;
        let s = ShareStatus {
            role: self.role,
            term: self.current_term,
            leader: self.leader,
            lease_end: self.lease_end(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            group_ready: self.group_ready(),
        };
        tx.send_replace(s);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use maplit::btreeset;

    use super::*;

    fn status() -> RaftStatus {
        let mut s = RaftStatus::new(1, 1, Instant::now(), Duration::from_millis(150));
        s.members = btreeset! {1, 2, 3};
        s.sync_peers();
        s
    }

    #[test]
    fn test_replicate_targets_exclude_self() {
        let mut s = status();
        s.observers = btreeset! {4};
        s.prepared_members = btreeset! {3, 5};
        assert_eq!(btreeset! {2, 3, 4, 5}, s.replicate_targets());
    }

    #[test]
    fn test_sync_peers_preserves_cursors() {
        let mut s = status();
        s.peers.get_mut(&2).unwrap().match_index = 7;
        s.members = btreeset! {1, 2, 4};
        s.sync_peers();
        assert_eq!(7, s.peers[&2].match_index);
        assert!(!s.peers.contains_key(&3));
        assert!(s.peers.contains_key(&4));
    }

    #[test]
    fn test_lease_needs_quorum_confirmation() {
        let mut s = status();
        s.role = RaftRole::Leader;
        let now = Instant::now();
        s.update_lease(now);
        // only self confirmed
        assert_eq!(None, s.lease_start);

        let t = now - Duration::from_millis(10);
        s.peers.get_mut(&2).unwrap().last_confirm_req = Some(t);
        s.update_lease(now);
        // quorum is {self@now, 2@t}; the quorum-th newest is t
        assert_eq!(Some(t), s.lease_start);
        assert_eq!(Some(t + s.elect_timeout), s.lease_end());
    }

    #[test]
    fn test_group_ready_requires_own_term_commit() {
        let mut s = status();
        s.role = RaftRole::Leader;
        s.group_ready_index = 5;
        s.commit_index = 4;
        assert!(!s.group_ready());
        s.commit_index = 5;
        assert!(s.group_ready());
    }
}
