//! Quorum math for a single member set and for joint consensus.
//!
//! A quorum is `⌊N/2⌋+1` of a member set. While a joint-consensus change is in
//! flight the prepared set is non-empty and every check must pass over both
//! sets independently. Observers never appear in the sets passed here.

use std::collections::BTreeSet;

use crate::NodeId;

/// Number of members that form a quorum of `n`.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// True if `granted` contains a quorum of `members`.
///
/// An empty member set has no quorum.
pub fn is_quorum(members: &BTreeSet<NodeId>, granted: &BTreeSet<NodeId>) -> bool {
    if members.is_empty() {
        return false;
    }
    let count = members.iter().filter(|id| granted.contains(id)).count();
    count >= majority(members.len())
}

/// The joint check: quorum of `members`, and additionally quorum of
/// `prepared` when a membership change is in flight.
pub fn is_joint_quorum(
    members: &BTreeSet<NodeId>,
    prepared: &BTreeSet<NodeId>,
    granted: &BTreeSet<NodeId>,
) -> bool {
    if !is_quorum(members, granted) {
        return false;
    }
    prepared.is_empty() || is_quorum(prepared, granted)
}

/// The greatest value `v` such that at least a quorum of `members` report a
/// value `>= v`, where `f` reads the per-member value.
///
/// With `f` returning match indices this is the leader's direct-commit
/// candidate; with `f` returning confirm timestamps it is the lease start.
pub fn quorum_value<T, F>(members: &BTreeSet<NodeId>, f: F) -> Option<T>
where
    T: Ord + Copy,
    F: Fn(NodeId) -> T,
{
    if members.is_empty() {
        return None;
    }
    let mut vals: Vec<T> = members.iter().map(|&id| f(id)).collect();
    vals.sort_unstable_by(|a, b| b.cmp(a));
    Some(vals[majority(vals.len()) - 1])
}

/// `quorum_value` under joint consensus: the minimum over both sets, so the
/// result is covered by a quorum of each.
pub fn joint_quorum_value<T, F>(
    members: &BTreeSet<NodeId>,
    prepared: &BTreeSet<NodeId>,
    f: F,
) -> Option<T>
where
    T: Ord + Copy,
    F: Fn(NodeId) -> T,
{
    let v = quorum_value(members, &f)?;
    match quorum_value(prepared, &f) {
        Some(p) => Some(v.min(p)),
        None => Some(v),
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;

    use super::*;

    #[test]
    fn test_majority() {
        assert_eq!(1, majority(1));
        assert_eq!(2, majority(2));
        assert_eq!(2, majority(3));
        assert_eq!(3, majority(4));
        assert_eq!(3, majority(5));
    }

    #[test]
    fn test_is_quorum() {
        let members = btreeset! {1, 2, 3, 4, 5};
        assert!(!is_quorum(&members, &btreeset! {1, 2}));
        assert!(is_quorum(&members, &btreeset! {1, 2, 3}));
        // grants from non-members do not count
        assert!(!is_quorum(&members, &btreeset! {1, 2, 6, 7}));
        assert!(!is_quorum(&btreeset! {}, &btreeset! {1}));
    }

    #[test]
    fn test_is_joint_quorum() {
        let members = btreeset! {1, 2, 3};
        let prepared = btreeset! {3, 4, 5};
        // quorum of members only
        assert!(!is_joint_quorum(&members, &prepared, &btreeset! {1, 2}));
        // quorum of prepared only
        assert!(!is_joint_quorum(&members, &prepared, &btreeset! {3, 4, 5}));
        // quorum of both
        assert!(is_joint_quorum(&members, &prepared, &btreeset! {1, 3, 4}));
        // no change in flight
        assert!(is_joint_quorum(&members, &btreeset! {}, &btreeset! {1, 2}));
    }

    #[test]
    fn test_quorum_value_match_index() {
        let members = btreeset! {1, 2, 3, 4, 5};
        let matched = |id: NodeId| -> u64 {
            match id {
                1 => 10,
                2 => 8,
                3 => 8,
                4 => 3,
                _ => 0,
            }
        };
        // three of five report >= 8
        assert_eq!(Some(8), quorum_value(&members, matched));
        assert_eq!(None, quorum_value(&btreeset! {}, matched));
    }

    #[test]
    fn test_quorum_value_two_of_five() {
        // only two members report the high value; quorum stays at the floor
        let members = btreeset! {1, 2, 3, 4, 5};
        let v = quorum_value(&members, |id| if id <= 2 { 100u64 } else { 1 });
        assert_eq!(Some(1), v);
    }

    #[test]
    fn test_joint_quorum_value_takes_min() {
        let members = btreeset! {1, 2, 3};
        let prepared = btreeset! {3, 4, 5};
        let matched = |id: NodeId| -> u64 {
            match id {
                1 | 2 => 20,
                3 => 9,
                _ => 5,
            }
        };
        // members quorum reaches 20, prepared quorum only 5
        assert_eq!(Some(5), joint_quorum_value(&members, &prepared, matched));
        assert_eq!(Some(20), joint_quorum_value(&members, &btreeset! {}, matched));
    }
}
