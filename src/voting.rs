/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Federated voting primitive: quorum and v-blocking tests over the latest statements of peers.
//!
//! This module is stateless. Every function takes the map of latest envelopes per node and one or
//! more predicates over statements, and answers a set-theoretic question about the local node's
//! [`QuorumSet`]:
//! - [`is_quorum`]: do the nodes satisfying the predicate contain a quorum of the local node? A
//!   quorum is a set closed under every member's own threshold rule, so this test needs to resolve
//!   each member's quorum set; members whose set cannot be resolved drop out of the computation.
//! - [`is_v_blocking`]: do the nodes satisfying the predicate intersect every slice of the local
//!   quorum set? A v-blocking set is exactly a set whose agreement the local node can never escape.
//! - [`find_closest_v_blocking`]: the smallest set of predicate-satisfying nodes whose failure
//!   would block the local quorum set, used for operator diagnostics.
//!
//! The *accept* and *ratify* rules of federated voting are built from these two tests by the
//! [ballot protocol](crate::ballot_protocol::implementation).

use std::collections::{BTreeMap, BTreeSet};

use crate::ballot_protocol::messages::{ScpEnvelope, ScpStatement};
use crate::types::{data_types::NodeId, quorum_set::QuorumSet};

/// Check whether `nodes` contains a slice of `quorum_set`, i.e. satisfies its threshold rule
/// recursively.
pub fn is_quorum_slice(quorum_set: &QuorumSet, nodes: &BTreeSet<NodeId>) -> bool {
    let mut threshold_left = quorum_set.threshold;

    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            threshold_left -= 1;
            if threshold_left == 0 {
                return true;
            }
        }
    }

    for inner in &quorum_set.inner_sets {
        if is_quorum_slice(inner, nodes) {
            threshold_left -= 1;
            if threshold_left == 0 {
                return true;
            }
        }
    }

    false
}

/// Check whether `nodes` is v-blocking for `quorum_set`: whether it intersects every slice.
///
/// Equivalently, `nodes` blocks `quorum_set` iff it hits enough members that the remaining ones
/// cannot reach the threshold. An empty quorum set (threshold 0) has no v-blocking set.
pub fn is_v_blocking_set(quorum_set: &QuorumSet, nodes: &BTreeSet<NodeId>) -> bool {
    if quorum_set.threshold == 0 {
        return false;
    }

    let mut left_till_block = 1 + quorum_set.members() as u32 - quorum_set.threshold;

    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            left_till_block -= 1;
            if left_till_block == 0 {
                return true;
            }
        }
    }

    for inner in &quorum_set.inner_sets {
        if is_v_blocking_set(inner, nodes) {
            left_till_block -= 1;
            if left_till_block == 0 {
                return true;
            }
        }
    }

    false
}

/// Check whether the nodes whose latest statement satisfies `filter` form a quorum of the local
/// node.
///
/// The candidate set starts as every sender in `envelopes` whose statement passes `filter`, and is
/// then repeatedly narrowed: a node stays only while its own quorum set (resolved through
/// `quorum_set_of`) has a slice inside the remaining candidates. A node whose quorum set cannot be
/// resolved is treated as non-voting and narrowed out. The fixed point is then tested against
/// `local_quorum_set`.
pub fn is_quorum(
    local_quorum_set: &QuorumSet,
    envelopes: &BTreeMap<NodeId, ScpEnvelope>,
    quorum_set_of: impl Fn(&ScpStatement) -> Option<QuorumSet>,
    filter: impl Fn(&ScpStatement) -> bool,
) -> bool {
    let mut candidates: BTreeSet<NodeId> = envelopes
        .iter()
        .filter(|(_, envelope)| filter(&envelope.statement))
        .map(|(node_id, _)| *node_id)
        .collect();

    loop {
        let narrowed: BTreeSet<NodeId> = candidates
            .iter()
            .filter(|node_id| {
                let statement = &envelopes
                    .get(*node_id)
                    .expect("candidates only contains senders present in the envelope map")
                    .statement;
                match quorum_set_of(statement) {
                    Some(quorum_set) => is_quorum_slice(&quorum_set, &candidates),
                    None => false,
                }
            })
            .copied()
            .collect();

        let reached_fixed_point = narrowed.len() == candidates.len();
        candidates = narrowed;
        if reached_fixed_point {
            break;
        }
    }

    is_quorum_slice(local_quorum_set, &candidates)
}

/// Check whether the nodes whose latest statement satisfies `filter` are v-blocking for the local
/// node.
pub fn is_v_blocking(
    local_quorum_set: &QuorumSet,
    envelopes: &BTreeMap<NodeId, ScpEnvelope>,
    filter: impl Fn(&ScpStatement) -> bool,
) -> bool {
    let nodes: BTreeSet<NodeId> = envelopes
        .iter()
        .filter(|(_, envelope)| filter(&envelope.statement))
        .map(|(node_id, _)| *node_id)
        .collect();
    is_v_blocking_set(local_quorum_set, &nodes)
}

/// Find the smallest set of nodes satisfying `filter` whose failure would leave `quorum_set`
/// without a reachable threshold, ignoring `excluded`.
///
/// Returns an empty vector when `quorum_set` is already blocked by the nodes *not* satisfying
/// `filter`: there is nothing left to lose.
pub fn find_closest_v_blocking(
    quorum_set: &QuorumSet,
    envelopes: &BTreeMap<NodeId, ScpEnvelope>,
    filter: impl Fn(&ScpStatement) -> bool,
    excluded: Option<&NodeId>,
) -> Vec<NodeId> {
    let nodes: BTreeSet<NodeId> = envelopes
        .iter()
        .filter(|(_, envelope)| filter(&envelope.statement))
        .map(|(node_id, _)| *node_id)
        .collect();
    find_closest_v_blocking_internal(quorum_set, &nodes, excluded)
}

fn find_closest_v_blocking_internal(
    quorum_set: &QuorumSet,
    nodes: &BTreeSet<NodeId>,
    excluded: Option<&NodeId>,
) -> Vec<NodeId> {
    let mut left_till_block = 1 + quorum_set.members() - quorum_set.threshold as usize;

    let mut candidates = Vec::new();

    for validator in &quorum_set.validators {
        if excluded.is_some_and(|excluded| validator == excluded) {
            continue;
        }
        if nodes.contains(validator) {
            candidates.push(*validator);
        } else {
            left_till_block -= 1;
            if left_till_block == 0 {
                return Vec::new();
            }
        }
    }

    let mut inner_results: Vec<Vec<NodeId>> = Vec::new();
    for inner in &quorum_set.inner_sets {
        let inner_result = find_closest_v_blocking_internal(inner, nodes, excluded);
        if inner_result.is_empty() {
            left_till_block -= 1;
            if left_till_block == 0 {
                return Vec::new();
            }
        } else {
            inner_results.push(inner_result);
        }
    }
    inner_results.sort_by_key(|inner_result| inner_result.len());

    // top-level validators get us closer one node at a time, so spend them first
    if candidates.len() > left_till_block {
        candidates.truncate(left_till_block);
    }
    left_till_block -= candidates.len();

    let mut inner_results = inner_results.into_iter();
    while left_till_block != 0 {
        match inner_results.next() {
            Some(inner_result) => {
                candidates.extend(inner_result);
                left_till_block -= 1;
            }
            None => break,
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot_protocol::messages::{PrepareStatement, ScpStatementPledges};
    use crate::types::{
        ballot::Ballot,
        data_types::{QuorumSetHash, SignatureBytes, SlotIndex, Value},
    };

    fn node(n: u8) -> NodeId {
        NodeId::new([n; 32])
    }

    fn node_set(ids: &[u8]) -> BTreeSet<NodeId> {
        ids.iter().map(|n| node(*n)).collect()
    }

    // Envelope whose statement's ballot counter encodes a fake "vote" the filter can select on.
    fn envelope(sender: NodeId, counter: u32) -> ScpEnvelope {
        ScpEnvelope {
            statement: ScpStatement {
                node_id: sender,
                slot_index: SlotIndex::new(0),
                pledges: ScpStatementPledges::Prepare(PrepareStatement {
                    quorum_set_hash: QuorumSetHash::new([0; 32]),
                    ballot: Ballot::new(counter, Value::new(b"v".to_vec())),
                    prepared: None,
                    prepared_prime: None,
                    n_c: 0,
                    n_h: 0,
                }),
            },
            signature: SignatureBytes::new([0; 64]),
        }
    }

    fn envelope_map(senders: &[(u8, u32)]) -> BTreeMap<NodeId, ScpEnvelope> {
        senders
            .iter()
            .map(|(n, counter)| (node(*n), envelope(node(*n), *counter)))
            .collect()
    }

    fn counter_at_least(min: u32) -> impl Fn(&ScpStatement) -> bool {
        move |statement| match &statement.pledges {
            ScpStatementPledges::Prepare(p) => p.ballot.counter >= min,
            _ => false,
        }
    }

    #[test]
    fn quorum_slice_respects_flat_threshold() {
        let qset = QuorumSet::new(2, vec![node(1), node(2), node(3)]);
        assert!(is_quorum_slice(&qset, &node_set(&[1, 2])));
        assert!(is_quorum_slice(&qset, &node_set(&[1, 2, 3])));
        assert!(!is_quorum_slice(&qset, &node_set(&[3])));
    }

    #[test]
    fn quorum_slice_counts_satisfied_inner_sets() {
        // 2-of-{A, {1-of-{B, C}}}
        let qset = QuorumSet {
            threshold: 2,
            validators: vec![node(1)],
            inner_sets: vec![QuorumSet::new(1, vec![node(2), node(3)])],
        };
        assert!(is_quorum_slice(&qset, &node_set(&[1, 3])));
        assert!(!is_quorum_slice(&qset, &node_set(&[1])));
        assert!(!is_quorum_slice(&qset, &node_set(&[2, 3])));
    }

    #[test]
    fn v_blocking_needs_members_beyond_slack() {
        // threshold 3 of 4: any 2 nodes block
        let qset = QuorumSet::new(3, vec![node(1), node(2), node(3), node(4)]);
        assert!(!is_v_blocking_set(&qset, &node_set(&[1])));
        assert!(is_v_blocking_set(&qset, &node_set(&[1, 2])));
        assert!(!is_v_blocking_set(&qset, &node_set(&[])));
    }

    #[test]
    fn empty_quorum_set_has_no_v_blocking_set() {
        let qset = QuorumSet {
            threshold: 0,
            validators: vec![],
            inner_sets: vec![],
        };
        assert!(!is_v_blocking_set(&qset, &node_set(&[1, 2, 3])));
    }

    #[test]
    fn quorum_requires_transitive_closure() {
        // Symmetric federation: everyone requires 2-of-{1,2,3}.
        let qset = QuorumSet::new(2, vec![node(1), node(2), node(3)]);
        let resolve = |_: &ScpStatement| Some(QuorumSet::new(2, vec![node(1), node(2), node(3)]));

        let envelopes = envelope_map(&[(1, 5), (2, 5), (3, 1)]);

        assert!(is_quorum(&qset, &envelopes, resolve, counter_at_least(5)));
        assert!(!is_quorum(&qset, &envelopes, resolve, counter_at_least(6)));
    }

    #[test]
    fn unresolvable_members_drop_out_of_quorum() {
        let qset = QuorumSet::new(2, vec![node(1), node(2), node(3)]);
        let envelopes = envelope_map(&[(1, 5), (2, 5)]);

        // node 2's quorum set is unknown, so only node 1 remains: not a quorum
        let resolve = |statement: &ScpStatement| {
            if statement.node_id == node(2) {
                None
            } else {
                Some(QuorumSet::new(2, vec![node(1), node(2), node(3)]))
            }
        };
        assert!(!is_quorum(&qset, &envelopes, resolve, counter_at_least(5)));
    }

    #[test]
    fn member_without_slice_is_narrowed_out() {
        // Node 3 votes, but its own quorum set requires node 4, which did not vote. Node 3 must
        // not count towards the local quorum.
        let local = QuorumSet::new(3, vec![node(1), node(2), node(3)]);
        let envelopes = envelope_map(&[(1, 5), (2, 5), (3, 5)]);
        let resolve = |statement: &ScpStatement| {
            if statement.node_id == node(3) {
                Some(QuorumSet::new(1, vec![node(4)]))
            } else {
                Some(QuorumSet::new(2, vec![node(1), node(2), node(3)]))
            }
        };
        assert!(!is_quorum(&local, &envelopes, resolve, counter_at_least(5)));
    }

    #[test]
    fn closest_v_blocking_reports_minimal_agreeing_set() {
        let qset = QuorumSet::new(3, vec![node(1), node(2), node(3), node(4)]);

        // All four agree: 2 nodes are enough to block.
        let envelopes = envelope_map(&[(1, 5), (2, 5), (3, 5), (4, 5)]);
        let closest = find_closest_v_blocking(&qset, &envelopes, counter_at_least(5), None);
        assert_eq!(closest.len(), 2);

        // Two already disagree: the set is blocked without losing anyone else.
        let envelopes = envelope_map(&[(1, 5), (2, 5), (3, 1), (4, 1)]);
        let closest = find_closest_v_blocking(&qset, &envelopes, counter_at_least(5), None);
        assert!(closest.is_empty());
    }
}
