/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum set configuration: each node's declaration of whom it requires agreement from.
//!
//! A [`QuorumSet`] is a threshold over a list of validators and nested inner sets. A node's quorum
//! *slices* are all the subsets that satisfy the threshold recursively. The federated voting
//! primitives in [`voting`](crate::voting) interpret quorum sets; this module only defines the
//! structure, its [sanity rules](QuorumSet::check_sane), and its [hash](QuorumSet::hash), which is
//! what statements carry on the wire.

use std::collections::HashSet;
use std::fmt::Debug;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use super::data_types::{NodeId, QuorumSetHash};

/// Maximum number of levels of inner sets below the root of a quorum set.
const MAX_NESTING_DEPTH: u32 = 2;

/// Maximum total number of validators mentioned across a whole quorum set.
const MAX_NODES: usize = 1000;

/// A threshold over validators and nested sub-slices.
///
/// `threshold` counts satisfied members, where a member is either a validator (satisfied when it is
/// in the set of nodes under consideration) or an inner set (satisfied when it recursively meets its
/// own threshold).
#[derive(Clone, PartialEq, Eq)]
pub struct QuorumSet {
    pub threshold: u32,
    pub validators: Vec<NodeId>,
    pub inner_sets: Vec<QuorumSet>,
}

// `BorshSerialize`/`BorshDeserialize` are implemented by hand rather than derived: the derive
// macro emits a `Vec<QuorumSet>: BorshSerialize` where-clause bound for the `inner_sets` field,
// and proving that bound recursively requires `QuorumSet: BorshSerialize` itself, which overflows
// the trait solver for this self-referential type. A manual impl serializing fields in the same
// order sidesteps the self-referential bound while producing identical bytes.
impl BorshSerialize for QuorumSet {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.threshold.serialize(writer)?;
        self.validators.serialize(writer)?;
        self.inner_sets.serialize(writer)
    }
}

impl BorshDeserialize for QuorumSet {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            threshold: u32::deserialize_reader(reader)?,
            validators: Vec::<NodeId>::deserialize_reader(reader)?,
            inner_sets: Vec::<QuorumSet>::deserialize_reader(reader)?,
        })
    }
}

impl QuorumSet {
    /// Create a flat `QuorumSet` requiring `threshold` of `validators`.
    pub fn new(threshold: u32, validators: Vec<NodeId>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets: Vec::new(),
        }
    }

    /// Get the number of members (validators plus inner sets) directly under this quorum set.
    pub fn members(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }

    /// Compute the SHA-256 hash of this quorum set's serialized form.
    ///
    /// This is the identifier that statements carry in their `quorum_set_hash` fields.
    pub fn hash(&self) -> QuorumSetHash {
        let bytes = self
            .try_to_vec()
            .expect("serializing a quorum set is infallible");
        QuorumSetHash::new(Sha256::digest(&bytes).into())
    }

    /// Check whether this quorum set is well-formed.
    ///
    /// A sane quorum set has, at every level, a threshold between 1 and the number of members, at
    /// most [`MAX_NESTING_DEPTH`] levels of inner sets below the root, no more than [`MAX_NODES`]
    /// validators in total, and no validator mentioned twice anywhere in the structure.
    ///
    /// Statements referencing a quorum set that fails this check are rejected on ingestion.
    pub fn check_sane(&self) -> Result<(), QuorumSetError> {
        let mut seen = HashSet::new();
        self.check_sane_internal(0, &mut seen)?;
        if seen.len() > MAX_NODES {
            return Err(QuorumSetError::TooManyValidators);
        }
        Ok(())
    }

    fn check_sane_internal(
        &self,
        depth: u32,
        seen: &mut HashSet<NodeId>,
    ) -> Result<(), QuorumSetError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(QuorumSetError::NestedTooDeeply);
        }

        let members = self.members() as u32;
        if self.threshold == 0 || self.threshold > members {
            return Err(QuorumSetError::ThresholdOutOfRange {
                threshold: self.threshold,
                members,
            });
        }

        for validator in &self.validators {
            if !seen.insert(*validator) {
                return Err(QuorumSetError::DuplicateValidator(*validator));
            }
        }

        for inner in &self.inner_sets {
            inner.check_sane_internal(depth + 1, seen)?;
        }

        Ok(())
    }
}

/// The ways in which a [`QuorumSet`] can be malformed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuorumSetError {
    /// A (possibly inner) set has a threshold of 0 or one exceeding its member count.
    ThresholdOutOfRange { threshold: u32, members: u32 },

    /// Inner sets are nested more than [`MAX_NESTING_DEPTH`] levels below the root.
    NestedTooDeeply,

    /// More than [`MAX_NODES`] validators are mentioned across the whole structure.
    TooManyValidators,

    /// The same validator appears more than once anywhere in the structure.
    DuplicateValidator(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::new([n; 32])
    }

    #[test]
    fn flat_set_with_valid_threshold_is_sane() {
        let qset = QuorumSet::new(2, vec![node(1), node(2), node(3)]);
        assert_eq!(qset.check_sane(), Ok(()));
    }

    #[test]
    fn zero_and_oversized_thresholds_are_rejected() {
        let empty = QuorumSet::new(0, vec![node(1)]);
        assert!(matches!(
            empty.check_sane(),
            Err(QuorumSetError::ThresholdOutOfRange { .. })
        ));

        let oversized = QuorumSet::new(4, vec![node(1), node(2), node(3)]);
        assert!(matches!(
            oversized.check_sane(),
            Err(QuorumSetError::ThresholdOutOfRange { .. })
        ));
    }

    #[test]
    fn duplicate_validators_are_rejected_across_levels() {
        let qset = QuorumSet {
            threshold: 2,
            validators: vec![node(1), node(2)],
            inner_sets: vec![QuorumSet::new(1, vec![node(1)])],
        };
        assert_eq!(
            qset.check_sane(),
            Err(QuorumSetError::DuplicateValidator(node(1)))
        );
    }

    #[test]
    fn nesting_beyond_two_levels_is_rejected() {
        let level3 = QuorumSet::new(1, vec![node(4)]);
        let level2 = QuorumSet {
            threshold: 1,
            validators: vec![node(3)],
            inner_sets: vec![level3],
        };
        let level1 = QuorumSet {
            threshold: 1,
            validators: vec![node(2)],
            inner_sets: vec![level2],
        };
        let root = QuorumSet {
            threshold: 1,
            validators: vec![node(1)],
            inner_sets: vec![level1],
        };
        assert_eq!(root.check_sane(), Err(QuorumSetError::NestedTooDeeply));
    }

    #[test]
    fn hash_is_stable_and_distinguishes_sets() {
        let a = QuorumSet::new(2, vec![node(1), node(2), node(3)]);
        let b = QuorumSet::new(3, vec![node(1), node(2), node(3)]);
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
    }
}
