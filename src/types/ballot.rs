/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Ballots: the unit of voting within a slot.
//!
//! A [`Ballot`] pairs a round counter with a candidate [`Value`]. Ballots are totally ordered,
//! lexicographically by `(counter, value)`, and two ballots are **compatible** iff they carry the
//! same value. Most of the ballot protocol's case analysis is phrased in terms of the
//! "less-and-compatible" and "less-and-incompatible" relations, which this module provides as free
//! functions so that federated-voting predicates can compose them.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::Value;

/// A `(counter, value)` pair: one round of voting for `value` within a slot.
///
/// `counter` starts at 1 for the first ballot a node adopts. Counter 0 is a sentinel that appears
/// only inside a node's own transient statements before any ballot is adopted and is never put on
/// the wire. Counter `u32::MAX` stands for the unbounded ballot implied by an externalizing node.
///
/// The derived `Ord` implementation is the ballot total order used throughout the protocol:
/// lexicographic by `(counter, value)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Ballot {
    pub counter: u32,
    pub value: Value,
}

impl Ballot {
    /// Create a new `Ballot` with the given `counter` and `value`.
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }
}

impl Display for Ballot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.counter, self.value)
    }
}

impl Debug for Ballot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Ballot{}", self)
    }
}

/// Check whether `b1` and `b2` carry the same value.
pub fn are_ballots_compatible(b1: &Ballot, b2: &Ballot) -> bool {
    b1.value == b2.value
}

/// Check whether `b1 <= b2` and `b1` is compatible with `b2`.
pub fn are_ballots_less_and_compatible(b1: &Ballot, b2: &Ballot) -> bool {
    b1 <= b2 && are_ballots_compatible(b1, b2)
}

/// Check whether `b1 <= b2` and `b1` is incompatible with `b2`.
pub fn are_ballots_less_and_incompatible(b1: &Ballot, b2: &Ballot) -> bool {
    b1 <= b2 && !are_ballots_compatible(b1, b2)
}

/// Compare two optional ballots, treating an unset ballot as smaller than any set ballot.
pub fn compare_ballots(b1: Option<&Ballot>, b2: Option<&Ballot>) -> Ordering {
    match (b1, b2) {
        (Some(b1), Some(b2)) => b1.cmp(b2),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
