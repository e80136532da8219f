/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages that are sent between nodes as part of the ballot protocol.
//!
//! ## Statements
//!
//! The ballot protocol involves three kinds of statements, one per phase:
//! 1. [`PrepareStatement`]: pledges that the sender is voting to prepare `ballot`, and records the
//!    highest ballots it has accepted as prepared (`prepared`, `prepared_prime`), the counter range
//!    it has confirmed prepared (`n_h`), and the counter it is voting to commit from (`n_c`).
//! 2. [`ConfirmStatement`]: pledges that the sender has accepted commit for every ballot with its
//!    value and a counter in `[n_commit, n_h]`.
//! 3. [`ExternalizeStatement`]: pledges that the sender has confirmed commit for `commit` and will
//!    never act on a different value in this slot.
//!
//! A statement travels inside an [`ScpEnvelope`], which binds it to its originating node with an
//! Ed25519 signature. Envelope signatures are produced here; verifying them on receipt is the
//! containing subsystem's responsibility.
//!
//! ## Projections
//!
//! The federated voting predicates in [`implementation`](super::implementation) are composed out of
//! a handful of projections of a statement onto single ballots or counters. These are deliberately
//! free functions over the statement ([`working_ballot`], [`ballot_counter`],
//! [`companion_quorum_set_hash`], [`statement_values`]) rather than methods, so predicates can name
//! them without committing to a statement variant.
//!
//! ## Ordering
//!
//! [`is_newer_statement`] defines the per-sender total order used to discard stale messages: first
//! by variant rank (`PREPARE < CONFIRM < EXTERNALIZE`), then lexicographically within a variant. Two
//! `EXTERNALIZE` statements from the same node never replace one another.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    ballot::{are_ballots_less_and_incompatible, Ballot},
    crypto_primitives::{Keypair, Signature, Verifier, VerifyingKey},
    data_types::{NodeId, QuorumSetHash, SignatureBytes, SlotIndex, Value},
};

/// Pledges made by a node in the PREPARE phase.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrepareStatement {
    pub quorum_set_hash: QuorumSetHash,
    pub ballot: Ballot,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    /// Lowest counter the sender is voting to commit, 0 when unset.
    pub n_c: u32,
    /// Highest counter the sender has confirmed prepared, 0 when unset.
    pub n_h: u32,
}

/// Pledges made by a node in the CONFIRM phase.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ConfirmStatement {
    pub ballot: Ballot,
    pub n_prepared: u32,
    pub n_commit: u32,
    pub n_h: u32,
    pub quorum_set_hash: QuorumSetHash,
}

/// Pledges made by a node that has externalized.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ExternalizeStatement {
    pub commit: Ballot,
    pub n_h: u32,
    pub commit_quorum_set_hash: QuorumSetHash,
}

/// The three kinds of pledges a ballot-protocol statement can carry.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ScpStatementPledges {
    Prepare(PrepareStatement),
    Confirm(ConfirmStatement),
    Externalize(ExternalizeStatement),
}

impl ScpStatementPledges {
    /// Rank used as the most significant key of the statement total order.
    fn rank(&self) -> u8 {
        match self {
            ScpStatementPledges::Prepare(_) => 0,
            ScpStatementPledges::Confirm(_) => 1,
            ScpStatementPledges::Externalize(_) => 2,
        }
    }
}

impl From<PrepareStatement> for ScpStatementPledges {
    fn from(prepare: PrepareStatement) -> Self {
        ScpStatementPledges::Prepare(prepare)
    }
}

impl From<ConfirmStatement> for ScpStatementPledges {
    fn from(confirm: ConfirmStatement) -> Self {
        ScpStatementPledges::Confirm(confirm)
    }
}

impl From<ExternalizeStatement> for ScpStatementPledges {
    fn from(externalize: ExternalizeStatement) -> Self {
        ScpStatementPledges::Externalize(externalize)
    }
}

/// A statement made by `node_id` about `slot_index`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ScpStatement {
    pub node_id: NodeId,
    pub slot_index: SlotIndex,
    pub pledges: ScpStatementPledges,
}

/// An [`ScpStatement`] signed by its originating node.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ScpEnvelope {
    pub statement: ScpStatement,
    pub signature: SignatureBytes,
}

impl ScpEnvelope {
    /// Create a new `ScpEnvelope` by signing `statement` with `keypair`.
    pub fn new(keypair: &Keypair, statement: ScpStatement) -> Self {
        let message_bytes = statement
            .try_to_vec()
            .expect("serializing a statement is infallible");
        let signature = keypair.sign(&message_bytes);
        Self {
            statement,
            signature,
        }
    }

    /// Verify that this envelope's signature was created by the node named in its statement.
    pub fn is_correct(&self) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.statement.node_id.bytes()) else {
            return false;
        };
        let Ok(message_bytes) = self.statement.try_to_vec() else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature.bytes());
        verifying_key.verify(&message_bytes, &signature).is_ok()
    }
}

/// Project a statement onto the single ballot used for value-compatibility tests.
///
/// For a `CONFIRM` statement this is `(n_commit, ballot.value)`: the lowest ballot the sender is
/// committed to.
pub fn working_ballot(statement: &ScpStatement) -> Ballot {
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => p.ballot.clone(),
        ScpStatementPledges::Confirm(c) => Ballot::new(c.n_commit, c.ballot.value.clone()),
        ScpStatementPledges::Externalize(e) => e.commit.clone(),
    }
}

/// Get the ballot counter a statement is working at.
///
/// An `EXTERNALIZE` statement stands for an unbounded ballot, so it reports `u32::MAX`.
pub fn ballot_counter(statement: &ScpStatement) -> u32 {
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => p.ballot.counter,
        ScpStatementPledges::Confirm(c) => c.ballot.counter,
        ScpStatementPledges::Externalize(_) => u32::MAX,
    }
}

/// Get the hash of the quorum set that federated voting should interpret the statement under.
pub fn companion_quorum_set_hash(statement: &ScpStatement) -> QuorumSetHash {
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => p.quorum_set_hash,
        ScpStatementPledges::Confirm(c) => c.quorum_set_hash,
        ScpStatementPledges::Externalize(e) => e.commit_quorum_set_hash,
    }
}

/// Collect every value a statement mentions, for value validation.
///
/// A `PREPARE` statement's current ballot is skipped while its counter is the pre-adoption sentinel
/// 0, since the ballot is not a vote yet.
pub fn statement_values(statement: &ScpStatement) -> BTreeSet<Value> {
    let mut values = BTreeSet::new();
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => {
            if p.ballot.counter != 0 {
                values.insert(p.ballot.value.clone());
            }
            if let Some(prepared) = &p.prepared {
                values.insert(prepared.value.clone());
            }
            if let Some(prepared_prime) = &p.prepared_prime {
                values.insert(prepared_prime.value.clone());
            }
        }
        ScpStatementPledges::Confirm(c) => {
            values.insert(c.ballot.value.clone());
        }
        ScpStatementPledges::Externalize(e) => {
            values.insert(e.commit.value.clone());
        }
    }
    values
}

/// Check whether a statement's pledges are internally consistent.
///
/// `is_self` relaxes the `PREPARE` check to allow `ballot.counter == 0`: a node's own statement may
/// carry the pre-adoption sentinel transiently, but such a statement is never emitted.
pub fn is_statement_sane(statement: &ScpStatement, is_self: bool) -> bool {
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => {
            let mut is_ok = is_self || p.ballot.counter > 0;

            if let (Some(prepared), Some(prepared_prime)) = (&p.prepared, &p.prepared_prime) {
                is_ok = is_ok && are_ballots_less_and_incompatible(prepared_prime, prepared);
            }

            is_ok = is_ok
                && (p.n_h == 0
                    || p.prepared
                        .as_ref()
                        .is_some_and(|prepared| p.n_h <= prepared.counter));

            // n_c != 0 requires n_c <= n_h <= ballot.counter
            is_ok
                && (p.n_c == 0
                    || (p.n_h != 0 && p.ballot.counter >= p.n_h && p.n_h >= p.n_c))
        }
        ScpStatementPledges::Confirm(c) => {
            c.ballot.counter > 0 && c.n_h <= c.ballot.counter && c.n_commit <= c.n_h
        }
        ScpStatementPledges::Externalize(e) => e.commit.counter > 0 && e.n_h >= e.commit.counter,
    }
}

/// Check whether `new` is strictly newer than `old` under the per-sender statement total order.
pub fn is_newer_statement(old: &ScpStatement, new: &ScpStatement) -> bool {
    if old.pledges.rank() != new.pledges.rank() {
        return old.pledges.rank() < new.pledges.rank();
    }

    match (&old.pledges, &new.pledges) {
        // A node only ever has one EXTERNALIZE statement; duplicates are stale.
        (ScpStatementPledges::Externalize(_), ScpStatementPledges::Externalize(_)) => false,
        (ScpStatementPledges::Confirm(old_c), ScpStatementPledges::Confirm(new_c)) => {
            // sorted by (ballot, n_prepared, n_h)
            (&old_c.ballot, old_c.n_prepared, old_c.n_h)
                < (&new_c.ballot, new_c.n_prepared, new_c.n_h)
        }
        (ScpStatementPledges::Prepare(old_p), ScpStatementPledges::Prepare(new_p)) => {
            // sorted by (ballot, prepared, prepared_prime, n_h), unset ballots sorting lowest
            (
                &old_p.ballot,
                &old_p.prepared,
                &old_p.prepared_prime,
                old_p.n_h,
            ) < (
                &new_p.ballot,
                &new_p.prepared,
                &new_p.prepared_prime,
                new_p.n_h,
            )
        }
        _ => unreachable!("ranks were equal, so the variants must match"),
    }
}
