//! Subprotocol for committing a single value per slot.
//!
//! # Introduction
//!
//! The ballot protocol is the voting/commit phase of the Stellar Consensus Protocol (SCP), a
//! federated Byzantine agreement algorithm. An external nomination stage produces a candidate
//! value; the ballot protocol's job is to drive a quorum of nodes to *externalize* (irrevocably
//! commit) a single value for the slot, despite crashed and malicious participants and despite
//! adversarial reordering of messages between honest ones.
//!
//! Unlike quorum-certificate-based BFT protocols, SCP has no global validator set and no
//! signatures-over-thresholds: each node declares its own [`QuorumSet`](crate::types::quorum_set),
//! and agreement is defined through the *federated voting* rules implemented in
//! [`voting`](crate::voting):
//! - a node **ratifies** a statement when a quorum containing it votes for the statement;
//! - a node **accepts** a statement when either a quorum votes for it, or a v-blocking set of the
//!   node's quorum set already accepts it (the v-blocking branch lets a node adopt a statement it
//!   never voted for, because a v-blocking set intersects every quorum the node could ever rely
//!   on).
//!
//! # Ballots and phases
//!
//! Voting proceeds in [`Ballot`](crate::types::ballot::Ballot)s: `(counter, value)` pairs, totally
//! ordered, with higher counters superseding lower ones and the value deciding compatibility. Per
//! slot, a node tracks five monotonically advancing ballots:
//!
//! | name | meaning |
//! |------|---------|
//! | `b`  | the ballot currently being voted to prepare |
//! | `p`  | highest ballot accepted as prepared |
//! | `p'` | highest ballot accepted as prepared that is incompatible with `p` |
//! | `h`  | highest ballot confirmed as prepared |
//! | `c`  | lowest ballot the node is voting to commit |
//!
//! and moves through three phases: `PREPARE` (voting to prepare ballots, abandoning incompatible
//! ones), `CONFIRM` (commit accepted; the node now only works on counters of a fixed value), and
//! `EXTERNALIZE` (commit confirmed; terminal).
//!
//! On every relevant state change the node re-runs four attempt steps in white-paper order —
//! accept-prepared, confirm-prepared, accept-commit, confirm-commit — followed by the counter
//! bumping rule that keeps it from being left behind by a v-blocking set of peers working at
//! higher counters. Each step that changes state causes a new statement for the whole local state
//! to be synthesized and re-ingested, which can trigger further steps; the recursion is bounded
//! and at most one outbound message is broadcast per external input.
//!
//! Main type: [`BallotProtocol`](implementation::BallotProtocol).

pub mod messages;

pub mod implementation;
