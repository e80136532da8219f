/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable integration of the ballot protocol into a host system.
//!
//! The ballot protocol is a pure state machine: it owns no sockets, no clocks, and no storage.
//! Everything it needs from the outside world arrives through an implementation of [`ScpDriver`],
//! which the host passes into every entry point of
//! [`BallotProtocol`](crate::ballot_protocol::implementation::BallotProtocol).
//!
//! ## Determinism
//!
//! Implementors of `ScpDriver` are expected to be *deterministic* in
//! [`validate_value`](ScpDriver::validate_value): every call should evaluate to the same level for
//! the same `(slot_index, value)` pair, since disagreement between nodes about validity translates
//! directly into disagreement about consensus.
//!
//! ## Timers
//!
//! The protocol does not call back into itself asynchronously. [`setup_timer`](ScpDriver::setup_timer)
//! only *registers* a deadline with the host's scheduler; when the deadline passes, the host must
//! call [`BallotProtocol::timer_expired`](crate::ballot_protocol::implementation::BallotProtocol::timer_expired)
//! on the same thread it runs the rest of the protocol on. Registering a new deadline for the same
//! `(slot_index, timer)` pair replaces the previous one, and a `delay` of `None` cancels it.

use std::time::Duration;

use crate::ballot_protocol::messages::ScpEnvelope;
use crate::types::{
    ballot::Ballot,
    data_types::{QuorumSetHash, SlotIndex, Value},
    quorum_set::QuorumSet,
};

/// How far the host vouches for a value's validity.
///
/// The ordering is significant: when a statement mentions several values, the statement's overall
/// level is the *minimum* of the individual levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// The value is malformed or otherwise unacceptable. Statements mentioning it are rejected.
    Invalid,

    /// The value cannot be fully checked locally (e.g., it depends on state this node has not
    /// caught up to). The protocol still advances on it, but stops broadcasting its own statements
    /// for the slot.
    MaybeValid,

    /// The value passed every local check.
    FullyValid,
}

/// Identifies a logical timer slot on the host's scheduler.
///
/// The ballot protocol uses a single timer per slot; the host may multiplex timers of other
/// subsystems (e.g. nomination) onto the same scheduler under different ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    BallotProtocol,
}

/// The interface between the ballot protocol and its host system.
///
/// The required methods cover transport, value validation, timeouts, quorum set resolution, and
/// the handover points with the external nomination stage. The provided methods are observability
/// hooks: they default to no-ops and are called *after* the corresponding transition has been
/// applied.
pub trait ScpDriver {
    /// Broadcast `envelope` to the network.
    ///
    /// Called at most once per external input, with the latest own statement, and only while the
    /// slot is fully validated.
    fn emit_envelope(&mut self, envelope: &ScpEnvelope);

    /// Check `value` against application-level validity rules.
    fn validate_value(&mut self, slot_index: SlotIndex, value: &Value) -> ValidationLevel;

    /// Compute the timeout for the given ballot round. `is_nomination` is `false` for every call
    /// made by the ballot protocol; the flag exists so a host can share one schedule with its
    /// nomination stage.
    fn compute_timeout(&mut self, round_number: u32, is_nomination: bool) -> Duration;

    /// Register (`Some(delay)`) or cancel (`None`) the deadline of `timer`. On expiry the host
    /// calls back into the protocol's timer entry point.
    fn setup_timer(&mut self, slot_index: SlotIndex, timer: TimerId, delay: Option<Duration>);

    /// Resolve a quorum set from its hash, or `None` if the body is not (yet) known.
    fn resolve_quorum_set(&self, quorum_set_hash: &QuorumSetHash) -> Option<QuorumSet>;

    /// Get the latest composite candidate value produced by the external nomination stage for
    /// `slot_index`, if any. Used as the value to bump to when the timer expires before any ballot
    /// was adopted.
    fn nomination_candidate(&self, slot_index: SlotIndex) -> Option<Value>;

    /// Tell the nomination stage to stop working on `slot_index`. Called exactly once, on
    /// externalization.
    fn stop_nomination(&mut self, slot_index: SlotIndex);

    /// The protocol adopted its first ballot for the slot.
    fn started_ballot_protocol(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}

    /// `ballot` was accepted as prepared.
    fn accepted_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}

    /// `ballot` was confirmed prepared (it became the new high ballot).
    fn confirmed_ballot_prepared(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}

    /// Commit was accepted up to `ballot`.
    fn accepted_commit(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}

    /// The slot externalized `value`. Terminal: the protocol never calls the driver about this
    /// slot again except to re-broadcast evidence.
    fn value_externalized(&mut self, _slot_index: SlotIndex, _value: &Value) {}

    /// A quorum of peers reached the local ballot's counter.
    fn ballot_did_hear_from_quorum(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}
}
