/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the ballot protocol, as specified in [`ballot_protocol`](super).
//!
//! Main type: [`BallotProtocol`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use serde_json::{json, Value as JsonValue};

use crate::driver::{ScpDriver, TimerId, ValidationLevel};
use crate::events::{
    AcceptCommitEvent, AcceptPreparedEvent, BallotTimeoutEvent, BumpBallotEvent,
    ConfirmPreparedEvent, EmitEnvelopeEvent, Event, ExternalizeEvent, HeardFromQuorumEvent,
    LostQuorumEvent, ReceiveEnvelopeEvent, StartBallotProtocolEvent,
};
use crate::types::{
    ballot::{
        are_ballots_compatible, are_ballots_less_and_compatible, are_ballots_less_and_incompatible,
        Ballot,
    },
    crypto_primitives::Keypair,
    data_types::{NodeId, QuorumSetHash, SlotIndex, Value},
    quorum_set::QuorumSet,
};
use crate::voting;

use super::messages::{
    ballot_counter, companion_quorum_set_hash, is_newer_statement, is_statement_sane,
    statement_values, working_ballot, ConfirmStatement, ExternalizeStatement, PrepareStatement,
    ScpEnvelope, ScpStatement, ScpStatementPledges,
};

/// Max number of state transitions that can occur from processing one message.
pub const MAX_ADVANCE_SLOT_RECURSION: u32 = 50;

/// Number of ballot timer expirations after which a silent peer is reported as missing rather than
/// merely unheard-from.
const NUM_TIMEOUTS_THRESHOLD_FOR_REPORTING: u32 = 3;

/// A commit counter interval `[lo, hi]`. `lo == 0` means "not found yet".
type Interval = (u32, u32);

/// The phase the ballot protocol is in for a slot.
///
/// Phases only ever advance, in declaration order. `Externalize` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BallotPhase {
    Prepare,
    Confirm,
    Externalize,
}

impl BallotPhase {
    /// The phase name as it appears in statements and operator output.
    pub fn name(&self) -> &'static str {
        match self {
            BallotPhase::Prepare => "PREPARE",
            BallotPhase::Confirm => "CONFIRM",
            BallotPhase::Externalize => "EXTERNALIZE",
        }
    }
}

/// The verdict of [`BallotProtocol::process_envelope`] on a single envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeState {
    /// The envelope was recorded (and possibly advanced the local state).
    Valid,

    /// The envelope was malformed, stale, or carried an invalid value. No state changed.
    Invalid,
}

/// The ways in which the ballot protocol can fail fatally for its slot.
///
/// Any of these indicates that the slot can make no further progress: either the network fed the
/// node a pathological message graph, or there is a bug. The caller must treat the slot as failed
/// rather than continue.
#[derive(Debug)]
pub enum BallotProtocolError {
    /// More than [`MAX_ADVANCE_SLOT_RECURSION`] state transitions resulted from a single message.
    MaxRecursionReached,

    /// The node produced a statement for itself that it then rejected on re-ingestion.
    MovedToBadState,

    /// [`BallotProtocol::set_state_from_envelope`] was called after the protocol already adopted a
    /// ballot.
    StateAlreadySet,
}

/// Immutable parameters that define the behaviour of a [`BallotProtocol`] instance and never
/// change over the lifetime of its slot.
#[derive(Clone)]
pub struct BallotProtocolConfig {
    /// The slot this instance is deciding.
    pub slot_index: SlotIndex,

    /// The keypair with which the instance signs its own statements. The derived
    /// [`NodeId`](crate::types::data_types::NodeId) is the instance's identity in the federation.
    pub keypair: Keypair,

    /// The local node's quorum set.
    pub quorum_set: QuorumSet,
}

/// A single participant in the ballot protocol, holding the per-slot voting state.
///
/// # Usage
///
/// The `BallotProtocol` struct is meant to be used in an "event-oriented" fashion: the host calls
/// an entry point whenever something happens to the node, passing its [`ScpDriver`] each time.
/// The entry points are:
/// 1. [`process_envelope`](Self::process_envelope): called for every ballot-protocol envelope
///    received from the network (after signature verification), and for nothing else.
/// 2. [`bump_state`](Self::bump_state): called when the external nomination stage produces a
///    candidate value for the slot.
/// 3. [`timer_expired`](Self::timer_expired): called when the deadline registered through
///    [`ScpDriver::setup_timer`] passes.
/// 4. [`set_state_from_envelope`](Self::set_state_from_envelope): optionally called once, before
///    anything else, to restore the state a previous incarnation of the process had reached.
///
/// All entry points are synchronous and must be called from a single thread: every call runs the
/// protocol to a fixed point before returning.
pub struct BallotProtocol {
    config: BallotProtocolConfig,
    local_node_id: NodeId,
    local_quorum_set_hash: QuorumSetHash,

    phase: BallotPhase,
    /// `b`: the ballot currently being voted to prepare.
    current: Option<Ballot>,
    /// `p`: the highest ballot accepted as prepared.
    prepared: Option<Ballot>,
    /// `p'`: the highest ballot accepted as prepared that is incompatible with `p`.
    prepared_prime: Option<Ballot>,
    /// `h`: the highest ballot confirmed as prepared.
    high: Option<Ballot>,
    /// `c`: the lowest ballot being voted to commit.
    commit: Option<Ballot>,
    /// The value seen confirmed prepared, or at least voted to commit: preferred over the
    /// nomination candidate on subsequent bumps.
    value_override: Option<Value>,

    latest_envelopes: BTreeMap<NodeId, ScpEnvelope>,
    /// Latest own envelope that passed re-ingestion.
    last_envelope: Option<ScpEnvelope>,
    /// Latest own envelope actually handed to the driver for broadcast.
    last_envelope_emit: Option<ScpEnvelope>,

    heard_from_quorum: bool,
    current_message_level: u32,
    timer_exp_count: u32,
    fully_validated: bool,

    event_publisher: Option<Sender<Event>>,
}

impl BallotProtocol {
    /// Create a new ballot protocol participant for the slot described by `config`.
    pub fn new(config: BallotProtocolConfig, event_publisher: Option<Sender<Event>>) -> Self {
        let local_node_id = config.keypair.node_id();
        let local_quorum_set_hash = config.quorum_set.hash();
        Self {
            config,
            local_node_id,
            local_quorum_set_hash,
            phase: BallotPhase::Prepare,
            current: None,
            prepared: None,
            prepared_prime: None,
            high: None,
            commit: None,
            value_override: None,
            latest_envelopes: BTreeMap::new(),
            last_envelope: None,
            last_envelope_emit: None,
            heard_from_quorum: false,
            current_message_level: 0,
            timer_exp_count: 0,
            fully_validated: true,
            event_publisher,
        }
    }

    /// Process a newly received ballot-protocol envelope.
    ///
    /// ## Internal procedure
    ///
    /// This function executes the following steps:
    /// 1. Check that the statement's pledges are internally consistent and that its companion
    ///    quorum set resolves and is sane. If not, return [`EnvelopeState::Invalid`].
    /// 2. Check that the statement is strictly newer than the sender's previous one. If not,
    ///    return `Invalid`.
    /// 3. Validate every value the statement mentions through the driver. `Invalid` values reject
    ///    the envelope; `MaybeValid` values mark the slot not fully validated, which suppresses
    ///    broadcasting of own statements but not local progress.
    /// 4. If the slot already externalized, record the envelope only if its working ballot agrees
    ///    with the committed value; the phase never changes again.
    /// 5. Otherwise record the envelope and run [`advance_slot`](Self::advance_slot) to a fixed
    ///    point.
    pub fn process_envelope(
        &mut self,
        envelope: ScpEnvelope,
        driver: &mut impl ScpDriver,
    ) -> Result<EnvelopeState, BallotProtocolError> {
        assert_eq!(
            envelope.statement.slot_index, self.config.slot_index,
            "envelope routed to the wrong slot"
        );

        let is_self = envelope.statement.node_id == self.local_node_id;

        if !is_self {
            Event::ReceiveEnvelope(ReceiveEnvelopeEvent {
                timestamp: SystemTime::now(),
                slot_index: self.config.slot_index,
                envelope: envelope.clone(),
            })
            .publish(&self.event_publisher);
        }

        if !self.is_statement_sane_with_quorum_set(&envelope.statement, is_self, driver) {
            if is_self {
                log::error!(
                    "not sane statement from self, skipping, i: {}",
                    self.config.slot_index
                );
            }
            return Ok(EnvelopeState::Invalid);
        }

        if !self.is_newer_statement_from(&envelope.statement.node_id, &envelope.statement) {
            if is_self {
                log::error!(
                    "stale statement from self, skipping, i: {}",
                    self.config.slot_index
                );
            } else {
                log::trace!("stale statement, skipping, i: {}", self.config.slot_index);
            }
            return Ok(EnvelopeState::Invalid);
        }

        let validation_level = self.validate_values(&envelope.statement, driver);
        if validation_level == ValidationLevel::Invalid {
            if is_self {
                log::error!(
                    "invalid value from self, skipping, i: {}",
                    self.config.slot_index
                );
            } else {
                log::trace!("invalid value, i: {}", self.config.slot_index);
            }
            return Ok(EnvelopeState::Invalid);
        }

        if self.phase != BallotPhase::Externalize {
            if validation_level == ValidationLevel::MaybeValid {
                self.fully_validated = false;
            }

            let hint = envelope.statement.clone();
            self.record_envelope(envelope);
            self.advance_slot(&hint, driver)?;
            return Ok(EnvelopeState::Valid);
        }

        // note: this handles also our own messages, in particular our final EXTERNALIZE statement
        let committed = self
            .commit
            .as_ref()
            .expect("commit is set in the EXTERNALIZE phase");
        if committed.value == working_ballot(&envelope.statement).value {
            self.record_envelope(envelope);
            return Ok(EnvelopeState::Valid);
        }

        if is_self {
            log::error!(
                "externalize statement with invalid value from self, skipping, i: {}",
                self.config.slot_index
            );
        }
        Ok(EnvelopeState::Invalid)
    }

    /// Adopt a new ballot carrying `value` (or the value override, if one was confirmed earlier).
    ///
    /// With `force == false` this is a no-op unless no ballot was adopted yet; the nomination
    /// stage uses this form to seed the first ballot. With `force == true` the counter is bumped
    /// by one unconditionally.
    ///
    /// Returns whether the local state changed.
    pub fn bump_state(
        &mut self,
        value: &Value,
        force: bool,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if !force && self.current.is_some() {
            return Ok(false);
        }

        let n = self
            .current
            .as_ref()
            .map_or(1, |current| current.counter + 1);

        self.bump_state_to(value, n, driver)
    }

    /// Adopt the ballot `(n, value)` (or the value override, if one was confirmed earlier).
    ///
    /// Returns whether the local state changed.
    pub fn bump_state_to(
        &mut self,
        value: &Value,
        n: u32,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return Ok(false);
        }

        // use the value that we saw confirmed prepared, or that we at least voted to commit to
        let new_value = self
            .value_override
            .clone()
            .unwrap_or_else(|| value.clone());
        let new_ballot = Ballot::new(n, new_value);

        log::trace!(
            "bump_state i: {} b: {}",
            self.config.slot_index,
            new_ballot
        );

        let updated = self.update_current_value(new_ballot, driver);

        if updated {
            self.emit_current_state_statement(driver)?;
            self.check_heard_from_quorum(driver);
        }

        Ok(updated)
    }

    /// Give up on the current ballot: bump to counter `n`, or to the next counter if `n` is 0,
    /// reusing the latest nomination candidate if the slot has no value of its own yet.
    ///
    /// Returns whether the local state changed.
    pub fn abandon_ballot(
        &mut self,
        n: u32,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        log::trace!("abandon_ballot i: {}", self.config.slot_index);

        let mut value = driver.nomination_candidate(self.config.slot_index);
        if value.as_ref().map_or(true, |value| value.is_empty()) {
            if let Some(current) = &self.current {
                value = Some(current.value.clone());
            }
        }

        match value {
            Some(value) if !value.is_empty() => {
                if n == 0 {
                    self.bump_state(&value, true, driver)
                } else {
                    self.bump_state_to(&value, n, driver)
                }
            }
            _ => Ok(false),
        }
    }

    /// Entry point for the host's scheduler: the ballot timer registered through
    /// [`ScpDriver::setup_timer`] expired.
    pub fn timer_expired(
        &mut self,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        self.timer_exp_count += 1;
        Event::BallotTimeout(BallotTimeoutEvent {
            timestamp: SystemTime::now(),
            slot_index: self.config.slot_index,
            timer_exp_count: self.timer_exp_count,
        })
        .publish(&self.event_publisher);

        self.abandon_ballot(0, driver)
    }

    /// Restore the state a previous incarnation of the process had reached, from the last own
    /// envelope it emitted. Must be called before the protocol adopts any ballot.
    pub fn set_state_from_envelope(
        &mut self,
        envelope: ScpEnvelope,
        driver: &mut impl ScpDriver,
    ) -> Result<(), BallotProtocolError> {
        if self.current.is_some() {
            return Err(BallotProtocolError::StateAlreadySet);
        }

        self.record_envelope(envelope.clone());
        self.last_envelope = Some(envelope.clone());
        self.last_envelope_emit = self.last_envelope.clone();

        match &envelope.statement.pledges {
            ScpStatementPledges::Prepare(p) => {
                let ballot_value = p.ballot.value.clone();
                self.bump_to_ballot(p.ballot.clone(), true, driver);
                self.prepared = p.prepared.clone();
                self.prepared_prime = p.prepared_prime.clone();
                if p.n_h != 0 {
                    self.high = Some(Ballot::new(p.n_h, ballot_value.clone()));
                }
                if p.n_c != 0 {
                    self.commit = Some(Ballot::new(p.n_c, ballot_value));
                }
                self.phase = BallotPhase::Prepare;
            }
            ScpStatementPledges::Confirm(c) => {
                let value = c.ballot.value.clone();
                self.bump_to_ballot(c.ballot.clone(), true, driver);
                self.prepared = Some(Ballot::new(c.n_prepared, value.clone()));
                self.high = Some(Ballot::new(c.n_h, value.clone()));
                self.commit = Some(Ballot::new(c.n_commit, value));
                self.phase = BallotPhase::Confirm;
            }
            ScpStatementPledges::Externalize(e) => {
                let value = e.commit.value.clone();
                self.bump_to_ballot(Ballot::new(u32::MAX, value.clone()), true, driver);
                self.prepared = Some(Ballot::new(u32::MAX, value.clone()));
                self.high = Some(Ballot::new(e.n_h, value));
                self.commit = Some(e.commit.clone());
                self.phase = BallotPhase::Externalize;
            }
        }

        Ok(())
    }

    /// Whether a quorum of peers is known to have reached the local ballot's counter.
    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    /// The phase the slot is in.
    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    /// Whether every value seen so far was fully validated by the driver.
    pub fn fully_validated(&self) -> bool {
        self.fully_validated
    }

    /// The current ballot `b`.
    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.current.as_ref()
    }

    /// The highest ballot accepted as prepared, `p`.
    pub fn prepared_ballot(&self) -> Option<&Ballot> {
        self.prepared.as_ref()
    }

    /// The highest accepted-prepared ballot incompatible with `p`, `p'`.
    pub fn prepared_prime_ballot(&self) -> Option<&Ballot> {
        self.prepared_prime.as_ref()
    }

    /// The highest ballot confirmed as prepared, `h`.
    pub fn high_ballot(&self) -> Option<&Ballot> {
        self.high.as_ref()
    }

    /// The commit ballot `c`.
    pub fn commit_ballot(&self) -> Option<&Ballot> {
        self.commit.as_ref()
    }

    /// The latest envelope recorded for `node_id`, if any.
    pub fn latest_message(&self, node_id: &NodeId) -> Option<&ScpEnvelope> {
        self.latest_envelopes.get(node_id)
    }

    /// All recorded envelopes, withholding the own one unless the slot is fully validated or
    /// `force_self` is set.
    pub fn current_envelopes(&self, force_self: bool) -> Vec<&ScpEnvelope> {
        self.latest_envelopes
            .iter()
            .filter(|(node_id, _)| {
                force_self || **node_id != self.local_node_id || self.fully_validated
            })
            .map(|(_, envelope)| envelope)
            .collect()
    }

    /// Evidence that the slot externalized: every recorded envelope whose working ballot agrees
    /// with the committed value, plus the own one if the slot is fully validated. Empty unless the
    /// phase is `EXTERNALIZE`.
    ///
    /// The containing subsystem broadcasts these to bring lagging peers up to date.
    pub fn externalizing_state(&self) -> Vec<ScpEnvelope> {
        if self.phase != BallotPhase::Externalize {
            return Vec::new();
        }
        let committed = self
            .commit
            .as_ref()
            .expect("commit is set in the EXTERNALIZE phase");

        self.latest_envelopes
            .iter()
            .filter(|(node_id, envelope)| {
                if **node_id == self.local_node_id {
                    self.fully_validated
                } else {
                    are_ballots_compatible(&working_ballot(&envelope.statement), committed)
                }
            })
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    // ## Statement ingestion internals

    fn is_statement_sane_with_quorum_set(
        &self,
        statement: &ScpStatement,
        is_self: bool,
        driver: &impl ScpDriver,
    ) -> bool {
        let quorum_set = match self.statement_quorum_set(statement, driver) {
            Some(quorum_set) => quorum_set,
            None => {
                log::debug!("statement with unknown quorum set, i: {}", self.config.slot_index);
                return false;
            }
        };
        if let Err(reason) = quorum_set.check_sane() {
            log::debug!("invalid quorum set received: {:?}", reason);
            return false;
        }

        if !is_statement_sane(statement, is_self) {
            log::trace!("malformed statement, i: {}", self.config.slot_index);
            return false;
        }
        true
    }

    fn is_newer_statement_from(&self, node_id: &NodeId, statement: &ScpStatement) -> bool {
        match self.latest_envelopes.get(node_id) {
            None => true,
            Some(old) => is_newer_statement(&old.statement, statement),
        }
    }

    fn validate_values(
        &self,
        statement: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> ValidationLevel {
        let values = statement_values(statement);
        if values.is_empty() {
            // this shouldn't happen
            return ValidationLevel::Invalid;
        }

        values.iter().fold(
            ValidationLevel::FullyValid,
            |level, value| {
                if level > ValidationLevel::Invalid {
                    level.min(driver.validate_value(self.config.slot_index, value))
                } else {
                    level
                }
            },
        )
    }

    fn record_envelope(&mut self, envelope: ScpEnvelope) {
        self.latest_envelopes
            .insert(envelope.statement.node_id, envelope);
    }

    fn statement_quorum_set(
        &self,
        statement: &ScpStatement,
        driver: &impl ScpDriver,
    ) -> Option<QuorumSet> {
        let hash = companion_quorum_set_hash(statement);
        if hash == self.local_quorum_set_hash {
            Some(self.config.quorum_set.clone())
        } else {
            driver.resolve_quorum_set(&hash)
        }
    }

    // ## Federated voting over the recorded envelopes

    fn federated_accept(
        &self,
        driver: &impl ScpDriver,
        voted: impl Fn(&ScpStatement) -> bool,
        accepted: impl Fn(&ScpStatement) -> bool,
    ) -> bool {
        // accept rule, first branch: a v-blocking set already accepts the statement
        if voting::is_v_blocking(&self.config.quorum_set, &self.latest_envelopes, &accepted) {
            return true;
        }

        // second branch: a quorum votes for (or accepts) the statement
        voting::is_quorum(
            &self.config.quorum_set,
            &self.latest_envelopes,
            |statement| self.statement_quorum_set(statement, driver),
            |statement| accepted(statement) || voted(statement),
        )
    }

    fn federated_ratify(
        &self,
        driver: &impl ScpDriver,
        voted: impl Fn(&ScpStatement) -> bool,
    ) -> bool {
        voting::is_quorum(
            &self.config.quorum_set,
            &self.latest_envelopes,
            |statement| self.statement_quorum_set(statement, driver),
            voted,
        )
    }

    // ## The advance driver

    /// Re-run the attempt steps in white-paper order, OR-accumulating "did work". Re-entered (up
    /// to [`MAX_ADVANCE_SLOT_RECURSION`] deep) every time an attempt step synthesizes a new own
    /// statement; the bump rule and the heard-from-quorum check run only at the outermost level,
    /// and the single outbound broadcast only happens after the outermost level unwinds.
    fn advance_slot(
        &mut self,
        hint: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> Result<(), BallotProtocolError> {
        self.current_message_level += 1;
        log::trace!(
            "advance_slot {} {}",
            self.current_message_level,
            self.local_state()
        );

        if self.current_message_level >= MAX_ADVANCE_SLOT_RECURSION {
            return Err(BallotProtocolError::MaxRecursionReached);
        }

        let mut did_work = false;

        did_work = self.attempt_accept_prepared(hint, driver)? || did_work;
        did_work = self.attempt_confirm_prepared(hint, driver)? || did_work;
        did_work = self.attempt_accept_commit(hint, driver)? || did_work;
        did_work = self.attempt_confirm_commit(hint, driver)? || did_work;

        // only bump after we're done with everything else
        if self.current_message_level == 1 {
            loop {
                // attempt_bump may re-enter advance_slot
                let did_bump = self.attempt_bump(driver)?;
                did_work = did_bump || did_work;
                if !did_bump {
                    break;
                }
            }

            self.check_heard_from_quorum(driver);
        }

        log::trace!(
            "advance_slot {} - exiting {}",
            self.current_message_level,
            self.local_state()
        );

        self.current_message_level -= 1;

        if did_work {
            self.send_latest_envelope(driver);
        }

        Ok(())
    }

    /// Gather the ballots that could be accepted or confirmed as prepared, given `hint` and the
    /// recorded envelopes.
    ///
    /// Seeds are the ballots the hint mentions (an unbounded ballot for CONFIRM/EXTERNALIZE
    /// hints); every recorded statement then contributes the ballots it references that sit at or
    /// below a seed and share its value.
    fn get_prepare_candidates(&self, hint: &ScpStatement) -> BTreeSet<Ballot> {
        let mut hint_ballots: BTreeSet<Ballot> = BTreeSet::new();

        match &hint.pledges {
            ScpStatementPledges::Prepare(p) => {
                hint_ballots.insert(p.ballot.clone());
                if let Some(prepared) = &p.prepared {
                    hint_ballots.insert(prepared.clone());
                }
                if let Some(prepared_prime) = &p.prepared_prime {
                    hint_ballots.insert(prepared_prime.clone());
                }
            }
            ScpStatementPledges::Confirm(c) => {
                hint_ballots.insert(Ballot::new(c.n_prepared, c.ballot.value.clone()));
                hint_ballots.insert(Ballot::new(u32::MAX, c.ballot.value.clone()));
            }
            ScpStatementPledges::Externalize(e) => {
                hint_ballots.insert(Ballot::new(u32::MAX, e.commit.value.clone()));
            }
        }

        let mut candidates = BTreeSet::new();

        while let Some(top_vote) = hint_ballots.pop_last() {
            let value = &top_vote.value;

            // find candidates that may have been prepared
            for envelope in self.latest_envelopes.values() {
                match &envelope.statement.pledges {
                    ScpStatementPledges::Prepare(p) => {
                        if are_ballots_less_and_compatible(&p.ballot, &top_vote) {
                            candidates.insert(p.ballot.clone());
                        }
                        if let Some(prepared) = &p.prepared {
                            if are_ballots_less_and_compatible(prepared, &top_vote) {
                                candidates.insert(prepared.clone());
                            }
                        }
                        if let Some(prepared_prime) = &p.prepared_prime {
                            if are_ballots_less_and_compatible(prepared_prime, &top_vote) {
                                candidates.insert(prepared_prime.clone());
                            }
                        }
                    }
                    ScpStatementPledges::Confirm(c) => {
                        if are_ballots_compatible(&top_vote, &c.ballot) {
                            candidates.insert(top_vote.clone());
                            if c.n_prepared < top_vote.counter {
                                candidates.insert(Ballot::new(c.n_prepared, value.clone()));
                            }
                        }
                    }
                    ScpStatementPledges::Externalize(e) => {
                        if are_ballots_compatible(&top_vote, &e.commit) {
                            candidates.insert(top_vote.clone());
                        }
                    }
                }
            }
        }

        candidates
    }

    fn attempt_accept_prepared(
        &mut self,
        hint: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return Ok(false);
        }

        let candidates = self.get_prepare_candidates(hint);

        // see if we can accept any of the candidates, starting with the highest
        for ballot in candidates.iter().rev() {
            if self.phase == BallotPhase::Confirm {
                // only consider the ballot if it may help us increase p (note: at this point,
                // p ~ c)
                let prepared = self
                    .prepared
                    .as_ref()
                    .expect("prepared is set in the CONFIRM phase");
                if !are_ballots_less_and_compatible(prepared, ballot) {
                    continue;
                }
                debug_assert!(are_ballots_compatible(
                    self.commit.as_ref().expect("commit is set in CONFIRM"),
                    ballot
                ));
            }

            // if we already prepared this ballot, don't bother checking again

            // if ballot <= p', ballot is neither a candidate for p nor p'
            if self
                .prepared_prime
                .as_ref()
                .is_some_and(|prepared_prime| ballot <= prepared_prime)
            {
                continue;
            }

            // if ballot is already covered by p, skip; otherwise, there is a chance it increases p'
            if self
                .prepared
                .as_ref()
                .is_some_and(|prepared| are_ballots_less_and_compatible(ballot, prepared))
            {
                continue;
            }

            let accepted = self.federated_accept(
                &*driver,
                // checks if any node is voting for this ballot
                |statement| match &statement.pledges {
                    ScpStatementPledges::Prepare(p) => {
                        are_ballots_less_and_compatible(ballot, &p.ballot)
                    }
                    ScpStatementPledges::Confirm(c) => are_ballots_compatible(ballot, &c.ballot),
                    ScpStatementPledges::Externalize(e) => {
                        are_ballots_compatible(ballot, &e.commit)
                    }
                },
                |statement| has_prepared_ballot(ballot, statement),
            );

            if accepted {
                return self.set_accept_prepared(ballot.clone(), driver);
            }
        }

        Ok(false)
    }

    fn set_accept_prepared(
        &mut self,
        ballot: Ballot,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        log::trace!(
            "set_accept_prepared i: {} b: {}",
            self.config.slot_index,
            ballot
        );

        // update our state
        let mut did_work = self.set_prepared(&ballot);

        // check if we also need to clear 'c'
        if self.commit.is_some() && self.high.is_some() {
            let high = self.high.as_ref().expect("checked above");
            let blocked_by_prepared = self
                .prepared
                .as_ref()
                .is_some_and(|prepared| are_ballots_less_and_incompatible(high, prepared));
            let blocked_by_prepared_prime = self
                .prepared_prime
                .as_ref()
                .is_some_and(|prepared_prime| {
                    are_ballots_less_and_incompatible(high, prepared_prime)
                });

            if blocked_by_prepared || blocked_by_prepared_prime {
                assert_eq!(self.phase, BallotPhase::Prepare);
                self.commit = None;
                did_work = true;
            }
        }

        if did_work {
            driver.accepted_ballot_prepared(self.config.slot_index, &ballot);
            Event::AcceptPrepared(AcceptPreparedEvent {
                timestamp: SystemTime::now(),
                slot_index: self.config.slot_index,
                ballot,
            })
            .publish(&self.event_publisher);
            self.emit_current_state_statement(driver)?;
        }

        Ok(did_work)
    }

    fn attempt_confirm_prepared(
        &mut self,
        hint: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Prepare {
            return Ok(false);
        }

        // we can only confirm ballots prepared once we accepted one
        if self.prepared.is_none() {
            return Ok(false);
        }

        let candidates: Vec<Ballot> = self.get_prepare_candidates(hint).into_iter().collect();

        // see if we can ratify any of the candidates as the new h, starting with the highest
        let mut new_high_index = None;
        for (index, ballot) in candidates.iter().enumerate().rev() {
            // only consider it if we can potentially raise h
            if self
                .high
                .as_ref()
                .is_some_and(|high| high >= ballot)
            {
                break;
            }

            if self.federated_ratify(&*driver, |statement| has_prepared_ballot(ballot, statement))
            {
                new_high_index = Some(index);
                break;
            }
        }

        let Some(new_high_index) = new_high_index else {
            return Ok(false);
        };
        let new_high = candidates[new_high_index].clone();

        // now, look for a commit ballot: scan downward from the new h through the candidates
        // compatible with it, ratifying each as prepared, and keep the lowest one that ratifies
        let mut new_commit = None;
        let can_set_commit = self.commit.is_none()
            && !self
                .prepared
                .as_ref()
                .is_some_and(|prepared| are_ballots_less_and_incompatible(&new_high, prepared))
            && !self
                .prepared_prime
                .as_ref()
                .is_some_and(|prepared_prime| {
                    are_ballots_less_and_incompatible(&new_high, prepared_prime)
                });

        if can_set_commit {
            // scan from the new h itself downward
            for ballot in candidates[..=new_high_index].iter().rev() {
                // the commit ballot may not sit below the current ballot
                if self
                    .current
                    .as_ref()
                    .is_some_and(|current| ballot < current)
                {
                    break;
                }
                // c and h must be compatible
                if !are_ballots_less_and_compatible(ballot, &new_high) {
                    continue;
                }
                if self
                    .federated_ratify(&*driver, |statement| has_prepared_ballot(ballot, statement))
                {
                    new_commit = Some(ballot.clone());
                } else {
                    break;
                }
            }
        }

        self.set_confirm_prepared(new_commit, new_high, driver)
    }

    fn set_confirm_prepared(
        &mut self,
        new_commit: Option<Ballot>,
        new_high: Ballot,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        log::trace!(
            "set_confirm_prepared i: {} h: {}",
            self.config.slot_index,
            new_high
        );

        // remember the new h's value
        self.value_override = Some(new_high.value.clone());

        let mut did_work = false;

        // we don't set c/h if we're not on a compatible ballot
        if self
            .current
            .as_ref()
            .map_or(true, |current| are_ballots_compatible(current, &new_high))
        {
            if self
                .high
                .as_ref()
                .map_or(true, |high| new_high > *high)
            {
                did_work = true;
                self.high = Some(new_high.clone());
            }

            if let Some(new_commit) = new_commit {
                assert!(self.commit.is_none());
                self.commit = Some(new_commit);
                did_work = true;
            }

            if did_work {
                driver.confirmed_ballot_prepared(self.config.slot_index, &new_high);
                Event::ConfirmPrepared(ConfirmPreparedEvent {
                    timestamp: SystemTime::now(),
                    slot_index: self.config.slot_index,
                    ballot: new_high.clone(),
                })
                .publish(&self.event_publisher);
            }
        }

        // always catch the current ballot up to the computed h
        did_work = self.update_current_if_needed(new_high, driver) || did_work;

        if did_work {
            self.emit_current_state_statement(driver)?;
        }

        Ok(did_work)
    }

    /// Collect the interesting commit-counter boundaries: every `[n_c/n_commit, n_h]` range edge
    /// contributed by a recorded statement compatible with `ballot`.
    fn get_commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut boundaries = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match &envelope.statement.pledges {
                ScpStatementPledges::Prepare(p) => {
                    if are_ballots_compatible(ballot, &p.ballot) && p.n_c != 0 {
                        boundaries.insert(p.n_c);
                        boundaries.insert(p.n_h);
                    }
                }
                ScpStatementPledges::Confirm(c) => {
                    if are_ballots_compatible(ballot, &c.ballot) {
                        boundaries.insert(c.n_commit);
                        boundaries.insert(c.n_h);
                    }
                }
                ScpStatementPledges::Externalize(e) => {
                    if are_ballots_compatible(ballot, &e.commit) {
                        boundaries.insert(e.commit.counter);
                        boundaries.insert(e.n_h);
                        boundaries.insert(u32::MAX);
                    }
                }
            }
        }
        boundaries
    }

    fn attempt_accept_commit(
        &mut self,
        hint: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return Ok(false);
        }

        // extract the value (and a counter, for logging) from the hint
        let ballot = match &hint.pledges {
            ScpStatementPledges::Prepare(p) => {
                if p.n_c == 0 {
                    return Ok(false);
                }
                Ballot::new(p.n_h, p.ballot.value.clone())
            }
            ScpStatementPledges::Confirm(c) => Ballot::new(c.n_h, c.ballot.value.clone()),
            ScpStatementPledges::Externalize(e) => Ballot::new(e.n_h, e.commit.value.clone()),
        };

        if self.phase == BallotPhase::Confirm {
            let high = self.high.as_ref().expect("high is set in CONFIRM");
            if !are_ballots_compatible(&ballot, high) {
                return Ok(false);
            }
        }

        let boundaries = self.get_commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return Ok(false);
        }

        // now, look for the widest interval
        let mut candidate: Interval = (0, 0);
        {
            let driver_ref = &*driver;
            let pred = |interval: Interval| -> bool {
                self.federated_accept(
                    driver_ref,
                    |statement| match &statement.pledges {
                        ScpStatementPledges::Prepare(p) => {
                            are_ballots_compatible(&ballot, &p.ballot)
                                && p.n_c != 0
                                && p.n_c <= interval.0
                                && interval.1 <= p.n_h
                        }
                        ScpStatementPledges::Confirm(c) => {
                            are_ballots_compatible(&ballot, &c.ballot)
                                && c.n_commit <= interval.0
                        }
                        ScpStatementPledges::Externalize(e) => {
                            are_ballots_compatible(&ballot, &e.commit)
                                && e.commit.counter <= interval.0
                        }
                    },
                    |statement| commit_predicate(&ballot, interval, statement),
                )
            };
            find_extended_interval(&mut candidate, &boundaries, pred);
        }

        if candidate.0 != 0
            && (self.phase != BallotPhase::Confirm
                || candidate.1
                    > self
                        .high
                        .as_ref()
                        .expect("high is set in CONFIRM")
                        .counter)
        {
            let commit = Ballot::new(candidate.0, ballot.value.clone());
            let high = Ballot::new(candidate.1, ballot.value);
            return self.set_accept_commit(commit, high, driver);
        }

        Ok(false)
    }

    fn set_accept_commit(
        &mut self,
        commit: Ballot,
        high: Ballot,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        log::trace!(
            "set_accept_commit i: {} new c: {} new h: {}",
            self.config.slot_index,
            commit,
            high
        );

        let mut did_work = false;

        // remember the new h's value
        self.value_override = Some(high.value.clone());

        if self.high.as_ref() != Some(&high) || self.commit.as_ref() != Some(&commit) {
            self.commit = Some(commit);
            self.high = Some(high.clone());
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if self
                .current
                .as_ref()
                .is_some_and(|current| !are_ballots_less_and_compatible(&high, current))
            {
                self.bump_to_ballot(high.clone(), false, driver);
            }
            self.prepared_prime = None;

            did_work = true;
        }

        if did_work {
            let new_high = self.high.clone().expect("just set");
            self.update_current_if_needed(new_high, driver);

            driver.accepted_commit(self.config.slot_index, &high);
            Event::AcceptCommit(AcceptCommitEvent {
                timestamp: SystemTime::now(),
                slot_index: self.config.slot_index,
                ballot: high,
            })
            .publish(&self.event_publisher);
            self.emit_current_state_statement(driver)?;
        }

        Ok(did_work)
    }

    fn attempt_confirm_commit(
        &mut self,
        hint: &ScpStatement,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Confirm {
            return Ok(false);
        }

        if self.high.is_none() || self.commit.is_none() {
            return Ok(false);
        }

        // extract the value (and a counter, for logging) from the hint
        let ballot = match &hint.pledges {
            ScpStatementPledges::Prepare(_) => return Ok(false),
            ScpStatementPledges::Confirm(c) => Ballot::new(c.n_h, c.ballot.value.clone()),
            ScpStatementPledges::Externalize(e) => Ballot::new(e.n_h, e.commit.value.clone()),
        };

        if !are_ballots_compatible(&ballot, self.commit.as_ref().expect("checked above")) {
            return Ok(false);
        }

        let boundaries = self.get_commit_boundaries(&ballot);
        let mut candidate: Interval = (0, 0);
        {
            let driver_ref = &*driver;
            let pred = |interval: Interval| -> bool {
                self.federated_ratify(driver_ref, |statement| {
                    commit_predicate(&ballot, interval, statement)
                })
            };
            find_extended_interval(&mut candidate, &boundaries, pred);
        }

        if candidate.0 != 0 {
            let commit = Ballot::new(candidate.0, ballot.value.clone());
            let high = Ballot::new(candidate.1, ballot.value);
            self.set_confirm_commit(commit, high, driver)
        } else {
            Ok(false)
        }
    }

    fn set_confirm_commit(
        &mut self,
        commit: Ballot,
        high: Ballot,
        driver: &mut impl ScpDriver,
    ) -> Result<bool, BallotProtocolError> {
        log::trace!(
            "set_confirm_commit i: {} new c: {} new h: {}",
            self.config.slot_index,
            commit,
            high
        );

        self.commit = Some(commit);
        self.high = Some(high.clone());
        self.update_current_if_needed(high, driver);

        self.phase = BallotPhase::Externalize;

        self.stop_ballot_protocol_timer(driver);

        self.emit_current_state_statement(driver)?;

        driver.stop_nomination(self.config.slot_index);

        let externalized_value = self
            .commit
            .as_ref()
            .expect("just set")
            .value
            .clone();
        driver.value_externalized(self.config.slot_index, &externalized_value);
        Event::Externalize(ExternalizeEvent {
            timestamp: SystemTime::now(),
            slot_index: self.config.slot_index,
            value: externalized_value,
        })
        .publish(&self.event_publisher);

        Ok(true)
    }

    /// The counter bumping rule: while a v-blocking set of peers works at counters strictly above
    /// the local one, jump to the smallest counter that is no longer strictly behind such a set.
    fn attempt_bump(&mut self, driver: &mut impl ScpDriver) -> Result<bool, BallotProtocolError> {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return Ok(false);
        }

        // First check to see if this condition applies at all. If there is no v-blocking set
        // ahead of the local node, there's nothing to do.
        let local_counter = self.current.as_ref().map_or(0, |current| current.counter);
        if !self.has_v_blocking_subset_strictly_ahead_of(local_counter) {
            return Ok(false);
        }

        // Collect all possible counters we might need to advance to.
        let all_counters: BTreeSet<u32> = self
            .latest_envelopes
            .values()
            .map(|envelope| ballot_counter(&envelope.statement))
            .filter(|counter| *counter > local_counter)
            .collect();

        // If we got to here, implicitly there _was_ a v-blocking subset with counters above the
        // local counter; we just need to find the minimal n at which that's no longer true. So
        // check them in order, starting from the smallest.
        for n in all_counters {
            if !self.has_v_blocking_subset_strictly_ahead_of(n) {
                return self.abandon_ballot(n, driver);
            }
        }

        Ok(false)
    }

    fn has_v_blocking_subset_strictly_ahead_of(&self, n: u32) -> bool {
        voting::is_v_blocking(
            &self.config.quorum_set,
            &self.latest_envelopes,
            |statement| ballot_counter(statement) > n,
        )
    }

    // ## Updates to the current ballot

    fn update_current_if_needed(&mut self, high: Ballot, driver: &mut impl ScpDriver) -> bool {
        if self
            .current
            .as_ref()
            .map_or(true, |current| *current < high)
        {
            self.bump_to_ballot(high, true, driver);
            true
        } else {
            false
        }
    }

    /// Adopt `ballot` as the current ballot, enforcing the state invariants.
    ///
    /// Refuses (returning `false`) when the commit ballot is incompatible with `ballot`, and when
    /// `ballot` sits below the current one; the latter can only happen when peers do not follow
    /// the protocol, so it is logged as an error.
    fn update_current_value(&mut self, ballot: Ballot, driver: &mut impl ScpDriver) -> bool {
        if self.phase != BallotPhase::Prepare && self.phase != BallotPhase::Confirm {
            return false;
        }

        let mut updated = false;
        match &self.current {
            None => {
                self.bump_to_ballot(ballot, true, driver);
                updated = true;
            }
            Some(current) => {
                if self
                    .commit
                    .as_ref()
                    .is_some_and(|commit| !are_ballots_compatible(commit, &ballot))
                {
                    return false;
                }

                if *current < ballot {
                    self.bump_to_ballot(ballot, true, driver);
                    updated = true;
                } else if *current > ballot {
                    // we may already have statements at counter+1
                    log::error!(
                        "update_current_value attempt to bump to a smaller ballot, i: {}",
                        self.config.slot_index
                    );
                    return false;
                }
            }
        }

        self.check_invariants();

        updated
    }

    fn bump_to_ballot(&mut self, ballot: Ballot, check: bool, driver: &mut impl ScpDriver) {
        log::trace!(
            "bump_to_ballot i: {} b: {}",
            self.config.slot_index,
            ballot
        );

        // `bump_to_ballot` must never be called once we committed
        assert_ne!(self.phase, BallotPhase::Externalize);

        if check {
            // the current ballot may only move up
            assert!(self
                .current
                .as_ref()
                .map_or(true, |current| ballot >= *current));
        }

        let got_bumped = self
            .current
            .as_ref()
            .map_or(true, |current| current.counter != ballot.counter);

        if self.current.is_none() {
            driver.started_ballot_protocol(self.config.slot_index, &ballot);
            Event::StartBallotProtocol(StartBallotProtocolEvent {
                timestamp: SystemTime::now(),
                slot_index: self.config.slot_index,
                ballot: ballot.clone(),
            })
            .publish(&self.event_publisher);
        } else if got_bumped {
            Event::BumpBallot(BumpBallotEvent {
                timestamp: SystemTime::now(),
                slot_index: self.config.slot_index,
                ballot: ballot.clone(),
            })
            .publish(&self.event_publisher);
        }

        self.current = Some(ballot);

        // note: we have to clear some fields (and recompute them based on latest messages).
        // invariant: h.value = b.value
        let current = self.current.as_ref().expect("just set");
        if self
            .high
            .as_ref()
            .is_some_and(|high| !are_ballots_compatible(current, high))
        {
            self.high = None;
            // invariant: c set only when h is set
            self.commit = None;
        }

        if got_bumped {
            self.heard_from_quorum = false;
        }
    }

    /// Raise `p` (and, when the new ballot is incompatible with it, demote the old `p` to `p'`).
    fn set_prepared(&mut self, ballot: &Ballot) -> bool {
        use std::cmp::Ordering;

        let mut did_work = false;

        match self
            .prepared
            .as_ref()
            .map(|prepared| prepared.cmp(ballot))
        {
            None => {
                self.prepared = Some(ballot.clone());
                did_work = true;
            }
            Some(Ordering::Less) => {
                // as we're replacing p, we see if we should also replace p'
                let old_prepared = self.prepared.take().expect("compared against Some");
                if !are_ballots_compatible(&old_prepared, ballot) {
                    self.prepared_prime = Some(old_prepared);
                }
                self.prepared = Some(ballot.clone());
                did_work = true;
            }
            Some(Ordering::Greater) => {
                // check if we should update only p'; this happens either when p' was unset or
                // when p' gets replaced by a higher ballot incompatible with p. The
                // incompatibility check is paranoia: this function is not called with ballots
                // that would not let us make progress.
                let prepared = self.prepared.as_ref().expect("compared against Some");
                let replaces_prepared_prime = match &self.prepared_prime {
                    None => true,
                    Some(prepared_prime) => {
                        prepared_prime < ballot && !are_ballots_compatible(prepared, ballot)
                    }
                };
                if replaces_prepared_prime {
                    self.prepared_prime = Some(ballot.clone());
                    did_work = true;
                }
            }
            Some(Ordering::Equal) => {}
        }

        did_work
    }

    // ## Own-statement emission

    fn create_statement(&self) -> ScpStatementPledges {
        self.check_invariants();

        match self.phase {
            BallotPhase::Prepare => ScpStatementPledges::Prepare(PrepareStatement {
                quorum_set_hash: self.local_quorum_set_hash,
                ballot: self
                    .current
                    .clone()
                    .unwrap_or_else(|| Ballot::new(0, Value::default())),
                prepared: self.prepared.clone(),
                prepared_prime: self.prepared_prime.clone(),
                n_c: self.commit.as_ref().map_or(0, |commit| commit.counter),
                n_h: self.high.as_ref().map_or(0, |high| high.counter),
            }),
            BallotPhase::Confirm => ScpStatementPledges::Confirm(ConfirmStatement {
                ballot: self.current.clone().expect("current is set in CONFIRM"),
                n_prepared: self
                    .prepared
                    .as_ref()
                    .expect("prepared is set in CONFIRM")
                    .counter,
                n_commit: self
                    .commit
                    .as_ref()
                    .expect("commit is set in CONFIRM")
                    .counter,
                n_h: self.high.as_ref().expect("high is set in CONFIRM").counter,
                quorum_set_hash: self.local_quorum_set_hash,
            }),
            BallotPhase::Externalize => ScpStatementPledges::Externalize(ExternalizeStatement {
                commit: self.commit.clone().expect("commit is set in EXTERNALIZE"),
                n_h: self
                    .high
                    .as_ref()
                    .expect("high is set in EXTERNALIZE")
                    .counter,
                commit_quorum_set_hash: self.local_quorum_set_hash,
            }),
        }
    }

    /// Synthesize an envelope for the current state and run it through ingestion; queue it for
    /// broadcast when it survived and is newer than the last own envelope.
    fn emit_current_state_statement(
        &mut self,
        driver: &mut impl ScpDriver,
    ) -> Result<(), BallotProtocolError> {
        let statement = ScpStatement {
            node_id: self.local_node_id,
            slot_index: self.config.slot_index,
            pledges: self.create_statement(),
        };
        let envelope = ScpEnvelope::new(&self.config.keypair, statement);

        let can_emit = self.current.is_some();

        // if we generate the same envelope, don't process it again: this can occur when updating
        // h in the PREPARE phase, as statements only keep track of h's counter (h's value could
        // differ)
        let is_duplicate = self
            .latest_envelopes
            .get(&self.local_node_id)
            .is_some_and(|last| *last == envelope);
        if is_duplicate {
            return Ok(());
        }

        match self.process_envelope(envelope.clone(), driver)? {
            EnvelopeState::Valid => {
                let is_newer = self.last_envelope.as_ref().map_or(true, |last| {
                    is_newer_statement(&last.statement, &envelope.statement)
                });
                if can_emit && is_newer {
                    self.last_envelope = Some(envelope);
                    // this will no-op if invoked from advance_slot, as advance_slot consolidates
                    // all messages sent
                    self.send_latest_envelope(driver);
                }
                Ok(())
            }
            // there is a bug in the node if it produced a statement for itself that it considers
            // invalid
            EnvelopeState::Invalid => Err(BallotProtocolError::MovedToBadState),
        }
    }

    fn send_latest_envelope(&mut self, driver: &mut impl ScpDriver) {
        // emit the current envelope if needed
        if self.current_message_level == 0 && self.last_envelope.is_some() && self.fully_validated
        {
            if self.last_envelope_emit != self.last_envelope {
                self.last_envelope_emit = self.last_envelope.clone();
                let envelope = self
                    .last_envelope_emit
                    .as_ref()
                    .expect("checked is_some above");
                driver.emit_envelope(envelope);
                Event::EmitEnvelope(EmitEnvelopeEvent {
                    timestamp: SystemTime::now(),
                    slot_index: self.config.slot_index,
                    envelope: envelope.clone(),
                })
                .publish(&self.event_publisher);
            }
        }
    }

    // ## Timer and heard-from-quorum tracking

    /// Re-evaluate whether a quorum of peers reached the local ballot's counter, arming the
    /// ballot timer on a not-heard to heard transition and disarming it on the way back.
    ///
    /// This method is safe to call regardless of the transitions of the other nodes on the
    /// network: peers can only transition to higher counters (older messages are ignored
    /// upstream), so the local node cannot flip-flop between "heard" and "not heard" for a given
    /// counter.
    fn check_heard_from_quorum(&mut self, driver: &mut impl ScpDriver) {
        let Some(current_counter) = self.current.as_ref().map(|current| current.counter) else {
            return;
        };

        let heard = {
            let driver_ref = &*driver;
            voting::is_quorum(
                &self.config.quorum_set,
                &self.latest_envelopes,
                |statement| self.statement_quorum_set(statement, driver_ref),
                |statement| match &statement.pledges {
                    ScpStatementPledges::Prepare(p) => current_counter <= p.ballot.counter,
                    _ => true,
                },
            )
        };

        if heard {
            let was_heard = self.heard_from_quorum;
            self.heard_from_quorum = true;
            if !was_heard {
                let ballot = self.current.clone().expect("current is set");
                driver.ballot_did_hear_from_quorum(self.config.slot_index, &ballot);
                Event::HeardFromQuorum(HeardFromQuorumEvent {
                    timestamp: SystemTime::now(),
                    slot_index: self.config.slot_index,
                    ballot,
                })
                .publish(&self.event_publisher);

                if self.phase != BallotPhase::Externalize {
                    self.start_ballot_protocol_timer(driver);
                }
            }
            if self.phase == BallotPhase::Externalize {
                self.stop_ballot_protocol_timer(driver);
            }
        } else {
            if self.heard_from_quorum {
                Event::LostQuorum(LostQuorumEvent {
                    timestamp: SystemTime::now(),
                    slot_index: self.config.slot_index,
                })
                .publish(&self.event_publisher);
            }
            self.heard_from_quorum = false;
            self.stop_ballot_protocol_timer(driver);
        }
    }

    fn start_ballot_protocol_timer(&mut self, driver: &mut impl ScpDriver) {
        let counter = self
            .current
            .as_ref()
            .expect("the timer is only armed once a ballot was adopted")
            .counter;
        let timeout = driver.compute_timeout(counter, false);
        driver.setup_timer(
            self.config.slot_index,
            TimerId::BallotProtocol,
            Some(timeout),
        );
    }

    fn stop_ballot_protocol_timer(&mut self, driver: &mut impl ScpDriver) {
        driver.setup_timer(self.config.slot_index, TimerId::BallotProtocol, None);
    }

    // ## Invariants

    fn check_invariants(&self) {
        match self.phase {
            BallotPhase::Prepare => {}
            BallotPhase::Confirm | BallotPhase::Externalize => {
                assert!(self.current.is_some());
                assert!(self.prepared.is_some());
                assert!(self.commit.is_some());
                assert!(self.high.is_some());
            }
        }

        if let Some(current) = &self.current {
            assert_ne!(current.counter, 0);
        }
        if let (Some(prepared), Some(prepared_prime)) = (&self.prepared, &self.prepared_prime) {
            assert!(are_ballots_less_and_incompatible(prepared_prime, prepared));
        }
        if let Some(high) = &self.high {
            let current = self
                .current
                .as_ref()
                .expect("h is only set while b is set");
            assert!(are_ballots_less_and_compatible(high, current));
        }
        if let Some(commit) = &self.commit {
            let current = self
                .current
                .as_ref()
                .expect("c is only set while b is set");
            let high = self.high.as_ref().expect("c is only set while h is set");
            assert!(are_ballots_less_and_compatible(commit, high));
            assert!(are_ballots_less_and_compatible(high, current));
        }
    }

    // ## Introspection

    /// Compact one-line rendering of the local state, for logs and dashboards.
    pub fn local_state(&self) -> String {
        format!(
            "i: {} | {} | b: {} | p: {} | p': {} | h: {} | c: {} | M: {}",
            self.config.slot_index,
            self.phase.name(),
            ballot_to_string(&self.current),
            ballot_to_string(&self.prepared),
            ballot_to_string(&self.prepared_prime),
            ballot_to_string(&self.high),
            ballot_to_string(&self.commit),
            self.latest_envelopes.len()
        )
    }

    /// Summary of the slot's ballot state as a JSON object.
    pub fn json_info(&self) -> JsonValue {
        json!({
            "heard": self.heard_from_quorum,
            "ballot": ballot_to_string(&self.current),
            "phase": self.phase.name(),
            "state": self.local_state(),
        })
    }

    /// Report, for the quorum set a peer declared, the closest v-blocking set of nodes that
    /// currently agree with the peer's working ballot: the operators those nodes belong to are
    /// the ones whose simultaneous failure would wedge the peer.
    pub fn json_quorum_info(
        &self,
        node_id: &NodeId,
        summary: bool,
        driver: &impl ScpDriver,
    ) -> JsonValue {
        // find the state of `node_id`
        let (phase, ballot, quorum_set_hash) = match self.latest_envelopes.get(node_id) {
            None => {
                let hash = if *node_id == self.local_node_id {
                    Some(self.local_quorum_set_hash)
                } else {
                    None
                };
                ("unknown", None, hash)
            }
            Some(envelope) => {
                let (phase, ballot) = match &envelope.statement.pledges {
                    ScpStatementPledges::Prepare(p) => ("PREPARE", p.ballot.clone()),
                    ScpStatementPledges::Confirm(c) => ("CONFIRM", c.ballot.clone()),
                    ScpStatementPledges::Externalize(e) => ("EXTERNALIZE", e.commit.clone()),
                };
                // use the companion set here even for EXTERNALIZE to capture the view of the
                // quorum set during consensus
                (
                    phase,
                    Some(ballot),
                    Some(companion_quorum_set_hash(&envelope.statement)),
                )
            }
        };

        let quorum_set = quorum_set_hash.and_then(|hash| {
            if hash == self.local_quorum_set_hash {
                Some(self.config.quorum_set.clone())
            } else {
                driver.resolve_quorum_set(&hash)
            }
        });
        let Some(quorum_set) = quorum_set else {
            return json!({ "phase": "expired" });
        };

        let fail_with = voting::find_closest_v_blocking(
            &quorum_set,
            &self.latest_envelopes,
            |statement| {
                ballot
                    .as_ref()
                    .is_some_and(|ballot| {
                        are_ballots_compatible(&working_ballot(statement), ballot)
                    })
            },
            Some(node_id),
        );

        let mut info = json!({
            "phase": phase,
            "fail_at": fail_with.len(),
            "hash": quorum_set_hash.map(|hash| hash.to_string()),
        });
        if !summary {
            info["fail_with"] = fail_with
                .iter()
                .map(|node| node.to_string())
                .collect::<Vec<String>>()
                .into();
            info["value"] = quorum_set_to_json(&quorum_set);
        }
        info
    }

    /// Classify a peer's progress relative to the local node, for operator dashboards.
    ///
    /// `self_already_moved_on` indicates that the containing subsystem has started a later slot.
    pub fn node_state(
        &self,
        node_id: &NodeId,
        self_already_moved_on: bool,
    ) -> QuorumInfoNodeState {
        if *node_id == self.local_node_id {
            // always mark myself as AGREE
            return QuorumInfoNodeState::Agree;
        }

        let Some(envelope) = self.latest_envelopes.get(node_id) else {
            return if self.timer_exp_count >= NUM_TIMEOUTS_THRESHOLD_FOR_REPORTING
                || self_already_moved_on
            {
                QuorumInfoNodeState::Missing
            } else {
                // it's too soon to start calling this node MISSING
                QuorumInfoNodeState::NoInfo
            };
        };

        let mut state = QuorumInfoNodeState::Agree;
        if let Some(last_emitted) = &self.last_envelope_emit {
            let statement = &envelope.statement;
            if self.phase == BallotPhase::Externalize && self_already_moved_on {
                // we have already externalized and moved onto the next slot, but this node
                // hasn't externalized yet
                state = QuorumInfoNodeState::Delayed;
            }

            let self_accepted_commit =
                self.phase == BallotPhase::Confirm || self.phase == BallotPhase::Externalize;
            let other_accepted_commit = matches!(
                statement.pledges,
                ScpStatementPledges::Confirm(_) | ScpStatementPledges::Externalize(_)
            );

            if self_accepted_commit
                && other_accepted_commit
                && !are_ballots_compatible(
                    &working_ballot(statement),
                    &working_ballot(&last_emitted.statement),
                )
            {
                // the node has accepted to commit a different value than ours. Even if it has
                // been marked something else, we overwrite it since this is bad.
                state = QuorumInfoNodeState::Disagree;
            }
        }
        state
    }
}

/// Classification of a peer's progress on a slot, as reported by
/// [`BallotProtocol::node_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumInfoNodeState {
    /// The peer agrees with the local working ballot (or there is no evidence otherwise).
    Agree,

    /// Nothing was heard from the peer, but it is too early to call it missing.
    NoInfo,

    /// Nothing was heard from the peer for long enough to report it.
    Missing,

    /// The peer has not externalized yet although the local node has moved on.
    Delayed,

    /// The peer accepted to commit a different value than the local node.
    Disagree,
}

/// Check whether `statement` witnesses acceptance of `ballot` (or a higher compatible one) as
/// prepared.
fn has_prepared_ballot(ballot: &Ballot, statement: &ScpStatement) -> bool {
    match &statement.pledges {
        ScpStatementPledges::Prepare(p) => {
            p.prepared
                .as_ref()
                .is_some_and(|prepared| are_ballots_less_and_compatible(ballot, prepared))
                || p.prepared_prime
                    .as_ref()
                    .is_some_and(|prepared_prime| {
                        are_ballots_less_and_compatible(ballot, prepared_prime)
                    })
        }
        ScpStatementPledges::Confirm(c) => {
            let prepared = Ballot::new(c.n_prepared, c.ballot.value.clone());
            are_ballots_less_and_compatible(ballot, &prepared)
        }
        ScpStatementPledges::Externalize(e) => are_ballots_compatible(ballot, &e.commit),
    }
}

/// Check whether `statement` accepts commit for every counter of `interval` on `ballot`'s value.
fn commit_predicate(ballot: &Ballot, interval: Interval, statement: &ScpStatement) -> bool {
    match &statement.pledges {
        ScpStatementPledges::Prepare(_) => false,
        ScpStatementPledges::Confirm(c) => {
            are_ballots_compatible(ballot, &c.ballot)
                && c.n_commit <= interval.0
                && interval.1 <= c.n_h
        }
        ScpStatementPledges::Externalize(e) => {
            are_ballots_compatible(ballot, &e.commit) && e.commit.counter <= interval.0
        }
    }
}

/// Find the widest interval over `boundaries` on which `pred` holds: anchor the top first, then
/// extend the bottom downward until the predicate fails.
fn find_extended_interval(
    candidate: &mut Interval,
    boundaries: &BTreeSet<u32>,
    mut pred: impl FnMut(Interval) -> bool,
) {
    // iterate through interesting boundaries, starting from the top
    for boundary in boundaries.iter().rev() {
        let cur = if candidate.0 == 0 {
            // first, find the high bound
            (*boundary, *boundary)
        } else if *boundary > candidate.1 {
            continue;
        } else {
            (*boundary, candidate.1)
        };

        if pred(cur) {
            *candidate = cur;
        } else if candidate.0 != 0 {
            // could not extend further
            break;
        }
    }
}

fn ballot_to_string(ballot: &Option<Ballot>) -> String {
    match ballot {
        Some(ballot) => ballot.to_string(),
        None => "(<null_ballot>)".to_string(),
    }
}

/// Render a quorum set as a JSON object, for the introspection queries.
fn quorum_set_to_json(quorum_set: &QuorumSet) -> JsonValue {
    let mut entries: Vec<JsonValue> = quorum_set
        .validators
        .iter()
        .map(|validator| JsonValue::String(validator.to_string()))
        .collect();
    entries.extend(quorum_set.inner_sets.iter().map(quorum_set_to_json));
    json!({
        "t": quorum_set.threshold,
        "v": entries,
    })
}
