/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Notifications that are emitted when significant things happen in the local ballot protocol
//! participant.
//!
//! ## Event enum
//!
//! Significant occurrences include adopting a ballot, accepting a ballot as prepared, accepting or
//! confirming commit, and broadcasting or receiving an envelope.
//!
//! Each of these corresponds to a variant of the [event enum](Event). Each variant tuple in turn
//! contains an inner struct type; for example, the [externalize variant](Event::Externalize)
//! contains the [`ExternalizeEvent`] struct type.
//!
//! Each inner struct stores information that summarizes the particular kind of event. This
//! information always includes a timestamp corresponding to the exact time when the event
//! occurred, and the slot it occurred in.
//!
//! ## Registering event handlers
//!
//! Library users can register event handler closures, which are then internally called by the
//! library's [event bus](crate::event_bus::start_event_bus) thread when the handler's particular
//! event variant happens. Default event handlers that log out events are defined in
//! [`logging`](crate::logging).
//!
//! ## Timing
//!
//! Events are always emitted **after** the corresponding occurrence is "completed". So, for
//! example, the [accept commit event](AcceptCommitEvent) is only emitted after `c`, `h`, and the
//! phase have all been updated.

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::ballot_protocol::messages::ScpEnvelope;
use crate::types::{
    ballot::Ballot,
    data_types::{SlotIndex, Value},
};

/// Enumerates all events defined for the ballot protocol.
pub enum Event {
    // Events that mark ballot state transitions.
    StartBallotProtocol(StartBallotProtocolEvent),
    BumpBallot(BumpBallotEvent),
    AcceptPrepared(AcceptPreparedEvent),
    ConfirmPrepared(ConfirmPreparedEvent),
    AcceptCommit(AcceptCommitEvent),
    Externalize(ExternalizeEvent),

    // Events that involve envelope traffic.
    EmitEnvelope(EmitEnvelopeEvent),
    ReceiveEnvelope(ReceiveEnvelopeEvent),

    // Timer and quorum tracking events.
    HeardFromQuorum(HeardFromQuorumEvent),
    LostQuorum(LostQuorumEvent),
    BallotTimeout(BallotTimeoutEvent),
}

impl Event {
    /// Publishes a given instance of the [`Event`] enum on the event publisher channel (if the
    /// channel is defined).
    pub fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// The participant adopted its first ballot for the slot.
pub struct StartBallotProtocolEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// The participant moved its current ballot to a higher counter.
pub struct BumpBallotEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// A ballot was accepted as prepared, raising `p` or `p'`.
pub struct AcceptPreparedEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// A ballot was confirmed prepared, raising the high ballot `h`.
pub struct ConfirmPreparedEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// Commit was accepted up to the given ballot; the participant is now in the CONFIRM phase.
pub struct AcceptCommitEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// The slot externalized the given value. Terminal for the slot.
pub struct ExternalizeEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub value: Value,
}

/// The participant handed an own envelope to the driver for broadcast.
pub struct EmitEnvelopeEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub envelope: ScpEnvelope,
}

/// The participant received an envelope from a peer (before any validity checks).
pub struct ReceiveEnvelopeEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub envelope: ScpEnvelope,
}

/// A quorum of peers reached the local ballot's counter; the ballot timer was armed.
pub struct HeardFromQuorumEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub ballot: Ballot,
}

/// The set of peers at the local ballot's counter no longer forms a quorum; the ballot timer was
/// disarmed.
pub struct LostQuorumEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
}

/// The ballot timer expired, causing the counter to be abandoned.
pub struct BallotTimeoutEvent {
    pub timestamp: SystemTime,
    pub slot_index: SlotIndex,
    pub timer_exp_count: u32,
}
