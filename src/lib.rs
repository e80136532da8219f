/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of the ballot protocol of the Stellar Consensus Protocol (SCP): the
//! voting/commit phase that drives a federation of nodes to externalize a single value per
//! numbered slot.
//!
//! ## The library's structure
//!
//! - [`ballot_protocol`] holds the per-slot state machine
//!   ([`BallotProtocol`](ballot_protocol::implementation::BallotProtocol)) and the wire
//!   [messages](ballot_protocol::messages) it exchanges.
//! - [`voting`] implements the federated voting primitive: quorum and v-blocking tests over the
//!   latest statements of peers.
//! - [`driver`] defines the [`ScpDriver`](driver::ScpDriver) trait through which the host system
//!   provides transport, value validation, timers, and quorum set resolution.
//! - [`types`] defines ballots, quorum sets, and the basic newtypes everything else is built
//!   from.
//! - [`events`], [`event_bus`], and [`logging`] provide notifications about significant
//!   occurrences in the protocol, and handlers that log them.
//!
//! Nomination (the stage that produces candidate values), envelope signature verification, quorum
//! set distribution, and all networking are the host system's responsibility.

pub mod types;

pub mod ballot_protocol;

pub mod voting;

pub mod driver;

pub mod events;

pub mod event_bus;

pub mod logging;

// Re-exports
pub use ballot_protocol::implementation::{
    BallotPhase, BallotProtocol, BallotProtocolConfig, BallotProtocolError, EnvelopeState,
    QuorumInfoNodeState, MAX_ADVANCE_SLOT_RECURSION,
};
pub use driver::ScpDriver;
