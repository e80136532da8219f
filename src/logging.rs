/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three
//! values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The index of the slot the event occurred in.
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how an [AcceptPrepared](crate::events::AcceptPreparedEvent) is printed:
//!
//! ```text
//! AcceptPrepared, 1701329264, 17, (1, 5Gt3WNn)
//! ```
//!
//! In the snippet, the fourth value is the accepted ballot: its counter, and the first seven
//! characters of the Base64 encoding of its value.

use std::time::SystemTime;

use crate::events::*;
use crate::types::data_types::first_seven_base64_chars;

// Names of each event in PascalCase for printing:
pub const START_BALLOT_PROTOCOL: &str = "StartBallotProtocol";
pub const BUMP_BALLOT: &str = "BumpBallot";
pub const ACCEPT_PREPARED: &str = "AcceptPrepared";
pub const CONFIRM_PREPARED: &str = "ConfirmPrepared";
pub const ACCEPT_COMMIT: &str = "AcceptCommit";
pub const EXTERNALIZE: &str = "Externalize";

pub const EMIT_ENVELOPE: &str = "EmitEnvelope";
pub const RECEIVE_ENVELOPE: &str = "ReceiveEnvelope";

pub const HEARD_FROM_QUORUM: &str = "HeardFromQuorum";
pub const LOST_QUORUM: &str = "LostQuorum";
pub const BALLOT_TIMEOUT: &str = "BallotTimeout";

/// Implemented by event types. Used to get a closure that logs the event.
pub trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartBallotProtocolEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &StartBallotProtocolEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_BALLOT_PROTOCOL,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for BumpBallotEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &BumpBallotEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BUMP_BALLOT,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptPreparedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &AcceptPreparedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPT_PREPARED,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for ConfirmPreparedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ConfirmPreparedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CONFIRM_PREPARED,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for AcceptCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &AcceptCommitEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACCEPT_COMMIT,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExternalizeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ExternalizeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                EXTERNALIZE,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.value
            )
        };
        Box::new(logger)
    }
}

impl Logger for EmitEnvelopeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &EmitEnvelopeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                EMIT_ENVELOPE,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                envelope_info(&event.envelope)
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveEnvelopeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &ReceiveEnvelopeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_ENVELOPE,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                first_seven_base64_chars(&event.envelope.statement.node_id.bytes()),
                envelope_info(&event.envelope)
            )
        };
        Box::new(logger)
    }
}

impl Logger for HeardFromQuorumEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &HeardFromQuorumEvent| {
            log::info!(
                "{}, {}, {}, {}",
                HEARD_FROM_QUORUM,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.ballot
            )
        };
        Box::new(logger)
    }
}

impl Logger for LostQuorumEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &LostQuorumEvent| {
            log::info!(
                "{}, {}, {}",
                LOST_QUORUM,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index
            )
        };
        Box::new(logger)
    }
}

impl Logger for BallotTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &BallotTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BALLOT_TIMEOUT,
                secs_since_unix_epoch(event.timestamp),
                event.slot_index,
                event.timer_exp_count
            )
        };
        Box::new(logger)
    }
}

fn envelope_info(envelope: &crate::ballot_protocol::messages::ScpEnvelope) -> String {
    use crate::ballot_protocol::messages::{working_ballot, ScpStatementPledges};

    let kind = match envelope.statement.pledges {
        ScpStatementPledges::Prepare(_) => "PREPARE",
        ScpStatementPledges::Confirm(_) => "CONFIRM",
        ScpStatementPledges::Externalize(_) => "EXTERNALIZE",
    };
    format!("{} {}", kind, working_ballot(&envelope.statement))
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
