/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events emitted by the [ballot protocol](crate::ballot_protocol) and passes
//! them to event handlers.
//!
//! When the thread receives a message containing an [event](crate::events::Event), it triggers the
//! execution of all handlers defined for the contained event type, where the handlers for each
//! event type are stored in [`EventHandlers`].
//!
//! ## Event Handlers
//!
//! An instance of `EventHandlers` contains:
//! 1. The handlers provided by the host system, and
//! 2. If logging is enabled, the default logging handlers defined in [logging](crate::logging).

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread,
    thread::JoinHandle,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event) type.
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the two optional handlers enabled for an event type that implements the [`Logger`]
/// trait, namely one logging handler, defined in [`logging`](crate::logging), and one user-defined
/// handler.
pub struct HandlerPair<T: Logger> {
    pub(crate) user_defined_handler: Option<HandlerPtr<T>>,
    pub(crate) logging_handler: Option<HandlerPtr<T>>,
}

impl<T: Logger> HandlerPair<T> {
    // Checks if no event handlers are defined for this event.
    fn is_empty(&self) -> bool {
        self.user_defined_handler.is_none() && self.logging_handler.is_none()
    }

    /// Creates a new `HandlerPair` with the user-defined handler, and the default logging handler
    /// if logging is enabled.
    fn new(log: bool, user_defined_handler: Option<HandlerPtr<T>>) -> HandlerPair<T> {
        HandlerPair {
            user_defined_handler,
            logging_handler: if log { Some(T::get_logger()) } else { None },
        }
    }

    fn fire(&self, event: &T) {
        self.user_defined_handler.iter().for_each(|handler| handler(event));
        self.logging_handler.iter().for_each(|handler| handler(event));
    }
}

/// Stores the `HandlerPair` of user-defined and optional logging handlers for each pre-defined
/// event type from [events](crate::events).
pub struct EventHandlers {
    pub(crate) start_ballot_protocol_handlers: HandlerPair<StartBallotProtocolEvent>,
    pub(crate) bump_ballot_handlers: HandlerPair<BumpBallotEvent>,
    pub(crate) accept_prepared_handlers: HandlerPair<AcceptPreparedEvent>,
    pub(crate) confirm_prepared_handlers: HandlerPair<ConfirmPreparedEvent>,
    pub(crate) accept_commit_handlers: HandlerPair<AcceptCommitEvent>,
    pub(crate) externalize_handlers: HandlerPair<ExternalizeEvent>,

    pub(crate) emit_envelope_handlers: HandlerPair<EmitEnvelopeEvent>,
    pub(crate) receive_envelope_handlers: HandlerPair<ReceiveEnvelopeEvent>,

    pub(crate) heard_from_quorum_handlers: HandlerPair<HeardFromQuorumEvent>,
    pub(crate) lost_quorum_handlers: HandlerPair<LostQuorumEvent>,
    pub(crate) ballot_timeout_handlers: HandlerPair<BallotTimeoutEvent>,
}

impl EventHandlers {
    /// Creates the [handler pairs](HandlerPair) for all pre-defined event types from
    /// [events](crate::events) given the user-defined handlers, and information on whether logging
    /// is enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: bool,
        start_ballot_protocol_handler: Option<HandlerPtr<StartBallotProtocolEvent>>,
        bump_ballot_handler: Option<HandlerPtr<BumpBallotEvent>>,
        accept_prepared_handler: Option<HandlerPtr<AcceptPreparedEvent>>,
        confirm_prepared_handler: Option<HandlerPtr<ConfirmPreparedEvent>>,
        accept_commit_handler: Option<HandlerPtr<AcceptCommitEvent>>,
        externalize_handler: Option<HandlerPtr<ExternalizeEvent>>,
        emit_envelope_handler: Option<HandlerPtr<EmitEnvelopeEvent>>,
        receive_envelope_handler: Option<HandlerPtr<ReceiveEnvelopeEvent>>,
        heard_from_quorum_handler: Option<HandlerPtr<HeardFromQuorumEvent>>,
        lost_quorum_handler: Option<HandlerPtr<LostQuorumEvent>>,
        ballot_timeout_handler: Option<HandlerPtr<BallotTimeoutEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            start_ballot_protocol_handlers: HandlerPair::new(log, start_ballot_protocol_handler),
            bump_ballot_handlers: HandlerPair::new(log, bump_ballot_handler),
            accept_prepared_handlers: HandlerPair::new(log, accept_prepared_handler),
            confirm_prepared_handlers: HandlerPair::new(log, confirm_prepared_handler),
            accept_commit_handlers: HandlerPair::new(log, accept_commit_handler),
            externalize_handlers: HandlerPair::new(log, externalize_handler),
            emit_envelope_handlers: HandlerPair::new(log, emit_envelope_handler),
            receive_envelope_handlers: HandlerPair::new(log, receive_envelope_handler),
            heard_from_quorum_handlers: HandlerPair::new(log, heard_from_quorum_handler),
            lost_quorum_handlers: HandlerPair::new(log, lost_quorum_handler),
            ballot_timeout_handlers: HandlerPair::new(log, ballot_timeout_handler),
        }
    }

    /// Creates `EventHandlers` with no user-defined handlers: only the default logging handlers,
    /// if `log` is enabled.
    pub fn logging_only(log: bool) -> EventHandlers {
        Self::new(
            log, None, None, None, None, None, None, None, None, None, None, None,
        )
    }

    /// Checks if no handlers are defined, i.e., neither user-defined handlers were defined nor
    /// logging is enabled.
    pub fn is_empty(&self) -> bool {
        self.start_ballot_protocol_handlers.is_empty()
            && self.bump_ballot_handlers.is_empty()
            && self.accept_prepared_handlers.is_empty()
            && self.confirm_prepared_handlers.is_empty()
            && self.accept_commit_handlers.is_empty()
            && self.externalize_handlers.is_empty()
            && self.emit_envelope_handlers.is_empty()
            && self.receive_envelope_handlers.is_empty()
            && self.heard_from_quorum_handlers.is_empty()
            && self.lost_quorum_handlers.is_empty()
            && self.ballot_timeout_handlers.is_empty()
    }

    /// Triggers the execution of each of the two handlers - the user-defined and the logging
    /// handler, if defined - for a given event type from [events](crate::events).
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartBallotProtocol(event) => self.start_ballot_protocol_handlers.fire(&event),
            Event::BumpBallot(event) => self.bump_ballot_handlers.fire(&event),
            Event::AcceptPrepared(event) => self.accept_prepared_handlers.fire(&event),
            Event::ConfirmPrepared(event) => self.confirm_prepared_handlers.fire(&event),
            Event::AcceptCommit(event) => self.accept_commit_handlers.fire(&event),
            Event::Externalize(event) => self.externalize_handlers.fire(&event),
            Event::EmitEnvelope(event) => self.emit_envelope_handlers.fire(&event),
            Event::ReceiveEnvelope(event) => self.receive_envelope_handlers.fire(&event),
            Event::HeardFromQuorum(event) => self.heard_from_quorum_handlers.fire(&event),
            Event::LostQuorum(event) => self.lost_quorum_handlers.fire(&event),
            Event::BallotTimeout(event) => self.ballot_timeout_handlers.fire(&event),
        }
    }
}

/// Starts the event bus thread, which runs an infinite loop until a shutdown signal is received
/// from the parent thread. In each iteration of the loop, the thread checks if it received any
/// event notifications, and if so, then triggers the execution of the handlers defined for the
/// event.
pub fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
