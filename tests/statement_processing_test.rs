use log::LevelFilter;

use rand_core::OsRng;
use scp_rs::types::{
    ballot::Ballot,
    crypto_primitives::{Keypair, SigningKey},
};
use scp_rs::{BallotPhase, EnvelopeState};

mod common;

use crate::common::{
    logging::setup_logger,
    mock::{prepare_envelope, value, Cluster},
};

/// A statement that is not strictly newer than the sender's previous one is rejected and leaves
/// the local state untouched; the same holds for an exact replay.
#[test]
fn stale_statement_ignored_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 3 nodes sharing a 2-of-3 quorum set.
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-5");
    let quorum_set_hash = cluster.quorum_set().hash();
    let peer_keypair = cluster.nodes[1].keypair.clone();
    let peer = cluster.nodes[1].node_id();

    // 2. The peer's ballot at counter 2 arrives first.
    let newer = prepare_envelope(
        &peer_keypair,
        quorum_set_hash,
        Ballot::new(2, v.clone()),
        None,
        0,
        0,
    );
    assert_eq!(
        cluster.nodes[0].process(newer.clone()),
        EnvelopeState::Valid
    );
    let state_after_newer = cluster.nodes[0].protocol.local_state();

    // 3. An older ballot from the same peer is rejected, and the recorded envelope stays the
    //    newer one.
    let older = prepare_envelope(
        &peer_keypair,
        quorum_set_hash,
        Ballot::new(1, v.clone()),
        None,
        0,
        0,
    );
    assert_eq!(cluster.nodes[0].process(older), EnvelopeState::Invalid);
    assert_eq!(cluster.nodes[0].protocol.local_state(), state_after_newer);
    assert_eq!(
        cluster.nodes[0].protocol.latest_message(&peer),
        Some(&newer)
    );

    // 4. Replaying the newer envelope itself is also a no-op.
    assert_eq!(cluster.nodes[0].process(newer), EnvelopeState::Invalid);
    assert_eq!(cluster.nodes[0].protocol.local_state(), state_after_newer);
}

/// A value the driver can only call maybe-valid still advances the local state, but suppresses
/// broadcasting of own statements.
#[test]
fn maybe_valid_value_suppresses_broadcast_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 3 nodes; the first node's driver cannot fully validate v.
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-6");
    let quorum_set_hash = cluster.quorum_set().hash();
    cluster.nodes[0].driver.maybe_valid_values.push(v.clone());

    // 2. A peer's statement mentioning v is accepted, but flips the slot to not-fully-validated.
    let envelope = prepare_envelope(
        &cluster.nodes[1].keypair.clone(),
        quorum_set_hash,
        Ballot::new(1, v.clone()),
        None,
        0,
        0,
    );
    assert_eq!(cluster.nodes[0].process(envelope), EnvelopeState::Valid);
    assert!(!cluster.nodes[0].protocol.fully_validated());

    // 3. The node still advances its own state on v, but nothing reaches the network.
    assert!(cluster.nodes[0].bump(&v));
    assert_eq!(
        cluster.nodes[0].protocol.current_ballot(),
        Some(&Ballot::new(1, v.clone()))
    );
    assert!(cluster.nodes[0].driver.emitted.is_empty());

    // 4. The own envelope is likewise withheld from the catch-up evidence.
    assert!(cluster.nodes[0]
        .protocol
        .current_envelopes(false)
        .iter()
        .all(|envelope| envelope.statement.node_id != cluster.nodes[0].node_id()));
}

/// Once a node externalized, statements working on a different value are rejected outright;
/// statements agreeing with the committed value are still recorded, but the phase never moves.
#[test]
fn externalize_is_absorbing_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Run a 3-node slot to completion on value v.
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-7");
    let w = value(b"tx-set-other");
    for node in cluster.nodes.iter_mut() {
        node.bump(&v);
    }
    cluster.deliver_until_quiet();
    assert_eq!(cluster.nodes[0].protocol.phase(), BallotPhase::Externalize);

    let quorum_set_hash = cluster.quorum_set().hash();
    let state_before = cluster.nodes[0].protocol.local_state();

    // 2. A straggler (not part of the quorum set) shows up working on a different value: its
    //    statement is rejected and nothing changes.
    let mut csprg = OsRng {};
    let straggler = Keypair::new(SigningKey::generate(&mut csprg));
    let disagreeing = prepare_envelope(
        &straggler,
        quorum_set_hash,
        Ballot::new(1, w),
        None,
        0,
        0,
    );
    assert_eq!(
        cluster.nodes[0].process(disagreeing),
        EnvelopeState::Invalid
    );
    assert_eq!(cluster.nodes[0].protocol.local_state(), state_before);
    assert_eq!(cluster.nodes[0].protocol.phase(), BallotPhase::Externalize);

    // 3. The same straggler working on the committed value is recorded, and the phase still
    //    never moves.
    let agreeing = prepare_envelope(
        &straggler,
        quorum_set_hash,
        Ballot::new(1, v),
        None,
        0,
        0,
    );
    assert_eq!(cluster.nodes[0].process(agreeing), EnvelopeState::Valid);
    assert_eq!(cluster.nodes[0].protocol.phase(), BallotPhase::Externalize);
    assert!(cluster.nodes[0]
        .protocol
        .latest_message(&straggler.node_id())
        .is_some());
}
