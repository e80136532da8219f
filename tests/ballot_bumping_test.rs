use log::LevelFilter;

use scp_rs::types::ballot::Ballot;
use scp_rs::BallotPhase;

mod common;

use crate::common::{
    logging::setup_logger,
    mock::{prepare_envelope, value, Cluster},
};

/// A v-blocking set of peers working at a higher counter drags the local node directly to the
/// smallest counter that is no longer strictly behind them.
///
/// With a 2-of-4 quorum set, any 3 nodes are v-blocking. Three peers at counter 5 must pull a
/// local node at counter 1 straight to 5, with no intermediate counters 2, 3, 4.
#[test]
fn v_blocking_bump_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 4 nodes sharing a 2-of-4 quorum set, with the first node as the
    //    node under test.
    let mut cluster = Cluster::new(4, 2);
    let v = value(b"tx-set-3");
    let quorum_set_hash = cluster.quorum_set().hash();

    // 2. The node under test adopts ballot (1, v).
    cluster.nodes[0].bump(&v);

    // 3. The three peers all jump to counter 5.
    log::debug!("Feeding PREPARE ballots at counter 5 from the three peers.");
    let peer_envelopes: Vec<_> = (1..4)
        .map(|peer| {
            prepare_envelope(
                &cluster.nodes[peer].keypair,
                quorum_set_hash,
                Ballot::new(5, v.clone()),
                None,
                0,
                0,
            )
        })
        .collect();
    for envelope in peer_envelopes {
        cluster.nodes[0].process(envelope);
    }

    // 4. The node under test is now at counter 5, and never passed through 2, 3, or 4.
    assert_eq!(
        cluster.nodes[0].protocol.current_ballot(),
        Some(&Ballot::new(5, v.clone()))
    );
    for envelope in cluster.nodes[0].driver.emitted.iter() {
        let counter = match &envelope.statement.pledges {
            scp_rs::ballot_protocol::messages::ScpStatementPledges::Prepare(p) => p.ballot.counter,
            _ => panic!("only PREPARE statements expected in this scenario"),
        };
        assert!(counter == 1 || counter == 5);
    }
}

/// Timer expiry abandons the current counter: the ballot moves to the next counter with the same
/// value, and the heard-from-quorum flag and timer are reset.
#[test]
fn timer_expiry_bumps_counter_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 3 nodes sharing a 2-of-3 quorum set; the first node adopts (1, v).
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-4");
    let quorum_set_hash = cluster.quorum_set().hash();
    cluster.nodes[0].bump(&v);

    // 2. Both peers report ballots at counter 1: the node hears from a quorum and arms the
    //    ballot timer.
    for peer in 1..3 {
        let envelope = prepare_envelope(
            &cluster.nodes[peer].keypair,
            quorum_set_hash,
            Ballot::new(1, v.clone()),
            None,
            0,
            0,
        );
        cluster.nodes[0].process(envelope);
    }
    assert!(cluster.nodes[0].protocol.heard_from_quorum());
    assert!(cluster.nodes[0].driver.armed_timer.is_some());

    // 3. Fire the timer: the counter moves to 2 with the value unchanged, and since no quorum has
    //    reached counter 2 yet, the heard flag drops and the timer is disarmed.
    log::debug!("Firing the ballot timer.");
    assert!(cluster.nodes[0].fire_timer());

    assert_eq!(
        cluster.nodes[0].protocol.current_ballot(),
        Some(&Ballot::new(2, v))
    );
    assert_eq!(cluster.nodes[0].protocol.phase(), BallotPhase::Prepare);
    assert!(!cluster.nodes[0].protocol.heard_from_quorum());
    assert!(cluster.nodes[0].driver.armed_timer.is_none());
}

/// Two camps start out split between two values; after the split round times out, everyone
/// reaches for the nomination stage's composite candidate and converges on it at counter 2.
///
/// Safety check on top: nobody externalizes the abandoned value.
#[test]
fn split_then_converge_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 3 nodes sharing a 2-of-3 quorum set. Nomination has settled on
    //    v_b everywhere, but the first node initially votes for v_a.
    let mut cluster = Cluster::new(3, 2);
    let v_a = value(b"aaa-tx-set");
    let v_b = value(b"bbb-tx-set");
    assert!(v_a < v_b);

    for node in cluster.nodes.iter_mut() {
        node.driver.nomination_candidate = Some(v_b.clone());
    }

    // 2. The split round: the first node adopts (1, v_a), the other two (1, v_b). No messages
    //    are delivered before the round times out.
    cluster.nodes[0].bump(&v_a);
    cluster.nodes[1].bump(&v_b);
    cluster.nodes[2].bump(&v_b);

    // 3. Every node's ballot timer fires: all move to counter 2 with the composite candidate.
    log::debug!("Firing every node's ballot timer.");
    for node in cluster.nodes.iter_mut() {
        node.fire_timer();
        assert_eq!(
            node.protocol.current_ballot(),
            Some(&Ballot::new(2, v_b.clone()))
        );
    }

    // 4. Deliver messages until the cluster goes quiet: everyone externalizes v_b at counter 2.
    cluster.deliver_until_quiet();

    for node in cluster.nodes.iter() {
        assert_eq!(node.protocol.phase(), BallotPhase::Externalize);
        assert_eq!(
            node.protocol.commit_ballot(),
            Some(&Ballot::new(2, v_b.clone()))
        );
        assert_eq!(node.driver.externalized.as_ref(), Some(&v_b));

        // no node may externalize v_b while still holding v_a as its prepared value
        assert_eq!(
            node.protocol
                .prepared_ballot()
                .expect("prepared is set after externalizing")
                .value,
            v_b
        );
    }
}
