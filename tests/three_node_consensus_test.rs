use log::LevelFilter;

use scp_rs::types::ballot::Ballot;
use scp_rs::BallotPhase;

mod common;

use crate::common::{
    logging::setup_logger,
    mock::{value, Cluster},
};

/// Three nodes with a symmetric 2-of-3 quorum set all nominate the same value and run the slot to
/// completion.
///
/// Every node must walk PREPARE -> CONFIRM -> EXTERNALIZE and commit `(1, v)`. The accepted-
/// prepared ballot ends at `(u32::MAX, v)`: once everyone confirms, each node accepts the
/// unbounded ballot of its peers' statements as prepared.
#[test]
fn three_node_happy_path_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Create a cluster of 3 nodes sharing a 2-of-3 quorum set.
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-1");

    // 2. Every node's nomination produces the same value; each adopts ballot (1, v).
    log::debug!("Bumping every node to ballot (1, v).");
    for node in cluster.nodes.iter_mut() {
        assert!(node.bump(&v));
        assert_eq!(
            node.protocol.current_ballot(),
            Some(&Ballot::new(1, v.clone()))
        );
    }

    // 3. Deliver messages until the cluster goes quiet.
    log::debug!("Delivering messages until the cluster goes quiet.");
    cluster.deliver_until_quiet();

    // 4. Every node externalized (1, v).
    for node in cluster.nodes.iter() {
        assert_eq!(node.protocol.phase(), BallotPhase::Externalize);
        assert_eq!(
            node.protocol.commit_ballot(),
            Some(&Ballot::new(1, v.clone()))
        );
        assert_eq!(
            node.protocol.high_ballot(),
            Some(&Ballot::new(1, v.clone()))
        );
        assert_eq!(
            node.protocol.prepared_ballot(),
            Some(&Ballot::new(u32::MAX, v.clone()))
        );

        assert_eq!(node.driver.externalized.as_ref(), Some(&v));
        assert!(node.driver.stopped_nomination);
        // the ballot timer must not stay armed after externalizing
        assert!(node.driver.armed_timer.is_none());
    }

    // 5. Every node can now serve its externalizing evidence: all peers agreed, so all 3
    //    envelopes (including its own) are included.
    for node in cluster.nodes.iter() {
        assert_eq!(node.protocol.externalizing_state().len(), 3);
    }
}

/// The introspection queries report a sensible picture of a finished slot.
#[test]
fn introspection_test() {
    setup_logger(LevelFilter::Trace);

    // 1. Run a 3-node slot to completion.
    let mut cluster = Cluster::new(3, 2);
    let v = value(b"tx-set-2");
    for node in cluster.nodes.iter_mut() {
        node.bump(&v);
    }
    cluster.deliver_until_quiet();

    // 2. json_info reflects the externalized state.
    let info = cluster.nodes[0].protocol.json_info();
    assert_eq!(info["phase"], "EXTERNALIZE");
    assert_eq!(info["heard"], true);

    // 3. The local-state line mentions every tracked ballot.
    let state = cluster.nodes[0].protocol.local_state();
    assert!(state.contains("EXTERNALIZE"));
    assert!(state.contains("| M: 3"));

    // 4. json_quorum_info: with all 3 nodes agreeing on a 2-of-3 quorum set, the peer under
    //    inspection survives until 2 of the agreeing nodes fail.
    let peer = cluster.nodes[1].node_id();
    let info = cluster.nodes[0]
        .protocol
        .json_quorum_info(&peer, false, &cluster.nodes[0].driver);
    assert_eq!(info["phase"], "EXTERNALIZE");
    assert_eq!(info["fail_at"], 2);

    // 5. node_state marks everyone as agreeing.
    use scp_rs::ballot_protocol::implementation::QuorumInfoNodeState;
    let local = cluster.nodes[0].node_id();
    assert_eq!(
        cluster.nodes[0].protocol.node_state(&local, false),
        QuorumInfoNodeState::Agree
    );
    assert_eq!(
        cluster.nodes[0].protocol.node_state(&peer, false),
        QuorumInfoNodeState::Agree
    );
}
