//! A mock driver and a totally local "cluster" of ballot protocol participants for driving
//! consensus scenarios deterministically: no threads, no real timers, and message delivery fully
//! under the test's control.

use std::collections::HashMap;
use std::time::Duration;

use rand_core::OsRng;

use scp_rs::ballot_protocol::messages::{
    PrepareStatement, ScpEnvelope, ScpStatement, ScpStatementPledges,
};
use scp_rs::driver::{ScpDriver, TimerId, ValidationLevel};
use scp_rs::types::{
    ballot::Ballot,
    crypto_primitives::{Keypair, SigningKey},
    data_types::{NodeId, QuorumSetHash, SlotIndex, Value},
    quorum_set::QuorumSet,
};
use scp_rs::{BallotProtocol, BallotProtocolConfig, EnvelopeState};

/// A driver stub that records everything the protocol asks of it.
///
/// Values validate as `FullyValid` unless registered in `invalid_values` or `maybe_valid_values`.
/// Timeouts grow linearly with the round number. Emitted envelopes accumulate in `emitted` until
/// the test (or the [`Cluster`]) drains them.
pub(crate) struct MockDriver {
    pub(crate) quorum_sets: HashMap<QuorumSetHash, QuorumSet>,
    pub(crate) emitted: Vec<ScpEnvelope>,
    pub(crate) externalized: Option<Value>,
    pub(crate) nomination_candidate: Option<Value>,
    pub(crate) armed_timer: Option<Duration>,
    pub(crate) stopped_nomination: bool,
    pub(crate) invalid_values: Vec<Value>,
    pub(crate) maybe_valid_values: Vec<Value>,
}

impl MockDriver {
    pub(crate) fn new(quorum_sets: HashMap<QuorumSetHash, QuorumSet>) -> Self {
        Self {
            quorum_sets,
            emitted: Vec::new(),
            externalized: None,
            nomination_candidate: None,
            armed_timer: None,
            stopped_nomination: false,
            invalid_values: Vec::new(),
            maybe_valid_values: Vec::new(),
        }
    }
}

impl ScpDriver for MockDriver {
    fn emit_envelope(&mut self, envelope: &ScpEnvelope) {
        self.emitted.push(envelope.clone());
    }

    fn validate_value(&mut self, _slot_index: SlotIndex, value: &Value) -> ValidationLevel {
        if self.invalid_values.contains(value) {
            ValidationLevel::Invalid
        } else if self.maybe_valid_values.contains(value) {
            ValidationLevel::MaybeValid
        } else {
            ValidationLevel::FullyValid
        }
    }

    fn compute_timeout(&mut self, round_number: u32, _is_nomination: bool) -> Duration {
        Duration::from_secs(round_number as u64 + 1)
    }

    fn setup_timer(&mut self, _slot_index: SlotIndex, _timer: TimerId, delay: Option<Duration>) {
        self.armed_timer = delay;
    }

    fn resolve_quorum_set(&self, quorum_set_hash: &QuorumSetHash) -> Option<QuorumSet> {
        self.quorum_sets.get(quorum_set_hash).cloned()
    }

    fn nomination_candidate(&self, _slot_index: SlotIndex) -> Option<Value> {
        self.nomination_candidate.clone()
    }

    fn stop_nomination(&mut self, _slot_index: SlotIndex) {
        self.stopped_nomination = true;
    }

    fn value_externalized(&mut self, _slot_index: SlotIndex, value: &Value) {
        self.externalized = Some(value.clone());
    }
}

/// One ballot protocol participant together with its driver stub.
pub(crate) struct TestNode {
    pub(crate) keypair: Keypair,
    pub(crate) protocol: BallotProtocol,
    pub(crate) driver: MockDriver,
}

impl TestNode {
    pub(crate) fn new(keypair: Keypair, quorum_set: QuorumSet, driver: MockDriver) -> Self {
        let config = BallotProtocolConfig {
            slot_index: SLOT,
            keypair: keypair.clone(),
            quorum_set,
        };
        Self {
            keypair,
            protocol: BallotProtocol::new(config, None),
            driver,
        }
    }

    pub(crate) fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    pub(crate) fn process(&mut self, envelope: ScpEnvelope) -> EnvelopeState {
        self.protocol
            .process_envelope(envelope, &mut self.driver)
            .expect("processing must not fail fatally in this scenario")
    }

    pub(crate) fn bump(&mut self, value: &Value) -> bool {
        self.protocol
            .bump_state(value, true, &mut self.driver)
            .expect("bumping must not fail fatally in this scenario")
    }

    pub(crate) fn fire_timer(&mut self) -> bool {
        self.protocol
            .timer_expired(&mut self.driver)
            .expect("the timer callback must not fail fatally in this scenario")
    }
}

/// The slot every test scenario plays out in.
pub(crate) const SLOT: SlotIndex = SlotIndex::new(1);

/// A set of nodes sharing one symmetric quorum set (`threshold` of all of them), delivering
/// messages to each other only when the test pumps them.
pub(crate) struct Cluster {
    pub(crate) nodes: Vec<TestNode>,
}

impl Cluster {
    pub(crate) fn new(size: usize, threshold: u32) -> Self {
        let mut csprg = OsRng {};
        let keypairs: Vec<Keypair> = (0..size)
            .map(|_| Keypair::new(SigningKey::generate(&mut csprg)))
            .collect();

        let quorum_set = QuorumSet::new(
            threshold,
            keypairs.iter().map(|keypair| keypair.node_id()).collect(),
        );
        let quorum_sets = HashMap::from([(quorum_set.hash(), quorum_set.clone())]);

        let nodes = keypairs
            .into_iter()
            .map(|keypair| {
                TestNode::new(
                    keypair,
                    quorum_set.clone(),
                    MockDriver::new(quorum_sets.clone()),
                )
            })
            .collect();

        Self { nodes }
    }

    /// The quorum set shared by every node in the cluster.
    pub(crate) fn quorum_set(&self) -> QuorumSet {
        self.nodes[0]
            .driver
            .quorum_sets
            .values()
            .next()
            .expect("the cluster registered its quorum set")
            .clone()
    }

    /// Deliver every pending broadcast to every other node, repeatedly, until no node has
    /// anything left to send.
    pub(crate) fn deliver_until_quiet(&mut self) {
        loop {
            let mut deliveries: Vec<(usize, ScpEnvelope)> = Vec::new();
            for (sender, node) in self.nodes.iter_mut().enumerate() {
                for envelope in node.driver.emitted.drain(..) {
                    deliveries.push((sender, envelope));
                }
            }
            if deliveries.is_empty() {
                return;
            }

            for (sender, envelope) in deliveries {
                for (receiver, node) in self.nodes.iter_mut().enumerate() {
                    if receiver != sender {
                        let _ = node.process(envelope.clone());
                    }
                }
            }
        }
    }
}

/// Build a signed `PREPARE` envelope, for feeding hand-crafted peer statements to a node.
pub(crate) fn prepare_envelope(
    keypair: &Keypair,
    quorum_set_hash: QuorumSetHash,
    ballot: Ballot,
    prepared: Option<Ballot>,
    n_c: u32,
    n_h: u32,
) -> ScpEnvelope {
    let statement = ScpStatement {
        node_id: keypair.node_id(),
        slot_index: SLOT,
        pledges: ScpStatementPledges::Prepare(PrepareStatement {
            quorum_set_hash,
            ballot,
            prepared,
            prepared_prime: None,
            n_c,
            n_h,
        }),
    };
    ScpEnvelope::new(keypair, statement)
}

pub(crate) fn value(bytes: &[u8]) -> Value {
    Value::new(bytes.to_vec())
}
