//! Protolab Scenario Runner
//!
//! Replays scripted scenarios against a single engine. A scenario is a JSON
//! array of instructions shaped `{ "type": ..., "data": ... }`; each engine
//! defines its own instruction enum and applies every instruction to exactly
//! one of its mutators. The runner owns a manual clock so that timed
//! protocols (leases, failure detection, background replication) replay
//! deterministically through the `advance_clock` instruction.
//!
//! Key Features:
//! - Typed instruction enums per engine
//! - Whole-scenario validation before any instruction runs
//! - Step-indexed errors for malformed instructions
//! - Serializable report with the audit trail and final statistics
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{Clock, ManualClock};
use crate::engine::Simulation;
use crate::event::Event;
use crate::eventual::EventualStore;
use crate::failure_detector::FailureDetector;
use crate::gossip::GossipSimulation;
use crate::hash::HashRing;
use crate::lamport::TotalOrderBroadcast;
use crate::lease::{FencingToken, LeaseManager};
use crate::merkle::MerkleSimulation;
use crate::message::MessageId;
use crate::node::NodeId;
use crate::partition::PartitionSimulation;
use crate::paxos::PaxosSimulation;
use crate::pbft::PbftSimulation;
use crate::quorum::QuorumSimulation;
use crate::raft::RaftSimulation;
use crate::saga::Saga;
use crate::shard::ShardCluster;
use crate::snapshot::SnapshotSimulation;
use crate::three_phase::ThreePhaseCommit;
use crate::transaction::TwoPhaseCommit;
use crate::vector_clock::CausalityTracker;
use protolab_common::{ConsistencyLevel, ProtocolKind, ProtolabError, Result, SimulationConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Scripted Trait
// =============================================================================

/// An engine that can be driven by scenario instructions.
pub trait Scripted {
    type Instruction: DeserializeOwned;

    /// Apply one instruction to the matching mutator.
    fn apply(&mut self, instruction: Self::Instruction);

    fn audit(&self) -> &[Event];

    /// Final statistics as JSON.
    fn summary(&self) -> Result<Value>;
}

macro_rules! simulation_report {
    () => {
        fn audit(&self) -> &[Event] {
            Simulation::events(self)
        }

        fn summary(&self) -> Result<Value> {
            Ok(serde_json::to_value(Simulation::stats(self))?)
        }
    };
}

// =============================================================================
// Steps and Reports
// =============================================================================

const ADVANCE_CLOCK: &str = "advance_clock";

/// One parsed scenario step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<I> {
    AdvanceClock { ms: u64 },
    Apply(I),
}

#[derive(Debug, Deserialize)]
struct AdvanceClockData {
    ms: u64,
}

/// Outcome of a replayed scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub protocol: ProtocolKind,
    pub steps: usize,
    pub clock_ms: u64,
    pub events: Vec<Event>,
    pub stats: Value,
}

/// Parse and validate a whole scenario before anything runs.
pub fn parse_steps<I: DeserializeOwned>(source: &str) -> Result<Vec<Step<I>>> {
    let document: Value = serde_json::from_str(source)
        .map_err(|e| ProtolabError::Scenario(format!("invalid JSON: {}", e)))?;
    let Value::Array(items) = document else {
        return Err(ProtolabError::Scenario(
            "scenario must be a JSON array of instructions".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(step, item)| parse_step(step, item))
        .collect()
}

fn parse_step<I: DeserializeOwned>(step: usize, item: Value) -> Result<Step<I>> {
    let kind = item.get("type").and_then(Value::as_str).ok_or_else(|| {
        ProtolabError::Instruction {
            step,
            reason: "missing string field 'type'".to_string(),
        }
    })?;

    if kind == ADVANCE_CLOCK {
        let data = item.get("data").cloned().unwrap_or(Value::Null);
        let data: AdvanceClockData =
            serde_json::from_value(data).map_err(|e| ProtolabError::Instruction {
                step,
                reason: e.to_string(),
            })?;
        return Ok(Step::AdvanceClock { ms: data.ms });
    }

    serde_json::from_value(item)
        .map(Step::Apply)
        .map_err(|e| ProtolabError::Instruction {
            step,
            reason: e.to_string(),
        })
}

/// Replay `source` against an engine that reads time from `clock`.
pub fn replay<S: Scripted>(
    protocol: ProtocolKind,
    engine: &mut S,
    clock: &ManualClock,
    source: &str,
) -> Result<ScenarioReport> {
    let steps = parse_steps::<S::Instruction>(source)?;
    let count = steps.len();
    for step in steps {
        match step {
            Step::AdvanceClock { ms } => {
                let now = clock.advance(ms);
                tracing::debug!(now, "scenario clock advanced");
            }
            Step::Apply(instruction) => engine.apply(instruction),
        }
    }
    tracing::info!(protocol = protocol.name(), steps = count, "scenario replayed");

    Ok(ScenarioReport {
        protocol,
        steps: count,
        clock_ms: clock.now_millis(),
        events: engine.audit().to_vec(),
        stats: engine.summary()?,
    })
}

/// Build the engine for `protocol` from `config` and replay `source`.
pub fn run_scenario(
    protocol: ProtocolKind,
    config: &SimulationConfig,
    source: &str,
) -> Result<ScenarioReport> {
    let clock = ManualClock::new(0);
    let shared = clock.shared();
    let delivery = config.delivery.clone();

    match protocol {
        ProtocolKind::Raft => {
            let mut sim = RaftSimulation::new(config.raft.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Paxos => {
            let mut sim = PaxosSimulation::new(config.paxos.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Pbft => {
            let mut sim = PbftSimulation::new(config.pbft.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::TwoPhaseCommit => {
            let mut sim = TwoPhaseCommit::new(config.commit.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::ThreePhaseCommit => {
            let mut sim = ThreePhaseCommit::new(config.commit.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Saga => {
            let mut saga = Saga::new(config.saga.clone()).with_clock(shared);
            replay(protocol, &mut saga, &clock, source)
        }
        ProtocolKind::Quorum => {
            let mut sim = QuorumSimulation::new(config.quorum.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Gossip => {
            let mut sim = GossipSimulation::new(config.gossip.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Merkle => {
            let mut sim = MerkleSimulation::new(config.merkle.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Eventual => {
            let mut sim = EventualStore::new(config.eventual.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Lamport => {
            let mut sim = TotalOrderBroadcast::new(config.causality.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::VectorClock => {
            let mut sim = CausalityTracker::new(config.causality.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Snapshot => {
            let mut sim = SnapshotSimulation::new(config.causality.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::ConsistentHashing => {
            let mut ring = HashRing::new(config.hash_ring.clone()).with_clock(shared);
            replay(protocol, &mut ring, &clock, source)
        }
        ProtocolKind::Sharding => {
            let mut sim = ShardCluster::new(config.shard.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Lease => {
            let mut sim = LeaseManager::new(config.lease.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::FailureDetector => {
            let mut sim = FailureDetector::new(config.failure_detector.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
        ProtocolKind::Partition => {
            let mut sim = PartitionSimulation::new(config.partition.clone())
                .with_clock(shared)
                .with_delivery(delivery);
            replay(protocol, &mut sim, &clock, source)
        }
    }
}

// =============================================================================
// Consensus Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RaftInstruction {
    StartElection { candidate: NodeId },
    ClientRequest { command: String },
    Heartbeat,
    Deliver { message: u64 },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for RaftSimulation {
    type Instruction = RaftInstruction;

    fn apply(&mut self, instruction: RaftInstruction) {
        match instruction {
            RaftInstruction::StartElection { candidate } => {
                self.start_election(&candidate);
            }
            RaftInstruction::ClientRequest { command } => {
                self.client_request(command);
            }
            RaftInstruction::Heartbeat => {
                self.heartbeat();
            }
            RaftInstruction::Deliver { message } => self.deliver(MessageId(message)),
            RaftInstruction::DeliverAll => {
                self.deliver_all();
            }
            RaftInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            RaftInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PaxosInstruction {
    StartProposal { proposer: NodeId, value: String },
    CheckForDecision,
    Deliver { message: u64 },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for PaxosSimulation {
    type Instruction = PaxosInstruction;

    fn apply(&mut self, instruction: PaxosInstruction) {
        match instruction {
            PaxosInstruction::StartProposal { proposer, value } => {
                self.start_proposal(&proposer, value);
            }
            PaxosInstruction::CheckForDecision => {
                self.check_for_decision();
            }
            PaxosInstruction::Deliver { message } => self.deliver(MessageId(message)),
            PaxosInstruction::DeliverAll => {
                self.deliver_all();
            }
            PaxosInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            PaxosInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PbftInstruction {
    ClientRequest { value: String },
    ViewChange,
    SetByzantine { node: NodeId, byzantine: bool },
    Deliver { message: u64 },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for PbftSimulation {
    type Instruction = PbftInstruction;

    fn apply(&mut self, instruction: PbftInstruction) {
        match instruction {
            PbftInstruction::ClientRequest { value } => {
                self.client_request(value);
            }
            PbftInstruction::ViewChange => {
                self.view_change();
            }
            PbftInstruction::SetByzantine { node, byzantine } => {
                self.set_byzantine(&node, byzantine);
            }
            PbftInstruction::Deliver { message } => self.deliver(MessageId(message)),
            PbftInstruction::DeliverAll => {
                self.deliver_all();
            }
            PbftInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            PbftInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

// =============================================================================
// Commitment Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TwoPhaseInstruction {
    StartTransaction,
    ParticipantVote { participant: NodeId, commit: bool },
    CoordinatorDecide,
    CoordinatorComplete,
    CheckTimeout,
    Deliver { message: u64 },
    DeliverAll,
    FailCoordinator,
    RecoverCoordinator,
    FailParticipant { participant: NodeId },
    RecoverParticipant { participant: NodeId },
}

impl Scripted for TwoPhaseCommit {
    type Instruction = TwoPhaseInstruction;

    fn apply(&mut self, instruction: TwoPhaseInstruction) {
        match instruction {
            TwoPhaseInstruction::StartTransaction => {
                self.start_transaction();
            }
            TwoPhaseInstruction::ParticipantVote { participant, commit } => {
                self.participant_vote(&participant, commit);
            }
            TwoPhaseInstruction::CoordinatorDecide => {
                self.coordinator_decide();
            }
            TwoPhaseInstruction::CoordinatorComplete => {
                self.coordinator_complete();
            }
            TwoPhaseInstruction::CheckTimeout => {
                self.check_timeout();
            }
            TwoPhaseInstruction::Deliver { message } => self.deliver(MessageId(message)),
            TwoPhaseInstruction::DeliverAll => {
                self.deliver_all();
            }
            TwoPhaseInstruction::FailCoordinator => self.fail_coordinator(),
            TwoPhaseInstruction::RecoverCoordinator => self.recover_coordinator(),
            TwoPhaseInstruction::FailParticipant { participant } => {
                self.fail_participant(&participant);
            }
            TwoPhaseInstruction::RecoverParticipant { participant } => {
                self.recover_participant(&participant);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ThreePhaseInstruction {
    StartTransaction,
    ParticipantVote { participant: NodeId, commit: bool },
    PreCommit,
    DoCommit,
    Complete,
    ParticipantTimeout { participant: NodeId },
    Deliver { message: u64 },
    DeliverAll,
    FailCoordinator,
    RecoverCoordinator,
    FailParticipant { participant: NodeId },
    RecoverParticipant { participant: NodeId },
}

impl Scripted for ThreePhaseCommit {
    type Instruction = ThreePhaseInstruction;

    fn apply(&mut self, instruction: ThreePhaseInstruction) {
        match instruction {
            ThreePhaseInstruction::StartTransaction => {
                self.start_transaction();
            }
            ThreePhaseInstruction::ParticipantVote { participant, commit } => {
                self.participant_vote(&participant, commit);
            }
            ThreePhaseInstruction::PreCommit => {
                self.pre_commit();
            }
            ThreePhaseInstruction::DoCommit => {
                self.do_commit();
            }
            ThreePhaseInstruction::Complete => {
                self.complete();
            }
            ThreePhaseInstruction::ParticipantTimeout { participant } => {
                self.participant_timeout(&participant);
            }
            ThreePhaseInstruction::Deliver { message } => self.deliver(MessageId(message)),
            ThreePhaseInstruction::DeliverAll => {
                self.deliver_all();
            }
            ThreePhaseInstruction::FailCoordinator => self.fail_coordinator(),
            ThreePhaseInstruction::RecoverCoordinator => self.recover_coordinator(),
            ThreePhaseInstruction::FailParticipant { participant } => {
                self.fail_participant(&participant);
            }
            ThreePhaseInstruction::RecoverParticipant { participant } => {
                self.recover_participant(&participant);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SagaInstruction {
    CompleteStep { index: usize },
    FailStep { index: usize },
    CompensateStep { index: usize },
}

impl Scripted for Saga {
    type Instruction = SagaInstruction;

    fn apply(&mut self, instruction: SagaInstruction) {
        match instruction {
            SagaInstruction::CompleteStep { index } => {
                self.complete_step(index);
            }
            SagaInstruction::FailStep { index } => {
                self.fail_step(index);
            }
            SagaInstruction::CompensateStep { index } => {
                self.compensate_step(index);
            }
        }
    }

    fn audit(&self) -> &[Event] {
        self.events()
    }

    fn summary(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.stats())?)
    }
}

// =============================================================================
// Replication Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum QuorumInstruction {
    Write { coordinator: NodeId, key: String, value: String },
    Read { coordinator: NodeId, key: String },
    Deliver { message: u64 },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for QuorumSimulation {
    type Instruction = QuorumInstruction;

    fn apply(&mut self, instruction: QuorumInstruction) {
        match instruction {
            QuorumInstruction::Write { coordinator, key, value } => {
                self.write(&coordinator, &key, &value);
            }
            QuorumInstruction::Read { coordinator, key } => {
                self.read(&coordinator, &key);
            }
            QuorumInstruction::Deliver { message } => self.deliver(MessageId(message)),
            QuorumInstruction::DeliverAll => {
                self.deliver_all();
            }
            QuorumInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            QuorumInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GossipInstruction {
    Update { node: NodeId, key: String, value: String },
    GossipRound,
    RunUntilConverged { max_rounds: u64 },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for GossipSimulation {
    type Instruction = GossipInstruction;

    fn apply(&mut self, instruction: GossipInstruction) {
        match instruction {
            GossipInstruction::Update { node, key, value } => {
                self.update(&node, &key, &value);
            }
            GossipInstruction::GossipRound => {
                self.gossip_round();
            }
            GossipInstruction::RunUntilConverged { max_rounds } => {
                self.run_until_converged(max_rounds);
            }
            GossipInstruction::DeliverAll => {
                self.deliver_all();
            }
            GossipInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            GossipInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MerkleInstruction {
    Put { replica: NodeId, key: String, value: String },
    Synchronize { a: NodeId, b: NodeId },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for MerkleSimulation {
    type Instruction = MerkleInstruction;

    fn apply(&mut self, instruction: MerkleInstruction) {
        match instruction {
            MerkleInstruction::Put { replica, key, value } => {
                self.put(&replica, &key, &value);
            }
            MerkleInstruction::Synchronize { a, b } => {
                self.synchronize(&a, &b);
            }
            MerkleInstruction::DeliverAll => {
                self.deliver_all();
            }
            MerkleInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            MerkleInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventualInstruction {
    Write {
        coordinator: NodeId,
        key: String,
        value: String,
        #[serde(default)]
        level: ConsistencyLevel,
    },
    Read {
        coordinator: NodeId,
        key: String,
        #[serde(default)]
        level: ConsistencyLevel,
    },
    /// Run background replication due at the current clock time.
    Tick,
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for EventualStore {
    type Instruction = EventualInstruction;

    fn apply(&mut self, instruction: EventualInstruction) {
        match instruction {
            EventualInstruction::Write { coordinator, key, value, level } => {
                self.write(&coordinator, &key, &value, level);
            }
            EventualInstruction::Read { coordinator, key, level } => {
                self.read(&coordinator, &key, level);
            }
            EventualInstruction::Tick => {
                let now = self.context().now();
                self.tick(now);
            }
            EventualInstruction::DeliverAll => {
                self.deliver_all();
            }
            EventualInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            EventualInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

// =============================================================================
// Causality Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LamportInstruction {
    LocalEvent { node: NodeId },
    Broadcast { sender: NodeId, payload: String },
    DeliverAll,
    FailNode { node: NodeId },
}

impl Scripted for TotalOrderBroadcast {
    type Instruction = LamportInstruction;

    fn apply(&mut self, instruction: LamportInstruction) {
        match instruction {
            LamportInstruction::LocalEvent { node } => {
                self.local_event(&node);
            }
            LamportInstruction::Broadcast { sender, payload } => {
                self.broadcast(&sender, &payload);
            }
            LamportInstruction::DeliverAll => {
                self.deliver_all();
            }
            LamportInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum VectorClockInstruction {
    LocalEvent { process: NodeId, label: String },
    Send { from: NodeId, to: NodeId, label: String },
    Deliver { message: u64 },
    DeliverAll,
}

impl Scripted for CausalityTracker {
    type Instruction = VectorClockInstruction;

    fn apply(&mut self, instruction: VectorClockInstruction) {
        match instruction {
            VectorClockInstruction::LocalEvent { process, label } => {
                self.local_event(&process, &label);
            }
            VectorClockInstruction::Send { from, to, label } => {
                self.send(&from, &to, &label);
            }
            VectorClockInstruction::Deliver { message } => self.deliver(MessageId(message)),
            VectorClockInstruction::DeliverAll => {
                self.deliver_all();
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SnapshotInstruction {
    LocalEvent { process: NodeId },
    SendAppMessage { from: NodeId, to: NodeId },
    InitiateSnapshot { initiator: NodeId },
    Deliver { message: u64 },
    DeliverAll,
    FailNode { node: NodeId },
}

impl Scripted for SnapshotSimulation {
    type Instruction = SnapshotInstruction;

    fn apply(&mut self, instruction: SnapshotInstruction) {
        match instruction {
            SnapshotInstruction::LocalEvent { process } => {
                self.local_event(&process);
            }
            SnapshotInstruction::SendAppMessage { from, to } => {
                self.send_app_message(&from, &to);
            }
            SnapshotInstruction::InitiateSnapshot { initiator } => {
                self.initiate_snapshot(&initiator);
            }
            SnapshotInstruction::Deliver { message } => self.deliver(MessageId(message)),
            SnapshotInstruction::DeliverAll => {
                self.deliver_all();
            }
            SnapshotInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
        }
    }

    simulation_report!();
}

// =============================================================================
// Partitioning Instructions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HashRingInstruction {
    AddKey { key: String },
    AddServer { server: NodeId },
    RemoveServer { server: NodeId },
    SetVirtualNodes { count: usize },
}

impl Scripted for HashRing {
    type Instruction = HashRingInstruction;

    fn apply(&mut self, instruction: HashRingInstruction) {
        match instruction {
            HashRingInstruction::AddKey { key } => {
                self.add_key(&key);
            }
            HashRingInstruction::AddServer { server } => {
                self.add_server(&server);
            }
            HashRingInstruction::RemoveServer { server } => {
                self.remove_server(&server);
            }
            HashRingInstruction::SetVirtualNodes { count } => {
                self.set_virtual_nodes(count);
            }
        }
    }

    fn audit(&self) -> &[Event] {
        self.events()
    }

    fn summary(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.stats())?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ShardInstruction {
    InsertKey { key: u64 },
    AddNode { node: NodeId },
    RemoveNode { node: NodeId },
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for ShardCluster {
    type Instruction = ShardInstruction;

    fn apply(&mut self, instruction: ShardInstruction) {
        match instruction {
            ShardInstruction::InsertKey { key } => {
                self.insert_key(key);
            }
            ShardInstruction::AddNode { node } => {
                self.add_node(&node);
            }
            ShardInstruction::RemoveNode { node } => {
                self.remove_node(&node);
            }
            ShardInstruction::DeliverAll => {
                self.deliver_all();
            }
            ShardInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            ShardInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LeaseInstruction {
    RequestLock { client: NodeId },
    Heartbeat { client: NodeId },
    ReleaseLock { client: NodeId },
    CheckTimeouts,
    FencedWrite { client: NodeId, token: FencingToken },
    DeliverAll,
    FailClient { client: NodeId },
    RecoverClient { client: NodeId },
}

impl Scripted for LeaseManager {
    type Instruction = LeaseInstruction;

    fn apply(&mut self, instruction: LeaseInstruction) {
        match instruction {
            LeaseInstruction::RequestLock { client } => {
                self.request_lock(&client);
            }
            LeaseInstruction::Heartbeat { client } => {
                self.heartbeat(&client);
            }
            LeaseInstruction::ReleaseLock { client } => {
                self.release_lock(&client);
            }
            LeaseInstruction::CheckTimeouts => {
                self.check_timeouts();
            }
            LeaseInstruction::FencedWrite { client, token } => {
                self.fenced_write(&client, token);
            }
            LeaseInstruction::DeliverAll => {
                self.deliver_all();
            }
            LeaseInstruction::FailClient { client } => {
                self.fail_client(&client);
            }
            LeaseInstruction::RecoverClient { client } => {
                self.recover_client(&client);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DetectorInstruction {
    Heartbeat { node: NodeId },
    HeartbeatAll,
    Evaluate,
    Probe { target: NodeId },
    DeliverAll,
    Crash { node: NodeId },
    Recover { node: NodeId },
}

impl Scripted for FailureDetector {
    type Instruction = DetectorInstruction;

    fn apply(&mut self, instruction: DetectorInstruction) {
        match instruction {
            DetectorInstruction::Heartbeat { node } => {
                self.heartbeat(&node);
            }
            DetectorInstruction::HeartbeatAll => {
                self.heartbeat_all();
            }
            DetectorInstruction::Evaluate => {
                self.evaluate();
            }
            DetectorInstruction::Probe { target } => {
                self.probe(&target);
            }
            DetectorInstruction::DeliverAll => {
                self.deliver_all();
            }
            DetectorInstruction::Crash { node } => {
                self.crash(&node);
            }
            DetectorInstruction::Recover { node } => {
                self.recover(&node);
            }
        }
    }

    simulation_report!();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PartitionInstruction {
    Partition { groups: Vec<Vec<NodeId>> },
    StartElection { candidate: NodeId },
    ClientWrite { leader: NodeId, value: String },
    Heal,
    DeliverAll,
    FailNode { node: NodeId },
    RecoverNode { node: NodeId },
}

impl Scripted for PartitionSimulation {
    type Instruction = PartitionInstruction;

    fn apply(&mut self, instruction: PartitionInstruction) {
        match instruction {
            PartitionInstruction::Partition { groups } => {
                self.partition(&groups);
            }
            PartitionInstruction::StartElection { candidate } => {
                self.start_election(&candidate);
            }
            PartitionInstruction::ClientWrite { leader, value } => {
                self.client_write(&leader, &value);
            }
            PartitionInstruction::Heal => {
                self.heal();
            }
            PartitionInstruction::DeliverAll => {
                self.deliver_all();
            }
            PartitionInstruction::FailNode { node } => {
                self.fail_node(&node);
            }
            PartitionInstruction::RecoverNode { node } => {
                self.recover_node(&node);
            }
        }
    }

    simulation_report!();
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig::default()
    }

    #[test]
    fn test_parse_instruction_shapes() {
        let steps = parse_steps::<RaftInstruction>(
            r#"[
                {"type": "start_election", "data": {"candidate": "N0"}},
                {"type": "deliver_all"},
                {"type": "advance_clock", "data": {"ms": 250}}
            ]"#,
        )
        .unwrap();
        assert_eq!(
            steps,
            vec![
                Step::Apply(RaftInstruction::StartElection {
                    candidate: NodeId::new("N0")
                }),
                Step::Apply(RaftInstruction::DeliverAll),
                Step::AdvanceClock { ms: 250 },
            ]
        );
    }

    #[test]
    fn test_two_phase_commit_scenario() {
        let source = r#"[
            {"type": "start_transaction"},
            {"type": "deliver_all"},
            {"type": "participant_vote", "data": {"participant": "P0", "commit": true}},
            {"type": "participant_vote", "data": {"participant": "P1", "commit": true}},
            {"type": "participant_vote", "data": {"participant": "P2", "commit": true}},
            {"type": "deliver_all"},
            {"type": "coordinator_decide"},
            {"type": "deliver_all"},
            {"type": "coordinator_complete"}
        ]"#;
        let report = run_scenario(ProtocolKind::TwoPhaseCommit, &config(), source).unwrap();
        assert_eq!(report.steps, 9);
        assert!(report.events.iter().any(|e| e.kind == "transaction_completed"));
    }

    #[test]
    fn test_lease_scenario_uses_scenario_clock() {
        let source = r#"[
            {"type": "request_lock", "data": {"client": "C0"}},
            {"type": "request_lock", "data": {"client": "C1"}},
            {"type": "advance_clock", "data": {"ms": 4000}},
            {"type": "check_timeouts"},
            {"type": "deliver_all"}
        ]"#;
        let report = run_scenario(ProtocolKind::Lease, &config(), source).unwrap();
        assert_eq!(report.clock_ms, 4000);
        assert_eq!(report.stats["holder"], serde_json::json!("C1"));
    }

    #[test]
    fn test_malformed_instruction_reports_step() {
        let source = r#"[
            {"type": "start_election", "data": {"candidate": "N0"}},
            {"type": "start_election", "data": {}}
        ]"#;
        match run_scenario(ProtocolKind::Raft, &config(), source) {
            Err(ProtolabError::Instruction { step, .. }) => assert_eq!(step, 1),
            other => panic!("unexpected result: {:?}", other.map(|r| r.steps)),
        }

        let unknown = r#"[{"type": "launch_rockets"}]"#;
        assert!(matches!(
            run_scenario(ProtocolKind::Raft, &config(), unknown),
            Err(ProtolabError::Instruction { step: 0, .. })
        ));
    }

    #[test]
    fn test_scenario_must_be_array() {
        let err = run_scenario(ProtocolKind::Saga, &config(), r#"{"type": "fail_step"}"#).unwrap_err();
        assert!(matches!(err, ProtolabError::Scenario(_)));
        assert!(err.is_user_error());

        let err = run_scenario(ProtocolKind::Saga, &config(), "not json").unwrap_err();
        assert!(matches!(err, ProtolabError::Scenario(_)));
    }

    #[test]
    fn test_nothing_runs_when_validation_fails() {
        let clock = ManualClock::new(0);
        let mut saga = Saga::new(config().saga).with_clock(clock.shared());
        let source = r#"[
            {"type": "complete_step", "data": {"index": 0}},
            {"type": "complete_step", "data": {"index": "first"}}
        ]"#;
        assert!(replay(ProtocolKind::Saga, &mut saga, &clock, source).is_err());
        assert!(saga.events().is_empty());
    }
}
