//! Protolab Engine - Distributed Protocol Simulators
//!
//! Deterministic, message-driven simulations of classic distributed-systems
//! protocols. Every engine shares one substrate: an in-memory network of
//! typed messages, an audit event log and an injectable clock. Nothing
//! happens until the caller sends, delivers or advances time.
//!
//! Key Features:
//! - Consensus: Raft, Paxos, PBFT, Multi-Paxos, EPaxos, joint consensus
//! - Atomic commitment: two-phase commit, three-phase commit, sagas
//! - Replication: quorums, gossip, Merkle anti-entropy, CRDTs, tunable consistency
//! - Causality: Lamport total-order broadcast, vector clocks, Chandy-Lamport snapshots
//! - Partitioning: consistent hashing, sharding, leases, failure detection, split-brain
//! - Scripted scenario replay
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

// Substrate
pub mod clock;
pub mod engine;
pub mod event;
pub mod message;
pub mod node;
pub mod topology;

// Consensus
pub mod paxos;
pub mod pbft;
pub mod raft;
pub mod variants;

// Commitment
pub mod saga;
pub mod three_phase;
pub mod transaction;

// Replication
pub mod crdt;
pub mod eventual;
pub mod gossip;
pub mod merkle;
pub mod quorum;

// Causality
pub mod lamport;
pub mod snapshot;
pub mod vector_clock;

// Partitioning
pub mod failure_detector;
pub mod hash;
pub mod lease;
pub mod partition;
pub mod shard;

pub mod scenario;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use engine::{SimContext, Simulation};
pub use event::{Event, EventLog};
pub use message::{Delivery, Message, MessageCounts, MessageId, MessageStatus, Network, Payload};
pub use node::{node_ids, NodeId, NodeStatus};
pub use topology::{byzantine_faults, byzantine_quorum, majority, SimNode, Topology};

pub use paxos::{PaxosSimulation, ProposalNumber};
pub use pbft::{PbftSimulation, SequenceNumber, View};
pub use raft::{LogIndex, NodeRole, RaftSimulation, Term};
pub use variants::{EPaxos, JointConsensus, MultiPaxos};

pub use saga::{Saga, SagaStatus, StepStatus};
pub use three_phase::ThreePhaseCommit;
pub use transaction::{Decision, TransactionId, TwoPhaseCommit};

pub use crdt::{Crdt, CrdtCluster, GCounter, ORSet, PNCounter, Rga};
pub use eventual::EventualStore;
pub use gossip::GossipSimulation;
pub use merkle::{MerkleSimulation, MerkleTree};
pub use quorum::QuorumSimulation;

pub use lamport::{LamportClock, TotalOrderBroadcast};
pub use snapshot::{GlobalSnapshot, SnapshotSimulation};
pub use vector_clock::{CausalityTracker, VectorClock, VectorClockOrdering, VersionedValue};

pub use failure_detector::{FailureDetector, Suspicion};
pub use hash::{HashRing, KeyMove, VirtualNode};
pub use lease::{FencingToken, LeaseManager, LockResponse};
pub use partition::PartitionSimulation;
pub use shard::{Shard, ShardCluster, ShardId};

pub use scenario::{run_scenario, ScenarioReport, Scripted};
