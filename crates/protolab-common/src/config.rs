//! Protolab Config - Configuration Structures
//!
//! Construction parameters for every simulation engine. Supports loading from
//! TOML files and programmatic construction through builder-style methods.
//! Every section has defaults that match the classroom scenarios, so a
//! configuration file only needs to name what it changes.
//!
//! Key Features:
//! - Consensus configuration (cluster sizes, role counts)
//! - Commitment configuration (participants, timeouts, saga steps)
//! - Replication configuration (quorums, fanout, consistency)
//! - Partitioning configuration (rings, shards, leases, detectors)
//! - Delivery configuration (auto-delivery delay, settle limits)
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::types::{GossipMode, QuorumScope, ShardStrategy};
use crate::{ProtolabError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Delivery Configuration
// =============================================================================

/// How in-flight messages are driven to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// When set, every send schedules an automatic delivery this many
    /// milliseconds later on the engine's clock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_delivery_delay_ms: Option<u64>,
    /// Upper bound on delivery passes when settling a network.
    pub max_passes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            auto_delivery_delay_ms: None,
            max_passes: 1000,
        }
    }
}

// =============================================================================
// Consensus Configuration
// =============================================================================

/// Configuration for the Raft simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub node_count: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self { node_count: 5 }
    }
}

impl RaftConfig {
    pub fn with_nodes(mut self, node_count: usize) -> Self {
        self.node_count = node_count;
        self
    }
}

/// Configuration for the single-decree Paxos simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaxosConfig {
    pub proposers: usize,
    pub acceptors: usize,
    pub learners: usize,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            proposers: 2,
            acceptors: 3,
            learners: 1,
        }
    }
}

impl PaxosConfig {
    pub fn with_proposers(mut self, proposers: usize) -> Self {
        self.proposers = proposers;
        self
    }

    pub fn with_acceptors(mut self, acceptors: usize) -> Self {
        self.acceptors = acceptors;
        self
    }

    pub fn with_learners(mut self, learners: usize) -> Self {
        self.learners = learners;
        self
    }
}

/// Configuration for the PBFT simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftConfig {
    pub node_count: usize,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self { node_count: 4 }
    }
}

// =============================================================================
// Commitment Configuration
// =============================================================================

/// Configuration shared by the two- and three-phase commit simulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub participants: usize,
    /// Voting window before the coordinator forces an abort.
    pub timeout_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            participants: 3,
            timeout_ms: 5000,
        }
    }
}

impl CommitConfig {
    pub fn with_participants(mut self, participants: usize) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Configuration for the saga simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub steps: Vec<String>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            steps: vec![
                "reserve-inventory".to_string(),
                "charge-payment".to_string(),
                "ship-order".to_string(),
            ],
        }
    }
}

// =============================================================================
// Replication Configuration
// =============================================================================

/// Configuration for quorum replication with read repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub node_count: usize,
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            replication_factor: 3,
            write_quorum: 2,
            read_quorum: 2,
        }
    }
}

impl QuorumConfig {
    pub fn with_quorums(mut self, write_quorum: usize, read_quorum: usize) -> Self {
        self.write_quorum = write_quorum;
        self.read_quorum = read_quorum;
        self
    }

    /// True when every read quorum intersects every write quorum.
    pub fn is_strongly_consistent(&self) -> bool {
        self.write_quorum + self.read_quorum > self.replication_factor
    }
}

/// Configuration for gossip anti-entropy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub node_count: usize,
    pub fanout: usize,
    pub mode: GossipMode,
    /// Seed for peer selection; equal seeds replay equal runs.
    pub seed: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_count: 6,
            fanout: 2,
            mode: GossipMode::PushPull,
            seed: 42,
        }
    }
}

impl GossipConfig {
    pub fn with_mode(mut self, mode: GossipMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Configuration for Merkle-tree anti-entropy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerkleConfig {
    pub replicas: usize,
    /// Leaf bucket count; rounded up to a power of two.
    pub leaf_buckets: usize,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            replicas: 2,
            leaf_buckets: 8,
        }
    }
}

/// Configuration for tunable-consistency eventual replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventualConfig {
    pub node_count: usize,
    /// Delay before background replication messages are delivered.
    pub background_delay_ms: u64,
}

impl Default for EventualConfig {
    fn default() -> Self {
        Self {
            node_count: 3,
            background_delay_ms: 1000,
        }
    }
}

// =============================================================================
// Causality Configuration
// =============================================================================

/// Configuration shared by the Lamport, vector clock and snapshot simulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CausalityConfig {
    pub process_count: usize,
}

impl Default for CausalityConfig {
    fn default() -> Self {
        Self { process_count: 3 }
    }
}

// =============================================================================
// Partitioning Configuration
// =============================================================================

/// Configuration for the consistent hashing ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashRingConfig {
    pub servers: usize,
    pub virtual_nodes: usize,
    pub ring_size: u64,
}

impl Default for HashRingConfig {
    fn default() -> Self {
        Self {
            servers: 3,
            virtual_nodes: 3,
            ring_size: 360,
        }
    }
}

/// Configuration for shard rebalancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub node_count: usize,
    pub key_space: u64,
    pub strategy: ShardStrategy,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            node_count: 3,
            key_space: 1000,
            strategy: ShardStrategy::Range,
        }
    }
}

/// Configuration for the lease lock manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub clients: usize,
    pub ttl_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            clients: 3,
            ttl_ms: 4000,
        }
    }
}

impl LeaseConfig {
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }
}

/// Configuration for heartbeat failure detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    pub node_count: usize,
    pub heartbeat_interval_ms: u64,
    pub phi_threshold: f64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            node_count: 4,
            heartbeat_interval_ms: 1000,
            phi_threshold: 8.0,
        }
    }
}

/// Configuration for the network partition simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub node_count: usize,
    pub quorum: QuorumScope,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            quorum: QuorumScope::PartitionMajority,
        }
    }
}

// =============================================================================
// Simulation Configuration
// =============================================================================

/// Top-level configuration covering every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SimulationConfig {
    pub delivery: DeliveryConfig,
    pub raft: RaftConfig,
    pub paxos: PaxosConfig,
    pub pbft: PbftConfig,
    pub commit: CommitConfig,
    pub saga: SagaConfig,
    pub quorum: QuorumConfig,
    pub gossip: GossipConfig,
    pub merkle: MerkleConfig,
    pub eventual: EventualConfig,
    pub causality: CausalityConfig,
    pub hash_ring: HashRingConfig,
    pub shard: ShardConfig,
    pub lease: LeaseConfig,
    pub failure_detector: FailureDetectorConfig,
    pub partition: PartitionConfig,
}

impl SimulationConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ProtolabError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProtolabError::Serialization(e.to_string()))
    }

    /// Reject configurations no engine can be built from.
    pub fn validate(&self) -> Result<()> {
        let non_empty = [
            ("raft.node_count", self.raft.node_count),
            ("paxos.acceptors", self.paxos.acceptors),
            ("paxos.proposers", self.paxos.proposers),
            ("pbft.node_count", self.pbft.node_count),
            ("quorum.node_count", self.quorum.node_count),
            ("gossip.node_count", self.gossip.node_count),
            ("merkle.replicas", self.merkle.replicas),
            ("eventual.node_count", self.eventual.node_count),
            ("causality.process_count", self.causality.process_count),
            ("shard.node_count", self.shard.node_count),
            ("failure_detector.node_count", self.failure_detector.node_count),
            ("partition.node_count", self.partition.node_count),
        ];
        for (field, value) in non_empty {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }

        let q = &self.quorum;
        if q.replication_factor == 0 || q.replication_factor > q.node_count {
            return Err(invalid(
                "quorum.replication_factor",
                "must be between 1 and quorum.node_count",
            ));
        }
        if q.write_quorum == 0 || q.write_quorum > q.replication_factor {
            return Err(invalid(
                "quorum.write_quorum",
                "must be between 1 and the replication factor",
            ));
        }
        if q.read_quorum == 0 || q.read_quorum > q.replication_factor {
            return Err(invalid(
                "quorum.read_quorum",
                "must be between 1 and the replication factor",
            ));
        }
        if self.hash_ring.virtual_nodes == 0 {
            return Err(invalid("hash_ring.virtual_nodes", "must be at least 1"));
        }
        if self.shard.key_space == 0 {
            return Err(invalid("shard.key_space", "must be at least 1"));
        }
        if self.failure_detector.heartbeat_interval_ms == 0 {
            return Err(invalid(
                "failure_detector.heartbeat_interval_ms",
                "must be at least 1",
            ));
        }
        if self.failure_detector.phi_threshold <= 0.0 {
            return Err(invalid("failure_detector.phi_threshold", "must be positive"));
        }
        if self.delivery.max_passes == 0 {
            return Err(invalid("delivery.max_passes", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ProtolabError {
    ProtolabError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease.ttl_ms, 4000);
        assert_eq!(config.paxos.acceptors, 3);
        assert!(!config.quorum.is_strongly_consistent());
    }

    #[test]
    fn test_partial_toml() {
        let config = SimulationConfig::from_toml_str(
            r#"
            [raft]
            node_count = 7

            [gossip]
            mode = "push"
            "#,
        )
        .unwrap();
        assert_eq!(config.raft.node_count, 7);
        assert_eq!(config.gossip.mode, GossipMode::Push);
        assert_eq!(config.gossip.fanout, 2);
        assert_eq!(config.pbft.node_count, 4);
    }

    #[test]
    fn test_validation_rejects_bad_quorum() {
        let err = SimulationConfig::from_toml_str(
            r#"
            [quorum]
            replication_factor = 3
            write_quorum = 4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtolabError::InvalidValue { ref field, .. } if field == "quorum.write_quorum"));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_round_trip_through_file() {
        let config = SimulationConfig {
            raft: RaftConfig::default().with_nodes(3),
            lease: LeaseConfig::default().with_ttl_ms(2500),
            ..Default::default()
        };
        let text = config.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();

        let loaded = SimulationConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = SimulationConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ProtolabError::Io(_)));
    }
}
