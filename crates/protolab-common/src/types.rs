//! Protolab Types - Shared Enumerations
//!
//! Small value types shared between the configuration layer and the
//! simulation engines. Every type here is serializable so it can appear in
//! TOML configuration files and JSON scenario scripts.
//!
//! Key Features:
//! - Protocol catalogue used by the scenario runner
//! - Gossip exchange modes and consistency levels
//! - Shard placement strategies and partition quorum rules
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Protocol Catalogue
// =============================================================================

/// Every protocol engine that can be driven by a scenario script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Raft,
    Paxos,
    Pbft,
    TwoPhaseCommit,
    ThreePhaseCommit,
    Saga,
    Quorum,
    Gossip,
    Merkle,
    Eventual,
    Lamport,
    VectorClock,
    Snapshot,
    ConsistentHashing,
    Sharding,
    Lease,
    FailureDetector,
    Partition,
}

impl ProtocolKind {
    /// All protocols in catalogue order.
    pub const ALL: [ProtocolKind; 18] = [
        ProtocolKind::Raft,
        ProtocolKind::Paxos,
        ProtocolKind::Pbft,
        ProtocolKind::TwoPhaseCommit,
        ProtocolKind::ThreePhaseCommit,
        ProtocolKind::Saga,
        ProtocolKind::Quorum,
        ProtocolKind::Gossip,
        ProtocolKind::Merkle,
        ProtocolKind::Eventual,
        ProtocolKind::Lamport,
        ProtocolKind::VectorClock,
        ProtocolKind::Snapshot,
        ProtocolKind::ConsistentHashing,
        ProtocolKind::Sharding,
        ProtocolKind::Lease,
        ProtocolKind::FailureDetector,
        ProtocolKind::Partition,
    ];

    /// Stable kebab-case name, as accepted on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Raft => "raft",
            ProtocolKind::Paxos => "paxos",
            ProtocolKind::Pbft => "pbft",
            ProtocolKind::TwoPhaseCommit => "two-phase-commit",
            ProtocolKind::ThreePhaseCommit => "three-phase-commit",
            ProtocolKind::Saga => "saga",
            ProtocolKind::Quorum => "quorum",
            ProtocolKind::Gossip => "gossip",
            ProtocolKind::Merkle => "merkle",
            ProtocolKind::Eventual => "eventual",
            ProtocolKind::Lamport => "lamport",
            ProtocolKind::VectorClock => "vector-clock",
            ProtocolKind::Snapshot => "snapshot",
            ProtocolKind::ConsistentHashing => "consistent-hashing",
            ProtocolKind::Sharding => "sharding",
            ProtocolKind::Lease => "lease",
            ProtocolKind::FailureDetector => "failure-detector",
            ProtocolKind::Partition => "partition",
        }
    }

    /// Topic the protocol belongs to.
    pub fn topic(&self) -> &'static str {
        match self {
            ProtocolKind::Raft | ProtocolKind::Paxos | ProtocolKind::Pbft => "consensus",
            ProtocolKind::TwoPhaseCommit | ProtocolKind::ThreePhaseCommit | ProtocolKind::Saga => {
                "atomic commitment"
            }
            ProtocolKind::Quorum
            | ProtocolKind::Gossip
            | ProtocolKind::Merkle
            | ProtocolKind::Eventual => "replication",
            ProtocolKind::Lamport | ProtocolKind::VectorClock | ProtocolKind::Snapshot => {
                "causality"
            }
            ProtocolKind::ConsistentHashing
            | ProtocolKind::Sharding
            | ProtocolKind::Lease
            | ProtocolKind::FailureDetector
            | ProtocolKind::Partition => "partitioning",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = crate::ProtolabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        ProtocolKind::ALL
            .iter()
            .copied()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| crate::ProtolabError::UnknownProtocol(s.to_string()))
    }
}

// =============================================================================
// Replication Modes
// =============================================================================

/// How two gossip peers exchange state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GossipMode {
    /// Sender pushes its entries to the peer.
    Push,
    /// Sender asks the peer for its entries.
    Pull,
    /// Both directions in one exchange.
    #[default]
    PushPull,
}

/// Number of replicas that must participate synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsistencyLevel {
    One,
    #[default]
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Number of replicas, coordinator included, that this level touches
    /// in a cluster of `n` nodes.
    pub fn replica_count(&self, n: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1.min(n),
            ConsistencyLevel::Quorum => n / 2 + 1,
            ConsistencyLevel::All => n,
        }
    }
}

// =============================================================================
// Partitioning Modes
// =============================================================================

/// How keys are mapped into shard segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ShardStrategy {
    /// Keys are split by value into contiguous ranges.
    #[default]
    Range,
    /// Keys are scattered by a multiplicative hash before range lookup.
    Hash,
}

/// Quorum rule applied to elections inside a network partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumScope {
    /// Majority of the reachable members of the candidate's partition.
    #[default]
    PartitionMajority,
    /// Majority of the whole configured cluster.
    ClusterMajority,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_round_trip() {
        for p in ProtocolKind::ALL {
            assert_eq!(p.name().parse::<ProtocolKind>().unwrap(), p);
        }
        assert_eq!("TWO_PHASE_COMMIT".parse::<ProtocolKind>().unwrap(), ProtocolKind::TwoPhaseCommit);
        assert!("zab".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_consistency_replica_count() {
        assert_eq!(ConsistencyLevel::One.replica_count(5), 1);
        assert_eq!(ConsistencyLevel::Quorum.replica_count(5), 3);
        assert_eq!(ConsistencyLevel::Quorum.replica_count(4), 3);
        assert_eq!(ConsistencyLevel::All.replica_count(5), 5);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ConsistencyLevel::Quorum).unwrap();
        assert_eq!(json, "\"QUORUM\"");
        let mode: GossipMode = serde_json::from_str("\"push-pull\"").unwrap();
        assert_eq!(mode, GossipMode::PushPull);
        let scope: QuorumScope = serde_json::from_str("\"cluster-majority\"").unwrap();
        assert_eq!(scope, QuorumScope::ClusterMajority);
    }
}
