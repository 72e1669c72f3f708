//! Protolab Quorum Replication
//!
//! Leaderless key-value replication with tunable read and write quorums.
//! Writes go to the coordinator and the next replicas in ring order; reads
//! sample a read quorum, return the newest version and repair stale replicas.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, QuorumConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Types
// =============================================================================

pub type Version = u64;

/// A stored value and the version that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub value: String,
    pub version: Version,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub store: BTreeMap<String, VersionedEntry>,
    pub write_counter: Version,
}

impl QuorumNode {
    pub fn version_of(&self, key: &str) -> Version {
        self.store.get(key).map(|e| e.version).unwrap_or(0)
    }

    /// Apply an entry iff it is strictly newer than the local copy.
    fn apply(&mut self, key: &str, entry: VersionedEntry) -> bool {
        if entry.version <= self.version_of(key) {
            return false;
        }
        self.store.insert(key.to_string(), entry);
        true
    }
}

impl SimNode for QuorumNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn status(&self) -> NodeStatus {
        self.status
    }

    fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }
}

/// Every message the quorum simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QuorumMessage {
    Replicate { key: String, value: String, version: Version },
    ReplicateAck { key: String, version: Version },
    Repair { key: String, value: String, version: Version },
}

impl Payload for QuorumMessage {
    fn kind(&self) -> &'static str {
        match self {
            QuorumMessage::Replicate { .. } => "Replicate",
            QuorumMessage::ReplicateAck { .. } => "ReplicateAck",
            QuorumMessage::Repair { .. } => "Repair",
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub success: bool,
    pub version: Version,
    pub replicas: Vec<NodeId>,
    pub healthy_replicas: usize,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadOutcome {
    pub success: bool,
    pub value: Option<String>,
    pub version: Version,
    pub sampled: Vec<NodeId>,
    pub repaired: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumStats {
    pub nodes: usize,
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub strongly_consistent: bool,
    pub writes: usize,
    pub successful_writes: usize,
    pub confirmed_writes: usize,
    pub reads: usize,
    pub repairs: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Quorum Simulation
// =============================================================================

#[derive(Debug, Clone)]
pub struct QuorumSimulation {
    config: QuorumConfig,
    nodes: Topology<QuorumNode>,
    /// Confirmed replica acknowledgements per (key, version).
    acks: BTreeMap<(String, Version), BTreeSet<NodeId>>,
    ctx: SimContext<QuorumMessage>,
}

impl QuorumSimulation {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            acks: BTreeMap::new(),
            ctx: SimContext::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.ctx.set_clock(clock);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.ctx.set_delivery(delivery);
        self
    }

    fn build_nodes(config: &QuorumConfig) -> Topology<QuorumNode> {
        Topology::new(
            node_ids("N", config.node_count)
                .into_iter()
                .map(|id| QuorumNode {
                    id,
                    status: NodeStatus::Healthy,
                    store: BTreeMap::new(),
                    write_counter: 0,
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[QuorumNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&QuorumNode> {
        self.nodes.get(id)
    }

    /// The `count` nodes after `start` in ring order, wrapping.
    fn ring_successors(&self, start: &NodeId, count: usize) -> Vec<NodeId> {
        let Some(pos) = self.nodes.position(start) else {
            return Vec::new();
        };
        let all = self.nodes.as_slice();
        (1..all.len())
            .map(|offset| all[(pos + offset) % all.len()].id.clone())
            .take(count)
            .collect()
    }

    /// Coordinator followed by the replicas it writes to.
    pub fn replica_set(&self, coordinator: &NodeId) -> Vec<NodeId> {
        let mut set = vec![coordinator.clone()];
        set.extend(self.ring_successors(coordinator, self.config.replication_factor.saturating_sub(1)));
        set
    }

    pub fn write(&mut self, coordinator: &NodeId, key: &str, value: &str) -> WriteOutcome {
        let healthy = self.nodes.is_healthy(coordinator);
        let Some(node) = self.nodes.get_mut(coordinator).filter(|_| healthy) else {
            self.ctx.log(
                "write_failed",
                format!("{} cannot coordinate a write", coordinator),
                json!({ "coordinator": coordinator, "key": key }),
            );
            return WriteOutcome {
                success: false,
                version: 0,
                replicas: Vec::new(),
                healthy_replicas: 0,
            };
        };

        node.write_counter = node.write_counter.max(node.version_of(key)) + 1;
        let version = node.write_counter;
        node.apply(
            key,
            VersionedEntry {
                value: value.to_string(),
                version,
            },
        );

        let replicas = self.ring_successors(coordinator, self.config.replication_factor.saturating_sub(1));
        let healthy_replicas = replicas.iter().filter(|id| self.nodes.is_healthy(id)).count();
        // Optimistic: healthy targets are counted before they acknowledge.
        let success = healthy_replicas + 1 >= self.config.write_quorum;
        self.acks.insert((key.to_string(), version), BTreeSet::new());

        self.ctx.log(
            "write",
            format!("{} writes {}={} v{}", coordinator, key, value, version),
            json!({
                "coordinator": coordinator,
                "key": key,
                "version": version,
                "replicas": replicas,
                "success": success,
            }),
        );
        self.ctx.broadcast(
            coordinator,
            &replicas,
            QuorumMessage::Replicate {
                key: key.to_string(),
                value: value.to_string(),
                version,
            },
        );
        WriteOutcome {
            success,
            version,
            replicas,
            healthy_replicas,
        }
    }

    pub fn read(&mut self, coordinator: &NodeId, key: &str) -> ReadOutcome {
        let failed = ReadOutcome {
            success: false,
            value: None,
            version: 0,
            sampled: Vec::new(),
            repaired: Vec::new(),
        };
        if !self.nodes.is_healthy(coordinator) {
            self.ctx.log(
                "read_failed",
                format!("{} cannot coordinate a read", coordinator),
                json!({ "coordinator": coordinator, "key": key }),
            );
            return failed;
        }

        let mut candidates = self.replica_set(coordinator);
        for id in self.nodes.ids() {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        let sampled: Vec<NodeId> = candidates
            .into_iter()
            .filter(|id| self.nodes.is_healthy(id))
            .take(self.config.read_quorum)
            .collect();
        if sampled.len() < self.config.read_quorum {
            self.ctx.log(
                "read_failed",
                format!("only {} of {} read replicas reachable", sampled.len(), self.config.read_quorum),
                json!({ "coordinator": coordinator, "key": key, "sampled": sampled }),
            );
            return ReadOutcome { sampled, ..failed };
        }

        let newest = sampled
            .iter()
            .filter_map(|id| self.nodes.get(id).and_then(|n| n.store.get(key)))
            .max_by_key(|e| e.version)
            .cloned();
        let version = newest.as_ref().map(|e| e.version).unwrap_or(0);
        let repaired: Vec<NodeId> = sampled
            .iter()
            .filter(|id| self.nodes.get(id).map(|n| n.version_of(key) < version).unwrap_or(false))
            .cloned()
            .collect();

        if let Some(entry) = &newest {
            self.ctx.broadcast(
                coordinator,
                &repaired,
                QuorumMessage::Repair {
                    key: key.to_string(),
                    value: entry.value.clone(),
                    version,
                },
            );
        }
        self.ctx.log(
            "read",
            format!("{} reads {} at v{}", coordinator, key, version),
            json!({
                "coordinator": coordinator,
                "key": key,
                "version": version,
                "sampled": sampled,
                "repaired": repaired,
            }),
        );
        ReadOutcome {
            success: true,
            value: newest.map(|e| e.value),
            version,
            sampled,
            repaired,
        }
    }

    /// Writes whose confirmed acknowledgements, counting the coordinator,
    /// reached the write quorum.
    pub fn confirmed_writes(&self) -> usize {
        self.acks
            .values()
            .filter(|acks| acks.len() + 1 >= self.config.write_quorum)
            .count()
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }

    pub fn recover_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Healthy) {
            return false;
        }
        self.ctx.log("node_recovered", format!("{} recovers", id), json!({ "node": id }));
        true
    }
}

impl Simulation for QuorumSimulation {
    type Payload = QuorumMessage;
    type Stats = QuorumStats;

    fn context(&self) -> &SimContext<QuorumMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<QuorumMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let (to, from) = (&message.to, &message.from);
        match message.payload {
            QuorumMessage::Replicate { key, value, version } => {
                if let Some(node) = self.nodes.get_mut(to) {
                    node.apply(&key, VersionedEntry { value, version });
                }
                self.ctx.send(to, from, QuorumMessage::ReplicateAck { key, version });
            }
            QuorumMessage::ReplicateAck { key, version } => {
                if let Some(acks) = self.acks.get_mut(&(key, version)) {
                    acks.insert(from.clone());
                }
            }
            QuorumMessage::Repair { key, value, version } => {
                let applied = self
                    .nodes
                    .get_mut(to)
                    .map(|n| n.apply(&key, VersionedEntry { value, version }))
                    .unwrap_or(false);
                if applied {
                    self.ctx.log(
                        "read_repair",
                        format!("{} repaired {} to v{}", to, key, version),
                        json!({ "node": to, "key": key, "version": version }),
                    );
                }
            }
        }
    }

    fn stats(&self) -> QuorumStats {
        let events = &self.ctx.events;
        let successful_writes = events
            .of_kind("write")
            .filter(|e| e.data["success"] == json!(true))
            .count();
        QuorumStats {
            nodes: self.nodes.len(),
            replication_factor: self.config.replication_factor,
            write_quorum: self.config.write_quorum,
            read_quorum: self.config.read_quorum,
            strongly_consistent: self.config.is_strongly_consistent(),
            writes: events.count_of("write"),
            successful_writes,
            confirmed_writes: self.confirmed_writes(),
            reads: events.count_of("read"),
            repairs: events.count_of("read_repair"),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.acks.clear();
        self.ctx.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn quorum() -> QuorumSimulation {
        QuorumSimulation::new(QuorumConfig::default())
    }

    #[test]
    fn test_write_replicates_in_ring_order() {
        let mut sim = quorum();
        let outcome = sim.write(&id("N3"), "k", "v1");
        assert!(outcome.success);
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.replicas, vec![id("N4"), id("N0")]);

        assert_eq!(sim.confirmed_writes(), 0);
        sim.deliver_all();
        assert_eq!(sim.confirmed_writes(), 1);
        for n in ["N3", "N4", "N0"] {
            assert_eq!(sim.node(&id(n)).unwrap().version_of("k"), 1);
        }
        assert_eq!(sim.node(&id("N1")).unwrap().version_of("k"), 0);
    }

    #[test]
    fn test_write_success_is_optimistic() {
        let mut sim = quorum();
        sim.fail_node(&id("N1"));
        sim.fail_node(&id("N2"));
        let outcome = sim.write(&id("N0"), "k", "v");
        assert!(!outcome.success);
        assert_eq!(outcome.healthy_replicas, 0);

        sim.recover_node(&id("N2"));
        let outcome = sim.write(&id("N0"), "k", "v2");
        assert!(outcome.success);
        assert_eq!(outcome.version, 2);
    }

    #[test]
    fn test_read_returns_newest_and_repairs() {
        let mut sim = quorum();
        sim.write(&id("N0"), "k", "old");
        sim.deliver_all();
        // N2 misses the second write.
        sim.fail_node(&id("N2"));
        sim.write(&id("N0"), "k", "new");
        sim.deliver_all();
        sim.recover_node(&id("N2"));

        // Coordinator N1: replica set N1, N2, N3 -> samples N1 and N2.
        let outcome = sim.read(&id("N1"), "k");
        assert!(outcome.success);
        assert_eq!(outcome.value.as_deref(), Some("new"));
        assert_eq!(outcome.version, 2);
        assert_eq!(outcome.sampled, vec![id("N1"), id("N2")]);
        assert_eq!(outcome.repaired, vec![id("N2")]);

        sim.deliver_all();
        assert_eq!(sim.node(&id("N2")).unwrap().version_of("k"), 2);
        assert_eq!(sim.stats().repairs, 1);
    }

    #[test]
    fn test_read_needs_quorum() {
        let config = QuorumConfig::default().with_quorums(2, 4);
        let mut sim = QuorumSimulation::new(config);
        sim.fail_node(&id("N1"));
        sim.fail_node(&id("N2"));
        let outcome = sim.read(&id("N0"), "k");
        assert!(!outcome.success);
        assert_eq!(outcome.sampled.len(), 3);
    }

    #[test]
    fn test_stale_replicate_ignored() {
        let mut sim = quorum();
        sim.write(&id("N0"), "k", "a");
        sim.write(&id("N0"), "k", "b");
        // Deliver the second Replicate to N1 before the first.
        let in_flight = sim.in_flight();
        sim.deliver(in_flight[2]);
        sim.deliver(in_flight[0]);
        let node = sim.node(&id("N1")).unwrap();
        assert_eq!(node.store["k"].value, "b");
    }

    #[test]
    fn test_stats() {
        let mut sim = quorum();
        sim.write(&id("N0"), "k", "v");
        sim.read(&id("N0"), "k");
        let stats = sim.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.successful_writes, 1);
        assert_eq!(stats.reads, 1);
        assert!(stats.strongly_consistent);
    }
}
