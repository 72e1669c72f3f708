//! Protolab Merkle Anti-Entropy
//!
//! Replicas summarize their key space as a balanced binary hash tree over a
//! fixed number of key buckets. Synchronizing two replicas walks both trees
//! from the root and only descends into subtrees whose hashes differ, then
//! ships the entries of each differing bucket in both directions.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::quorum::VersionedEntry;
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, MerkleConfig};
use protolab_common::utils::bucket_of;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// =============================================================================
// Merkle Tree
// =============================================================================

/// Hash tree over the buckets of one replica. `levels[0]` holds the leaves,
/// the last level holds the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    pub levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build the tree for `store` split into `buckets` leaves (a power of two).
    pub fn build(store: &BTreeMap<String, VersionedEntry>, buckets: usize) -> Self {
        let mut grouped: Vec<Vec<(&String, &VersionedEntry)>> = vec![Vec::new(); buckets];
        for (key, entry) in store {
            grouped[bucket_of(key, buckets)].push((key, entry));
        }

        let leaves: Vec<String> = grouped
            .iter()
            .map(|entries| {
                let mut hasher = Sha256::new();
                for (key, entry) in entries {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(entry.value.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(entry.version.to_be_bytes());
                }
                hex::encode(hasher.finalize())
            })
            .collect();

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let next: Vec<String> = levels
                .last()
                .map(|level| {
                    level
                        .chunks(2)
                        .map(|pair| {
                            let mut hasher = Sha256::new();
                            for child in pair {
                                hasher.update(child.as_bytes());
                            }
                            hex::encode(hasher.finalize())
                        })
                        .collect()
                })
                .unwrap_or_default();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn root(&self) -> &str {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    fn hash_at(&self, level: usize, index: usize) -> Option<&String> {
        self.levels.get(level).and_then(|l| l.get(index))
    }
}

/// Outcome of one synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub in_sync: bool,
    pub nodes_compared: usize,
    pub differing_leaves: Vec<usize>,
    pub entries_sent: usize,
}

// =============================================================================
// Replicas
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MerkleReplica {
    pub id: NodeId,
    pub status: NodeStatus,
    pub store: BTreeMap<String, VersionedEntry>,
}

impl MerkleReplica {
    fn bucket_entries(&self, bucket: usize, buckets: usize) -> BTreeMap<String, VersionedEntry> {
        self.store
            .iter()
            .filter(|(key, _)| bucket_of(key, buckets) == bucket)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

impl SimNode for MerkleReplica {
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

/// Every message the Merkle simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MerkleMessage {
    SyncEntries {
        bucket: usize,
        entries: BTreeMap<String, VersionedEntry>,
    },
}

impl Payload for MerkleMessage {
    fn kind(&self) -> &'static str {
        match self {
            MerkleMessage::SyncEntries { .. } => "SyncEntries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleStats {
    pub replicas: usize,
    pub leaf_buckets: usize,
    pub roots: BTreeMap<NodeId, String>,
    pub synchronizations: usize,
    pub entries_repaired: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Merkle Simulation
// =============================================================================

#[derive(Debug, Clone)]
pub struct MerkleSimulation {
    config: MerkleConfig,
    buckets: usize,
    nodes: Topology<MerkleReplica>,
    entries_repaired: usize,
    ctx: SimContext<MerkleMessage>,
}

impl MerkleSimulation {
    pub fn new(config: MerkleConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            buckets: config.leaf_buckets.max(1).next_power_of_two(),
            config,
            entries_repaired: 0,
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

    fn build_nodes(config: &MerkleConfig) -> Topology<MerkleReplica> {
        Topology::new(
            node_ids("R", config.replicas)
                .into_iter()
                .map(|id| MerkleReplica {
                    id,
                    status: NodeStatus::Healthy,
                    store: BTreeMap::new(),
                })
                .collect(),
        )
    }

    pub fn replicas(&self) -> &[MerkleReplica] {
        self.nodes.as_slice()
    }

    pub fn leaf_buckets(&self) -> usize {
        self.buckets
    }

    /// Local write with a version one above the replica's current copy.
    pub fn put(&mut self, replica: &NodeId, key: &str, value: &str) -> bool {
        let healthy = self.nodes.is_healthy(replica);
        let Some(node) = self.nodes.get_mut(replica).filter(|_| healthy) else {
            self.ctx.log(
                "put_failed",
                format!("{} cannot accept a write", replica),
                json!({ "replica": replica, "key": key }),
            );
            return false;
        };
        let version = node.store.get(key).map(|e| e.version).unwrap_or(0) + 1;
        node.store.insert(
            key.to_string(),
            VersionedEntry {
                value: value.to_string(),
                version,
            },
        );
        self.ctx.log(
            "local_write",
            format!("{} sets {}={} v{}", replica, key, value, version),
            json!({ "replica": replica, "key": key, "version": version }),
        );
        true
    }

    pub fn tree(&self, replica: &NodeId) -> Option<MerkleTree> {
        self.nodes
            .get(replica)
            .map(|node| MerkleTree::build(&node.store, self.buckets))
    }

    pub fn root_hash(&self, replica: &NodeId) -> Option<String> {
        self.tree(replica).map(|t| t.root().to_string())
    }

    /// Compare two replicas and queue `SyncEntries` for every differing leaf.
    pub fn synchronize(&mut self, a: &NodeId, b: &NodeId) -> SyncReport {
        let (Some(tree_a), Some(tree_b)) = (self.tree(a), self.tree(b)) else {
            return SyncReport::default();
        };
        if !self.nodes.is_healthy(a) || !self.nodes.is_healthy(b) {
            self.ctx.log(
                "sync_failed",
                format!("{} and {} cannot synchronize", a, b),
                json!({ "a": a, "b": b }),
            );
            return SyncReport::default();
        }

        let mut report = SyncReport::default();
        let top = tree_a.levels.len() - 1;
        compare_subtree(&tree_a, &tree_b, top, 0, &mut report);
        report.in_sync = report.differing_leaves.is_empty();

        for &bucket in &report.differing_leaves {
            for (from, to) in [(a, b), (b, a)] {
                let entries = self
                    .nodes
                    .get(from)
                    .map(|n| n.bucket_entries(bucket, self.buckets))
                    .unwrap_or_default();
                if entries.is_empty() {
                    continue;
                }
                report.entries_sent += entries.len();
                self.ctx.send(from, to, MerkleMessage::SyncEntries { bucket, entries });
            }
        }

        self.ctx.log(
            "merkle_sync",
            format!(
                "{} <-> {}: {} nodes compared, {} leaves differ",
                a,
                b,
                report.nodes_compared,
                report.differing_leaves.len()
            ),
            json!({ "a": a, "b": b, "report": report }),
        );
        report
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

fn compare_subtree(a: &MerkleTree, b: &MerkleTree, level: usize, index: usize, report: &mut SyncReport) {
    report.nodes_compared += 1;
    if a.hash_at(level, index) == b.hash_at(level, index) {
        return;
    }
    if level == 0 {
        report.differing_leaves.push(index);
        return;
    }
    for child in [index * 2, index * 2 + 1] {
        if a.hash_at(level - 1, child).is_some() {
            compare_subtree(a, b, level - 1, child, report);
        }
    }
}

impl Simulation for MerkleSimulation {
    type Payload = MerkleMessage;
    type Stats = MerkleStats;

    fn context(&self) -> &SimContext<MerkleMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<MerkleMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let MerkleMessage::SyncEntries { bucket, entries } = message.payload;
        let Some(node) = self.nodes.get_mut(&message.to) else {
            return;
        };
        let mut updated = 0;
        for (key, entry) in entries {
            let newer = node.store.get(&key).map(|e| entry.version > e.version).unwrap_or(true);
            if newer {
                node.store.insert(key, entry);
                updated += 1;
            }
        }
        if updated > 0 {
            self.entries_repaired += updated;
            self.ctx.log(
                "entries_synced",
                format!("{} took {} entries of bucket {}", message.to, updated, bucket),
                json!({ "replica": message.to, "bucket": bucket, "updated": updated }),
            );
        }
    }

    fn stats(&self) -> MerkleStats {
        MerkleStats {
            replicas: self.nodes.len(),
            leaf_buckets: self.buckets,
            roots: self
                .nodes
                .iter()
                .map(|n| (n.id.clone(), MerkleTree::build(&n.store, self.buckets).root().to_string()))
                .collect(),
            synchronizations: self.ctx.events.count_of("merkle_sync"),
            entries_repaired: self.entries_repaired,
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.entries_repaired = 0;
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

    fn merkle() -> MerkleSimulation {
        MerkleSimulation::new(MerkleConfig::default())
    }

    #[test]
    fn test_tree_shape() {
        let tree = MerkleTree::build(&BTreeMap::new(), 8);
        assert_eq!(tree.leaf_count(), 8);
        assert_eq!(tree.levels.len(), 4);
        assert_eq!(tree.root().len(), 64);
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        let sim = MerkleSimulation::new(MerkleConfig {
            replicas: 2,
            leaf_buckets: 6,
        });
        assert_eq!(sim.leaf_buckets(), 8);
    }

    #[test]
    fn test_identical_replicas_compare_root_only() {
        let mut sim = merkle();
        for r in ["R0", "R1"] {
            sim.put(&id(r), "a", "1");
            sim.put(&id(r), "b", "2");
        }
        assert_eq!(sim.root_hash(&id("R0")), sim.root_hash(&id("R1")));
        let report = sim.synchronize(&id("R0"), &id("R1"));
        assert!(report.in_sync);
        assert_eq!(report.nodes_compared, 1);
        assert!(sim.in_flight().is_empty());
    }

    #[test]
    fn test_single_difference_descends_one_path() {
        let mut sim = merkle();
        sim.put(&id("R0"), "a", "1");
        let report = sim.synchronize(&id("R0"), &id("R1"));
        assert!(!report.in_sync);
        assert_eq!(report.differing_leaves, vec![bucket_of("a", 8)]);
        // Root, then both children at each of the three lower levels.
        assert_eq!(report.nodes_compared, 7);
        assert_eq!(report.entries_sent, 1);

        sim.deliver_all();
        assert_eq!(sim.root_hash(&id("R0")), sim.root_hash(&id("R1")));
    }

    #[test]
    fn test_newer_version_wins_both_ways() {
        let mut sim = merkle();
        sim.put(&id("R0"), "k", "a");
        sim.put(&id("R1"), "k", "b");
        sim.put(&id("R1"), "k", "c");
        sim.put(&id("R0"), "other", "x");
        sim.synchronize(&id("R0"), &id("R1"));
        sim.deliver_all();

        for r in ["R0", "R1"] {
            let replica = sim.replicas().iter().find(|n| n.id == id(r)).unwrap();
            assert_eq!(replica.store["k"].value, "c");
            assert!(replica.store.contains_key("other"));
        }
        assert!(sim.synchronize(&id("R0"), &id("R1")).in_sync);
    }

    #[test]
    fn test_failed_replica_cannot_sync() {
        let mut sim = merkle();
        sim.put(&id("R0"), "a", "1");
        sim.fail_node(&id("R1"));
        assert_eq!(sim.synchronize(&id("R0"), &id("R1")), SyncReport::default());
        assert!(sim.events().iter().any(|e| e.kind == "sync_failed"));
    }

    #[test]
    fn test_failed_replica_rejects_writes() {
        let mut sim = merkle();
        let before = sim.root_hash(&id("R1"));
        sim.fail_node(&id("R1"));
        assert!(!sim.put(&id("R1"), "a", "1"));
        assert_eq!(sim.root_hash(&id("R1")), before);
        assert_eq!(sim.events().last().unwrap().kind, "put_failed");
        assert!(!sim.put(&id("R9"), "a", "1"));
    }
}
