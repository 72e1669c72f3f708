//! Protolab Shard Management
//!
//! Key-space sharding with rebalancing. The key space is cut into one
//! contiguous segment per node and shard `i` is owned by node `i`. Adding or
//! removing a node recomputes the layout and ships every changed shard's keys
//! to its new owner in a single migration message.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, ShardConfig};
use protolab_common::types::ShardStrategy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Knuth's multiplicative hashing constant.
const MULTIPLICATIVE_HASH: u128 = 2_654_435_761;

// =============================================================================
// Shard ID
// =============================================================================

/// Unique identifier for a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard_{}", self.0)
    }
}

// =============================================================================
// Shard
// =============================================================================

/// State of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ShardState {
    /// Shard is serving from its owner.
    #[default]
    Active,
    /// Shard's keys are on their way to a new owner.
    Migrating,
}

/// A contiguous segment `[start, end)` of the key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub owner: NodeId,
    pub start: u64,
    pub end: u64,
    pub state: ShardState,
}

impl Shard {
    /// Check if a key position is in this shard's range.
    pub fn contains(&self, position: u64) -> bool {
        position >= self.start && position < self.end
    }

    fn same_placement(&self, other: &Shard) -> bool {
        self.owner == other.owner && self.start == other.start && self.end == other.end
    }
}

/// Split `key_space` into one equal segment per owner.
fn layout(owners: &[NodeId], key_space: u64) -> Vec<Shard> {
    let n = owners.len() as u128;
    let boundary = |i: usize| (i as u128 * key_space as u128 / n) as u64;
    owners
        .iter()
        .enumerate()
        .map(|(i, owner)| Shard {
            id: ShardId(i as u32),
            owner: owner.clone(),
            start: boundary(i),
            end: boundary(i + 1),
            state: ShardState::Active,
        })
        .collect()
}

// =============================================================================
// Nodes and Messages
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ShardNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub keys: BTreeSet<u64>,
}

impl SimNode for ShardNode {
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

/// Every message the shard simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ShardMessage {
    Migration {
        shard: ShardId,
        start: u64,
        end: u64,
        keys: Vec<u64>,
    },
}

impl Payload for ShardMessage {
    fn kind(&self) -> &'static str {
        match self {
            ShardMessage::Migration { .. } => "Migration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub nodes: usize,
    pub shards: usize,
    pub strategy: ShardStrategy,
    pub keys_per_node: BTreeMap<NodeId, usize>,
    pub migrations: usize,
    pub keys_migrated: usize,
    pub misplaced_keys: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Shard Cluster
// =============================================================================

#[derive(Debug, Clone)]
pub struct ShardCluster {
    config: ShardConfig,
    nodes: Topology<ShardNode>,
    shards: Vec<Shard>,
    keys_migrated: usize,
    ctx: SimContext<ShardMessage>,
}

impl ShardCluster {
    pub fn new(config: ShardConfig) -> Self {
        let nodes = Self::build_nodes(&config);
        Self {
            shards: layout(&nodes.ids(), config.key_space),
            nodes,
            config,
            keys_migrated: 0,
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

    fn build_nodes(config: &ShardConfig) -> Topology<ShardNode> {
        Topology::new(node_ids("N", config.node_count).into_iter().map(empty_node).collect())
    }

    pub fn nodes(&self) -> &[ShardNode] {
        self.nodes.as_slice()
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Position of `key` in the key space under the configured strategy.
    pub fn position(&self, key: u64) -> u64 {
        let space = self.config.key_space.max(1);
        match self.config.strategy {
            ShardStrategy::Range => key % space,
            ShardStrategy::Hash => ((key as u128 * MULTIPLICATIVE_HASH) % space as u128) as u64,
        }
    }

    pub fn shard_for(&self, key: u64) -> Option<&Shard> {
        let position = self.position(key);
        self.shards.iter().find(|s| s.contains(position))
    }

    pub fn insert_key(&mut self, key: u64) -> Option<NodeId> {
        let Some(owner) = self.shard_for(key).map(|s| s.owner.clone()) else {
            self.ctx.log("insert_failed", format!("no shard for key {}", key), json!({ "key": key }));
            return None;
        };
        if !self.nodes.is_healthy(&owner) {
            self.ctx.log(
                "insert_failed",
                format!("owner {} of key {} is down", owner, key),
                json!({ "key": key, "owner": owner }),
            );
            return None;
        }
        if let Some(node) = self.nodes.get_mut(&owner) {
            node.keys.insert(key);
        }
        let position = self.position(key);
        self.ctx.log(
            "key_inserted",
            format!("key {} -> {}", key, owner),
            json!({ "key": key, "position": position, "owner": owner }),
        );
        Some(owner)
    }

    pub fn add_node(&mut self, id: &NodeId) -> Vec<MessageId> {
        if self.nodes.contains(id) {
            self.ctx.log("add_node_failed", format!("{} already present", id), json!({ "node": id }));
            return Vec::new();
        }
        self.nodes.insert(empty_node(id.clone()));
        tracing::info!(node = %id, "node joined, rebalancing");
        self.rebalance(None)
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Vec<MessageId> {
        if !self.nodes.contains(id) || self.nodes.len() == 1 {
            self.ctx.log("remove_node_failed", format!("{} cannot be removed", id), json!({ "node": id }));
            return Vec::new();
        }
        tracing::info!(node = %id, "node leaving, rebalancing");
        let messages = self.rebalance(Some(id));
        let remaining: Vec<ShardNode> = self.nodes.iter().filter(|n| &n.id != id).cloned().collect();
        self.nodes = Topology::new(remaining);
        messages
    }

    /// Recompute the layout and send one migration per changed shard. A
    /// shard that keeps its owner is sent by another node holding its keys,
    /// or settles in place when there is none.
    fn rebalance(&mut self, leaving: Option<&NodeId>) -> Vec<MessageId> {
        let owners: Vec<NodeId> = self.nodes.ids().into_iter().filter(|id| Some(id) != leaving).collect();
        let old = std::mem::replace(&mut self.shards, layout(&owners, self.config.key_space));

        let mut sent = Vec::new();
        for index in 0..self.shards.len() {
            let shard = &self.shards[index];
            if old.get(index).map(|o| o.same_placement(shard)).unwrap_or(false) {
                continue;
            }
            let keys: Vec<u64> = self
                .nodes
                .iter()
                .flat_map(|n| n.keys.iter().copied())
                .filter(|k| shard.contains(self.position(*k)))
                .collect::<BTreeSet<u64>>()
                .into_iter()
                .collect();
            let previous = old
                .iter()
                .find(|o| o.contains(shard.start))
                .map(|o| o.owner.clone())
                .unwrap_or_else(|| shard.owner.clone());
            let from = if previous != shard.owner {
                previous
            } else {
                let other_holder = self
                    .nodes
                    .iter()
                    .find(|n| n.id != shard.owner && keys.iter().any(|k| n.keys.contains(k)))
                    .map(|n| n.id.clone());
                match other_holder {
                    Some(holder) => holder,
                    None => continue,
                }
            };
            let (id, to, start, end) = (shard.id, shard.owner.clone(), shard.start, shard.end);
            self.shards[index].state = ShardState::Migrating;
            self.ctx.log(
                "migration_started",
                format!("{} [{}, {}) -> {} with {} keys", id, start, end, to, keys.len()),
                json!({ "shard": id, "from": from, "to": to, "keys": keys.len() }),
            );
            sent.push(self.ctx.send(
                &from,
                &to,
                ShardMessage::Migration {
                    shard: id,
                    start,
                    end,
                    keys,
                },
            ));
        }
        sent
    }

    /// Keys stored somewhere other than their shard's owner.
    pub fn misplaced_keys(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.keys.iter().map(move |k| (&n.id, *k)))
            .filter(|(holder, key)| self.shard_for(*key).map(|s| &s.owner != *holder).unwrap_or(true))
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

fn empty_node(id: NodeId) -> ShardNode {
    ShardNode {
        id,
        status: NodeStatus::Healthy,
        keys: BTreeSet::new(),
    }
}

impl Simulation for ShardCluster {
    type Payload = ShardMessage;
    type Stats = ShardStats;

    fn context(&self) -> &SimContext<ShardMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<ShardMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let ShardMessage::Migration { shard, keys, .. } = message.payload;
        for node in self.nodes.iter_mut() {
            if node.id == message.to {
                node.keys.extend(keys.iter().copied());
            } else {
                for key in &keys {
                    node.keys.remove(key);
                }
            }
        }
        if let Some(s) = self.shards.iter_mut().find(|s| s.id == shard && s.owner == message.to) {
            s.state = ShardState::Active;
        }
        self.keys_migrated += keys.len();
        self.ctx.log(
            "migration_completed",
            format!("{} moved {} keys to {}", shard, keys.len(), message.to),
            json!({ "shard": shard, "to": message.to, "keys": keys }),
        );
    }

    fn stats(&self) -> ShardStats {
        ShardStats {
            nodes: self.nodes.len(),
            shards: self.shards.len(),
            strategy: self.config.strategy,
            keys_per_node: self.nodes.iter().map(|n| (n.id.clone(), n.keys.len())).collect(),
            migrations: self.ctx.events.count_of("migration_started"),
            keys_migrated: self.keys_migrated,
            misplaced_keys: self.misplaced_keys(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.shards = layout(&self.nodes.ids(), self.config.key_space);
        self.keys_migrated = 0;
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

    fn cluster(strategy: ShardStrategy) -> ShardCluster {
        ShardCluster::new(ShardConfig {
            node_count: 3,
            key_space: 1000,
            strategy,
        })
    }

    #[test]
    fn test_initial_layout() {
        let sim = cluster(ShardStrategy::Range);
        let ranges: Vec<(u64, u64)> = sim.shards().iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(ranges, vec![(0, 333), (333, 666), (666, 1000)]);
        assert_eq!(sim.shard_for(500).unwrap().owner, id("N1"));
        assert_eq!(sim.shard_for(1999).unwrap().owner, id("N2"));
    }

    #[test]
    fn test_hash_strategy_scatters() {
        let sim = cluster(ShardStrategy::Hash);
        assert_eq!(sim.position(1), 2_654_435_761 % 1000);
        assert_eq!(sim.position(0), 0);
        let owners: BTreeSet<NodeId> = (0..30).filter_map(|k| sim.shard_for(k).map(|s| s.owner.clone())).collect();
        assert_eq!(owners.len(), 3);
    }

    #[test]
    fn test_add_node_migrates_changed_shards() {
        let mut sim = cluster(ShardStrategy::Range);
        for key in [10, 300, 400, 600, 700, 900] {
            sim.insert_key(key).unwrap();
        }
        let sent = sim.add_node(&id("N3"));
        // Shard 0 only shrinks and already holds its keys; 1 and 2 change
        // owner at their start and shard 3 is new.
        assert_eq!(sent.len(), 3);
        assert_eq!(sim.shards()[0].state, ShardState::Active);
        assert!(sim.shards()[1..].iter().all(|s| s.state == ShardState::Migrating));
        assert!(sim.messages().iter().all(|m| m.from != m.to));
        assert!(sim.misplaced_keys() > 0);

        sim.deliver_all();
        assert_eq!(sim.misplaced_keys(), 0);
        assert!(sim.shards().iter().all(|s| s.state == ShardState::Active));
        let stats = sim.stats();
        assert_eq!(stats.keys_per_node.values().sum::<usize>(), 6);
        assert_eq!(stats.keys_per_node[&id("N3")], 1);
    }

    #[test]
    fn test_migration_carries_exactly_the_shard_keys() {
        let mut sim = cluster(ShardStrategy::Range);
        for key in [100, 260, 500] {
            sim.insert_key(key);
        }
        sim.add_node(&id("N3"));
        let ShardMessage::Migration { start, end, keys, .. } = &sim.messages()[0].payload;
        assert_eq!((*start, *end), (250, 500));
        assert_eq!(keys, &vec![260]);
    }

    #[test]
    fn test_kept_shard_pulls_keys_from_leaving_node() {
        let mut sim = cluster(ShardStrategy::Range);
        for key in [10, 400] {
            sim.insert_key(key);
        }
        sim.remove_node(&id("N1"));
        // N0 keeps shard 0 but its range now covers key 400 held by N1.
        let first = &sim.messages()[0];
        assert_eq!((first.from.clone(), first.to.clone()), (id("N1"), id("N0")));
        assert!(sim.messages().iter().all(|m| m.from != m.to));
        sim.deliver_all();
        assert_eq!(sim.misplaced_keys(), 0);
    }

    #[test]
    fn test_full_key_space_layout() {
        let sim = ShardCluster::new(ShardConfig {
            node_count: 3,
            key_space: u64::MAX,
            strategy: ShardStrategy::Range,
        });
        let shards = sim.shards();
        assert_eq!(shards[0].start, 0);
        assert_eq!(shards[2].end, u64::MAX);
        assert!(shards.windows(2).all(|w| w[0].end == w[1].start));
        assert_eq!(sim.shard_for(u64::MAX - 1).unwrap().owner, id("N2"));
        assert_eq!(sim.shard_for(1).unwrap().owner, id("N0"));
    }

    #[test]
    fn test_remove_node_moves_its_keys() {
        let mut sim = cluster(ShardStrategy::Range);
        for key in [10, 400, 900] {
            sim.insert_key(key);
        }
        sim.remove_node(&id("N1"));
        assert_eq!(sim.nodes().len(), 2);
        assert_eq!(sim.shards().len(), 2);
        sim.deliver_all();
        assert_eq!(sim.misplaced_keys(), 0);
        assert_eq!(sim.stats().keys_per_node.values().sum::<usize>(), 3);
        assert!(sim.remove_node(&id("N1")).is_empty());
    }
}
