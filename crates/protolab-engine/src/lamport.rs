//! Protolab Lamport Clocks
//!
//! Scalar logical clocks and total-order broadcast built on them. Every
//! broadcast is held back at each node until every node has acknowledged it,
//! then delivered in `(timestamp, sender)` order, which gives all nodes the
//! same delivery sequence. Channels between two nodes are FIFO.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{CausalityConfig, DeliveryConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Lamport Clock
// =============================================================================

/// A Lamport logical clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local or send event.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Advance past a received timestamp.
    pub fn receive(&mut self, timestamp: u64) -> u64 {
        self.time = self.time.max(timestamp) + 1;
        self.time
    }

    pub fn time(&self) -> u64 {
        self.time
    }
}

// =============================================================================
// Total-Order Broadcast
// =============================================================================

/// Position of a broadcast in the total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastKey {
    pub timestamp: u64,
    pub sender: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldbackEntry {
    pub payload: String,
    pub acks: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredBroadcast {
    pub key: BroadcastKey,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub clock: LamportClock,
    pub holdback: BTreeMap<BroadcastKey, HoldbackEntry>,
    /// Acks that arrived before the broadcast they acknowledge.
    pub pending_acks: BTreeMap<BroadcastKey, BTreeSet<NodeId>>,
    pub delivered: Vec<DeliveredBroadcast>,
}

impl SimNode for BroadcastNode {
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

/// Every message the total-order broadcast simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BroadcastMessage {
    Broadcast { key: BroadcastKey, payload: String },
    Ack { key: BroadcastKey, timestamp: u64 },
}

impl Payload for BroadcastMessage {
    fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::Broadcast { .. } => "Broadcast",
            BroadcastMessage::Ack { .. } => "Ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastStats {
    pub nodes: usize,
    pub broadcasts: usize,
    pub clocks: BTreeMap<NodeId, u64>,
    pub delivered: BTreeMap<NodeId, Vec<String>>,
    pub held_back: usize,
    pub consistent_order: bool,
    pub messages: MessageCounts,
}

#[derive(Debug, Clone)]
pub struct TotalOrderBroadcast {
    config: CausalityConfig,
    nodes: Topology<BroadcastNode>,
    ctx: SimContext<BroadcastMessage>,
}

impl TotalOrderBroadcast {
    pub fn new(config: CausalityConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
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

    fn build_nodes(config: &CausalityConfig) -> Topology<BroadcastNode> {
        Topology::new(
            node_ids("P", config.process_count)
                .into_iter()
                .map(|id| BroadcastNode {
                    id,
                    status: NodeStatus::Healthy,
                    clock: LamportClock::new(),
                    holdback: BTreeMap::new(),
                    pending_acks: BTreeMap::new(),
                    delivered: Vec::new(),
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[BroadcastNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&BroadcastNode> {
        self.nodes.get(id)
    }

    /// Payloads delivered at `id`, in delivery order.
    pub fn delivery_order(&self, id: &NodeId) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.delivered.iter().map(|d| d.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn local_event(&mut self, id: &NodeId) -> Option<u64> {
        let healthy = self.nodes.is_healthy(id);
        let node = self.nodes.get_mut(id).filter(|_| healthy)?;
        let time = node.clock.tick();
        self.ctx.log(
            "local_event",
            format!("{} ticks to {}", id, time),
            json!({ "node": id, "time": time }),
        );
        Some(time)
    }

    pub fn broadcast(&mut self, sender: &NodeId, payload: &str) -> Option<BroadcastKey> {
        let healthy = self.nodes.is_healthy(sender);
        let Some(node) = self.nodes.get_mut(sender).filter(|_| healthy) else {
            self.ctx.log(
                "broadcast_failed",
                format!("{} cannot broadcast", sender),
                json!({ "sender": sender, "payload": payload }),
            );
            return None;
        };
        let key = BroadcastKey {
            timestamp: node.clock.tick(),
            sender: sender.clone(),
        };
        node.holdback.insert(
            key.clone(),
            HoldbackEntry {
                payload: payload.to_string(),
                acks: BTreeSet::from([sender.clone()]),
            },
        );

        self.ctx.log(
            "broadcast",
            format!("{} broadcasts '{}' at {}", sender, payload, key.timestamp),
            json!({ "key": key, "payload": payload }),
        );
        let peers = self.nodes.peers_of(sender);
        self.ctx.broadcast(
            sender,
            &peers,
            BroadcastMessage::Broadcast {
                key: key.clone(),
                payload: payload.to_string(),
            },
        );
        self.try_deliver(sender);
        Some(key)
    }

    fn handle_broadcast(&mut self, id: &NodeId, key: BroadcastKey, payload: String) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.clock.receive(key.timestamp);
        let timestamp = node.clock.tick();
        let mut acks = node.pending_acks.remove(&key).unwrap_or_default();
        acks.insert(key.sender.clone());
        acks.insert(id.clone());
        node.holdback.insert(key.clone(), HoldbackEntry { payload, acks });

        let peers = self.nodes.peers_of(id);
        self.ctx.broadcast(id, &peers, BroadcastMessage::Ack { key, timestamp });
        self.try_deliver(id);
    }

    fn handle_ack(&mut self, id: &NodeId, from: &NodeId, key: BroadcastKey, timestamp: u64) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.clock.receive(timestamp);
        match node.holdback.get_mut(&key) {
            Some(entry) => {
                entry.acks.insert(from.clone());
            }
            None => {
                node.pending_acks.entry(key).or_default().insert(from.clone());
            }
        }
        self.try_deliver(id);
    }

    /// Deliver from the head of the holdback queue while the head is
    /// acknowledged by every healthy node.
    fn try_deliver(&mut self, id: &NodeId) {
        let everyone = self.nodes.healthy_ids();
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let mut delivered = Vec::new();
        while let Some(entry) = node.holdback.first_entry() {
            if !everyone.iter().all(|n| entry.get().acks.contains(n)) {
                break;
            }
            let (key, entry) = entry.remove_entry();
            delivered.push(DeliveredBroadcast {
                key,
                payload: entry.payload,
            });
        }
        node.delivered.extend(delivered.iter().cloned());
        for d in delivered {
            self.ctx.log(
                "delivered",
                format!("{} delivers '{}'", id, d.payload),
                json!({ "node": id, "key": d.key, "payload": d.payload }),
            );
        }
    }

    /// True when every node's delivery sequence is a prefix of the longest.
    pub fn is_order_consistent(&self) -> bool {
        let orders: Vec<Vec<String>> = self.nodes.iter().map(|n| self.delivery_order(&n.id)).collect();
        let Some(longest) = orders.iter().max_by_key(|o| o.len()) else {
            return true;
        };
        orders.iter().all(|o| longest.starts_with(o))
    }

    fn deliver_one(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        match message.payload {
            BroadcastMessage::Broadcast { key, payload } => self.handle_broadcast(&message.to, key, payload),
            BroadcastMessage::Ack { key, timestamp } => {
                self.handle_ack(&message.to, &message.from, key, timestamp)
            }
        }
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        for other in self.nodes.healthy_ids() {
            self.try_deliver(&other);
        }
        true
    }
}

impl Simulation for TotalOrderBroadcast {
    type Payload = BroadcastMessage;
    type Stats = BroadcastStats;

    fn context(&self) -> &SimContext<BroadcastMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<BroadcastMessage> {
        &mut self.ctx
    }

    /// Channels are FIFO: older in-flight messages on the same channel are
    /// delivered first.
    fn deliver(&mut self, id: MessageId) {
        let Some(target) = self.ctx.network.get(id) else {
            return;
        };
        let (from, to) = (target.from.clone(), target.to.clone());
        let earlier: Vec<MessageId> = self
            .ctx
            .network
            .messages()
            .iter()
            .filter(|m| m.is_in_flight() && m.id < id && m.from == from && m.to == to)
            .map(|m| m.id)
            .collect();
        for older in earlier {
            self.deliver_one(older);
        }
        self.deliver_one(id);
    }

    fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            nodes: self.nodes.len(),
            broadcasts: self.ctx.events.count_of("broadcast"),
            clocks: self.nodes.iter().map(|n| (n.id.clone(), n.clock.time())).collect(),
            delivered: self.nodes.iter().map(|n| (n.id.clone(), self.delivery_order(&n.id))).collect(),
            held_back: self.nodes.iter().map(|n| n.holdback.len()).sum(),
            consistent_order: self.is_order_consistent(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
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

    fn tob() -> TotalOrderBroadcast {
        TotalOrderBroadcast::new(CausalityConfig::default())
    }

    #[test]
    fn test_lamport_clock() {
        let mut clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.receive(10), 11);
        assert_eq!(clock.receive(3), 12);
    }

    #[test]
    fn test_single_broadcast_delivered_everywhere() {
        let mut sim = tob();
        sim.broadcast(&id("P0"), "a").unwrap();
        assert!(sim.delivery_order(&id("P0")).is_empty());
        sim.deliver_all();
        for n in ["P0", "P1", "P2"] {
            assert_eq!(sim.delivery_order(&id(n)), vec!["a".to_string()]);
        }
        assert_eq!(sim.stats().held_back, 0);
    }

    #[test]
    fn test_concurrent_broadcasts_same_order() {
        let mut sim = tob();
        sim.local_event(&id("P2"));
        sim.local_event(&id("P2"));
        sim.broadcast(&id("P2"), "late");
        sim.broadcast(&id("P0"), "x");
        sim.broadcast(&id("P1"), "y");
        sim.deliver_all();

        let order = sim.delivery_order(&id("P0"));
        assert_eq!(order, vec!["x".to_string(), "y".to_string(), "late".to_string()]);
        assert_eq!(sim.delivery_order(&id("P1")), order);
        assert_eq!(sim.delivery_order(&id("P2")), order);
        assert!(sim.is_order_consistent());
    }

    #[test]
    fn test_ack_before_broadcast_is_kept() {
        let mut sim = tob();
        sim.broadcast(&id("P0"), "m");
        // Deliver to P1 first so its ack to P2 races the broadcast to P2.
        let to_p1 = sim.in_flight()[0];
        sim.deliver(to_p1);
        let ack_to_p2 = sim
            .messages()
            .iter()
            .find(|m| m.kind() == "Ack" && m.to == id("P2"))
            .map(|m| m.id)
            .unwrap();
        sim.deliver(ack_to_p2);
        assert_eq!(sim.node(&id("P2")).unwrap().pending_acks.len(), 1);

        sim.deliver_all();
        assert!(sim.node(&id("P2")).unwrap().pending_acks.is_empty());
        assert_eq!(sim.delivery_order(&id("P2")), vec!["m".to_string()]);
    }

    fn find(sim: &TotalOrderBroadcast, kind: &str, from: &str, to: &str) -> MessageId {
        sim.messages()
            .iter()
            .find(|m| m.is_in_flight() && m.kind() == kind && m.from == id(from) && m.to == id(to))
            .map(|m| m.id)
            .unwrap()
    }

    #[test]
    fn test_ack_cannot_overtake_broadcast_on_same_channel() {
        let mut sim = tob();
        sim.broadcast(&id("P1"), "b");
        sim.broadcast(&id("P0"), "a");

        let first = find(&sim, "Broadcast", "P1", "P2");
        sim.deliver(first);
        let second = find(&sim, "Broadcast", "P1", "P0");
        sim.deliver(second);
        let ack = find(&sim, "Ack", "P0", "P2");
        sim.deliver(ack);
        assert!(sim.node(&id("P2")).unwrap().holdback.keys().any(|k| k.sender == id("P0")));
        sim.deliver_all();

        let expected = vec!["a".to_string(), "b".to_string()];
        for n in ["P0", "P1", "P2"] {
            assert_eq!(sim.delivery_order(&id(n)), expected, "{}", n);
        }
        assert!(sim.is_order_consistent());
    }

    #[test]
    fn test_failed_node_unblocks_delivery() {
        let mut sim = tob();
        sim.fail_node(&id("P2"));
        sim.broadcast(&id("P0"), "m");
        sim.deliver_all();
        assert_eq!(sim.delivery_order(&id("P1")), vec!["m".to_string()]);
        assert!(sim.broadcast(&id("P2"), "nope").is_none());
    }
}
