//! Protolab Eventual Consistency
//!
//! A replicated key-value store with per-request consistency levels. Each
//! stored value carries a vector clock; reads pick the causally greatest
//! version among the sampled replicas and surface concurrent siblings.
//! Writes at level ONE reach the other replicas only through deferred
//! background replication.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use crate::vector_clock::{VectorClock, VectorClockOrdering, VersionedValue};
use protolab_common::config::{DeliveryConfig, EventualConfig};
use protolab_common::types::ConsistencyLevel;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Nodes and Messages
// =============================================================================

pub type StoredValue = VersionedValue<String>;

#[derive(Debug, Clone, Serialize)]
pub struct EventualNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub store: BTreeMap<String, StoredValue>,
}

impl EventualNode {
    /// Keep the incoming version unless it is causally older than ours.
    fn apply(&mut self, key: &str, incoming: StoredValue) -> bool {
        let stale = self
            .store
            .get(key)
            .map(|current| matches!(incoming.clock.compare(&current.clock), VectorClockOrdering::Before | VectorClockOrdering::Equal))
            .unwrap_or(false);
        if stale {
            return false;
        }
        self.store.insert(key.to_string(), incoming);
        true
    }
}

impl SimNode for EventualNode {
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

/// Every message the eventual store sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventualMessage {
    Replicate { key: String, version: StoredValue },
}

impl Payload for EventualMessage {
    fn kind(&self) -> &'static str {
        match self {
            EventualMessage::Replicate { .. } => "Replicate",
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventualWrite {
    pub success: bool,
    pub clock: VectorClock,
    /// Replicas written synchronously, coordinator excluded.
    pub synchronous: Vec<NodeId>,
    /// Replicas that receive the value through background replication.
    pub background: Vec<NodeId>,
}

impl EventualWrite {
    fn rejected() -> Self {
        Self {
            success: false,
            clock: VectorClock::new(),
            synchronous: Vec::new(),
            background: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventualRead {
    pub success: bool,
    pub value: Option<String>,
    pub clock: Option<VectorClock>,
    pub sampled: Vec<NodeId>,
    /// Versions concurrent with the returned one.
    pub siblings: Vec<StoredValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventualStats {
    pub nodes: usize,
    pub writes: usize,
    pub reads: usize,
    pub conflicting_reads: usize,
    pub pending_background: usize,
    pub divergent_keys: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Eventual Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct EventualStore {
    config: EventualConfig,
    nodes: Topology<EventualNode>,
    ctx: SimContext<EventualMessage>,
}

impl EventualStore {
    pub fn new(config: EventualConfig) -> Self {
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

    fn build_nodes(config: &EventualConfig) -> Topology<EventualNode> {
        Topology::new(
            node_ids("N", config.node_count)
                .into_iter()
                .map(|id| EventualNode {
                    id,
                    status: NodeStatus::Healthy,
                    store: BTreeMap::new(),
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[EventualNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&EventualNode> {
        self.nodes.get(id)
    }

    /// Healthy nodes in ring order starting at `start`.
    fn healthy_ring_from(&self, start: &NodeId) -> Vec<NodeId> {
        let Some(pos) = self.nodes.position(start) else {
            return Vec::new();
        };
        let all = self.nodes.as_slice();
        (0..all.len())
            .map(|offset| &all[(pos + offset) % all.len()])
            .filter(|n| n.status.is_available())
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn write(&mut self, coordinator: &NodeId, key: &str, value: &str, level: ConsistencyLevel) -> EventualWrite {
        let now = self.ctx.now();
        let required = level.replica_count(self.nodes.len());
        let available = if self.nodes.is_healthy(coordinator) {
            self.healthy_ring_from(coordinator)
        } else {
            Vec::new()
        };
        if available.is_empty() || available.len() < required {
            self.ctx.log(
                "write_failed",
                format!("{} reached {} of {} replicas", coordinator, available.len(), required),
                json!({ "coordinator": coordinator, "key": key, "level": level }),
            );
            return EventualWrite::rejected();
        }

        let Some(node) = self.nodes.get_mut(coordinator) else {
            return EventualWrite::rejected();
        };
        let mut clock = node.store.get(key).map(|v| v.clock.clone()).unwrap_or_default();
        clock.increment(coordinator);
        let version = StoredValue::new(value.to_string(), clock.clone(), now);
        node.store.insert(key.to_string(), version.clone());

        let synchronous: Vec<NodeId> = available
            .into_iter()
            .skip(1)
            .take(required.saturating_sub(1))
            .collect();
        for id in &synchronous {
            if let Some(replica) = self.nodes.get_mut(id) {
                replica.apply(key, version.clone());
            }
        }

        let background: Vec<NodeId> = match level {
            ConsistencyLevel::One => self.nodes.peers_of(coordinator),
            ConsistencyLevel::Quorum | ConsistencyLevel::All => Vec::new(),
        };
        for id in &background {
            self.ctx.send_later(
                coordinator,
                id,
                EventualMessage::Replicate {
                    key: key.to_string(),
                    version: version.clone(),
                },
                self.config.background_delay_ms,
            );
        }

        self.ctx.log(
            "write",
            format!("{} writes {}={} at {:?}", coordinator, key, value, level),
            json!({
                "coordinator": coordinator,
                "key": key,
                "level": level,
                "clock": clock,
                "synchronous": synchronous,
                "background": background,
            }),
        );
        EventualWrite {
            success: true,
            clock,
            synchronous,
            background,
        }
    }

    pub fn read(&mut self, coordinator: &NodeId, key: &str, level: ConsistencyLevel) -> EventualRead {
        let required = level.replica_count(self.nodes.len());
        let sampled: Vec<NodeId> = if self.nodes.is_healthy(coordinator) {
            self.healthy_ring_from(coordinator).into_iter().take(required).collect()
        } else {
            Vec::new()
        };
        if sampled.is_empty() || sampled.len() < required {
            self.ctx.log(
                "read_failed",
                format!("{} reached {} of {} replicas", coordinator, sampled.len(), required),
                json!({ "coordinator": coordinator, "key": key, "level": level }),
            );
            return EventualRead {
                success: false,
                value: None,
                clock: None,
                sampled,
                siblings: Vec::new(),
            };
        }

        let versions: Vec<StoredValue> = sampled
            .iter()
            .filter_map(|id| self.nodes.get(id).and_then(|n| n.store.get(key)).cloned())
            .collect();
        let winner = newest(&versions).cloned();
        let mut siblings: Vec<StoredValue> = Vec::new();
        if let Some(best) = &winner {
            for v in &versions {
                if v.is_concurrent(best) && !siblings.iter().any(|s| s.clock == v.clock) {
                    siblings.push(v.clone());
                }
            }
        }

        self.ctx.log(
            "read",
            format!(
                "{} reads {} at {:?}: {}",
                coordinator,
                key,
                level,
                winner.as_ref().map(|v| v.value.as_str()).unwrap_or("<none>")
            ),
            json!({
                "coordinator": coordinator,
                "key": key,
                "level": level,
                "sampled": sampled,
                "siblings": siblings.len(),
            }),
        );
        EventualRead {
            success: true,
            value: winner.as_ref().map(|v| v.value.clone()),
            clock: winner.map(|v| v.clock),
            sampled,
            siblings,
        }
    }

    /// Keys whose stored clocks differ across healthy replicas.
    pub fn divergent_keys(&self) -> Vec<String> {
        let healthy: Vec<&EventualNode> = self.nodes.iter().filter(|n| n.status.is_available()).collect();
        let keys: BTreeSet<&String> = healthy.iter().flat_map(|n| n.store.keys()).collect();
        keys.into_iter()
            .filter(|key| {
                let mut clocks = healthy.iter().map(|n| n.store.get(*key).map(|v| &v.clock));
                let first = clocks.next().flatten();
                clocks.any(|c| c != first)
            })
            .cloned()
            .collect()
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

/// Causally greatest version; a concurrent candidate replaces the current
/// best, so ties resolve in favour of the later replica in sample order.
fn newest(versions: &[StoredValue]) -> Option<&StoredValue> {
    let mut best: Option<&StoredValue> = None;
    for v in versions {
        best = match best {
            None => Some(v),
            Some(b) => match v.clock.compare(&b.clock) {
                VectorClockOrdering::After | VectorClockOrdering::Concurrent => Some(v),
                VectorClockOrdering::Before | VectorClockOrdering::Equal => Some(b),
            },
        };
    }
    best
}

impl Simulation for EventualStore {
    type Payload = EventualMessage;
    type Stats = EventualStats;

    fn context(&self) -> &SimContext<EventualMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<EventualMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let EventualMessage::Replicate { key, version } = message.payload;
        let Some(node) = self.nodes.get_mut(&message.to) else {
            return;
        };
        let applied = node.apply(&key, version);
        self.ctx.log(
            "background_replicate",
            format!("{} receives {} from {} ({})", message.to, key, message.from, if applied { "applied" } else { "stale" }),
            json!({ "node": message.to, "key": key, "applied": applied }),
        );
    }

    fn stats(&self) -> EventualStats {
        EventualStats {
            nodes: self.nodes.len(),
            writes: self.ctx.events.count_of("write"),
            reads: self.ctx.events.count_of("read"),
            conflicting_reads: self
                .ctx
                .events
                .of_kind("read")
                .filter(|e| e.data["siblings"].as_u64().unwrap_or(0) > 0)
                .count(),
            pending_background: self.ctx.network.scheduler().len(),
            divergent_keys: self.divergent_keys().len(),
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
    use crate::clock::ManualClock;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn store(clock: &ManualClock) -> EventualStore {
        EventualStore::new(EventualConfig::default()).with_clock(clock.shared())
    }

    #[test]
    fn test_one_is_visible_after_background_delay() {
        let clock = ManualClock::new(0);
        let mut sim = store(&clock);
        let write = sim.write(&id("N0"), "k", "v1", ConsistencyLevel::One);
        assert!(write.success);
        assert!(write.synchronous.is_empty());
        assert_eq!(write.background.len(), 2);

        let stale = sim.read(&id("N1"), "k", ConsistencyLevel::One);
        assert!(stale.success);
        assert_eq!(stale.value, None);
        assert_eq!(sim.stats().divergent_keys, 1);

        assert_eq!(sim.tick(999), 0);
        assert_eq!(sim.tick(1000), 2);
        let fresh = sim.read(&id("N1"), "k", ConsistencyLevel::One);
        assert_eq!(fresh.value.as_deref(), Some("v1"));
        assert_eq!(sim.stats().divergent_keys, 0);
    }

    #[test]
    fn test_quorum_write_quorum_read_overlap() {
        let clock = ManualClock::new(0);
        let mut sim = store(&clock);
        let write = sim.write(&id("N0"), "k", "v1", ConsistencyLevel::Quorum);
        assert_eq!(write.synchronous, vec![id("N1")]);
        assert!(write.background.is_empty());

        // N2 has nothing, but a majority sample from N2 includes N0.
        let read = sim.read(&id("N2"), "k", ConsistencyLevel::Quorum);
        assert_eq!(read.sampled, vec![id("N2"), id("N0")]);
        assert_eq!(read.value.as_deref(), Some("v1"));
        assert!(read.siblings.is_empty());
    }

    #[test]
    fn test_all_fails_with_a_down_replica() {
        let mut sim = EventualStore::new(EventualConfig::default());
        sim.fail_node(&id("N2"));
        let write = sim.write(&id("N0"), "k", "v", ConsistencyLevel::All);
        assert!(!write.success);
        assert!(write.synchronous.is_empty());
        assert!(sim.nodes().iter().all(|n| n.store.get("k").is_none()));
        assert_eq!(sim.stats().pending_background, 0);
        assert_eq!(sim.events().last().unwrap().kind, "write_failed");
        assert!(!sim.read(&id("N0"), "k", ConsistencyLevel::All).success);

        let quorum = sim.write(&id("N0"), "k", "v", ConsistencyLevel::Quorum);
        assert!(quorum.success);
        assert_eq!(quorum.synchronous, vec![id("N1")]);
    }

    #[test]
    fn test_concurrent_writes_report_siblings() {
        let clock = ManualClock::new(0);
        let mut sim = store(&clock);
        sim.write(&id("N0"), "k", "left", ConsistencyLevel::One);
        sim.write(&id("N1"), "k", "right", ConsistencyLevel::One);
        sim.tick(1000);

        // Each side keeps its own version; the versions are concurrent.
        let read = sim.read(&id("N0"), "k", ConsistencyLevel::All);
        assert!(read.success);
        assert_eq!(read.siblings.len(), 1);
        assert_eq!(sim.stats().conflicting_reads, 1);
    }

    #[test]
    fn test_causal_overwrite_wins() {
        let clock = ManualClock::new(0);
        let mut sim = store(&clock);
        sim.write(&id("N0"), "k", "v1", ConsistencyLevel::All);
        let second = sim.write(&id("N1"), "k", "v2", ConsistencyLevel::One);
        assert_eq!(second.clock.get(&id("N0")), 1);
        assert_eq!(second.clock.get(&id("N1")), 1);

        let read = sim.read(&id("N2"), "k", ConsistencyLevel::All);
        assert_eq!(read.value.as_deref(), Some("v2"));
        assert!(read.siblings.is_empty());
    }
}
