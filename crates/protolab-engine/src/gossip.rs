//! Protolab Gossip
//!
//! Epidemic anti-entropy. Each round every healthy node contacts `fanout`
//! random healthy peers and exchanges versioned entries by push, pull or
//! both. Peer selection draws from a seeded generator so a seed replays the
//! same run.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::quorum::{Version, VersionedEntry};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, GossipConfig};
use protolab_common::types::GossipMode;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub type GossipStore = BTreeMap<String, VersionedEntry>;

#[derive(Debug, Clone, Serialize)]
pub struct GossipNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub store: GossipStore,
}

impl GossipNode {
    /// Take every entry strictly newer than the local copy; returns the
    /// number of keys updated.
    fn merge(&mut self, entries: GossipStore) -> usize {
        let mut updated = 0;
        for (key, entry) in entries {
            let newer = self.store.get(&key).map(|e| entry.version > e.version).unwrap_or(true);
            if newer {
                self.store.insert(key, entry);
                updated += 1;
            }
        }
        updated
    }

    fn digest(&self) -> BTreeMap<String, Version> {
        self.store.iter().map(|(k, e)| (k.clone(), e.version)).collect()
    }

    /// Entries newer than what `digest` says the peer holds.
    fn newer_than(&self, digest: &BTreeMap<String, Version>) -> GossipStore {
        self.store
            .iter()
            .filter(|(k, e)| digest.get(*k).map(|v| e.version > *v).unwrap_or(true))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

impl SimNode for GossipNode {
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

/// Every message the gossip simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GossipMessage {
    Push { round: u64, entries: GossipStore },
    PullRequest { round: u64, digest: BTreeMap<String, Version> },
    PullResponse { round: u64, entries: GossipStore },
}

impl Payload for GossipMessage {
    fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Push { .. } => "Push",
            GossipMessage::PullRequest { .. } => "PullRequest",
            GossipMessage::PullResponse { .. } => "PullResponse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipStats {
    pub nodes: usize,
    pub fanout: usize,
    pub mode: GossipMode,
    pub round: u64,
    pub converged: bool,
    pub keys: usize,
    pub updates_applied: usize,
    pub messages: MessageCounts,
}

#[derive(Debug, Clone)]
pub struct GossipSimulation {
    config: GossipConfig,
    nodes: Topology<GossipNode>,
    rng: StdRng,
    round: u64,
    updates_applied: usize,
    ctx: SimContext<GossipMessage>,
}

impl GossipSimulation {
    pub fn new(config: GossipConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            round: 0,
            updates_applied: 0,
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

    fn build_nodes(config: &GossipConfig) -> Topology<GossipNode> {
        Topology::new(
            node_ids("G", config.node_count)
                .into_iter()
                .map(|id| GossipNode {
                    id,
                    status: NodeStatus::Healthy,
                    store: BTreeMap::new(),
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[GossipNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&GossipNode> {
        self.nodes.get(id)
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Local write; the version is one above the node's current copy.
    pub fn update(&mut self, node: &NodeId, key: &str, value: &str) -> Option<Version> {
        let healthy = self.nodes.is_healthy(node);
        let Some(target) = self.nodes.get_mut(node).filter(|_| healthy) else {
            self.ctx.log(
                "update_failed",
                format!("{} cannot accept updates", node),
                json!({ "node": node, "key": key }),
            );
            return None;
        };
        let version = target.store.get(key).map(|e| e.version).unwrap_or(0) + 1;
        target.store.insert(
            key.to_string(),
            VersionedEntry {
                value: value.to_string(),
                version,
            },
        );
        self.ctx.log(
            "local_update",
            format!("{} sets {}={} v{}", node, key, value, version),
            json!({ "node": node, "key": key, "version": version }),
        );
        Some(version)
    }

    /// Start one round of exchanges. Messages are delivered by the caller.
    pub fn gossip_round(&mut self) -> u64 {
        self.round += 1;
        let round = self.round;
        let healthy = self.nodes.healthy_ids();
        let mut exchanges = 0;

        for node in &healthy {
            let peers: Vec<NodeId> = healthy.iter().filter(|p| *p != node).cloned().collect();
            let chosen: Vec<NodeId> = peers
                .choose_multiple(&mut self.rng, self.config.fanout)
                .cloned()
                .collect();
            let Some(state) = self.nodes.get(node) else {
                continue;
            };
            let entries = state.store.clone();
            let digest = state.digest();
            for peer in &chosen {
                if matches!(self.config.mode, GossipMode::Push | GossipMode::PushPull) {
                    self.ctx.send(node, peer, GossipMessage::Push { round, entries: entries.clone() });
                }
                if matches!(self.config.mode, GossipMode::Pull | GossipMode::PushPull) {
                    self.ctx.send(node, peer, GossipMessage::PullRequest { round, digest: digest.clone() });
                }
                exchanges += 1;
            }
        }

        self.ctx.log(
            "gossip_round",
            format!("round {} with {} exchanges", round, exchanges),
            json!({ "round": round, "exchanges": exchanges, "mode": self.config.mode }),
        );
        round
    }

    /// True when every healthy node holds the same entries.
    pub fn is_converged(&self) -> bool {
        let mut stores = self
            .nodes
            .iter()
            .filter(|n| n.status.is_available())
            .map(|n| &n.store);
        match stores.next() {
            Some(first) => stores.all(|s| s == first),
            None => true,
        }
    }

    /// Run rounds until convergence or `max_rounds`; returns the rounds run.
    pub fn run_until_converged(&mut self, max_rounds: u64) -> u64 {
        let mut rounds = 0;
        while !self.is_converged() && rounds < max_rounds {
            self.gossip_round();
            self.deliver_all();
            rounds += 1;
        }
        rounds
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

    fn apply(&mut self, to: &NodeId, from: &NodeId, round: u64, entries: GossipStore) {
        let updated = self.nodes.get_mut(to).map(|n| n.merge(entries)).unwrap_or(0);
        if updated > 0 {
            self.updates_applied += updated;
            self.ctx.log(
                "gossip_merge",
                format!("{} took {} entries from {}", to, updated, from),
                json!({ "node": to, "peer": from, "round": round, "updated": updated }),
            );
        }
    }
}

impl Simulation for GossipSimulation {
    type Payload = GossipMessage;
    type Stats = GossipStats;

    fn context(&self) -> &SimContext<GossipMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<GossipMessage> {
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
            GossipMessage::Push { round, entries } | GossipMessage::PullResponse { round, entries } => {
                self.apply(to, from, round, entries)
            }
            GossipMessage::PullRequest { round, digest } => {
                let entries = self.nodes.get(to).map(|n| n.newer_than(&digest)).unwrap_or_default();
                if !entries.is_empty() {
                    self.ctx.send(to, from, GossipMessage::PullResponse { round, entries });
                }
            }
        }
    }

    fn stats(&self) -> GossipStats {
        let keys = self
            .nodes
            .iter()
            .flat_map(|n| n.store.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        GossipStats {
            nodes: self.nodes.len(),
            fanout: self.config.fanout,
            mode: self.config.mode,
            round: self.round,
            converged: self.is_converged(),
            keys,
            updates_applied: self.updates_applied,
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.round = 0;
        self.updates_applied = 0;
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

    #[test]
    fn test_update_bumps_version() {
        let mut sim = GossipSimulation::new(GossipConfig::default());
        assert_eq!(sim.update(&id("G0"), "k", "a"), Some(1));
        assert_eq!(sim.update(&id("G0"), "k", "b"), Some(2));
        assert!(!sim.is_converged());
    }

    #[test]
    fn test_each_mode_converges() {
        for mode in [GossipMode::Push, GossipMode::Pull, GossipMode::PushPull] {
            let mut sim = GossipSimulation::new(GossipConfig::default().with_mode(mode));
            sim.update(&id("G0"), "a", "1");
            sim.update(&id("G3"), "b", "2");
            let rounds = sim.run_until_converged(50);
            assert!(sim.is_converged(), "{:?} did not converge", mode);
            assert!(rounds > 0);
            assert!(sim.nodes().iter().all(|n| n.store.len() == 2));
        }
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = |seed| {
            let mut sim = GossipSimulation::new(GossipConfig::default().with_seed(seed));
            sim.update(&id("G0"), "k", "v");
            sim.gossip_round();
            sim.messages().iter().map(|m| m.to.clone()).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_higher_version_wins() {
        let mut sim = GossipSimulation::new(GossipConfig::default());
        sim.update(&id("G0"), "k", "old");
        sim.update(&id("G1"), "k", "x");
        sim.update(&id("G1"), "k", "new");
        sim.run_until_converged(50);
        assert!(sim.nodes().iter().all(|n| n.store["k"].value == "new"));
    }

    #[test]
    fn test_failed_node_excluded_from_convergence() {
        let mut sim = GossipSimulation::new(GossipConfig::default());
        sim.fail_node(&id("G5"));
        sim.update(&id("G0"), "k", "v");
        sim.run_until_converged(50);
        assert!(sim.is_converged());
        assert!(sim.node(&id("G5")).unwrap().store.is_empty());

        sim.reset();
        assert_eq!(sim.round(), 0);
        assert!(sim.is_converged());
    }
}
