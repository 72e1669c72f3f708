//! Protolab Failure Detection
//!
//! Heartbeat failure detector with a phi-style suspicion level. A monitor
//! tracks the last time it heard from each node; the elapsed time measured
//! in heartbeat intervals decides whether a node is alive, suspected or
//! declared failed. Direct probes let the monitor clear a suspicion.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{DeliveryConfig, FailureDetectorConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Identifier of the monitoring process.
pub const MONITOR_ID: &str = "MON";

// =============================================================================
// Suspicion
// =============================================================================

/// The monitor's opinion of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Suspicion {
    #[default]
    Alive,
    Suspect,
    Failed,
}

impl Suspicion {
    /// Classify a phi value against `threshold`.
    pub fn from_phi(phi: f64, threshold: f64) -> Self {
        if phi >= threshold {
            Suspicion::Failed
        } else if phi >= threshold / 2.0 {
            Suspicion::Suspect
        } else {
            Suspicion::Alive
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoredNode {
    pub id: NodeId,
    /// Actual liveness, unknown to the monitor.
    pub status: NodeStatus,
    pub last_heard: u64,
    pub suspicion: Suspicion,
    pub phi: f64,
}

impl SimNode for MonitoredNode {
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

/// Every message the failure detector sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DetectorMessage {
    Heartbeat { sent_at: u64 },
    Probe { sequence: u64 },
    Ack { sequence: u64 },
}

impl Payload for DetectorMessage {
    fn kind(&self) -> &'static str {
        match self {
            DetectorMessage::Heartbeat { .. } => "Heartbeat",
            DetectorMessage::Probe { .. } => "Probe",
            DetectorMessage::Ack { .. } => "Ack",
        }
    }
}

/// A change in the monitor's opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspicionChange {
    pub node: NodeId,
    pub from: Suspicion,
    pub to: Suspicion,
    pub phi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorStats {
    pub nodes: usize,
    pub suspicion: BTreeMap<NodeId, Suspicion>,
    pub heartbeats: usize,
    pub probes: usize,
    pub false_suspicions: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Failure Detector
// =============================================================================

#[derive(Debug, Clone)]
pub struct FailureDetector {
    config: FailureDetectorConfig,
    monitor: NodeId,
    nodes: Topology<MonitoredNode>,
    next_probe: u64,
    ctx: SimContext<DetectorMessage>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig) -> Self {
        let ctx = SimContext::default();
        Self {
            nodes: Self::build_nodes(&config, ctx.now()),
            config,
            monitor: NodeId::new(MONITOR_ID),
            next_probe: 1,
            ctx,
        }
    }

    /// Use `clock`; every node counts as heard from at the clock's time.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.ctx.set_clock(clock);
        let now = self.ctx.now();
        for node in self.nodes.iter_mut() {
            node.last_heard = now;
        }
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.ctx.set_delivery(delivery);
        self
    }

    fn build_nodes(config: &FailureDetectorConfig, now: u64) -> Topology<MonitoredNode> {
        Topology::new(
            node_ids("N", config.node_count)
                .into_iter()
                .map(|id| MonitoredNode {
                    id,
                    status: NodeStatus::Healthy,
                    last_heard: now,
                    suspicion: Suspicion::Alive,
                    phi: 0.0,
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[MonitoredNode] {
        self.nodes.as_slice()
    }

    pub fn suspicion_of(&self, id: &NodeId) -> Option<Suspicion> {
        self.nodes.get(id).map(|n| n.suspicion)
    }

    /// Elapsed time since the node was last heard from, in intervals.
    pub fn phi(&self, id: &NodeId) -> Option<f64> {
        let now = self.ctx.now();
        let interval = self.config.heartbeat_interval_ms.max(1) as f64;
        self.nodes
            .get(id)
            .map(|n| now.saturating_sub(n.last_heard) as f64 / interval)
    }

    /// The node sends a heartbeat to the monitor. Crashed nodes stay silent.
    pub fn heartbeat(&mut self, id: &NodeId) -> Option<MessageId> {
        if !self.nodes.is_healthy(id) {
            return None;
        }
        let now = self.ctx.now();
        let monitor = self.monitor.clone();
        Some(self.ctx.send(id, &monitor, DetectorMessage::Heartbeat { sent_at: now }))
    }

    /// Heartbeat from every healthy node.
    pub fn heartbeat_all(&mut self) -> Vec<MessageId> {
        self.nodes
            .healthy_ids()
            .iter()
            .filter_map(|id| self.heartbeat(id))
            .collect()
    }

    /// Recompute phi for every node and return the opinions that changed.
    pub fn evaluate(&mut self) -> Vec<SuspicionChange> {
        let threshold = self.config.phi_threshold;
        let phis: Vec<(NodeId, f64)> = self
            .nodes
            .ids()
            .into_iter()
            .filter_map(|id| self.phi(&id).map(|phi| (id, phi)))
            .collect();

        let mut changes = Vec::new();
        for (id, phi) in phis {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            node.phi = phi;
            let next = Suspicion::from_phi(phi, threshold);
            if next != node.suspicion {
                changes.push(SuspicionChange {
                    node: id,
                    from: node.suspicion,
                    to: next,
                    phi,
                });
                node.suspicion = next;
            }
        }
        for change in &changes {
            let kind = match change.to {
                Suspicion::Alive => "node_alive",
                Suspicion::Suspect => "node_suspected",
                Suspicion::Failed => "node_declared_failed",
            };
            if change.to == Suspicion::Failed {
                tracing::info!(node = %change.node, phi = change.phi, "node declared failed");
            }
            self.ctx.log(
                kind,
                format!("{} {:?} -> {:?} (phi {:.2})", change.node, change.from, change.to, change.phi),
                json!({ "node": change.node, "from": change.from, "to": change.to, "phi": change.phi }),
            );
        }
        changes
    }

    /// Ask `target` directly whether it is alive.
    pub fn probe(&mut self, target: &NodeId) -> Option<MessageId> {
        if !self.nodes.contains(target) {
            self.ctx.log("probe_failed", format!("unknown node {}", target), json!({ "node": target }));
            return None;
        }
        let sequence = self.next_probe;
        self.next_probe += 1;
        self.ctx.log(
            "probe",
            format!("{} probes {} (#{})", self.monitor, target, sequence),
            json!({ "node": target, "sequence": sequence }),
        );
        let monitor = self.monitor.clone();
        Some(self.ctx.send(&monitor, target, DetectorMessage::Probe { sequence }))
    }

    fn heard_from(&mut self, id: &NodeId, via: &str) {
        let now = self.ctx.now();
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let previous = node.suspicion;
        node.last_heard = now;
        node.phi = 0.0;
        node.suspicion = Suspicion::Alive;
        if previous != Suspicion::Alive {
            self.ctx.log(
                "node_alive",
                format!("{} {:?} -> Alive ({})", id, previous, via),
                json!({ "node": id, "from": previous, "to": Suspicion::Alive, "via": via }),
            );
        }
    }

    pub fn crash(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} crashes", id), json!({ "node": id }));
        true
    }

    pub fn recover(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Healthy) {
            return false;
        }
        self.ctx.log("node_recovered", format!("{} recovers", id), json!({ "node": id }));
        true
    }
}

impl Simulation for FailureDetector {
    type Payload = DetectorMessage;
    type Stats = DetectorStats;

    fn context(&self) -> &SimContext<DetectorMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<DetectorMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let monitor = &self.monitor;
        let message = match self
            .ctx
            .begin_delivery(id, |to| to == monitor || nodes.is_healthy(to))
        {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        match message.payload {
            DetectorMessage::Heartbeat { .. } => self.heard_from(&message.from, "heartbeat"),
            DetectorMessage::Probe { sequence } => {
                self.ctx.send(&message.to, &message.from, DetectorMessage::Ack { sequence });
            }
            DetectorMessage::Ack { .. } => self.heard_from(&message.from, "probe"),
        }
    }

    fn stats(&self) -> DetectorStats {
        DetectorStats {
            nodes: self.nodes.len(),
            suspicion: self.nodes.iter().map(|n| (n.id.clone(), n.suspicion)).collect(),
            heartbeats: self.messages().iter().filter(|m| m.kind() == "Heartbeat").count(),
            probes: self.ctx.events.count_of("probe"),
            false_suspicions: self
                .nodes
                .iter()
                .filter(|n| n.suspicion != Suspicion::Alive && n.status.is_available())
                .count(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config, self.ctx.now());
        self.next_probe = 1;
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

    fn detector(clock: &ManualClock) -> FailureDetector {
        FailureDetector::new(FailureDetectorConfig::default()).with_clock(clock.shared())
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(Suspicion::from_phi(3.9, 8.0), Suspicion::Alive);
        assert_eq!(Suspicion::from_phi(4.0, 8.0), Suspicion::Suspect);
        assert_eq!(Suspicion::from_phi(8.0, 8.0), Suspicion::Failed);
    }

    #[test]
    fn test_silence_escalates() {
        let clock = ManualClock::new(10_000);
        let mut sim = detector(&clock);
        clock.advance(2000);
        assert!(sim.evaluate().is_empty());

        clock.advance(2000);
        let changes = sim.evaluate();
        assert_eq!(changes.len(), 4);
        assert!(changes.iter().all(|c| c.to == Suspicion::Suspect));

        clock.advance(4000);
        sim.evaluate();
        assert_eq!(sim.suspicion_of(&id("N0")), Some(Suspicion::Failed));
        assert_eq!(sim.stats().false_suspicions, 4);
    }

    #[test]
    fn test_heartbeats_keep_nodes_alive() {
        let clock = ManualClock::new(0);
        let mut sim = detector(&clock);
        sim.crash(&id("N3"));
        for _ in 0..8 {
            clock.advance(1000);
            sim.heartbeat_all();
            sim.deliver_all();
        }
        sim.evaluate();
        assert_eq!(sim.suspicion_of(&id("N0")), Some(Suspicion::Alive));
        assert_eq!(sim.suspicion_of(&id("N3")), Some(Suspicion::Failed));
        assert_eq!(sim.phi(&id("N3")), Some(8.0));
        assert_eq!(sim.stats().heartbeats, 24);
    }

    #[test]
    fn test_probe_clears_suspicion() {
        let clock = ManualClock::new(0);
        let mut sim = detector(&clock);
        clock.advance(5000);
        sim.evaluate();
        assert_eq!(sim.suspicion_of(&id("N1")), Some(Suspicion::Suspect));

        sim.crash(&id("N2"));
        sim.probe(&id("N1"));
        sim.probe(&id("N2"));
        sim.deliver_all();
        assert_eq!(sim.suspicion_of(&id("N1")), Some(Suspicion::Alive));
        assert_eq!(sim.suspicion_of(&id("N2")), Some(Suspicion::Suspect));
        assert!(sim.events().iter().any(|e| e.kind == "node_alive"));
        assert!(sim.probe(&id("N9")).is_none());
    }
}
