//! Protolab Chandy-Lamport Snapshots
//!
//! Consistent global snapshots over FIFO channels. A process records its own
//! state when it initiates a snapshot or sees its first marker, then records
//! every incoming channel until a marker arrives on it.
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
use std::fmt;

// =============================================================================
// Snapshot Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap{}", self.0)
    }
}

/// Counters making up a process's local state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub events: u64,
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    pub state: ProcessState,
    /// Peers whose channel is still being recorded.
    pub recording_from: BTreeSet<NodeId>,
    pub channels: BTreeMap<NodeId, Vec<String>>,
}

impl LocalSnapshot {
    pub fn is_complete(&self) -> bool {
        self.recording_from.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub from: NodeId,
    pub to: NodeId,
    pub messages: Vec<String>,
}

/// Recorded process states plus the messages caught in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSnapshot {
    pub id: SnapshotId,
    pub initiator: NodeId,
    pub states: BTreeMap<NodeId, ProcessState>,
    pub channels: Vec<ChannelState>,
}

impl GlobalSnapshot {
    pub fn in_transit(&self) -> usize {
        self.channels.iter().map(|c| c.messages.len()).sum()
    }

    /// Every message recorded as sent is either recorded as received or
    /// recorded in a channel.
    pub fn is_consistent(&self) -> bool {
        let sent: u64 = self.states.values().map(|s| s.sent).sum();
        let received: u64 = self.states.values().map(|s| s.received).sum();
        sent == received + self.in_transit() as u64
    }
}

// =============================================================================
// Processes and Messages
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotProcess {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: ProcessState,
    pub snapshots: BTreeMap<SnapshotId, LocalSnapshot>,
}

impl SimNode for SnapshotProcess {
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

/// Every message the snapshot simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SnapshotMessage {
    App { label: String },
    Marker { snapshot: SnapshotId },
}

impl Payload for SnapshotMessage {
    fn kind(&self) -> &'static str {
        match self {
            SnapshotMessage::App { .. } => "App",
            SnapshotMessage::Marker { .. } => "Marker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub processes: usize,
    pub snapshots_started: usize,
    pub snapshots_completed: usize,
    pub app_messages: usize,
    pub markers: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Snapshot Simulation
// =============================================================================

#[derive(Debug, Clone)]
pub struct SnapshotSimulation {
    config: CausalityConfig,
    nodes: Topology<SnapshotProcess>,
    initiators: BTreeMap<SnapshotId, NodeId>,
    next_snapshot: u64,
    ctx: SimContext<SnapshotMessage>,
}

impl SnapshotSimulation {
    pub fn new(config: CausalityConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            initiators: BTreeMap::new(),
            next_snapshot: 1,
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

    fn build_nodes(config: &CausalityConfig) -> Topology<SnapshotProcess> {
        Topology::new(
            node_ids("P", config.process_count)
                .into_iter()
                .map(|id| SnapshotProcess {
                    id,
                    status: NodeStatus::Healthy,
                    state: ProcessState::default(),
                    snapshots: BTreeMap::new(),
                })
                .collect(),
        )
    }

    pub fn processes(&self) -> &[SnapshotProcess] {
        self.nodes.as_slice()
    }

    pub fn process(&self, id: &NodeId) -> Option<&SnapshotProcess> {
        self.nodes.get(id)
    }

    pub fn local_event(&mut self, id: &NodeId) -> bool {
        let healthy = self.nodes.is_healthy(id);
        let Some(node) = self.nodes.get_mut(id).filter(|_| healthy) else {
            return false;
        };
        node.state.events += 1;
        let events = node.state.events;
        self.ctx.log("local_event", format!("{} local event", id), json!({ "node": id, "events": events }));
        true
    }

    pub fn send_app_message(&mut self, from: &NodeId, to: &NodeId) -> Option<MessageId> {
        let healthy = self.nodes.is_healthy(from) && self.nodes.contains(to) && from != to;
        let Some(node) = self.nodes.get_mut(from).filter(|_| healthy) else {
            self.ctx.log(
                "send_failed",
                format!("{} cannot send to {}", from, to),
                json!({ "from": from, "to": to }),
            );
            return None;
        };
        node.state.sent += 1;
        let label = format!("{}-{}", from, node.state.sent);
        self.ctx.log(
            "app_send",
            format!("{} sends {} to {}", from, label, to),
            json!({ "from": from, "to": to, "label": label }),
        );
        Some(self.ctx.send(from, to, SnapshotMessage::App { label }))
    }

    pub fn initiate_snapshot(&mut self, initiator: &NodeId) -> Option<SnapshotId> {
        if !self.nodes.is_healthy(initiator) {
            self.ctx.log(
                "snapshot_failed",
                format!("{} cannot initiate a snapshot", initiator),
                json!({ "initiator": initiator }),
            );
            return None;
        }
        let id = SnapshotId(self.next_snapshot);
        self.next_snapshot += 1;
        self.initiators.insert(id, initiator.clone());
        tracing::info!(snapshot = %id, initiator = %initiator, "snapshot initiated");
        self.record_and_propagate(initiator, id, None);
        Some(id)
    }

    /// Record local state, start recording every incoming channel except
    /// `marker_from`, and send a marker on every outgoing channel.
    fn record_and_propagate(&mut self, id: &NodeId, snapshot: SnapshotId, marker_from: Option<&NodeId>) {
        let peers = self.nodes.peers_of(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let recording_from: BTreeSet<NodeId> = peers.iter().filter(|p| Some(*p) != marker_from).cloned().collect();
        let mut channels: BTreeMap<NodeId, Vec<String>> = recording_from.iter().map(|p| (p.clone(), Vec::new())).collect();
        if let Some(from) = marker_from {
            channels.insert(from.clone(), Vec::new());
        }
        let state = node.state;
        node.snapshots.insert(
            snapshot,
            LocalSnapshot {
                state,
                recording_from,
                channels,
            },
        );
        self.ctx.log(
            "state_recorded",
            format!("{} records state for {}", id, snapshot),
            json!({ "node": id, "snapshot": snapshot, "state": state }),
        );
        self.ctx.broadcast(id, &peers, SnapshotMessage::Marker { snapshot });
        self.check_complete(id, snapshot);
    }

    fn check_complete(&mut self, id: &NodeId, snapshot: SnapshotId) {
        let complete = self
            .nodes
            .get(id)
            .and_then(|n| n.snapshots.get(&snapshot))
            .map(LocalSnapshot::is_complete)
            .unwrap_or(false);
        if complete {
            self.ctx.log(
                "local_snapshot_complete",
                format!("{} completes {}", id, snapshot),
                json!({ "node": id, "snapshot": snapshot }),
            );
            if self.global_snapshot(snapshot).is_some() {
                tracing::info!(snapshot = %snapshot, "global snapshot complete");
                self.ctx.log(
                    "snapshot_complete",
                    format!("{} complete", snapshot),
                    json!({ "snapshot": snapshot }),
                );
            }
        }
    }

    fn handle_app(&mut self, to: &NodeId, from: &NodeId, label: String) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        node.state.received += 1;
        for local in node.snapshots.values_mut() {
            if local.recording_from.contains(from) {
                local.channels.entry(from.clone()).or_default().push(label.clone());
            }
        }
    }

    fn handle_marker(&mut self, to: &NodeId, from: &NodeId, snapshot: SnapshotId) {
        let Some(node) = self.nodes.get_mut(to) else {
            return;
        };
        match node.snapshots.get_mut(&snapshot) {
            None => self.record_and_propagate(to, snapshot, Some(from)),
            Some(local) => {
                local.recording_from.remove(from);
                self.check_complete(to, snapshot);
            }
        }
    }

    /// The assembled snapshot once every process has completed it.
    pub fn global_snapshot(&self, snapshot: SnapshotId) -> Option<GlobalSnapshot> {
        let initiator = self.initiators.get(&snapshot)?;
        let mut states = BTreeMap::new();
        let mut channels = Vec::new();
        for node in self.nodes.iter() {
            let local = node.snapshots.get(&snapshot).filter(|l| l.is_complete())?;
            states.insert(node.id.clone(), local.state);
            for (from, messages) in &local.channels {
                if !messages.is_empty() {
                    channels.push(ChannelState {
                        from: from.clone(),
                        to: node.id.clone(),
                        messages: messages.clone(),
                    });
                }
            }
        }
        Some(GlobalSnapshot {
            id: snapshot,
            initiator: initiator.clone(),
            states,
            channels,
        })
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }

    fn deliver_one(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        match message.payload {
            SnapshotMessage::App { label } => self.handle_app(&message.to, &message.from, label),
            SnapshotMessage::Marker { snapshot } => self.handle_marker(&message.to, &message.from, snapshot),
        }
    }
}

impl Simulation for SnapshotSimulation {
    type Payload = SnapshotMessage;
    type Stats = SnapshotStats;

    fn context(&self) -> &SimContext<SnapshotMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<SnapshotMessage> {
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

    fn stats(&self) -> SnapshotStats {
        let counts = self.ctx.network.messages().iter().fold((0, 0), |(app, markers), m| match m.payload {
            SnapshotMessage::App { .. } => (app + 1, markers),
            SnapshotMessage::Marker { .. } => (app, markers + 1),
        });
        SnapshotStats {
            processes: self.nodes.len(),
            snapshots_started: self.initiators.len(),
            snapshots_completed: self.ctx.events.count_of("snapshot_complete"),
            app_messages: counts.0,
            markers: counts.1,
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.initiators.clear();
        self.next_snapshot = 1;
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

    fn sim() -> SnapshotSimulation {
        SnapshotSimulation::new(CausalityConfig::default())
    }

    #[test]
    fn test_quiet_system_snapshot() {
        let mut sim = sim();
        sim.local_event(&id("P1"));
        let snap = sim.initiate_snapshot(&id("P0")).unwrap();
        assert!(sim.global_snapshot(snap).is_none());
        sim.deliver_all();

        let global = sim.global_snapshot(snap).unwrap();
        assert_eq!(global.states.len(), 3);
        assert_eq!(global.states[&id("P1")].events, 1);
        assert_eq!(global.in_transit(), 0);
        assert!(global.is_consistent());
        assert_eq!(sim.stats().snapshots_completed, 1);
    }

    #[test]
    fn test_in_transit_message_recorded_on_channel() {
        let mut sim = sim();
        let app = sim.send_app_message(&id("P1"), &id("P0")).unwrap();
        let snap = sim.initiate_snapshot(&id("P0")).unwrap();
        // P1 sees the marker before the application message reaches P0.
        let marker_to_p1 = sim
            .messages()
            .iter()
            .find(|m| m.kind() == "Marker" && m.to == id("P1"))
            .map(|m| m.id)
            .unwrap();
        sim.deliver(marker_to_p1);
        sim.deliver(app);
        sim.deliver_all();

        let global = sim.global_snapshot(snap).unwrap();
        assert_eq!(global.states[&id("P1")].sent, 1);
        assert_eq!(global.states[&id("P0")].received, 0);
        assert_eq!(global.channels.len(), 1);
        assert_eq!(global.channels[0].from, id("P1"));
        assert_eq!(global.channels[0].messages, vec!["P1-1".to_string()]);
        assert!(global.is_consistent());
    }

    #[test]
    fn test_fifo_channel_delivers_older_first() {
        let mut sim = sim();
        sim.initiate_snapshot(&id("P0")).unwrap();
        let app = sim.send_app_message(&id("P0"), &id("P1")).unwrap();
        // The marker was sent first, so it is processed before the message.
        sim.deliver(app);
        let p1 = sim.process(&id("P1")).unwrap();
        assert!(p1.snapshots.contains_key(&SnapshotId(1)));
        assert_eq!(p1.state.received, 1);
        assert!(p1.snapshots[&SnapshotId(1)].channels.values().all(Vec::is_empty));
    }

    #[test]
    fn test_failed_process_blocks_completion() {
        let mut sim = sim();
        sim.fail_node(&id("P2"));
        assert!(sim.initiate_snapshot(&id("P2")).is_none());
        let snap = sim.initiate_snapshot(&id("P0")).unwrap();
        sim.deliver_all();
        assert!(sim.global_snapshot(snap).is_none());
        assert_eq!(sim.stats().snapshots_completed, 0);
    }
}
