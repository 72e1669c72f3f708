//! Protolab PBFT
//!
//! Practical Byzantine Fault Tolerance in its normal-case form: the primary of
//! the current view orders a request with a pre-prepare, replicas agree on the
//! order with prepares, and execute once a quorum of commits arrives. With
//! `n` replicas the cluster tolerates `f = (n - 1) / 3` faulty nodes and every
//! phase needs `2f + 1` matching messages. Faulty nodes only omit messages.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{byzantine_faults, byzantine_quorum, SimNode, Topology};
use protolab_common::config::{DeliveryConfig, PbftConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

pub type View = u64;
pub type SequenceNumber = u64;

// =============================================================================
// Roles and Phases
// =============================================================================

/// Role of a PBFT replica in the current view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PbftRole {
    Primary,
    Replica,
}

/// Progress of one request at one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestPhase {
    /// Prepares or commits arrived before the pre-prepare.
    Pending,
    PrePrepared,
    Prepared,
    Executed,
}

/// A replica's record of one sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEntry {
    pub sequence: SequenceNumber,
    pub view: View,
    pub value: Option<String>,
    pub phase: RequestPhase,
    pub prepares: BTreeSet<NodeId>,
    pub commits: BTreeSet<NodeId>,
}

impl RequestEntry {
    fn placeholder(sequence: SequenceNumber, view: View) -> Self {
        Self {
            sequence,
            view,
            value: None,
            phase: RequestPhase::Pending,
            prepares: BTreeSet::new(),
            commits: BTreeSet::new(),
        }
    }
}

// =============================================================================
// PBFT Node
// =============================================================================

/// A PBFT replica.
#[derive(Debug, Clone, Serialize)]
pub struct PbftNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub role: PbftRole,
    pub view: View,
    /// Omits every outgoing protocol message when set.
    pub byzantine: bool,
    pub log: BTreeMap<SequenceNumber, RequestEntry>,
    /// Executed requests in execution order.
    pub executed: Vec<(SequenceNumber, String)>,
}

impl PbftNode {
    fn new(id: NodeId, role: PbftRole) -> Self {
        Self {
            id,
            status: NodeStatus::Healthy,
            role,
            view: 0,
            byzantine: false,
            log: BTreeMap::new(),
            executed: Vec::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == PbftRole::Primary
    }

    pub fn phase_of(&self, sequence: SequenceNumber) -> Option<RequestPhase> {
        self.log.get(&sequence).map(|e| e.phase)
    }
}

impl SimNode for PbftNode {
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

// =============================================================================
// PBFT Messages
// =============================================================================

/// Every message the PBFT simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PbftMessage {
    PrePrepare {
        view: View,
        sequence: SequenceNumber,
        value: String,
    },
    Prepare {
        view: View,
        sequence: SequenceNumber,
    },
    Commit {
        view: View,
        sequence: SequenceNumber,
    },
}

impl PbftMessage {
    pub fn view(&self) -> View {
        match self {
            PbftMessage::PrePrepare { view, .. }
            | PbftMessage::Prepare { view, .. }
            | PbftMessage::Commit { view, .. } => *view,
        }
    }
}

impl Payload for PbftMessage {
    fn kind(&self) -> &'static str {
        match self {
            PbftMessage::PrePrepare { .. } => "PrePrepare",
            PbftMessage::Prepare { .. } => "Prepare",
            PbftMessage::Commit { .. } => "Commit",
        }
    }
}

// =============================================================================
// PBFT Statistics
// =============================================================================

/// Summary of a PBFT run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbftStats {
    pub nodes: usize,
    pub faults_tolerated: usize,
    pub quorum: usize,
    pub view: View,
    pub primary: NodeId,
    pub requests: usize,
    /// Executed request count per replica.
    pub executed: BTreeMap<NodeId, usize>,
    pub messages: MessageCounts,
}

// =============================================================================
// PBFT Simulation
// =============================================================================

/// Replicas `R0..` with the primary of view `v` at position `v mod n`.
#[derive(Debug, Clone)]
pub struct PbftSimulation {
    config: PbftConfig,
    nodes: Topology<PbftNode>,
    view: View,
    next_sequence: SequenceNumber,
    ctx: SimContext<PbftMessage>,
}

impl PbftSimulation {
    pub fn new(config: PbftConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            view: 0,
            next_sequence: 0,
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

    fn build_nodes(config: &PbftConfig) -> Topology<PbftNode> {
        Topology::new(
            node_ids("R", config.node_count)
                .into_iter()
                .enumerate()
                .map(|(i, id)| {
                    let role = if i == 0 {
                        PbftRole::Primary
                    } else {
                        PbftRole::Replica
                    };
                    PbftNode::new(id, role)
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[PbftNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&PbftNode> {
        self.nodes.get(id)
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn faults_tolerated(&self) -> usize {
        byzantine_faults(self.nodes.len())
    }

    pub fn quorum(&self) -> usize {
        byzantine_quorum(self.nodes.len())
    }

    /// Primary of the current view.
    pub fn primary(&self) -> Option<&PbftNode> {
        if self.nodes.is_empty() {
            return None;
        }
        let index = (self.view % self.nodes.len() as u64) as usize;
        self.nodes.as_slice().get(index)
    }

    /// Send unless the sender is faulty, in which case the message is omitted.
    fn send_all(&mut self, from: &NodeId, payload: PbftMessage) {
        let byzantine = self.nodes.get(from).map(|n| n.byzantine).unwrap_or(false);
        if byzantine {
            self.ctx.log(
                "message_omitted",
                format!("{} withholds its {}", from, payload.kind()),
                json!({ "node": from, "kind": payload.kind() }),
            );
            return;
        }
        let peers = self.nodes.peers_of(from);
        self.ctx.broadcast(from, &peers, payload);
    }

    // -------------------------------------------------------------------------
    // Normal Case
    // -------------------------------------------------------------------------

    /// Have the primary order a client request.
    pub fn client_request(&mut self, value: impl Into<String>) -> Option<SequenceNumber> {
        let value = value.into();
        let Some(primary) = self.primary().filter(|p| p.status.is_available()).map(|p| p.id.clone())
        else {
            self.ctx.log(
                "request_failed",
                format!("primary for view {} is unavailable for '{}'", self.view, value),
                json!({ "view": self.view, "value": value }),
            );
            return None;
        };

        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let view = self.view;
        if let Some(node) = self.nodes.get_mut(&primary) {
            let mut entry = RequestEntry::placeholder(sequence, view);
            entry.value = Some(value.clone());
            entry.phase = RequestPhase::PrePrepared;
            entry.prepares.insert(primary.clone());
            node.log.insert(sequence, entry);
        }

        self.ctx.log(
            "pre_prepare",
            format!("{} assigns sequence {} to '{}' in view {}", primary, sequence, value, view),
            json!({ "primary": primary, "sequence": sequence, "view": view, "value": value }),
        );
        self.send_all(&primary, PbftMessage::PrePrepare { view, sequence, value });
        Some(sequence)
    }

    fn handle_pre_prepare(
        &mut self,
        replica: &NodeId,
        primary: &NodeId,
        view: View,
        sequence: SequenceNumber,
        value: String,
    ) {
        let Some(node) = self.nodes.get_mut(replica) else {
            return;
        };
        let entry = node
            .log
            .entry(sequence)
            .or_insert_with(|| RequestEntry::placeholder(sequence, view));
        if entry.phase != RequestPhase::Pending {
            return;
        }
        entry.value = Some(value.clone());
        entry.phase = RequestPhase::PrePrepared;
        entry.prepares.insert(primary.clone());
        entry.prepares.insert(replica.clone());

        self.ctx.log(
            "prepare",
            format!("{} accepts '{}' at sequence {} and sends prepares", replica, value, sequence),
            json!({ "node": replica, "sequence": sequence, "view": view }),
        );
        self.send_all(replica, PbftMessage::Prepare { view, sequence });
        self.check_prepared(replica, sequence);
    }

    fn handle_prepare(&mut self, replica: &NodeId, from: &NodeId, view: View, sequence: SequenceNumber) {
        let Some(node) = self.nodes.get_mut(replica) else {
            return;
        };
        node.log
            .entry(sequence)
            .or_insert_with(|| RequestEntry::placeholder(sequence, view))
            .prepares
            .insert(from.clone());
        self.check_prepared(replica, sequence);
    }

    fn handle_commit(&mut self, replica: &NodeId, from: &NodeId, view: View, sequence: SequenceNumber) {
        let Some(node) = self.nodes.get_mut(replica) else {
            return;
        };
        node.log
            .entry(sequence)
            .or_insert_with(|| RequestEntry::placeholder(sequence, view))
            .commits
            .insert(from.clone());
        self.check_committed(replica, sequence);
    }

    fn check_prepared(&mut self, replica: &NodeId, sequence: SequenceNumber) {
        let quorum = self.quorum();
        let Some(entry) = self.nodes.get_mut(replica).and_then(|n| n.log.get_mut(&sequence)) else {
            return;
        };
        if entry.phase != RequestPhase::PrePrepared || entry.prepares.len() < quorum {
            return;
        }
        entry.phase = RequestPhase::Prepared;
        entry.commits.insert(replica.clone());
        let view = entry.view;
        let prepares = entry.prepares.len();

        self.ctx.log(
            "prepared",
            format!("{} is prepared for sequence {} with {} prepares", replica, sequence, prepares),
            json!({ "node": replica, "sequence": sequence, "prepares": prepares }),
        );
        self.send_all(replica, PbftMessage::Commit { view, sequence });
        self.check_committed(replica, sequence);
    }

    fn check_committed(&mut self, replica: &NodeId, sequence: SequenceNumber) {
        let quorum = self.quorum();
        let Some(node) = self.nodes.get_mut(replica) else {
            return;
        };
        let Some(entry) = node.log.get_mut(&sequence) else {
            return;
        };
        if entry.phase != RequestPhase::Prepared || entry.commits.len() < quorum {
            return;
        }
        entry.phase = RequestPhase::Executed;
        let value = entry.value.clone().unwrap_or_default();
        let commits = entry.commits.len();
        node.executed.push((sequence, value.clone()));

        self.ctx.log(
            "executed",
            format!("{} executes '{}' at sequence {}", replica, value, sequence),
            json!({ "node": replica, "sequence": sequence, "value": value, "commits": commits }),
        );
    }

    // -------------------------------------------------------------------------
    // View Change and Faults
    // -------------------------------------------------------------------------

    /// Move every replica to the next view and rotate the primary.
    pub fn view_change(&mut self) -> View {
        self.view += 1;
        let n = self.nodes.len().max(1) as u64;
        let primary_index = (self.view % n) as usize;
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.view = self.view;
            node.role = if i == primary_index {
                PbftRole::Primary
            } else {
                PbftRole::Replica
            };
        }
        let primary = self.primary().map(|p| p.id.clone());
        tracing::info!(view = self.view, primary = ?primary, "pbft view change");
        self.ctx.log(
            "view_change",
            format!(
                "view {} begins with primary {}",
                self.view,
                primary.as_ref().map(|p| p.as_str()).unwrap_or("-")
            ),
            json!({ "view": self.view, "primary": primary }),
        );
        self.view
    }

    /// Mark a replica as faulty (it stops sending) or honest again.
    pub fn set_byzantine(&mut self, id: &NodeId, byzantine: bool) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        node.byzantine = byzantine;
        self.ctx.log(
            "byzantine_set",
            format!("{} is now {}", id, if byzantine { "faulty" } else { "honest" }),
            json!({ "node": id, "byzantine": byzantine }),
        );
        true
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

impl Simulation for PbftSimulation {
    type Payload = PbftMessage;
    type Stats = PbftStats;

    fn context(&self) -> &SimContext<PbftMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<PbftMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let (to, from) = (&message.to, &message.from);

        let local_view = self.nodes.get(to).map(|n| n.view).unwrap_or(0);
        if message.payload.view() != local_view {
            self.ctx.log(
                "view_mismatch",
                format!(
                    "{} ignores {} for view {} while in view {}",
                    to,
                    message.kind(),
                    message.payload.view(),
                    local_view
                ),
                json!({ "node": to, "kind": message.kind(), "view": message.payload.view() }),
            );
            return;
        }

        match message.payload.clone() {
            PbftMessage::PrePrepare {
                view,
                sequence,
                value,
            } => self.handle_pre_prepare(to, from, view, sequence, value),
            PbftMessage::Prepare { view, sequence } => self.handle_prepare(to, from, view, sequence),
            PbftMessage::Commit { view, sequence } => self.handle_commit(to, from, view, sequence),
        }
    }

    fn stats(&self) -> PbftStats {
        PbftStats {
            nodes: self.nodes.len(),
            faults_tolerated: self.faults_tolerated(),
            quorum: self.quorum(),
            view: self.view,
            primary: self.primary().map(|p| p.id.clone()).unwrap_or_else(|| NodeId::new("-")),
            requests: self.next_sequence as usize,
            executed: self
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.executed.len()))
                .collect(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.view = 0;
        self.next_sequence = 0;
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

    fn pbft(n: usize) -> PbftSimulation {
        PbftSimulation::new(PbftConfig { node_count: n })
    }

    #[test]
    fn test_fault_math() {
        let sim = pbft(4);
        assert_eq!(sim.faults_tolerated(), 1);
        assert_eq!(sim.quorum(), 3);
        assert_eq!(sim.primary().unwrap().id, id("R0"));
    }

    #[test]
    fn test_request_executes_everywhere() {
        let mut sim = pbft(4);
        assert_eq!(sim.client_request("op-1"), Some(1));
        sim.deliver_all();

        for node in sim.nodes() {
            assert_eq!(node.executed, vec![(1, "op-1".to_string())]);
            assert_eq!(node.phase_of(1), Some(RequestPhase::Executed));
        }
    }

    #[test]
    fn test_sequences_increase() {
        let mut sim = pbft(4);
        assert_eq!(sim.client_request("a"), Some(1));
        assert_eq!(sim.client_request("b"), Some(2));
        sim.deliver_all();
        for node in sim.nodes() {
            let order: Vec<_> = node.executed.iter().map(|(s, _)| *s).collect();
            assert_eq!(order.len(), 2);
            assert!(order.contains(&1) && order.contains(&2));
        }
    }

    #[test]
    fn test_execution_is_idempotent() {
        let mut sim = pbft(4);
        sim.client_request("a");
        sim.deliver_all();
        let executed = sim.events().iter().filter(|e| e.kind == "executed").count();
        assert_eq!(executed, 4);
        sim.deliver_all();
        assert_eq!(sim.events().iter().filter(|e| e.kind == "executed").count(), 4);
    }

    #[test]
    fn test_tolerates_one_faulty_replica() {
        let mut sim = pbft(4);
        sim.set_byzantine(&id("R3"), true);
        sim.client_request("a");
        sim.deliver_all();

        for name in ["R0", "R1", "R2"] {
            assert_eq!(sim.node(&id(name)).unwrap().executed.len(), 1);
        }
        assert!(sim.events().iter().any(|e| e.kind == "message_omitted"));
    }

    #[test]
    fn test_two_faults_block_progress() {
        let mut sim = pbft(4);
        sim.set_byzantine(&id("R2"), true);
        sim.set_byzantine(&id("R3"), true);
        sim.client_request("a");
        sim.deliver_all();
        assert!(sim.nodes().iter().all(|n| n.executed.is_empty()));
    }

    #[test]
    fn test_crashed_primary_then_view_change() {
        let mut sim = pbft(4);
        sim.fail_node(&id("R0"));
        assert_eq!(sim.client_request("a"), None);
        assert_eq!(sim.events().last().unwrap().kind, "request_failed");

        assert_eq!(sim.view_change(), 1);
        assert_eq!(sim.primary().unwrap().id, id("R1"));
        assert!(sim.node(&id("R1")).unwrap().is_primary());
        assert!(!sim.node(&id("R0")).unwrap().is_primary());

        assert!(sim.client_request("a").is_some());
        sim.deliver_all();
        for name in ["R1", "R2", "R3"] {
            assert_eq!(sim.node(&id(name)).unwrap().executed.len(), 1);
        }
    }

    #[test]
    fn test_old_view_messages_ignored() {
        let mut sim = pbft(4);
        sim.client_request("a");
        sim.view_change();
        sim.deliver_all();
        assert!(sim.nodes().iter().all(|n| n.executed.is_empty()));
        assert_eq!(sim.events().iter().filter(|e| e.kind == "view_mismatch").count(), 3);
    }

    #[test]
    fn test_reset() {
        let mut sim = pbft(4);
        sim.client_request("a");
        sim.view_change();
        sim.reset();
        assert_eq!(sim.view(), 0);
        assert_eq!(sim.stats().requests, 0);
        assert!(sim.messages().is_empty());
    }
}
