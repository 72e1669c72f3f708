//! Protolab Consensus Variants
//!
//! Three refinements of the basic consensus engines:
//! joint-configuration membership change, Multi-Paxos with a stable leader
//! that skips phase 1 for every slot after election, and EPaxos-style
//! leaderless commit with a fast and a slow path.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{SharedClock, SystemClock};
use crate::engine::{SimContext, Simulation};
use crate::event::{Event, EventLog};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::paxos::{proposal_number, AcceptedProposal, ProposalNumber};
use crate::topology::{majority, SimNode, Topology};
use protolab_common::config::{DeliveryConfig, PaxosConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// Joint Consensus
// =============================================================================

/// Configuration a member currently operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigPhase {
    Old,
    Joint,
    New,
}

/// A node taking part in a membership change.
#[derive(Debug, Clone, Serialize)]
pub struct MemberNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub phase: ConfigPhase,
    pub in_old: bool,
    pub in_new: bool,
}

impl MemberNode {
    /// False once a node has been retired by a finished change.
    pub fn is_member(&self) -> bool {
        self.in_old || self.in_new
    }
}

impl SimNode for MemberNode {
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

/// Summary of a membership change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointStats {
    pub in_transition: bool,
    pub old_config: Vec<NodeId>,
    pub new_config: Vec<NodeId>,
    pub changes: usize,
}

/// Membership change through an intermediate joint configuration in which
/// every decision needs a majority of both the old and the new member sets.
#[derive(Debug, Clone)]
pub struct JointConsensus {
    initial: Vec<NodeId>,
    nodes: Topology<MemberNode>,
    in_transition: bool,
    events: EventLog,
    clock: SharedClock,
}

impl JointConsensus {
    pub fn new(members: Vec<NodeId>) -> Self {
        Self {
            nodes: Self::build_nodes(&members),
            initial: members,
            in_transition: false,
            events: EventLog::new(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn build_nodes(members: &[NodeId]) -> Topology<MemberNode> {
        Topology::new(
            members
                .iter()
                .map(|id| MemberNode {
                    id: id.clone(),
                    status: NodeStatus::Healthy,
                    phase: ConfigPhase::Old,
                    in_old: true,
                    in_new: false,
                })
                .collect(),
        )
    }

    fn log(&mut self, kind: &str, description: String, data: serde_json::Value) {
        let now = self.clock.now_millis();
        self.events.record(now, kind, description, data);
    }

    pub fn nodes(&self) -> &[MemberNode] {
        self.nodes.as_slice()
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn in_transition(&self) -> bool {
        self.in_transition
    }

    pub fn old_config(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.in_old).map(|n| n.id.clone()).collect()
    }

    pub fn new_config(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.in_new).map(|n| n.id.clone()).collect()
    }

    /// Enter the joint configuration `old ∪ new`.
    pub fn begin_change(&mut self, new_members: &[NodeId]) -> bool {
        if self.in_transition {
            self.log(
                "change_rejected",
                "a membership change is already in progress".to_string(),
                json!({ "requested": new_members }),
            );
            return false;
        }
        if new_members.is_empty() {
            self.log(
                "change_rejected",
                "the new configuration must not be empty".to_string(),
                json!({ "requested": new_members }),
            );
            return false;
        }

        for id in new_members {
            if !self.nodes.contains(id) {
                self.nodes.insert(MemberNode {
                    id: id.clone(),
                    status: NodeStatus::Healthy,
                    phase: ConfigPhase::Old,
                    in_old: false,
                    in_new: false,
                });
            }
        }
        for node in self.nodes.iter_mut() {
            node.in_new = new_members.contains(&node.id);
            if node.is_member() {
                node.phase = ConfigPhase::Joint;
            }
        }
        self.in_transition = true;

        let old = self.old_config();
        let new = self.new_config();
        self.log(
            "joint_entered",
            format!("joint configuration of {} old and {} new members", old.len(), new.len()),
            json!({ "old": old, "new": new }),
        );
        true
    }

    /// True when `acks` holds a majority of every configuration in force.
    pub fn has_joint_quorum(&self, acks: &[NodeId]) -> bool {
        let count = |config: &[NodeId]| config.iter().filter(|id| acks.contains(id)).count();
        let old = self.old_config();
        let old_ok = count(&old) >= majority(old.len());
        if !self.in_transition {
            return old_ok;
        }
        let new = self.new_config();
        old_ok && count(&new) >= majority(new.len())
    }

    /// Acknowledgements from every healthy member.
    pub fn healthy_acks(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_member() && n.status.is_available())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Leave the joint configuration: new members switch to `New`, the rest
    /// are retired.
    pub fn finalize(&mut self) -> bool {
        if !self.in_transition {
            self.log(
                "finalize_rejected",
                "no membership change to finalize".to_string(),
                json!({}),
            );
            return false;
        }
        for node in self.nodes.iter_mut() {
            if node.in_new {
                node.phase = ConfigPhase::New;
                node.in_old = true;
            } else {
                node.phase = ConfigPhase::Old;
                node.in_old = false;
            }
            node.in_new = false;
        }
        self.in_transition = false;

        let members = self.old_config();
        tracing::info!(members = members.len(), "membership change finalized");
        self.log(
            "config_finalized",
            format!("new configuration of {} members in force", members.len()),
            json!({ "members": members }),
        );
        true
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }

    pub fn stats(&self) -> JointStats {
        JointStats {
            in_transition: self.in_transition,
            old_config: self.old_config(),
            new_config: self.new_config(),
            changes: self.events.count_of("config_finalized"),
        }
    }

    pub fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.initial);
        self.in_transition = false;
        self.events.clear();
    }
}

// =============================================================================
// Multi-Paxos
// =============================================================================

pub type Slot = u64;

/// Role of a Multi-Paxos node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiPaxosRole {
    Proposer,
    Acceptor,
}

/// A Multi-Paxos node. Acceptors keep one accepted proposal per slot.
#[derive(Debug, Clone, Serialize)]
pub struct MultiPaxosNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub role: MultiPaxosRole,
    pub index: usize,
    pub round: u64,
    pub promised: ProposalNumber,
    pub accepted: BTreeMap<Slot, AcceptedProposal>,
}

impl SimNode for MultiPaxosNode {
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

/// Every message the Multi-Paxos simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MultiPaxosMessage {
    Prepare {
        ballot: ProposalNumber,
    },
    Promise {
        ballot: ProposalNumber,
        accepted: BTreeMap<Slot, AcceptedProposal>,
    },
    Nack {
        ballot: ProposalNumber,
        promised: ProposalNumber,
    },
    Accept {
        ballot: ProposalNumber,
        slot: Slot,
        value: String,
    },
    Accepted {
        ballot: ProposalNumber,
        slot: Slot,
    },
}

impl Payload for MultiPaxosMessage {
    fn kind(&self) -> &'static str {
        match self {
            MultiPaxosMessage::Prepare { .. } => "Prepare",
            MultiPaxosMessage::Promise { .. } => "Promise",
            MultiPaxosMessage::Nack { .. } => "Nack",
            MultiPaxosMessage::Accept { .. } => "Accept",
            MultiPaxosMessage::Accepted { .. } => "Accepted",
        }
    }
}

/// The leader's view of its own leadership.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Leadership {
    pub proposer: Option<NodeId>,
    pub ballot: ProposalNumber,
    pub established: bool,
    pub promises: BTreeMap<NodeId, BTreeMap<Slot, AcceptedProposal>>,
    pub next_slot: Slot,
    pub proposals: BTreeMap<Slot, String>,
    pub acks: BTreeMap<Slot, BTreeSet<NodeId>>,
}

/// Summary of a Multi-Paxos run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPaxosStats {
    pub leader: Option<NodeId>,
    pub ballot: ProposalNumber,
    pub established: bool,
    pub chosen: usize,
    pub prepares_sent: usize,
    pub messages: MessageCounts,
}

/// Multi-Paxos: one phase 1 per leadership, then one phase 2 per slot.
#[derive(Debug, Clone)]
pub struct MultiPaxos {
    config: PaxosConfig,
    nodes: Topology<MultiPaxosNode>,
    leadership: Leadership,
    chosen: BTreeMap<Slot, String>,
    ctx: SimContext<MultiPaxosMessage>,
}

impl MultiPaxos {
    pub fn new(config: PaxosConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            leadership: Leadership::default(),
            chosen: BTreeMap::new(),
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

    fn build_nodes(config: &PaxosConfig) -> Topology<MultiPaxosNode> {
        let node = |id: NodeId, role: MultiPaxosRole, index: usize| MultiPaxosNode {
            id,
            status: NodeStatus::Healthy,
            role,
            index,
            round: 0,
            promised: 0,
            accepted: BTreeMap::new(),
        };
        let proposers = node_ids("P", config.proposers)
            .into_iter()
            .enumerate()
            .map(|(i, id)| node(id, MultiPaxosRole::Proposer, i));
        let acceptors = node_ids("A", config.acceptors)
            .into_iter()
            .enumerate()
            .map(|(i, id)| node(id, MultiPaxosRole::Acceptor, i));
        Topology::new(proposers.chain(acceptors).collect())
    }

    pub fn nodes(&self) -> &[MultiPaxosNode] {
        self.nodes.as_slice()
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// Values chosen so far, by slot. A chosen slot never changes.
    pub fn chosen(&self) -> &BTreeMap<Slot, String> {
        &self.chosen
    }

    fn acceptor_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.role == MultiPaxosRole::Acceptor)
            .map(|n| n.id.clone())
            .collect()
    }

    fn quorum(&self) -> usize {
        majority(self.config.acceptors)
    }

    /// Run phase 1 once on behalf of every future slot.
    pub fn elect_leader(&mut self, proposer: &NodeId) -> Option<ProposalNumber> {
        let healthy = self.nodes.is_healthy(proposer);
        let ballot = match self.nodes.get_mut(proposer) {
            Some(node) if healthy && node.role == MultiPaxosRole::Proposer => {
                let seen_round = self.leadership.ballot / crate::paxos::ROUND_STRIDE;
                node.round = (node.round + 1).max(seen_round + 1);
                proposal_number(node.round, node.index)
            }
            _ => {
                self.ctx.log(
                    "election_failed",
                    format!("{} cannot lead", proposer),
                    json!({ "proposer": proposer }),
                );
                return None;
            }
        };

        self.leadership = Leadership {
            proposer: Some(proposer.clone()),
            ballot,
            next_slot: self.chosen.keys().next_back().map(|s| s + 1).unwrap_or(1),
            ..Default::default()
        };
        self.ctx.log(
            "leader_prepare",
            format!("{} runs phase 1 with ballot {}", proposer, ballot),
            json!({ "proposer": proposer, "ballot": ballot }),
        );
        let acceptors = self.acceptor_ids();
        self.ctx.broadcast(proposer, &acceptors, MultiPaxosMessage::Prepare { ballot });
        Some(ballot)
    }

    /// Append a value at the next slot, skipping phase 1.
    pub fn append(&mut self, value: impl Into<String>) -> Option<Slot> {
        let value = value.into();
        let leader = match &self.leadership.proposer {
            Some(id) if self.leadership.established && self.nodes.is_healthy(id) => id.clone(),
            _ => {
                self.ctx.log(
                    "append_failed",
                    format!("no established leader for '{}'", value),
                    json!({ "value": value }),
                );
                return None;
            }
        };
        let slot = self.leadership.next_slot;
        self.leadership.next_slot += 1;
        self.send_accepts(&leader, slot, value.clone());
        self.ctx.log(
            "slot_proposed",
            format!("{} proposes '{}' for slot {}", leader, value, slot),
            json!({ "leader": leader, "slot": slot, "value": value, "ballot": self.leadership.ballot }),
        );
        Some(slot)
    }

    fn send_accepts(&mut self, leader: &NodeId, slot: Slot, value: String) {
        let ballot = self.leadership.ballot;
        self.leadership.proposals.insert(slot, value.clone());
        self.leadership.acks.remove(&slot);
        let acceptors = self.acceptor_ids();
        self.ctx.broadcast(leader, &acceptors, MultiPaxosMessage::Accept { ballot, slot, value });
    }

    fn handle_prepare(&mut self, acceptor: &NodeId, proposer: &NodeId, ballot: ProposalNumber) {
        let Some(node) = self.nodes.get_mut(acceptor) else {
            return;
        };
        if ballot > node.promised {
            node.promised = ballot;
            let accepted = node.accepted.clone();
            self.ctx.log(
                "promise_made",
                format!("{} promises ballot {}", acceptor, ballot),
                json!({ "acceptor": acceptor, "ballot": ballot }),
            );
            self.ctx.send(acceptor, proposer, MultiPaxosMessage::Promise { ballot, accepted });
        } else {
            let promised = node.promised;
            self.ctx.send(acceptor, proposer, MultiPaxosMessage::Nack { ballot, promised });
        }
    }

    fn handle_promise(
        &mut self,
        proposer: &NodeId,
        acceptor: &NodeId,
        ballot: ProposalNumber,
        accepted: BTreeMap<Slot, AcceptedProposal>,
    ) {
        let quorum = self.quorum();
        let lead = &mut self.leadership;
        if lead.proposer.as_ref() != Some(proposer) || lead.ballot != ballot || lead.established {
            return;
        }
        lead.promises.insert(acceptor.clone(), accepted);
        if lead.promises.len() < quorum {
            return;
        }
        lead.established = true;

        // Slots some acceptor already accepted are finished under the new
        // ballot with the highest-numbered value reported.
        let mut recovered: BTreeMap<Slot, AcceptedProposal> = BTreeMap::new();
        for slots in lead.promises.values() {
            for (slot, proposal) in slots {
                let keep = recovered.get(slot).map(|p| p.number >= proposal.number).unwrap_or(false);
                if !keep {
                    recovered.insert(*slot, proposal.clone());
                }
            }
        }
        if let Some(max_slot) = recovered.keys().next_back() {
            lead.next_slot = lead.next_slot.max(max_slot + 1);
        }

        tracing::info!(leader = %proposer, ballot, "multi-paxos leader established");
        self.ctx.log(
            "leader_established",
            format!("{} leads with ballot {}", proposer, ballot),
            json!({ "leader": proposer, "ballot": ballot, "recovered": recovered.len() }),
        );
        for (slot, proposal) in recovered {
            if !self.chosen.contains_key(&slot) || self.chosen.get(&slot) == Some(&proposal.value) {
                self.send_accepts(proposer, slot, proposal.value);
            }
        }
    }

    fn handle_nack(&mut self, proposer: &NodeId, ballot: ProposalNumber, promised: ProposalNumber) {
        if self.leadership.proposer.as_ref() == Some(proposer) && self.leadership.ballot == ballot {
            self.leadership.established = false;
            self.ctx.log(
                "leader_preempted",
                format!("{} is preempted by ballot {}", proposer, promised),
                json!({ "proposer": proposer, "ballot": ballot, "promised": promised }),
            );
        }
    }

    fn handle_accept(
        &mut self,
        acceptor: &NodeId,
        leader: &NodeId,
        ballot: ProposalNumber,
        slot: Slot,
        value: String,
    ) {
        let Some(node) = self.nodes.get_mut(acceptor) else {
            return;
        };
        if ballot < node.promised {
            let promised = node.promised;
            self.ctx.send(acceptor, leader, MultiPaxosMessage::Nack { ballot, promised });
            return;
        }
        node.promised = ballot;
        node.accepted.insert(
            slot,
            AcceptedProposal {
                number: ballot,
                value: value.clone(),
            },
        );
        self.ctx.log(
            "slot_accepted",
            format!("{} accepts '{}' for slot {}", acceptor, value, slot),
            json!({ "acceptor": acceptor, "slot": slot, "ballot": ballot }),
        );
        self.ctx.send(acceptor, leader, MultiPaxosMessage::Accepted { ballot, slot });
    }

    fn handle_accepted(&mut self, acceptor: &NodeId, ballot: ProposalNumber, slot: Slot) {
        if ballot != self.leadership.ballot || self.chosen.contains_key(&slot) {
            return;
        }
        let quorum = self.quorum();
        let acks = self.leadership.acks.entry(slot).or_default();
        acks.insert(acceptor.clone());
        if acks.len() < quorum {
            return;
        }
        let Some(value) = self.leadership.proposals.get(&slot).cloned() else {
            return;
        };
        self.ctx.log(
            "slot_chosen",
            format!("slot {} is chosen as '{}'", slot, value),
            json!({ "slot": slot, "value": value, "ballot": ballot }),
        );
        self.chosen.insert(slot, value);
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }
}

impl Simulation for MultiPaxos {
    type Payload = MultiPaxosMessage;
    type Stats = MultiPaxosStats;

    fn context(&self) -> &SimContext<MultiPaxosMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<MultiPaxosMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let (to, from) = (&message.to, &message.from);
        match message.payload.clone() {
            MultiPaxosMessage::Prepare { ballot } => self.handle_prepare(to, from, ballot),
            MultiPaxosMessage::Promise { ballot, accepted } => {
                self.handle_promise(to, from, ballot, accepted)
            }
            MultiPaxosMessage::Nack { ballot, promised } => self.handle_nack(to, ballot, promised),
            MultiPaxosMessage::Accept {
                ballot,
                slot,
                value,
            } => self.handle_accept(to, from, ballot, slot, value),
            MultiPaxosMessage::Accepted { ballot, slot } => self.handle_accepted(from, ballot, slot),
        }
    }

    fn stats(&self) -> MultiPaxosStats {
        MultiPaxosStats {
            leader: self
                .leadership
                .proposer
                .clone()
                .filter(|_| self.leadership.established),
            ballot: self.leadership.ballot,
            established: self.leadership.established,
            chosen: self.chosen.len(),
            prepares_sent: self.ctx.events.count_of("leader_prepare"),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.leadership = Leadership::default();
        self.chosen.clear();
        self.ctx.clear();
    }
}

// =============================================================================
// EPaxos
// =============================================================================

/// Identity of an EPaxos instance: owning replica and its local sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub replica: NodeId,
    pub sequence: u64,
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.replica, self.sequence)
    }
}

/// Commit progress of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    PreAccepted,
    Committed,
}

/// A command together with the instances it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub command: String,
    pub deps: Vec<InstanceId>,
    pub status: InstanceStatus,
    pub fast_path: bool,
}

/// An EPaxos replica; any replica may lead its own instances.
#[derive(Debug, Clone, Serialize)]
pub struct EPaxosReplica {
    pub id: NodeId,
    pub status: NodeStatus,
    pub next_sequence: u64,
    pub instances: BTreeMap<InstanceId, Instance>,
}

impl SimNode for EPaxosReplica {
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

/// Every message the EPaxos simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EPaxosMessage {
    PreAccept { instance: Instance },
    Commit { instance: Instance },
}

impl Payload for EPaxosMessage {
    fn kind(&self) -> &'static str {
        match self {
            EPaxosMessage::PreAccept { .. } => "PreAccept",
            EPaxosMessage::Commit { .. } => "Commit",
        }
    }
}

/// Summary of an EPaxos run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EPaxosStats {
    pub replicas: usize,
    pub fast_quorum: usize,
    pub slow_quorum: usize,
    pub fast_commits: usize,
    pub slow_commits: usize,
    pub pending: usize,
    pub messages: MessageCounts,
}

/// Leaderless commit. Whether an instance takes the fast path is decided by
/// the caller; dependencies are supplied by the caller as well.
#[derive(Debug, Clone)]
pub struct EPaxos {
    replica_count: usize,
    nodes: Topology<EPaxosReplica>,
    ctx: SimContext<EPaxosMessage>,
}

impl EPaxos {
    pub fn new(replica_count: usize) -> Self {
        Self {
            nodes: Self::build_nodes(replica_count),
            replica_count,
            ctx: SimContext::default(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.ctx.set_clock(clock);
        self
    }

    fn build_nodes(count: usize) -> Topology<EPaxosReplica> {
        Topology::new(
            node_ids("E", count)
                .into_iter()
                .map(|id| EPaxosReplica {
                    id,
                    status: NodeStatus::Healthy,
                    next_sequence: 0,
                    instances: BTreeMap::new(),
                })
                .collect(),
        )
    }

    pub fn replicas(&self) -> &[EPaxosReplica] {
        self.nodes.as_slice()
    }

    /// `F + floor((F + 1) / 2)` replicas besides the leader for `N = 2F + 1`.
    pub fn fast_quorum(&self) -> usize {
        let f = self.replica_count / 2;
        f + (f + 1) / 2
    }

    pub fn slow_quorum(&self) -> usize {
        majority(self.replica_count)
    }

    /// The leader's copy of an instance.
    pub fn instance(&self, id: &InstanceId) -> Option<&Instance> {
        self.nodes.get(&id.replica).and_then(|r| r.instances.get(id))
    }

    /// Instances still waiting on the slow path.
    pub fn pending(&self) -> Vec<InstanceId> {
        self.nodes
            .iter()
            .flat_map(|r| r.instances.values().filter(move |i| i.id.replica == r.id))
            .filter(|i| i.status == InstanceStatus::PreAccepted)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Create an instance led by `replica`.
    pub fn propose(
        &mut self,
        replica: &NodeId,
        command: impl Into<String>,
        deps: Vec<InstanceId>,
        fast_path: bool,
    ) -> Option<InstanceId> {
        let command = command.into();
        let healthy = self.nodes.is_healthy(replica);
        let Some(node) = self.nodes.get_mut(replica).filter(|_| healthy) else {
            self.ctx.log(
                "propose_failed",
                format!("{} cannot lead '{}'", replica, command),
                json!({ "replica": replica, "command": command }),
            );
            return None;
        };
        node.next_sequence += 1;
        let id = InstanceId {
            replica: replica.clone(),
            sequence: node.next_sequence,
        };
        let mut instance = Instance {
            id: id.clone(),
            command: command.clone(),
            deps,
            status: InstanceStatus::PreAccepted,
            fast_path,
        };
        if fast_path {
            instance.status = InstanceStatus::Committed;
        }
        node.instances.insert(id.clone(), instance.clone());

        let peers = self.nodes.peers_of(replica);
        if fast_path {
            let quorum = self.fast_quorum();
            self.ctx.log(
                "fast_commit",
                format!("{} commits '{}' on the fast path", id, command),
                json!({ "instance": id, "command": command, "fast_quorum": quorum }),
            );
            self.ctx.broadcast(replica, &peers, EPaxosMessage::Commit { instance });
        } else {
            self.ctx.log(
                "pre_accepted",
                format!("{} pre-accepts '{}' and awaits the slow path", id, command),
                json!({ "instance": id, "command": command, "deps": instance.deps }),
            );
            self.ctx.broadcast(replica, &peers, EPaxosMessage::PreAccept { instance });
        }
        Some(id)
    }

    /// Finish a pending instance through the slow path.
    pub fn commit_slow(&mut self, id: &InstanceId) -> bool {
        let healthy = self.nodes.is_healthy(&id.replica);
        let instance = match self.nodes.get_mut(&id.replica).and_then(|r| r.instances.get_mut(id)) {
            Some(instance) if healthy && instance.status == InstanceStatus::PreAccepted => {
                instance.status = InstanceStatus::Committed;
                instance.clone()
            }
            _ => {
                self.ctx.log(
                    "commit_failed",
                    format!("{} has nothing to commit", id),
                    json!({ "instance": id }),
                );
                return false;
            }
        };
        let quorum = self.slow_quorum();
        self.ctx.log(
            "slow_commit",
            format!("{} commits '{}' after the accept round", id, instance.command),
            json!({ "instance": id, "slow_quorum": quorum }),
        );
        let peers = self.nodes.peers_of(&id.replica);
        self.ctx.broadcast(&id.replica, &peers, EPaxosMessage::Commit { instance });
        true
    }

    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        if !self.nodes.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("node_failed", format!("{} fails", id), json!({ "node": id }));
        true
    }
}

impl Simulation for EPaxos {
    type Payload = EPaxosMessage;
    type Stats = EPaxosStats;

    fn context(&self) -> &SimContext<EPaxosMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<EPaxosMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let Some(replica) = self.nodes.get_mut(&message.to) else {
            return;
        };
        match message.payload {
            EPaxosMessage::PreAccept { instance } => {
                let known = replica.instances.entry(instance.id.clone()).or_insert(instance);
                let id = known.id.clone();
                self.ctx.log(
                    "pre_accept_received",
                    format!("{} records {}", message.to, id),
                    json!({ "replica": message.to, "instance": id }),
                );
            }
            EPaxosMessage::Commit { instance } => {
                let id = instance.id.clone();
                replica.instances.insert(id.clone(), instance);
                self.ctx.log(
                    "commit_received",
                    format!("{} learns {} is committed", message.to, id),
                    json!({ "replica": message.to, "instance": id }),
                );
            }
        }
    }

    fn stats(&self) -> EPaxosStats {
        EPaxosStats {
            replicas: self.replica_count,
            fast_quorum: self.fast_quorum(),
            slow_quorum: self.slow_quorum(),
            fast_commits: self.ctx.events.count_of("fast_commit"),
            slow_commits: self.ctx.events.count_of("slow_commit"),
            pending: self.pending().len(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(self.replica_count);
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

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| id(n)).collect()
    }

    #[test]
    fn test_joint_change_lifecycle() {
        let mut joint = JointConsensus::new(ids(&["a", "b", "c"]));
        assert!(joint.begin_change(&ids(&["c", "d", "e"])));
        assert!(joint.in_transition());
        assert_eq!(joint.nodes().len(), 5);
        assert!(joint.nodes().iter().all(|n| n.phase == ConfigPhase::Joint));
        assert!(!joint.begin_change(&ids(&["a"])));

        assert!(joint.finalize());
        let phases: Vec<_> = joint.nodes().iter().map(|n| (n.id.as_str().to_string(), n.phase)).collect();
        assert!(phases.contains(&("a".to_string(), ConfigPhase::Old)));
        assert!(phases.contains(&("d".to_string(), ConfigPhase::New)));
        assert_eq!(joint.old_config(), ids(&["c", "d", "e"]));
        assert!(!joint.nodes()[0].is_member());
        assert!(!joint.finalize());
    }

    #[test]
    fn test_joint_quorum_needs_both_majorities() {
        let mut joint = JointConsensus::new(ids(&["a", "b", "c"]));
        joint.begin_change(&ids(&["c", "d", "e"]));

        // Old majority only.
        assert!(!joint.has_joint_quorum(&ids(&["a", "b"])));
        // New majority only.
        assert!(!joint.has_joint_quorum(&ids(&["d", "e"])));
        // Both.
        assert!(joint.has_joint_quorum(&ids(&["a", "c", "d"])));
    }

    #[test]
    fn test_joint_quorum_outside_transition() {
        let mut joint = JointConsensus::new(ids(&["a", "b", "c"]));
        assert!(joint.has_joint_quorum(&ids(&["a", "b"])));
        joint.fail_node(&id("a"));
        joint.fail_node(&id("b"));
        assert!(!joint.has_joint_quorum(&joint.healthy_acks()));
    }

    fn multi() -> MultiPaxos {
        MultiPaxos::new(PaxosConfig::default())
    }

    #[test]
    fn test_multi_paxos_skips_phase_one() {
        let mut mp = multi();
        assert_eq!(mp.elect_leader(&id("P0")), Some(10));
        mp.deliver_all();
        assert!(mp.leadership().established);

        let prepares_before = mp.messages().iter().filter(|m| m.kind() == "Prepare").count();
        assert_eq!(mp.append("a"), Some(1));
        assert_eq!(mp.append("b"), Some(2));
        mp.deliver_all();
        let prepares_after = mp.messages().iter().filter(|m| m.kind() == "Prepare").count();

        assert_eq!(prepares_before, prepares_after);
        assert_eq!(mp.chosen().get(&1).map(String::as_str), Some("a"));
        assert_eq!(mp.chosen().get(&2).map(String::as_str), Some("b"));
    }

    #[test]
    fn test_multi_paxos_append_requires_leader() {
        let mut mp = multi();
        assert_eq!(mp.append("a"), None);
        mp.elect_leader(&id("P0"));
        // Promises not yet delivered.
        assert_eq!(mp.append("a"), None);
    }

    #[test]
    fn test_multi_paxos_new_leader_keeps_chosen() {
        let mut mp = multi();
        mp.elect_leader(&id("P0"));
        mp.deliver_all();
        mp.append("a");
        mp.deliver_all();

        assert_eq!(mp.elect_leader(&id("P1")), Some(21));
        mp.deliver_all();
        assert!(mp.leadership().established);
        assert_eq!(mp.append("b"), Some(2));
        mp.deliver_all();
        assert_eq!(mp.chosen().get(&1).map(String::as_str), Some("a"));
        assert_eq!(mp.chosen().get(&2).map(String::as_str), Some("b"));
    }

    #[test]
    fn test_multi_paxos_old_leader_preempted() {
        let mut mp = multi();
        mp.elect_leader(&id("P0"));
        mp.deliver_all();
        let mut rival = mp.clone();
        rival.elect_leader(&id("P1"));
        rival.deliver_all();
        assert_eq!(rival.leadership().proposer, Some(id("P1")));
        assert!(mp.leadership().established);
    }

    #[test]
    fn test_epaxos_paths() {
        let mut ep = EPaxos::new(5);
        assert_eq!(ep.fast_quorum(), 3);
        assert_eq!(ep.slow_quorum(), 3);

        let fast = ep.propose(&id("E0"), "x=1", vec![], true).unwrap();
        assert_eq!(ep.instance(&fast).unwrap().status, InstanceStatus::Committed);

        let slow = ep.propose(&id("E1"), "x=2", vec![fast.clone()], false).unwrap();
        assert_eq!(ep.instance(&slow).unwrap().status, InstanceStatus::PreAccepted);
        assert_eq!(ep.pending(), vec![slow.clone()]);

        assert!(ep.commit_slow(&slow));
        assert!(!ep.commit_slow(&slow));
        assert!(ep.pending().is_empty());
        ep.deliver_all();

        for replica in ep.replicas() {
            assert_eq!(replica.instances.len(), 2);
            assert!(replica.instances.values().all(|i| i.status == InstanceStatus::Committed));
        }
        assert_eq!(ep.instance(&slow).unwrap().deps, vec![fast]);
        let stats = ep.stats();
        assert_eq!((stats.fast_commits, stats.slow_commits), (1, 1));
    }

    #[test]
    fn test_epaxos_failed_replica() {
        let mut ep = EPaxos::new(3);
        ep.fail_node(&id("E2"));
        assert!(ep.propose(&id("E2"), "x", vec![], true).is_none());
        let inst = ep.propose(&id("E0"), "y", vec![], true).unwrap();
        assert_eq!(inst.to_string(), "E0.1");
    }
}
