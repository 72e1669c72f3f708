//! Protolab Network Partitions
//!
//! Leader election across a partitioned network. Nodes are grouped into
//! partitions; links between partitions are down and messages sent over them
//! fail. Depending on the quorum rule, each side may elect its own leader,
//! which is the split-brain condition. Healing reconnects the network and
//! keeps only the leader with the highest term.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::raft::{NodeRole, Term};
use crate::topology::{majority, SimNode, Topology};
use protolab_common::config::{DeliveryConfig, PartitionConfig};
use protolab_common::types::QuorumScope;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

// =============================================================================
// Nodes and Messages
// =============================================================================

pub type PartitionId = usize;

#[derive(Debug, Clone, Serialize)]
pub struct PartitionNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub partition: PartitionId,
    pub term: Term,
    pub role: NodeRole,
    pub voted_for: Option<NodeId>,
    pub votes: BTreeSet<NodeId>,
    pub leader_id: Option<NodeId>,
    /// Client writes this node accepted while leading.
    pub writes: Vec<String>,
}

impl PartitionNode {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Healthy,
            partition: 0,
            term: 0,
            role: NodeRole::Follower,
            voted_for: None,
            votes: BTreeSet::new(),
            leader_id: None,
            writes: Vec::new(),
        }
    }

    fn observe_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.role = NodeRole::Follower;
            self.voted_for = None;
            self.votes.clear();
        }
    }
}

impl SimNode for PartitionNode {
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

/// Every message the partition simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PartitionMessage {
    RequestVote { term: Term },
    Vote { term: Term, granted: bool },
    Heartbeat { term: Term },
}

impl Payload for PartitionMessage {
    fn kind(&self) -> &'static str {
        match self {
            PartitionMessage::RequestVote { .. } => "RequestVote",
            PartitionMessage::Vote { .. } => "Vote",
            PartitionMessage::Heartbeat { .. } => "Heartbeat",
        }
    }
}

/// Result of reconnecting the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
    pub leader: Option<NodeId>,
    pub term: Term,
    pub stepped_down: Vec<NodeId>,
    pub discarded_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub nodes: usize,
    pub partitions: usize,
    pub quorum: QuorumScope,
    pub leaders: Vec<(NodeId, Term)>,
    pub split_brain: bool,
    pub elections: usize,
    pub dropped_messages: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Partition Simulation
// =============================================================================

#[derive(Debug, Clone)]
pub struct PartitionSimulation {
    config: PartitionConfig,
    nodes: Topology<PartitionNode>,
    ctx: SimContext<PartitionMessage>,
}

impl PartitionSimulation {
    pub fn new(config: PartitionConfig) -> Self {
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

    fn build_nodes(config: &PartitionConfig) -> Topology<PartitionNode> {
        Topology::new(node_ids("N", config.node_count).into_iter().map(PartitionNode::new).collect())
    }

    pub fn nodes(&self) -> &[PartitionNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&PartitionNode> {
        self.nodes.get(id)
    }

    /// True when both nodes exist and share a partition.
    pub fn can_reach(&self, a: &NodeId, b: &NodeId) -> bool {
        match (self.nodes.get(a), self.nodes.get(b)) {
            (Some(x), Some(y)) => x.partition == y.partition,
            _ => false,
        }
    }

    fn partition_members(&self, id: &NodeId) -> Vec<NodeId> {
        let Some(partition) = self.nodes.get(id).map(|n| n.partition) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|n| n.partition == partition)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn partition_count(&self) -> usize {
        self.nodes.iter().map(|n| n.partition).collect::<BTreeSet<_>>().len()
    }

    /// Split the network. Nodes missing from `groups` share one extra
    /// partition.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) -> bool {
        if groups.iter().flatten().any(|id| !self.nodes.contains(id)) {
            self.ctx.log(
                "partition_failed",
                "partition names an unknown node",
                json!({ "groups": groups }),
            );
            return false;
        }
        let rest = groups.len();
        for node in self.nodes.iter_mut() {
            node.partition = groups.iter().position(|g| g.contains(&node.id)).unwrap_or(rest);
        }
        tracing::info!(partitions = self.partition_count(), "network partitioned");
        self.ctx.log(
            "partitioned",
            format!("network split into {} partitions", self.partition_count()),
            json!({ "groups": groups }),
        );
        true
    }

    fn quorum_for(&self, candidate: &NodeId) -> usize {
        match self.config.quorum {
            QuorumScope::PartitionMajority => majority(self.partition_members(candidate).len()),
            QuorumScope::ClusterMajority => majority(self.nodes.len()),
        }
    }

    pub fn start_election(&mut self, candidate: &NodeId) -> bool {
        let healthy = self.nodes.is_healthy(candidate);
        let Some(node) = self.nodes.get_mut(candidate).filter(|_| healthy) else {
            self.ctx.log(
                "election_failed",
                format!("{} cannot start an election", candidate),
                json!({ "candidate": candidate }),
            );
            return false;
        };
        node.term += 1;
        node.role = NodeRole::Candidate;
        node.voted_for = Some(candidate.clone());
        node.votes = BTreeSet::from([candidate.clone()]);
        node.leader_id = None;
        let term = node.term;

        let reachable: Vec<NodeId> = self
            .partition_members(candidate)
            .into_iter()
            .filter(|id| id != candidate)
            .collect();
        self.ctx.log(
            "election_started",
            format!("{} starts an election for term {} reaching {} peers", candidate, term, reachable.len()),
            json!({ "candidate": candidate, "term": term, "reachable": reachable }),
        );
        self.ctx.broadcast(candidate, &reachable, PartitionMessage::RequestVote { term });
        self.maybe_become_leader(candidate, term);
        true
    }

    fn maybe_become_leader(&mut self, candidate: &NodeId, term: Term) -> bool {
        let needed = self.quorum_for(candidate);
        let Some(node) = self.nodes.get_mut(candidate) else {
            return false;
        };
        if node.role != NodeRole::Candidate || node.term != term || node.votes.len() < needed {
            return false;
        }
        node.role = NodeRole::Leader;
        node.leader_id = Some(candidate.clone());
        let partition = node.partition;

        tracing::info!(leader = %candidate, term, partition, "partition leader elected");
        self.ctx.log(
            "leader_elected",
            format!("{} leads partition {} in term {}", candidate, partition, term),
            json!({ "leader": candidate, "term": term, "partition": partition }),
        );
        let followers: Vec<NodeId> = self
            .partition_members(candidate)
            .into_iter()
            .filter(|id| id != candidate)
            .collect();
        self.ctx.broadcast(candidate, &followers, PartitionMessage::Heartbeat { term });
        true
    }

    /// Healthy leaders with their terms.
    pub fn leaders(&self) -> Vec<(NodeId, Term)> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Leader && n.status.is_available())
            .map(|n| (n.id.clone(), n.term))
            .collect()
    }

    pub fn is_split_brain(&self) -> bool {
        self.leaders().len() > 1
    }

    /// Accept a client write at a node that believes it is leader.
    pub fn client_write(&mut self, leader: &NodeId, value: &str) -> bool {
        let healthy = self.nodes.is_healthy(leader);
        let Some(node) = self.nodes.get_mut(leader).filter(|n| healthy && n.role == NodeRole::Leader) else {
            self.ctx.log(
                "write_failed",
                format!("{} is not a leader", leader),
                json!({ "node": leader, "value": value }),
            );
            return false;
        };
        node.writes.push(value.to_string());
        let term = node.term;
        self.ctx.log(
            "write_accepted",
            format!("{} accepts '{}' in term {}", leader, value, term),
            json!({ "node": leader, "value": value, "term": term }),
        );
        true
    }

    /// Reconnect every node. Leaders other than the one with the highest
    /// term step down and lose the writes they accepted.
    pub fn heal(&mut self) -> HealReport {
        for node in self.nodes.iter_mut() {
            node.partition = 0;
        }
        let winner = self
            .leaders()
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
        let top_term = self.nodes.iter().map(|n| n.term).max().unwrap_or(0);
        let winner_writes = winner
            .as_ref()
            .and_then(|(id, _)| self.nodes.get(id))
            .map(|n| n.writes.clone())
            .unwrap_or_default();

        let mut stepped_down = Vec::new();
        let mut discarded_writes = 0;
        for node in self.nodes.iter_mut() {
            let is_winner = winner.as_ref().map(|(id, _)| id == &node.id).unwrap_or(false);
            if is_winner {
                continue;
            }
            if node.role == NodeRole::Leader {
                stepped_down.push(node.id.clone());
                discarded_writes += node.writes.iter().filter(|w| !winner_writes.contains(w)).count();
            }
            node.role = NodeRole::Follower;
            node.votes.clear();
            node.term = node.term.max(winner.as_ref().map(|(_, t)| *t).unwrap_or(top_term));
            node.leader_id = winner.as_ref().map(|(id, _)| id.clone());
            node.writes = winner_writes.clone();
        }

        let report = HealReport {
            leader: winner.as_ref().map(|(id, _)| id.clone()),
            term: winner.map(|(_, t)| t).unwrap_or(top_term),
            stepped_down,
            discarded_writes,
        };
        tracing::info!(leader = ?report.leader, stepped_down = report.stepped_down.len(), "network healed");
        self.ctx.log(
            "healed",
            format!(
                "network healed; {} stepped down, {} writes discarded",
                report.stepped_down.len(),
                report.discarded_writes
            ),
            json!({ "report": report }),
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

    fn handle_request_vote(&mut self, voter: &NodeId, candidate: &NodeId, term: Term) {
        let Some(node) = self.nodes.get_mut(voter) else {
            return;
        };
        node.observe_term(term);
        let granted = term == node.term && node.voted_for.as_ref().map(|v| v == candidate).unwrap_or(true);
        if granted {
            node.voted_for = Some(candidate.clone());
        }
        let current = node.term;
        self.ctx.send(voter, candidate, PartitionMessage::Vote { term: current, granted });
    }

    fn handle_vote(&mut self, candidate: &NodeId, voter: &NodeId, term: Term, granted: bool) {
        let Some(node) = self.nodes.get_mut(candidate) else {
            return;
        };
        if term > node.term {
            node.observe_term(term);
            return;
        }
        if !granted || term != node.term || node.role != NodeRole::Candidate {
            return;
        }
        node.votes.insert(voter.clone());
        self.maybe_become_leader(candidate, term);
    }

    fn handle_heartbeat(&mut self, follower: &NodeId, leader: &NodeId, term: Term) {
        let Some(node) = self.nodes.get_mut(follower) else {
            return;
        };
        if term < node.term {
            return;
        }
        node.observe_term(term);
        node.role = NodeRole::Follower;
        node.leader_id = Some(leader.clone());
    }
}

impl Simulation for PartitionSimulation {
    type Payload = PartitionMessage;
    type Stats = PartitionStats;

    fn context(&self) -> &SimContext<PartitionMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<PartitionMessage> {
        &mut self.ctx
    }

    /// Messages across a down link fail like messages to a crashed node.
    fn deliver(&mut self, id: MessageId) {
        let Some(from) = self.ctx.network.get(id).map(|m| m.from.clone()) else {
            return;
        };
        let reachable: BTreeSet<NodeId> = self
            .partition_members(&from)
            .into_iter()
            .filter(|n| self.nodes.is_healthy(n))
            .collect();
        let message = match self.ctx.begin_delivery(id, |to| reachable.contains(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        match message.payload {
            PartitionMessage::RequestVote { term } => self.handle_request_vote(&message.to, &message.from, term),
            PartitionMessage::Vote { term, granted } => {
                self.handle_vote(&message.to, &message.from, term, granted)
            }
            PartitionMessage::Heartbeat { term } => self.handle_heartbeat(&message.to, &message.from, term),
        }
    }

    fn stats(&self) -> PartitionStats {
        PartitionStats {
            nodes: self.nodes.len(),
            partitions: self.partition_count(),
            quorum: self.config.quorum,
            leaders: self.leaders(),
            split_brain: self.is_split_brain(),
            elections: self.ctx.events.count_of("election_started"),
            dropped_messages: self.ctx.network.status_counts().failed,
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

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| id(n)).collect()
    }

    fn split(scope: QuorumScope) -> PartitionSimulation {
        let mut sim = PartitionSimulation::new(PartitionConfig {
            node_count: 5,
            quorum: scope,
        });
        assert!(sim.partition(&[ids(&["N0", "N1", "N2"]), ids(&["N3", "N4"])]));
        sim
    }

    #[test]
    fn test_partition_assignment() {
        let mut sim = PartitionSimulation::new(PartitionConfig::default());
        sim.partition(&[ids(&["N0"]), ids(&["N1", "N2"])]);
        assert_eq!(sim.partition_count(), 3);
        assert!(sim.can_reach(&id("N3"), &id("N4")));
        assert!(!sim.can_reach(&id("N0"), &id("N1")));
        assert!(!sim.partition(&[ids(&["N9"])]));
    }

    #[test]
    fn test_split_brain_with_partition_majority() {
        let mut sim = split(QuorumScope::PartitionMajority);
        sim.start_election(&id("N0"));
        sim.start_election(&id("N3"));
        sim.deliver_all();

        assert!(sim.is_split_brain());
        assert_eq!(sim.leaders().len(), 2);
        assert_eq!(sim.node(&id("N4")).unwrap().leader_id, Some(id("N3")));
    }

    #[test]
    fn test_cluster_majority_prevents_split_brain() {
        let mut sim = split(QuorumScope::ClusterMajority);
        sim.start_election(&id("N0"));
        sim.start_election(&id("N3"));
        sim.deliver_all();

        assert_eq!(sim.leaders(), vec![(id("N0"), 1)]);
        assert!(!sim.is_split_brain());
    }

    #[test]
    fn test_cross_partition_messages_fail() {
        let mut sim = split(QuorumScope::PartitionMajority);
        let sent = sim.context_mut().send(&id("N0"), &id("N3"), PartitionMessage::Heartbeat { term: 1 });
        sim.deliver(sent);
        assert_eq!(sim.stats().dropped_messages, 1);
        assert_eq!(sim.node(&id("N3")).unwrap().term, 0);
    }

    #[test]
    fn test_heal_keeps_highest_term() {
        let mut sim = split(QuorumScope::PartitionMajority);
        sim.start_election(&id("N0"));
        sim.deliver_all();
        sim.start_election(&id("N3"));
        sim.deliver_all();
        sim.start_election(&id("N3"));
        sim.deliver_all();
        assert!(sim.client_write(&id("N0"), "a"));
        assert!(sim.client_write(&id("N3"), "b"));
        assert!(!sim.client_write(&id("N1"), "c"));

        let report = sim.heal();
        assert_eq!(report.leader, Some(id("N3")));
        assert_eq!(report.term, 2);
        assert_eq!(report.stepped_down, vec![id("N0")]);
        assert_eq!(report.discarded_writes, 1);
        assert_eq!(sim.leaders(), vec![(id("N3"), 2)]);
        assert_eq!(sim.partition_count(), 1);
        assert!(sim.nodes().iter().all(|n| n.term == 2 && n.writes == vec!["b".to_string()]));
    }
}
