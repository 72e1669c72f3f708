//! Protolab Raft Consensus
//!
//! Simulated Raft cluster: leader election by term-numbered votes and log
//! replication through AppendEntries. Every RPC travels as a message and takes
//! effect only when delivered.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{majority, SimNode, Topology};
use protolab_common::config::{DeliveryConfig, RaftConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};

pub type Term = u64;
pub type LogIndex = u64;

// =============================================================================
// Node Role
// =============================================================================

/// Role of a node in the Raft cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeRole {
    /// Follower node that replicates from leader.
    #[default]
    Follower,
    /// Candidate node during leader election.
    Candidate,
    /// Leader node that handles writes.
    Leader,
}

// =============================================================================
// Log Entry
// =============================================================================

/// A command stamped with the term of the leader that appended it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: String,
}

// =============================================================================
// Vote Request/Response
// =============================================================================

/// Request for a vote during leader election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

// =============================================================================
// Append Entries Request/Response
// =============================================================================

/// Request to append entries to the log. Empty entries make a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// Response to an append entries request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

/// Every message the Raft simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RaftMessage {
    RequestVote(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendResponse(AppendEntriesResponse),
}

impl Payload for RaftMessage {
    fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) => "RequestVote",
            RaftMessage::VoteResponse(_) => "VoteResponse",
            RaftMessage::AppendEntries(_) => "AppendEntries",
            RaftMessage::AppendResponse(_) => "AppendResponse",
        }
    }
}

// =============================================================================
// Raft Node
// =============================================================================

/// A node in the Raft cluster.
#[derive(Debug, Clone, Serialize)]
pub struct RaftNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
    pub commit_index: LogIndex,
    pub leader_id: Option<NodeId>,
    pub votes_received: BTreeSet<NodeId>,
    /// Highest log index known to be replicated on each node; leader only.
    pub match_index: HashMap<NodeId, LogIndex>,
}

impl RaftNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Healthy,
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            leader_id: None,
            votes_received: BTreeSet::new(),
            match_index: HashMap::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; zero for index zero or past the end.
    pub fn term_at(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        self.log.get(index as usize - 1).map(|e| e.term).unwrap_or(0)
    }

    pub fn committed_entries(&self) -> &[LogEntry] {
        let end = (self.commit_index as usize).min(self.log.len());
        &self.log[..end]
    }

    fn step_down(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = NodeRole::Follower;
        self.votes_received.clear();
        self.match_index.clear();
    }
}

impl SimNode for RaftNode {
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
// Raft Statistics
// =============================================================================

/// Summary of a Raft run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftStats {
    pub nodes: usize,
    pub healthy: usize,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub elections: usize,
    pub log_length: LogIndex,
    pub commit_index: LogIndex,
    pub messages: MessageCounts,
}

// =============================================================================
// Raft Simulation
// =============================================================================

/// A whole Raft cluster driven message by message.
#[derive(Debug, Clone)]
pub struct RaftSimulation {
    config: RaftConfig,
    nodes: Topology<RaftNode>,
    ctx: SimContext<RaftMessage>,
}

impl RaftSimulation {
    /// Nodes are named `S0`, `S1`, ...
    pub fn new(config: RaftConfig) -> Self {
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

    fn build_nodes(config: &RaftConfig) -> Topology<RaftNode> {
        Topology::new(node_ids("S", config.node_count).into_iter().map(RaftNode::new).collect())
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn nodes(&self) -> &[RaftNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&RaftNode> {
        self.nodes.get(id)
    }

    /// The healthy leader with the highest term.
    pub fn leader(&self) -> Option<&RaftNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader() && n.status.is_available())
            .max_by_key(|n| n.current_term)
    }

    /// Leaders per term across the whole history of the run.
    pub fn leaders_by_term(&self) -> HashMap<Term, Vec<NodeId>> {
        let mut by_term: HashMap<Term, Vec<NodeId>> = HashMap::new();
        for event in self.ctx.events.of_kind("leader_elected") {
            let term = event.data["term"].as_u64().unwrap_or(0);
            if let Some(id) = event.data["leader"].as_str() {
                by_term.entry(term).or_default().push(NodeId::new(id));
            }
        }
        by_term
    }

    // -------------------------------------------------------------------------
    // Election
    // -------------------------------------------------------------------------

    /// Begin an election with `candidate` as the candidate.
    pub fn start_election(&mut self, candidate: &NodeId) -> bool {
        if !self.nodes.is_healthy(candidate) {
            self.ctx.log(
                "election_failed",
                format!("{} cannot start an election", candidate),
                json!({ "candidate": candidate }),
            );
            return false;
        }

        let request = {
            let Some(node) = self.nodes.get_mut(candidate) else {
                return false;
            };
            node.role = NodeRole::Candidate;
            node.current_term += 1;
            node.voted_for = Some(candidate.clone());
            node.leader_id = None;
            node.votes_received.clear();
            node.votes_received.insert(candidate.clone());
            VoteRequest {
                term: node.current_term,
                candidate_id: candidate.clone(),
                last_log_index: node.last_log_index(),
                last_log_term: node.last_log_term(),
            }
        };

        self.ctx.log(
            "election_started",
            format!("{} starts an election for term {}", candidate, request.term),
            json!({ "candidate": candidate, "term": request.term }),
        );

        let peers = self.nodes.peers_of(candidate);
        self.ctx.broadcast(candidate, &peers, RaftMessage::RequestVote(request.clone()));

        // A single-node cluster wins on its own vote.
        self.maybe_become_leader(candidate, request.term);
        true
    }

    fn handle_request_vote(&mut self, voter: &NodeId, request: VoteRequest) {
        let Some(node) = self.nodes.get_mut(voter) else {
            return;
        };

        if request.term > node.current_term {
            node.step_down(request.term);
            node.leader_id = None;
        }

        let vote_granted = request.term >= node.current_term
            && (node.voted_for.is_none() || node.voted_for.as_ref() == Some(&request.candidate_id));
        if vote_granted {
            node.voted_for = Some(request.candidate_id.clone());
        }
        let response = VoteResponse {
            term: node.current_term,
            vote_granted,
        };

        let (kind, verb) = if vote_granted {
            ("vote_granted", "grants")
        } else {
            ("vote_denied", "denies")
        };
        self.ctx.log(
            kind,
            format!("{} {} its vote to {} for term {}", voter, verb, request.candidate_id, request.term),
            json!({ "voter": voter, "candidate": request.candidate_id, "term": response.term }),
        );
        self.ctx.send(voter, &request.candidate_id, RaftMessage::VoteResponse(response));
    }

    fn handle_vote_response(&mut self, candidate: &NodeId, voter: &NodeId, response: VoteResponse) {
        let Some(node) = self.nodes.get_mut(candidate) else {
            return;
        };

        if response.term > node.current_term {
            let old_role = node.role;
            node.step_down(response.term);
            node.leader_id = None;
            self.ctx.log(
                "stepped_down",
                format!("{} sees term {} and steps down from {:?}", candidate, response.term, old_role),
                json!({ "node": candidate, "term": response.term }),
            );
            return;
        }

        if node.role != NodeRole::Candidate || response.term != node.current_term {
            self.ctx.log(
                "vote_ignored",
                format!("{} ignores a stale vote from {}", candidate, voter),
                json!({ "node": candidate, "voter": voter }),
            );
            return;
        }

        if !response.vote_granted {
            self.ctx.log(
                "vote_rejected",
                format!("{} was refused a vote by {}", candidate, voter),
                json!({ "node": candidate, "voter": voter, "term": response.term }),
            );
            return;
        }

        node.votes_received.insert(voter.clone());
        let term = node.current_term;
        let votes = node.votes_received.len();
        if !self.maybe_become_leader(candidate, term) {
            self.ctx.log(
                "vote_counted",
                format!("{} has {} of {} votes needed", candidate, votes, majority(self.nodes.len())),
                json!({ "node": candidate, "votes": votes, "term": term }),
            );
        }
    }

    /// Promote `candidate` once it holds votes from a majority of all
    /// configured nodes, failed ones included.
    fn maybe_become_leader(&mut self, candidate: &NodeId, term: Term) -> bool {
        let needed = majority(self.nodes.len());
        let last_index = {
            let Some(node) = self.nodes.get_mut(candidate) else {
                return false;
            };
            if node.role != NodeRole::Candidate
                || node.current_term != term
                || node.votes_received.len() < needed
            {
                return false;
            }
            node.role = NodeRole::Leader;
            node.leader_id = Some(candidate.clone());
            node.last_log_index()
        };

        let ids = self.nodes.ids();
        if let Some(node) = self.nodes.get_mut(candidate) {
            node.match_index = ids.iter().map(|id| (id.clone(), 0)).collect();
            node.match_index.insert(candidate.clone(), last_index);
        }
        for node in self.nodes.iter_mut() {
            if node.id != *candidate && node.status.is_available() {
                node.role = NodeRole::Follower;
                node.votes_received.clear();
                node.leader_id = Some(candidate.clone());
            }
        }

        tracing::info!(leader = %candidate, term, "raft leader elected");
        self.ctx.log(
            "leader_elected",
            format!("{} becomes leader for term {}", candidate, term),
            json!({ "leader": candidate, "term": term }),
        );
        true
    }

    // -------------------------------------------------------------------------
    // Replication
    // -------------------------------------------------------------------------

    /// Append a command at the leader and replicate it.
    pub fn client_request(&mut self, command: impl Into<String>) -> Option<LogIndex> {
        let command = command.into();
        let Some(leader_id) = self.leader().map(|l| l.id.clone()) else {
            self.ctx.log(
                "client_request_failed",
                format!("no leader to accept '{}'", command),
                json!({ "command": command }),
            );
            return None;
        };

        let (index, term) = {
            let leader = self.nodes.get_mut(&leader_id)?;
            let index = leader.last_log_index() + 1;
            let term = leader.current_term;
            leader.log.push(LogEntry {
                index,
                term,
                command: command.clone(),
            });
            leader.match_index.insert(leader_id.clone(), index);
            (index, term)
        };

        self.ctx.log(
            "entry_appended",
            format!("{} appends '{}' at index {} in term {}", leader_id, command, index, term),
            json!({ "leader": leader_id, "index": index, "term": term, "command": command }),
        );
        self.replicate_from(&leader_id);
        // A single-node cluster commits immediately.
        self.advance_commit_index(&leader_id);
        Some(index)
    }

    /// Leader sends an AppendEntries to every follower.
    pub fn heartbeat(&mut self) -> bool {
        let Some(leader_id) = self.leader().map(|l| l.id.clone()) else {
            self.ctx.log("heartbeat_failed", "no leader to send heartbeats", json!({}));
            return false;
        };
        let term = self.nodes.get(&leader_id).map(|l| l.current_term).unwrap_or(0);
        self.ctx.log(
            "heartbeat",
            format!("{} sends heartbeats for term {}", leader_id, term),
            json!({ "leader": leader_id, "term": term }),
        );
        self.replicate_from(&leader_id);
        true
    }

    /// Each follower receives the entries after the index it last confirmed.
    fn replicate_from(&mut self, leader_id: &NodeId) {
        let Some(leader) = self.nodes.get(leader_id) else {
            return;
        };
        let requests: Vec<(NodeId, AppendEntriesRequest)> = self
            .nodes
            .peers_of(leader_id)
            .into_iter()
            .map(|peer| {
                let matched = leader.match_index.get(&peer).copied().unwrap_or(0);
                let request = AppendEntriesRequest {
                    term: leader.current_term,
                    leader_id: leader_id.clone(),
                    prev_log_index: matched,
                    prev_log_term: leader.term_at(matched),
                    entries: leader
                        .log
                        .get(matched as usize..)
                        .map(|rest| rest.to_vec())
                        .unwrap_or_default(),
                    leader_commit: leader.commit_index,
                };
                (peer, request)
            })
            .collect();

        for (peer, request) in requests {
            self.ctx.send(leader_id, &peer, RaftMessage::AppendEntries(request));
        }
    }

    fn handle_append_entries(&mut self, follower: &NodeId, request: AppendEntriesRequest) {
        let Some(node) = self.nodes.get_mut(follower) else {
            return;
        };

        if request.term < node.current_term {
            let response = AppendEntriesResponse {
                term: node.current_term,
                success: false,
                match_index: 0,
            };
            self.ctx.log(
                "append_rejected",
                format!("{} rejects AppendEntries from stale term {}", follower, request.term),
                json!({ "node": follower, "term": request.term, "current_term": response.term }),
            );
            self.ctx.send(follower, &request.leader_id, RaftMessage::AppendResponse(response));
            return;
        }

        node.step_down(request.term);
        node.leader_id = Some(request.leader_id.clone());

        for entry in &request.entries {
            let slot = entry.index as usize;
            if node.log.len() >= slot {
                if node.log[slot - 1].term != entry.term {
                    node.log.truncate(slot - 1);
                    node.log.push(entry.clone());
                }
            } else if node.log.len() + 1 == slot {
                node.log.push(entry.clone());
            } else {
                break;
            }
        }

        let covered = request.prev_log_index + request.entries.len() as LogIndex;
        let match_index = covered.min(node.last_log_index());
        let new_commit = request.leader_commit.min(node.last_log_index());
        if new_commit > node.commit_index {
            node.commit_index = new_commit;
        }
        let response = AppendEntriesResponse {
            term: node.current_term,
            success: true,
            match_index,
        };

        if request.entries.is_empty() {
            self.ctx.log(
                "heartbeat_received",
                format!("{} accepts heartbeat from {}", follower, request.leader_id),
                json!({ "node": follower, "leader": request.leader_id, "commit_index": node.commit_index }),
            );
        } else {
            self.ctx.log(
                "entries_appended",
                format!(
                    "{} stores {} entries from {} up to index {}",
                    follower,
                    request.entries.len(),
                    request.leader_id,
                    match_index
                ),
                json!({ "node": follower, "leader": request.leader_id, "match_index": match_index }),
            );
        }
        self.ctx.send(follower, &request.leader_id, RaftMessage::AppendResponse(response));
    }

    fn handle_append_response(
        &mut self,
        leader_id: &NodeId,
        follower: &NodeId,
        response: AppendEntriesResponse,
    ) {
        let Some(node) = self.nodes.get_mut(leader_id) else {
            return;
        };

        if response.term > node.current_term {
            node.step_down(response.term);
            node.leader_id = None;
            self.ctx.log(
                "stepped_down",
                format!("{} learns of term {} and steps down", leader_id, response.term),
                json!({ "node": leader_id, "term": response.term }),
            );
            return;
        }

        if !node.is_leader() || !response.success {
            return;
        }

        let entry = node.match_index.entry(follower.clone()).or_insert(0);
        if response.match_index > *entry {
            *entry = response.match_index;
        }
        self.advance_commit_index(leader_id);
    }

    /// Commit the highest current-term index stored on a majority.
    fn advance_commit_index(&mut self, leader_id: &NodeId) {
        let needed = majority(self.nodes.len());
        let Some(leader) = self.nodes.get_mut(leader_id) else {
            return;
        };
        let mut new_commit = leader.commit_index;
        for index in (leader.commit_index + 1..=leader.last_log_index()).rev() {
            if leader.term_at(index) != leader.current_term {
                continue;
            }
            let replicas = leader.match_index.values().filter(|&&m| m >= index).count();
            if replicas >= needed {
                new_commit = index;
                break;
            }
        }
        if new_commit > leader.commit_index {
            leader.commit_index = new_commit;
            tracing::info!(leader = %leader_id, commit_index = new_commit, "raft entries committed");
            self.ctx.log(
                "entry_committed",
                format!("{} commits through index {}", leader_id, new_commit),
                json!({ "leader": leader_id, "commit_index": new_commit }),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------------

    /// Crash a node; its term and log survive.
    pub fn fail_node(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        node.status = NodeStatus::Failed;
        node.role = NodeRole::Follower;
        node.votes_received.clear();
        node.match_index.clear();
        self.ctx.log(
            "node_failed",
            format!("{} fails", id),
            json!({ "node": id, "term": node.current_term }),
        );
        true
    }

    /// Restart a crashed node as a follower.
    pub fn recover_node(&mut self, id: &NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.status != NodeStatus::Failed {
            return false;
        }
        node.status = NodeStatus::Healthy;
        self.ctx.log(
            "node_recovered",
            format!("{} recovers as a follower", id),
            json!({ "node": id, "term": node.current_term }),
        );
        true
    }
}

impl Simulation for RaftSimulation {
    type Payload = RaftMessage;
    type Stats = RaftStats;

    fn context(&self) -> &SimContext<RaftMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<RaftMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let nodes = &self.nodes;
        let message = match self.ctx.begin_delivery(id, |to| nodes.is_healthy(to)) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        match message.payload {
            RaftMessage::RequestVote(request) => self.handle_request_vote(&message.to, request),
            RaftMessage::VoteResponse(response) => {
                self.handle_vote_response(&message.to, &message.from, response)
            }
            RaftMessage::AppendEntries(request) => self.handle_append_entries(&message.to, request),
            RaftMessage::AppendResponse(response) => {
                self.handle_append_response(&message.to, &message.from, response)
            }
        }
    }

    fn stats(&self) -> RaftStats {
        let leader = self.leader();
        RaftStats {
            nodes: self.nodes.len(),
            healthy: self.nodes.healthy_count(),
            term: self.nodes.iter().map(|n| n.current_term).max().unwrap_or(0),
            leader: leader.map(|l| l.id.clone()),
            elections: self.ctx.events.count_of("election_started"),
            log_length: leader.map(|l| l.last_log_index()).unwrap_or(0),
            commit_index: leader.map(|l| l.commit_index).unwrap_or(0),
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
