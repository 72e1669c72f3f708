//! Protolab Paxos
//!
//! Single-decree Paxos with separate proposer, acceptor and learner nodes.
//! Proposal numbers are `round * 10 + proposer_index`, so two proposers never
//! share a number and a later round always outranks an earlier one.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{majority, SimNode, Topology};
use protolab_common::config::{DeliveryConfig, PaxosConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub type ProposalNumber = u64;

/// Multiplier separating the round from the proposer index.
pub const ROUND_STRIDE: u64 = 10;

/// Proposal number for a proposer's round.
pub fn proposal_number(round: u64, proposer_index: usize) -> ProposalNumber {
    round * ROUND_STRIDE + proposer_index as u64
}

// =============================================================================
// Roles
// =============================================================================

/// Role of a Paxos node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosRole {
    Proposer,
    Acceptor,
    Learner,
}

/// A value an acceptor has accepted, with the proposal that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedProposal {
    pub number: ProposalNumber,
    pub value: String,
}

/// Proposer bookkeeping for its current proposal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProposerState {
    pub index: usize,
    pub round: u64,
    pub proposal: Option<ProposalNumber>,
    pub own_value: Option<String>,
    /// Acceptor id to the proposal it reported in its promise.
    pub promises: BTreeMap<NodeId, Option<AcceptedProposal>>,
    pub accept_value: Option<String>,
    /// Highest proposal number seen in a rejection.
    pub highest_seen: ProposalNumber,
}

/// Acceptor promise and accepted proposal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcceptorState {
    pub promised: ProposalNumber,
    pub accepted: Option<AcceptedProposal>,
}

/// Learner view of what each acceptor reported accepting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LearnerState {
    pub reports: BTreeMap<NodeId, AcceptedProposal>,
    pub learned: Option<String>,
}

/// Role-specific state of a node.
#[derive(Debug, Clone, Serialize)]
pub enum RoleState {
    Proposer(ProposerState),
    Acceptor(AcceptorState),
    Learner(LearnerState),
}

// =============================================================================
// Paxos Node
// =============================================================================

/// A node in the Paxos deployment.
#[derive(Debug, Clone, Serialize)]
pub struct PaxosNode {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: RoleState,
}

impl PaxosNode {
    pub fn role(&self) -> PaxosRole {
        match self.state {
            RoleState::Proposer(_) => PaxosRole::Proposer,
            RoleState::Acceptor(_) => PaxosRole::Acceptor,
            RoleState::Learner(_) => PaxosRole::Learner,
        }
    }

    pub fn as_proposer(&self) -> Option<&ProposerState> {
        match &self.state {
            RoleState::Proposer(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_acceptor(&self) -> Option<&AcceptorState> {
        match &self.state {
            RoleState::Acceptor(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_learner(&self) -> Option<&LearnerState> {
        match &self.state {
            RoleState::Learner(l) => Some(l),
            _ => None,
        }
    }
}

impl SimNode for PaxosNode {
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
// Paxos Messages
// =============================================================================

/// Every message the Paxos simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PaxosMessage {
    Prepare {
        number: ProposalNumber,
    },
    Promise {
        number: ProposalNumber,
        accepted: Option<AcceptedProposal>,
    },
    Nack {
        number: ProposalNumber,
        promised: ProposalNumber,
    },
    Accept {
        number: ProposalNumber,
        value: String,
    },
    Accepted {
        number: ProposalNumber,
        value: String,
    },
}

impl Payload for PaxosMessage {
    fn kind(&self) -> &'static str {
        match self {
            PaxosMessage::Prepare { .. } => "Prepare",
            PaxosMessage::Promise { .. } => "Promise",
            PaxosMessage::Nack { .. } => "Nack",
            PaxosMessage::Accept { .. } => "Accept",
            PaxosMessage::Accepted { .. } => "Accepted",
        }
    }
}

// =============================================================================
// Paxos Statistics
// =============================================================================

/// Summary of a Paxos run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaxosStats {
    pub proposers: usize,
    pub acceptors: usize,
    pub learners: usize,
    pub proposals: usize,
    pub promises: usize,
    pub rejections: usize,
    pub decided_value: Option<String>,
    pub messages: MessageCounts,
}

// =============================================================================
// Paxos Simulation
// =============================================================================

/// Proposers `P<i>`, acceptors `A<i>`, learners `L<i>` exchanging messages.
#[derive(Debug, Clone)]
pub struct PaxosSimulation {
    config: PaxosConfig,
    nodes: Topology<PaxosNode>,
    decided: Option<AcceptedProposal>,
    ctx: SimContext<PaxosMessage>,
}

impl PaxosSimulation {
    pub fn new(config: PaxosConfig) -> Self {
        Self {
            nodes: Self::build_nodes(&config),
            config,
            decided: None,
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

    fn build_nodes(config: &PaxosConfig) -> Topology<PaxosNode> {
        let node = |id: NodeId, state: RoleState| PaxosNode {
            id,
            status: NodeStatus::Healthy,
            state,
        };
        let proposers = node_ids("P", config.proposers).into_iter().enumerate().map(|(i, id)| {
            node(
                id,
                RoleState::Proposer(ProposerState {
                    index: i,
                    ..Default::default()
                }),
            )
        });
        let acceptors = node_ids("A", config.acceptors)
            .into_iter()
            .map(|id| node(id, RoleState::Acceptor(AcceptorState::default())));
        let learners = node_ids("L", config.learners)
            .into_iter()
            .map(|id| node(id, RoleState::Learner(LearnerState::default())));
        Topology::new(proposers.chain(acceptors).chain(learners).collect())
    }

    pub fn nodes(&self) -> &[PaxosNode] {
        self.nodes.as_slice()
    }

    pub fn node(&self, id: &NodeId) -> Option<&PaxosNode> {
        self.nodes.get(id)
    }

    fn with_role(&self, role: PaxosRole) -> Vec<&PaxosNode> {
        self.nodes.iter().filter(|n| n.role() == role).collect()
    }

    pub fn proposers(&self) -> Vec<&PaxosNode> {
        self.with_role(PaxosRole::Proposer)
    }

    pub fn acceptors(&self) -> Vec<&PaxosNode> {
        self.with_role(PaxosRole::Acceptor)
    }

    pub fn learners(&self) -> Vec<&PaxosNode> {
        self.with_role(PaxosRole::Learner)
    }

    fn ids_with_role(&self, role: PaxosRole) -> Vec<NodeId> {
        self.with_role(role).into_iter().map(|n| n.id.clone()).collect()
    }

    /// Value chosen by a majority of acceptors, once known. Never changes.
    pub fn decided_value(&self) -> Option<&str> {
        self.decided.as_ref().map(|d| d.value.as_str())
    }

    pub fn decided_proposal(&self) -> Option<&AcceptedProposal> {
        self.decided.as_ref()
    }

    fn acceptor_quorum(&self) -> usize {
        majority(self.config.acceptors)
    }

    // -------------------------------------------------------------------------
    // Phase 1
    // -------------------------------------------------------------------------

    /// Start a new proposal from `proposer`. Returns its proposal number.
    pub fn start_proposal(
        &mut self,
        proposer: &NodeId,
        value: impl Into<String>,
    ) -> Option<ProposalNumber> {
        let value = value.into();
        let healthy = self.nodes.is_healthy(proposer);
        let number = match self.nodes.get_mut(proposer) {
            Some(PaxosNode {
                state: RoleState::Proposer(p),
                ..
            }) if healthy => {
                let seen_round = p.highest_seen / ROUND_STRIDE;
                p.round = (p.round + 1).max(seen_round + 1);
                let number = proposal_number(p.round, p.index);
                p.proposal = Some(number);
                p.own_value = Some(value.clone());
                p.promises.clear();
                p.accept_value = None;
                number
            }
            _ => {
                self.ctx.log(
                    "proposal_failed",
                    format!("{} cannot propose '{}'", proposer, value),
                    json!({ "proposer": proposer, "value": value }),
                );
                return None;
            }
        };

        self.ctx.log(
            "proposal_started",
            format!("{} prepares proposal {} for '{}'", proposer, number, value),
            json!({ "proposer": proposer, "number": number, "value": value }),
        );
        let acceptors = self.ids_with_role(PaxosRole::Acceptor);
        self.ctx.broadcast(proposer, &acceptors, PaxosMessage::Prepare { number });
        Some(number)
    }

    fn handle_prepare(&mut self, acceptor: &NodeId, proposer: &NodeId, number: ProposalNumber) {
        let Some(PaxosNode {
            state: RoleState::Acceptor(a),
            ..
        }) = self.nodes.get_mut(acceptor)
        else {
            return;
        };

        if number > a.promised {
            a.promised = number;
            let accepted = a.accepted.clone();
            self.ctx.log(
                "promise_made",
                format!("{} promises proposal {}", acceptor, number),
                json!({ "acceptor": acceptor, "number": number, "accepted": accepted }),
            );
            self.ctx.send(acceptor, proposer, PaxosMessage::Promise { number, accepted });
        } else {
            let promised = a.promised;
            self.ctx.log(
                "prepare_rejected",
                format!("{} rejects proposal {}, already promised {}", acceptor, number, promised),
                json!({ "acceptor": acceptor, "number": number, "promised": promised }),
            );
            self.ctx.send(acceptor, proposer, PaxosMessage::Nack { number, promised });
        }
    }

    fn handle_promise(
        &mut self,
        proposer: &NodeId,
        acceptor: &NodeId,
        number: ProposalNumber,
        accepted: Option<AcceptedProposal>,
    ) {
        let quorum = self.acceptor_quorum();
        let Some(PaxosNode {
            state: RoleState::Proposer(p),
            ..
        }) = self.nodes.get_mut(proposer)
        else {
            return;
        };
        if p.proposal != Some(number) || p.accept_value.is_some() {
            return;
        }

        p.promises.insert(acceptor.clone(), accepted);
        if p.promises.len() < quorum {
            let count = p.promises.len();
            self.ctx.log(
                "promise_received",
                format!("{} has {} of {} promises for {}", proposer, count, quorum, number),
                json!({ "proposer": proposer, "number": number, "promises": count }),
            );
            return;
        }

        // The highest-numbered accepted proposal among the promises wins.
        let prior = p
            .promises
            .values()
            .flatten()
            .max_by_key(|a| a.number)
            .map(|a| a.value.clone());
        let adopted = prior.is_some();
        let Some(value) = prior.or_else(|| p.own_value.clone()) else {
            return;
        };
        p.accept_value = Some(value.clone());

        self.ctx.log(
            "accept_sent",
            format!("{} asks acceptors to accept '{}' under {}", proposer, value, number),
            json!({ "proposer": proposer, "number": number, "value": value, "adopted": adopted }),
        );
        let acceptors = self.ids_with_role(PaxosRole::Acceptor);
        self.ctx.broadcast(proposer, &acceptors, PaxosMessage::Accept { number, value });
    }

    fn handle_nack(&mut self, proposer: &NodeId, number: ProposalNumber, promised: ProposalNumber) {
        let Some(PaxosNode {
            state: RoleState::Proposer(p),
            ..
        }) = self.nodes.get_mut(proposer)
        else {
            return;
        };
        p.highest_seen = p.highest_seen.max(promised);
        self.ctx.log(
            "proposal_rejected",
            format!("{} learns proposal {} was outranked by {}", proposer, number, promised),
            json!({ "proposer": proposer, "number": number, "promised": promised }),
        );
    }

    // -------------------------------------------------------------------------
    // Phase 2
    // -------------------------------------------------------------------------

    fn handle_accept(
        &mut self,
        acceptor: &NodeId,
        proposer: &NodeId,
        number: ProposalNumber,
        value: String,
    ) {
        let Some(PaxosNode {
            state: RoleState::Acceptor(a),
            ..
        }) = self.nodes.get_mut(acceptor)
        else {
            return;
        };

        if number < a.promised {
            let promised = a.promised;
            self.ctx.log(
                "accept_rejected",
                format!("{} refuses '{}' under {}, promised {}", acceptor, value, number, promised),
                json!({ "acceptor": acceptor, "number": number, "promised": promised }),
            );
            self.ctx.send(acceptor, proposer, PaxosMessage::Nack { number, promised });
            return;
        }

        a.promised = number;
        a.accepted = Some(AcceptedProposal {
            number,
            value: value.clone(),
        });
        self.ctx.log(
            "value_accepted",
            format!("{} accepts '{}' under {}", acceptor, value, number),
            json!({ "acceptor": acceptor, "number": number, "value": value }),
        );
        let learners = self.ids_with_role(PaxosRole::Learner);
        self.ctx.broadcast(acceptor, &learners, PaxosMessage::Accepted { number, value });
        self.check_for_decision();
    }

    fn handle_accepted(
        &mut self,
        learner: &NodeId,
        acceptor: &NodeId,
        number: ProposalNumber,
        value: String,
    ) {
        let quorum = self.acceptor_quorum();
        let Some(PaxosNode {
            state: RoleState::Learner(l),
            ..
        }) = self.nodes.get_mut(learner)
        else {
            return;
        };
        l.reports.insert(
            acceptor.clone(),
            AcceptedProposal {
                number,
                value: value.clone(),
            },
        );
        if l.learned.is_some() {
            return;
        }
        let agreeing = l.reports.values().filter(|r| r.number == number).count();
        if agreeing >= quorum {
            l.learned = Some(value.clone());
            self.ctx.log(
                "value_learned",
                format!("{} learns '{}'", learner, value),
                json!({ "learner": learner, "number": number, "value": value }),
            );
        }
    }

    /// Record a decision the first time a majority of acceptors hold the same
    /// accepted proposal. Acceptances are tallied by proposal number, not by
    /// value: one number carries exactly one value, so matching numbers imply
    /// matching values, while equal values under different numbers do not
    /// form a majority. A decision is never revised.
    pub fn check_for_decision(&mut self) -> Option<&str> {
        if self.decided.is_none() {
            let quorum = self.acceptor_quorum();
            let mut tally: BTreeMap<ProposalNumber, (usize, &AcceptedProposal)> = BTreeMap::new();
            for node in self.nodes.iter() {
                if let Some(accepted) = node.as_acceptor().and_then(|a| a.accepted.as_ref()) {
                    tally.entry(accepted.number).or_insert((0, accepted)).0 += 1;
                }
            }
            let chosen = tally
                .into_values()
                .find(|(count, _)| *count >= quorum)
                .map(|(_, proposal)| proposal.clone());

            if let Some(proposal) = chosen {
                tracing::info!(value = %proposal.value, number = proposal.number, "paxos value decided");
                self.ctx.log(
                    "value_decided",
                    format!("'{}' is chosen under proposal {}", proposal.value, proposal.number),
                    json!({ "number": proposal.number, "value": proposal.value }),
                );
                self.decided = Some(proposal);
            }
        }
        self.decided_value()
    }

    // -------------------------------------------------------------------------
    // Failures
    // -------------------------------------------------------------------------

    /// Crash a node; acceptor promises and accepted values survive.
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

impl Simulation for PaxosSimulation {
    type Payload = PaxosMessage;
    type Stats = PaxosStats;

    fn context(&self) -> &SimContext<PaxosMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<PaxosMessage> {
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
            PaxosMessage::Prepare { number } => self.handle_prepare(to, from, number),
            PaxosMessage::Promise { number, accepted } => {
                self.handle_promise(to, from, number, accepted)
            }
            PaxosMessage::Nack { number, promised } => self.handle_nack(to, number, promised),
            PaxosMessage::Accept { number, value } => self.handle_accept(to, from, number, value),
            PaxosMessage::Accepted { number, value } => {
                self.handle_accepted(to, from, number, value)
            }
        }
    }

    fn stats(&self) -> PaxosStats {
        let events = &self.ctx.events;
        PaxosStats {
            proposers: self.config.proposers,
            acceptors: self.config.acceptors,
            learners: self.config.learners,
            proposals: events.count_of("proposal_started"),
            promises: events.count_of("promise_made"),
            rejections: events.count_of("prepare_rejected") + events.count_of("accept_rejected"),
            decided_value: self.decided_value().map(str::to_string),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.nodes = Self::build_nodes(&self.config);
        self.decided = None;
        self.ctx.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
