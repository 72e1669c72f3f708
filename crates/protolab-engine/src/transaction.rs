//! Protolab Two-Phase Commit
//!
//! Coordinator-driven atomic commitment. The coordinator collects one vote
//! per participant, decides commit only on a unanimous yes, and finishes once
//! every healthy participant acknowledged the decision. A coordinator that
//! fails after participants prepared leaves them blocked.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use protolab_common::config::{CommitConfig, DeliveryConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// Transaction ID
// =============================================================================

/// Identifier of one commit round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

// =============================================================================
// States
// =============================================================================

/// Coordinator side of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoordinatorState {
    #[default]
    Init,
    Preparing,
    Committing,
    Aborting,
    Committed,
    Aborted,
}

impl CoordinatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Participant side of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParticipantState {
    #[default]
    Init,
    Prepared,
    Committed,
    Aborted,
}

/// A participant's answer to the vote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantVote {
    Commit,
    Abort,
}

impl ParticipantVote {
    pub fn from_bool(commit: bool) -> Self {
        if commit {
            Self::Commit
        } else {
            Self::Abort
        }
    }
}

/// Result of asking a coordinator to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Waiting,
    Commit,
    Abort,
}

// =============================================================================
// Nodes
// =============================================================================

/// The transaction coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct Coordinator {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: CoordinatorState,
    pub transaction: Option<TransactionId>,
    pub votes: BTreeMap<NodeId, ParticipantVote>,
    pub acks: BTreeSet<NodeId>,
    pub started_at: Option<u64>,
}

impl Coordinator {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Healthy,
            state: CoordinatorState::Init,
            transaction: None,
            votes: BTreeMap::new(),
            acks: BTreeSet::new(),
            started_at: None,
        }
    }

    fn is_up(&self) -> bool {
        self.status.is_available()
    }
}

/// A resource manager taking part in the transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: ParticipantState,
    pub transaction: Option<TransactionId>,
    pub vote: Option<ParticipantVote>,
}

impl SimNode for Participant {
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
// Messages
// =============================================================================

/// Every message the two-phase commit simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TwoPhaseMessage {
    VoteRequest { transaction: TransactionId },
    Vote { transaction: TransactionId, vote: ParticipantVote },
    GlobalCommit { transaction: TransactionId },
    GlobalAbort { transaction: TransactionId },
    Ack { transaction: TransactionId },
}

impl Payload for TwoPhaseMessage {
    fn kind(&self) -> &'static str {
        match self {
            TwoPhaseMessage::VoteRequest { .. } => "VoteRequest",
            TwoPhaseMessage::Vote { .. } => "Vote",
            TwoPhaseMessage::GlobalCommit { .. } => "GlobalCommit",
            TwoPhaseMessage::GlobalAbort { .. } => "GlobalAbort",
            TwoPhaseMessage::Ack { .. } => "Ack",
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Summary of a two-phase commit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoPhaseStats {
    pub transaction: Option<TransactionId>,
    pub coordinator: CoordinatorState,
    pub coordinator_up: bool,
    pub participants: BTreeMap<NodeId, ParticipantState>,
    pub yes_votes: usize,
    pub no_votes: usize,
    pub acks: usize,
    pub blocked: usize,
    pub messages: MessageCounts,
}

// =============================================================================
// Two-Phase Commit Simulation
// =============================================================================

/// Coordinator `C` and participants `P0..`.
#[derive(Debug, Clone)]
pub struct TwoPhaseCommit {
    config: CommitConfig,
    coordinator: Coordinator,
    participants: Topology<Participant>,
    next_transaction: u64,
    ctx: SimContext<TwoPhaseMessage>,
}

impl TwoPhaseCommit {
    pub fn new(config: CommitConfig) -> Self {
        Self {
            participants: Self::build_participants(&config),
            coordinator: Coordinator::new(NodeId::new("C")),
            config,
            next_transaction: 0,
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

    pub(crate) fn build_participants(config: &CommitConfig) -> Topology<Participant> {
        Topology::new(
            node_ids("P", config.participants)
                .into_iter()
                .map(|id| Participant {
                    id,
                    status: NodeStatus::Healthy,
                    state: ParticipantState::Init,
                    transaction: None,
                    vote: None,
                })
                .collect(),
        )
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn participants(&self) -> &[Participant] {
        self.participants.as_slice()
    }

    pub fn participant(&self, id: &NodeId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Begin a new transaction; the coordinator must be up and idle.
    pub fn start_transaction(&mut self) -> Option<TransactionId> {
        let idle = matches!(self.coordinator.state, CoordinatorState::Init) || self.coordinator.state.is_terminal();
        if !self.coordinator.is_up() || !idle {
            self.ctx.log(
                "start_failed",
                "coordinator cannot start a transaction".to_string(),
                json!({ "state": self.coordinator.state, "status": self.coordinator.status }),
            );
            return None;
        }

        self.next_transaction += 1;
        let transaction = TransactionId(self.next_transaction);
        let now = self.ctx.now();
        let coordinator = &mut self.coordinator;
        coordinator.state = CoordinatorState::Preparing;
        coordinator.transaction = Some(transaction);
        coordinator.votes.clear();
        coordinator.acks.clear();
        coordinator.started_at = Some(now);
        for participant in self.participants.iter_mut() {
            participant.state = ParticipantState::Init;
            participant.transaction = None;
            participant.vote = None;
        }

        self.ctx.log(
            "transaction_started",
            format!("coordinator starts {}", transaction),
            json!({ "transaction": transaction }),
        );
        let from = self.coordinator.id.clone();
        let targets = self.participants.ids();
        self.ctx.broadcast(&from, &targets, TwoPhaseMessage::VoteRequest { transaction });
        Some(transaction)
    }

    /// A participant votes on the transaction it was asked about.
    pub fn participant_vote(&mut self, id: &NodeId, commit: bool) -> bool {
        let healthy = self.participants.is_healthy(id);
        let Some(participant) = self.participants.get_mut(id) else {
            return false;
        };
        let transaction = match participant.transaction {
            Some(tx) if healthy && participant.state == ParticipantState::Init => tx,
            _ => {
                self.ctx.log(
                    "vote_failed",
                    format!("{} cannot vote", id),
                    json!({ "participant": id, "commit": commit }),
                );
                return false;
            }
        };
        let vote = ParticipantVote::from_bool(commit);
        participant.vote = Some(vote);
        participant.state = if commit {
            ParticipantState::Prepared
        } else {
            ParticipantState::Aborted
        };

        self.ctx.log(
            "participant_voted",
            format!("{} votes {:?} on {}", id, vote, transaction),
            json!({ "participant": id, "vote": vote, "transaction": transaction }),
        );
        let coordinator = self.coordinator.id.clone();
        self.ctx.send(id, &coordinator, TwoPhaseMessage::Vote { transaction, vote });
        true
    }

    /// Decide once every healthy participant's vote has arrived.
    pub fn coordinator_decide(&mut self) -> Decision {
        match self.coordinator.state {
            CoordinatorState::Committing | CoordinatorState::Committed => return Decision::Commit,
            CoordinatorState::Aborting | CoordinatorState::Aborted => return Decision::Abort,
            CoordinatorState::Init => {
                self.ctx.log("decide_failed", "no transaction to decide".to_string(), json!({}));
                return Decision::Waiting;
            }
            CoordinatorState::Preparing => {}
        }
        if !self.coordinator.is_up() {
            self.ctx.log("decide_failed", "coordinator is down".to_string(), json!({}));
            return Decision::Waiting;
        }

        let healthy = self.participants.healthy_ids();
        let votes = &self.coordinator.votes;
        if healthy.iter().any(|id| !votes.contains_key(id)) {
            return Decision::Waiting;
        }
        let commit = healthy
            .iter()
            .all(|id| votes.get(id) == Some(&ParticipantVote::Commit));

        let decision = if commit { Decision::Commit } else { Decision::Abort };
        self.broadcast_decision(decision, &healthy);
        decision
    }

    fn broadcast_decision(&mut self, decision: Decision, targets: &[NodeId]) {
        let Some(transaction) = self.coordinator.transaction else {
            return;
        };
        let (state, payload) = match decision {
            Decision::Commit => (CoordinatorState::Committing, TwoPhaseMessage::GlobalCommit { transaction }),
            _ => (CoordinatorState::Aborting, TwoPhaseMessage::GlobalAbort { transaction }),
        };
        self.coordinator.state = state;

        tracing::info!(transaction = %transaction, decision = ?decision, "coordinator decided");
        self.ctx.log(
            "coordinator_decided",
            format!("coordinator decides {:?} for {}", decision, transaction),
            json!({ "transaction": transaction, "decision": decision }),
        );
        let from = self.coordinator.id.clone();
        self.ctx.broadcast(&from, targets, payload);
    }

    /// Finish the transaction once every healthy participant acknowledged.
    pub fn coordinator_complete(&mut self) -> bool {
        let final_state = match self.coordinator.state {
            CoordinatorState::Committing => CoordinatorState::Committed,
            CoordinatorState::Aborting => CoordinatorState::Aborted,
            _ => return false,
        };
        if !self.coordinator.is_up() {
            return false;
        }
        let acks = &self.coordinator.acks;
        if self.participants.healthy_ids().iter().any(|id| !acks.contains(id)) {
            return false;
        }
        self.coordinator.state = final_state;
        self.ctx.log(
            "transaction_completed",
            format!("transaction ends {:?}", final_state),
            json!({ "transaction": self.coordinator.transaction, "state": final_state }),
        );
        true
    }

    /// Abort a transaction stuck in the voting phase for longer than the
    /// configured timeout.
    pub fn check_timeout(&mut self) -> bool {
        if self.coordinator.state != CoordinatorState::Preparing || !self.coordinator.is_up() {
            return false;
        }
        let Some(started) = self.coordinator.started_at else {
            return false;
        };
        let elapsed = self.ctx.now().saturating_sub(started);
        if elapsed < self.config.timeout_ms {
            return false;
        }
        self.ctx.log(
            "transaction_timeout",
            format!("no decision after {}ms, aborting", elapsed),
            json!({ "elapsed_ms": elapsed, "timeout_ms": self.config.timeout_ms }),
        );
        let targets = self.participants.healthy_ids();
        self.broadcast_decision(Decision::Abort, &targets);
        true
    }

    /// Prepared participants stuck waiting on a failed coordinator.
    pub fn blocked_participants(&self) -> Vec<NodeId> {
        if self.coordinator.is_up() {
            return Vec::new();
        }
        self.participants
            .iter()
            .filter(|p| p.status.is_available() && p.state == ParticipantState::Prepared)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn fail_coordinator(&mut self) {
        self.coordinator.status = NodeStatus::Failed;
        tracing::warn!(state = ?self.coordinator.state, "coordinator failed");
        self.ctx.log(
            "coordinator_failed",
            "coordinator fails".to_string(),
            json!({ "state": self.coordinator.state }),
        );
    }

    pub fn recover_coordinator(&mut self) {
        self.coordinator.status = NodeStatus::Healthy;
        self.ctx.log(
            "coordinator_recovered",
            "coordinator recovers".to_string(),
            json!({ "state": self.coordinator.state }),
        );
    }

    pub fn fail_participant(&mut self, id: &NodeId) -> bool {
        if !self.participants.set_status(id, NodeStatus::Failed) {
            return false;
        }
        self.ctx.log("participant_failed", format!("{} fails", id), json!({ "participant": id }));
        true
    }

    pub fn recover_participant(&mut self, id: &NodeId) -> bool {
        if !self.participants.set_status(id, NodeStatus::Healthy) {
            return false;
        }
        self.ctx.log("participant_recovered", format!("{} recovers", id), json!({ "participant": id }));
        true
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    fn handle_vote_request(&mut self, id: &NodeId, transaction: TransactionId) {
        if self.coordinator.transaction != Some(transaction) {
            return;
        }
        if let Some(participant) = self.participants.get_mut(id) {
            participant.transaction = Some(transaction);
        }
    }

    fn handle_vote(&mut self, from: &NodeId, transaction: TransactionId, vote: ParticipantVote) {
        let coordinator = &mut self.coordinator;
        if coordinator.state != CoordinatorState::Preparing || coordinator.transaction != Some(transaction) {
            return;
        }
        coordinator.votes.insert(from.clone(), vote);
    }

    /// Apply a decision only for the participant's current transaction.
    fn handle_decision(&mut self, id: &NodeId, transaction: TransactionId, commit: bool) {
        if self.coordinator.transaction != Some(transaction) {
            return;
        }
        let Some(participant) = self.participants.get_mut(id) else {
            return;
        };
        if participant.transaction.is_some_and(|current| current != transaction) {
            return;
        }
        participant.transaction = Some(transaction);
        participant.state = if commit {
            ParticipantState::Committed
        } else {
            ParticipantState::Aborted
        };
        let state = participant.state;
        self.ctx.log(
            "participant_finalized",
            format!("{} is {:?}", id, state),
            json!({ "participant": id, "state": state, "transaction": transaction }),
        );
        let coordinator = self.coordinator.id.clone();
        self.ctx.send(id, &coordinator, TwoPhaseMessage::Ack { transaction });
    }

    fn handle_ack(&mut self, from: &NodeId, transaction: TransactionId) {
        if self.coordinator.transaction == Some(transaction) {
            self.coordinator.acks.insert(from.clone());
        }
    }
}

impl Simulation for TwoPhaseCommit {
    type Payload = TwoPhaseMessage;
    type Stats = TwoPhaseStats;

    fn context(&self) -> &SimContext<TwoPhaseMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<TwoPhaseMessage> {
        &mut self.ctx
    }

    fn deliver(&mut self, id: MessageId) {
        let coordinator = &self.coordinator;
        let participants = &self.participants;
        let up = |to: &NodeId| {
            if *to == coordinator.id {
                coordinator.is_up()
            } else {
                participants.is_healthy(to)
            }
        };
        let message = match self.ctx.begin_delivery(id, up) {
            Delivery::Delivered(message) => message,
            Delivery::Failed | Delivery::Skipped => return,
        };
        let (to, from) = (&message.to, &message.from);
        match message.payload {
            TwoPhaseMessage::VoteRequest { transaction } => self.handle_vote_request(to, transaction),
            TwoPhaseMessage::Vote { transaction, vote } => self.handle_vote(from, transaction, vote),
            TwoPhaseMessage::GlobalCommit { transaction } => self.handle_decision(to, transaction, true),
            TwoPhaseMessage::GlobalAbort { transaction } => self.handle_decision(to, transaction, false),
            TwoPhaseMessage::Ack { transaction } => self.handle_ack(from, transaction),
        }
    }

    fn stats(&self) -> TwoPhaseStats {
        let votes = self.coordinator.votes.values();
        let yes_votes = votes.clone().filter(|v| **v == ParticipantVote::Commit).count();
        TwoPhaseStats {
            transaction: self.coordinator.transaction,
            coordinator: self.coordinator.state,
            coordinator_up: self.coordinator.is_up(),
            participants: self.participants.iter().map(|p| (p.id.clone(), p.state)).collect(),
            yes_votes,
            no_votes: votes.count() - yes_votes,
            acks: self.coordinator.acks.len(),
            blocked: self.blocked_participants().len(),
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.coordinator = Coordinator::new(self.coordinator.id.clone());
        self.participants = Self::build_participants(&self.config);
        self.next_transaction = 0;
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

    fn two_pc() -> (TwoPhaseCommit, ManualClock) {
        let clock = ManualClock::new(0);
        let sim = TwoPhaseCommit::new(CommitConfig::default()).with_clock(clock.shared());
        (sim, clock)
    }

    fn vote_all(sim: &mut TwoPhaseCommit, votes: &[bool]) {
        for (i, commit) in votes.iter().enumerate() {
            assert!(sim.participant_vote(&NodeId::indexed("P", i), *commit));
        }
        sim.deliver_all();
    }

    #[test]
    fn test_decision_for_another_transaction_is_ignored() {
        let (mut sim, _clock) = two_pc();
        let current = sim.start_transaction().unwrap();
        sim.deliver_all();
        vote_all(&mut sim, &[true, true, true]);

        let coordinator = sim.coordinator().id.clone();
        let stale = TransactionId(current.0 + 7);
        sim.ctx.send(&coordinator, &id("P0"), TwoPhaseMessage::GlobalAbort { transaction: stale });
        sim.ctx.send(&coordinator, &id("P1"), TwoPhaseMessage::VoteRequest { transaction: stale });
        sim.deliver_all();

        let p0 = sim.participant(&id("P0")).unwrap();
        assert_eq!(p0.state, ParticipantState::Prepared);
        assert_eq!(p0.transaction, Some(current));
        assert_eq!(sim.participant(&id("P1")).unwrap().transaction, Some(current));
        assert!(sim.coordinator().acks.is_empty());

        assert_eq!(sim.coordinator_decide(), Decision::Commit);
        sim.deliver_all();
        assert!(sim.coordinator_complete());
    }

    #[test]
    fn test_unanimous_commit() {
        let (mut sim, _) = two_pc();
        let tx = sim.start_transaction().unwrap();
        assert_eq!(tx.to_string(), "tx1");
        sim.deliver_all();
        vote_all(&mut sim, &[true, true, true]);

        assert_eq!(sim.coordinator_decide(), Decision::Commit);
        assert!(!sim.coordinator_complete());
        sim.deliver_all();
        assert!(sim.coordinator_complete());
        assert_eq!(sim.coordinator().state, CoordinatorState::Committed);
        assert!(sim
            .participants()
            .iter()
            .all(|p| p.state == ParticipantState::Committed));
    }

    #[test]
    fn test_single_no_aborts() {
        let (mut sim, _) = two_pc();
        sim.start_transaction();
        sim.deliver_all();
        vote_all(&mut sim, &[true, false, true]);

        assert_eq!(sim.coordinator_decide(), Decision::Abort);
        sim.deliver_all();
        assert!(sim.coordinator_complete());
        assert_eq!(sim.coordinator().state, CoordinatorState::Aborted);
        assert!(sim.participants().iter().all(|p| p.state == ParticipantState::Aborted));
    }

    #[test]
    fn test_waits_for_undelivered_votes() {
        let (mut sim, _) = two_pc();
        sim.start_transaction();
        sim.deliver_all();
        for i in 0..3 {
            sim.participant_vote(&NodeId::indexed("P", i), true);
        }
        assert_eq!(sim.coordinator_decide(), Decision::Waiting);
        sim.deliver_all();
        assert_eq!(sim.coordinator_decide(), Decision::Commit);
        // Repeated decisions are stable.
        assert_eq!(sim.coordinator_decide(), Decision::Commit);
    }

    #[test]
    fn test_vote_requires_request() {
        let (mut sim, _) = two_pc();
        assert!(!sim.participant_vote(&id("P0"), true));
        sim.start_transaction();
        assert!(!sim.participant_vote(&id("P0"), true));
        sim.deliver_all();
        assert!(sim.participant_vote(&id("P0"), true));
        assert!(!sim.participant_vote(&id("P0"), false));
        assert!(sim.events().iter().any(|e| e.kind == "vote_failed"));
    }

    #[test]
    fn test_timeout_forces_abort() {
        let (mut sim, clock) = two_pc();
        sim.start_transaction();
        sim.deliver_all();
        sim.participant_vote(&id("P0"), true);
        sim.deliver_all();

        clock.advance(4999);
        assert!(!sim.check_timeout());
        clock.advance(1);
        assert!(sim.check_timeout());
        sim.deliver_all();
        assert_eq!(sim.coordinator_decide(), Decision::Abort);
        assert_eq!(sim.participant(&id("P0")).unwrap().state, ParticipantState::Aborted);
        assert!(sim.coordinator_complete());
    }

    #[test]
    fn test_coordinator_failure_blocks_prepared() {
        let (mut sim, _) = two_pc();
        sim.start_transaction();
        sim.deliver_all();
        vote_all(&mut sim, &[true, true, true]);
        sim.fail_coordinator();

        assert_eq!(sim.coordinator_decide(), Decision::Waiting);
        assert_eq!(sim.blocked_participants().len(), 3);
        assert_eq!(sim.stats().blocked, 3);

        sim.recover_coordinator();
        assert!(sim.blocked_participants().is_empty());
        assert_eq!(sim.coordinator_decide(), Decision::Commit);
    }

    #[test]
    fn test_failed_participant_excluded() {
        let (mut sim, _) = two_pc();
        sim.start_transaction();
        sim.fail_participant(&id("P2"));
        sim.deliver_all();
        sim.participant_vote(&id("P0"), true);
        sim.participant_vote(&id("P1"), true);
        sim.deliver_all();

        assert_eq!(sim.coordinator_decide(), Decision::Commit);
        sim.deliver_all();
        assert!(sim.coordinator_complete());
        assert_eq!(sim.participant(&id("P2")).unwrap().state, ParticipantState::Init);
    }

    #[test]
    fn test_new_transaction_after_completion() {
        let (mut sim, _) = two_pc();
        sim.start_transaction();
        assert!(sim.start_transaction().is_none());
        sim.deliver_all();
        vote_all(&mut sim, &[true, true, true]);
        sim.coordinator_decide();
        sim.deliver_all();
        sim.coordinator_complete();

        assert_eq!(sim.start_transaction(), Some(TransactionId(2)));
        assert_eq!(sim.stats().yes_votes, 0);

        sim.reset();
        assert_eq!(sim.start_transaction(), Some(TransactionId(1)));
    }
}
