//! Protolab Three-Phase Commit
//!
//! Non-blocking commitment: a pre-commit round between voting and commit
//! means every participant that saw a pre-commit knows the outcome, so a
//! participant timing out can finish on its own.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::SharedClock;
use crate::engine::{SimContext, Simulation};
use crate::message::{Delivery, MessageCounts, MessageId, Payload};
use crate::node::{node_ids, NodeId, NodeStatus};
use crate::topology::{SimNode, Topology};
use crate::transaction::{Decision, ParticipantVote, TransactionId};
use protolab_common::config::{CommitConfig, DeliveryConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// States
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreePhaseCoordinatorState {
    #[default]
    Init,
    Waiting,
    PreCommitted,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThreePhaseParticipantState {
    #[default]
    Init,
    Ready,
    PreCommitted,
    Committed,
    Aborted,
}

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ThreePhaseCoordinator {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: ThreePhaseCoordinatorState,
    pub transaction: Option<TransactionId>,
    pub votes: BTreeMap<NodeId, ParticipantVote>,
    pub pre_commit_acks: BTreeSet<NodeId>,
    pub commit_acks: BTreeSet<NodeId>,
}

impl ThreePhaseCoordinator {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Healthy,
            state: ThreePhaseCoordinatorState::Init,
            transaction: None,
            votes: BTreeMap::new(),
            pre_commit_acks: BTreeSet::new(),
            commit_acks: BTreeSet::new(),
        }
    }

    fn is_up(&self) -> bool {
        self.status.is_available()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreePhaseParticipant {
    pub id: NodeId,
    pub status: NodeStatus,
    pub state: ThreePhaseParticipantState,
    pub transaction: Option<TransactionId>,
}

impl SimNode for ThreePhaseParticipant {
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

/// Every message the three-phase commit simulator sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ThreePhaseMessage {
    CanCommit { transaction: TransactionId },
    Vote { transaction: TransactionId, vote: ParticipantVote },
    PreCommit { transaction: TransactionId },
    PreCommitAck { transaction: TransactionId },
    DoCommit { transaction: TransactionId },
    DoCommitAck { transaction: TransactionId },
    Abort { transaction: TransactionId },
}

impl Payload for ThreePhaseMessage {
    fn kind(&self) -> &'static str {
        match self {
            ThreePhaseMessage::CanCommit { .. } => "CanCommit",
            ThreePhaseMessage::Vote { .. } => "Vote",
            ThreePhaseMessage::PreCommit { .. } => "PreCommit",
            ThreePhaseMessage::PreCommitAck { .. } => "PreCommitAck",
            ThreePhaseMessage::DoCommit { .. } => "DoCommit",
            ThreePhaseMessage::DoCommitAck { .. } => "DoCommitAck",
            ThreePhaseMessage::Abort { .. } => "Abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreePhaseStats {
    pub transaction: Option<TransactionId>,
    pub coordinator: ThreePhaseCoordinatorState,
    pub coordinator_up: bool,
    pub participants: BTreeMap<NodeId, ThreePhaseParticipantState>,
    pub pre_commit_acks: usize,
    pub commit_acks: usize,
    pub completed: bool,
    pub messages: MessageCounts,
}

// =============================================================================
// Three-Phase Commit Simulation
// =============================================================================

/// Coordinator `C` and participants `P0..`; every phase is caller driven.
#[derive(Debug, Clone)]
pub struct ThreePhaseCommit {
    config: CommitConfig,
    coordinator: ThreePhaseCoordinator,
    participants: Topology<ThreePhaseParticipant>,
    next_transaction: u64,
    completed: bool,
    ctx: SimContext<ThreePhaseMessage>,
}

impl ThreePhaseCommit {
    pub fn new(config: CommitConfig) -> Self {
        Self {
            participants: Self::build_participants(&config),
            coordinator: ThreePhaseCoordinator::new(NodeId::new("C")),
            config,
            next_transaction: 0,
            completed: false,
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

    fn build_participants(config: &CommitConfig) -> Topology<ThreePhaseParticipant> {
        Topology::new(
            node_ids("P", config.participants)
                .into_iter()
                .map(|id| ThreePhaseParticipant {
                    id,
                    status: NodeStatus::Healthy,
                    state: ThreePhaseParticipantState::Init,
                    transaction: None,
                })
                .collect(),
        )
    }

    pub fn coordinator(&self) -> &ThreePhaseCoordinator {
        &self.coordinator
    }

    pub fn participants(&self) -> &[ThreePhaseParticipant] {
        self.participants.as_slice()
    }

    pub fn participant(&self, id: &NodeId) -> Option<&ThreePhaseParticipant> {
        self.participants.get(id)
    }

    fn coordinator_broadcast(&mut self, targets: &[NodeId], payload: ThreePhaseMessage) {
        let from = self.coordinator.id.clone();
        self.ctx.broadcast(&from, targets, payload);
    }

    pub fn start_transaction(&mut self) -> Option<TransactionId> {
        let idle = matches!(
            self.coordinator.state,
            ThreePhaseCoordinatorState::Init
                | ThreePhaseCoordinatorState::Committed
                | ThreePhaseCoordinatorState::Aborted
        );
        if !self.coordinator.is_up() || !idle {
            self.ctx.log(
                "start_failed",
                "coordinator cannot start a transaction".to_string(),
                json!({ "state": self.coordinator.state }),
            );
            return None;
        }
        self.next_transaction += 1;
        let transaction = TransactionId(self.next_transaction);
        let mut coordinator = ThreePhaseCoordinator::new(self.coordinator.id.clone());
        coordinator.state = ThreePhaseCoordinatorState::Waiting;
        coordinator.transaction = Some(transaction);
        self.coordinator = coordinator;
        self.completed = false;
        for participant in self.participants.iter_mut() {
            participant.state = ThreePhaseParticipantState::Init;
            participant.transaction = None;
        }

        self.ctx.log(
            "transaction_started",
            format!("coordinator asks can-commit for {}", transaction),
            json!({ "transaction": transaction }),
        );
        let targets = self.participants.ids();
        self.coordinator_broadcast(&targets, ThreePhaseMessage::CanCommit { transaction });
        Some(transaction)
    }

    pub fn participant_vote(&mut self, id: &NodeId, commit: bool) -> bool {
        let healthy = self.participants.is_healthy(id);
        let Some(participant) = self.participants.get_mut(id) else {
            return false;
        };
        let transaction = match participant.transaction {
            Some(tx) if healthy && participant.state == ThreePhaseParticipantState::Init => tx,
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
        participant.state = if commit {
            ThreePhaseParticipantState::Ready
        } else {
            ThreePhaseParticipantState::Aborted
        };
        self.ctx.log(
            "participant_voted",
            format!("{} votes {:?}", id, vote),
            json!({ "participant": id, "vote": vote, "transaction": transaction }),
        );
        let coordinator = self.coordinator.id.clone();
        self.ctx.send(id, &coordinator, ThreePhaseMessage::Vote { transaction, vote });
        true
    }

    /// Enter the pre-commit phase once every healthy participant voted yes;
    /// any no vote aborts.
    pub fn pre_commit(&mut self) -> Decision {
        match self.coordinator.state {
            ThreePhaseCoordinatorState::PreCommitted | ThreePhaseCoordinatorState::Committed => {
                return Decision::Commit
            }
            ThreePhaseCoordinatorState::Aborted => return Decision::Abort,
            ThreePhaseCoordinatorState::Init => {
                self.ctx.log("pre_commit_failed", "no transaction in progress".to_string(), json!({}));
                return Decision::Waiting;
            }
            ThreePhaseCoordinatorState::Waiting => {}
        }
        let Some(transaction) = self.coordinator.transaction.filter(|_| self.coordinator.is_up()) else {
            self.ctx.log("pre_commit_failed", "coordinator is down".to_string(), json!({}));
            return Decision::Waiting;
        };

        let healthy = self.participants.healthy_ids();
        let votes = &self.coordinator.votes;
        if healthy.iter().any(|id| !votes.contains_key(id)) {
            self.ctx.log(
                "pre_commit_failed",
                "votes are still outstanding".to_string(),
                json!({ "received": votes.len(), "expected": healthy.len() }),
            );
            return Decision::Waiting;
        }
        let commit = healthy
            .iter()
            .all(|id| votes.get(id) == Some(&ParticipantVote::Commit));

        if commit {
            self.coordinator.state = ThreePhaseCoordinatorState::PreCommitted;
            self.ctx.log(
                "pre_commit_sent",
                format!("coordinator pre-commits {}", transaction),
                json!({ "transaction": transaction }),
            );
            self.coordinator_broadcast(&healthy, ThreePhaseMessage::PreCommit { transaction });
            Decision::Commit
        } else {
            self.abort(transaction, &healthy);
            Decision::Abort
        }
    }

    fn abort(&mut self, transaction: TransactionId, targets: &[NodeId]) {
        self.coordinator.state = ThreePhaseCoordinatorState::Aborted;
        tracing::info!(transaction = %transaction, "three-phase commit aborted");
        self.ctx.log(
            "coordinator_aborted",
            format!("coordinator aborts {}", transaction),
            json!({ "transaction": transaction }),
        );
        self.coordinator_broadcast(targets, ThreePhaseMessage::Abort { transaction });
    }

    /// Send the final commit once every healthy participant acknowledged the
    /// pre-commit.
    pub fn do_commit(&mut self) -> bool {
        let ready = self.coordinator.state == ThreePhaseCoordinatorState::PreCommitted && self.coordinator.is_up();
        let healthy = self.participants.healthy_ids();
        let acked = healthy.iter().all(|id| self.coordinator.pre_commit_acks.contains(id));
        let transaction = match self.coordinator.transaction {
            Some(tx) if ready && acked => tx,
            _ => {
                self.ctx.log(
                    "do_commit_failed",
                    "pre-commit is not acknowledged by every participant".to_string(),
                    json!({ "acks": self.coordinator.pre_commit_acks.len(), "expected": healthy.len() }),
                );
                return false;
            }
        };
        self.coordinator.state = ThreePhaseCoordinatorState::Committed;
        tracing::info!(transaction = %transaction, "three-phase commit committed");
        self.ctx.log(
            "do_commit_sent",
            format!("coordinator commits {}", transaction),
            json!({ "transaction": transaction }),
        );
        self.coordinator_broadcast(&healthy, ThreePhaseMessage::DoCommit { transaction });
        true
    }

    /// True once the transaction reached its end: committed with every healthy
    /// participant's acknowledgement, or aborted.
    pub fn complete(&mut self) -> bool {
        let done = match self.coordinator.state {
            ThreePhaseCoordinatorState::Aborted => true,
            ThreePhaseCoordinatorState::Committed => {
                let acks = &self.coordinator.commit_acks;
                self.participants.healthy_ids().iter().all(|id| acks.contains(id))
            }
            _ => false,
        };
        if done && !self.completed {
            self.completed = true;
            self.ctx.log(
                "transaction_completed",
                format!("transaction ends {:?}", self.coordinator.state),
                json!({ "transaction": self.coordinator.transaction, "state": self.coordinator.state }),
            );
        }
        done
    }

    /// Termination rule for a participant that lost the coordinator: a
    /// pre-committed participant commits, anything earlier aborts.
    pub fn participant_timeout(&mut self, id: &NodeId) -> Option<ThreePhaseParticipantState> {
        let healthy = self.participants.is_healthy(id);
        let participant = self.participants.get_mut(id).filter(|_| healthy)?;
        let next = match participant.state {
            ThreePhaseParticipantState::PreCommitted => ThreePhaseParticipantState::Committed,
            ThreePhaseParticipantState::Init | ThreePhaseParticipantState::Ready => {
                ThreePhaseParticipantState::Aborted
            }
            terminal => return Some(terminal),
        };
        let previous = participant.state;
        participant.state = next;
        self.ctx.log(
            "participant_timeout",
            format!("{} times out in {:?} and moves to {:?}", id, previous, next),
            json!({ "participant": id, "from": previous, "to": next }),
        );
        Some(next)
    }

    pub fn fail_coordinator(&mut self) {
        self.coordinator.status = NodeStatus::Failed;
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

    fn participant_step(
        &mut self,
        id: &NodeId,
        transaction: TransactionId,
        from: &[ThreePhaseParticipantState],
        to: ThreePhaseParticipantState,
        ack: Option<ThreePhaseMessage>,
    ) {
        let Some(participant) = self.participants.get_mut(id) else {
            return;
        };
        if participant.transaction != Some(transaction) || !from.contains(&participant.state) {
            return;
        }
        participant.state = to;
        self.ctx.log(
            "participant_state",
            format!("{} moves to {:?}", id, to),
            json!({ "participant": id, "state": to, "transaction": transaction }),
        );
        if let Some(ack) = ack {
            let coordinator = self.coordinator.id.clone();
            self.ctx.send(id, &coordinator, ack);
        }
    }

    fn on_coordinator(&mut self, from: &NodeId, message: ThreePhaseMessage) {
        let coordinator = &mut self.coordinator;
        match message {
            ThreePhaseMessage::Vote { transaction, vote } => {
                if coordinator.transaction == Some(transaction)
                    && coordinator.state == ThreePhaseCoordinatorState::Waiting
                {
                    coordinator.votes.insert(from.clone(), vote);
                }
            }
            ThreePhaseMessage::PreCommitAck { transaction } => {
                if coordinator.transaction == Some(transaction) {
                    coordinator.pre_commit_acks.insert(from.clone());
                }
            }
            ThreePhaseMessage::DoCommitAck { transaction } => {
                if coordinator.transaction == Some(transaction) {
                    coordinator.commit_acks.insert(from.clone());
                }
            }
            _ => {}
        }
    }
}

impl Simulation for ThreePhaseCommit {
    type Payload = ThreePhaseMessage;
    type Stats = ThreePhaseStats;

    fn context(&self) -> &SimContext<ThreePhaseMessage> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut SimContext<ThreePhaseMessage> {
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
        use ThreePhaseParticipantState as S;
        let to = &message.to;
        match message.payload {
            ThreePhaseMessage::CanCommit { transaction } => {
                if self.coordinator.transaction != Some(transaction) {
                    return;
                }
                if let Some(participant) = self.participants.get_mut(to) {
                    participant.transaction = Some(transaction);
                }
            }
            ThreePhaseMessage::PreCommit { transaction } => self.participant_step(
                to,
                transaction,
                &[S::Ready],
                S::PreCommitted,
                Some(ThreePhaseMessage::PreCommitAck { transaction }),
            ),
            ThreePhaseMessage::DoCommit { transaction } => self.participant_step(
                to,
                transaction,
                &[S::PreCommitted, S::Committed],
                S::Committed,
                Some(ThreePhaseMessage::DoCommitAck { transaction }),
            ),
            ThreePhaseMessage::Abort { transaction } => {
                self.participant_step(to, transaction, &[S::Init, S::Ready, S::PreCommitted], S::Aborted, None)
            }
            payload => self.on_coordinator(&message.from, payload),
        }
    }

    fn stats(&self) -> ThreePhaseStats {
        ThreePhaseStats {
            transaction: self.coordinator.transaction,
            coordinator: self.coordinator.state,
            coordinator_up: self.coordinator.is_up(),
            participants: self.participants.iter().map(|p| (p.id.clone(), p.state)).collect(),
            pre_commit_acks: self.coordinator.pre_commit_acks.len(),
            commit_acks: self.coordinator.commit_acks.len(),
            completed: self.completed,
            messages: self.ctx.network.status_counts(),
        }
    }

    fn reset(&mut self) {
        self.coordinator = ThreePhaseCoordinator::new(self.coordinator.id.clone());
        self.participants = Self::build_participants(&self.config);
        self.next_transaction = 0;
        self.completed = false;
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

    fn started() -> ThreePhaseCommit {
        let mut sim = ThreePhaseCommit::new(CommitConfig::default());
        sim.start_transaction();
        sim.deliver_all();
        sim
    }

    fn vote_all(sim: &mut ThreePhaseCommit, commit: bool) {
        for i in 0..3 {
            sim.participant_vote(&NodeId::indexed("P", i), commit);
        }
        sim.deliver_all();
    }

    fn all_in(sim: &ThreePhaseCommit, state: ThreePhaseParticipantState) -> bool {
        sim.participants().iter().all(|p| p.state == state)
    }

    #[test]
    fn test_full_commit() {
        let mut sim = started();
        vote_all(&mut sim, true);

        assert_eq!(sim.pre_commit(), Decision::Commit);
        assert!(!sim.do_commit());
        sim.deliver_all();
        assert!(all_in(&sim, ThreePhaseParticipantState::PreCommitted));

        assert!(sim.do_commit());
        assert!(!sim.complete());
        sim.deliver_all();
        assert!(sim.complete());
        assert!(all_in(&sim, ThreePhaseParticipantState::Committed));
        assert!(sim.stats().completed);
    }

    #[test]
    fn test_no_vote_aborts() {
        let mut sim = started();
        sim.participant_vote(&id("P0"), true);
        sim.participant_vote(&id("P1"), false);
        sim.participant_vote(&id("P2"), true);
        sim.deliver_all();

        assert_eq!(sim.pre_commit(), Decision::Abort);
        sim.deliver_all();
        assert!(sim.complete());
        assert!(all_in(&sim, ThreePhaseParticipantState::Aborted));
    }

    #[test]
    fn test_pre_commit_waits_for_votes() {
        let mut sim = started();
        sim.participant_vote(&id("P0"), true);
        sim.deliver_all();
        assert_eq!(sim.pre_commit(), Decision::Waiting);
        assert!(sim.events().iter().any(|e| e.kind == "pre_commit_failed"));
    }

    #[test]
    fn test_timeout_after_pre_commit_commits() {
        let mut sim = started();
        vote_all(&mut sim, true);
        sim.pre_commit();
        sim.deliver_all();
        sim.fail_coordinator();

        for i in 0..3 {
            assert_eq!(
                sim.participant_timeout(&NodeId::indexed("P", i)),
                Some(ThreePhaseParticipantState::Committed)
            );
        }
        assert!(all_in(&sim, ThreePhaseParticipantState::Committed));
    }

    #[test]
    fn test_timeout_before_pre_commit_aborts() {
        let mut sim = started();
        vote_all(&mut sim, true);
        sim.fail_coordinator();

        assert_eq!(
            sim.participant_timeout(&id("P0")),
            Some(ThreePhaseParticipantState::Aborted)
        );
        sim.fail_participant(&id("P1"));
        assert_eq!(sim.participant_timeout(&id("P1")), None);
        assert_eq!(sim.participant_timeout(&id("nope")), None);
    }

    #[test]
    fn test_mixed_timeout_outcomes() {
        let mut sim = started();
        vote_all(&mut sim, true);
        sim.pre_commit();
        // Only P0 receives the pre-commit before the coordinator fails.
        let first = sim.in_flight()[0];
        sim.deliver(first);
        sim.fail_coordinator();

        assert_eq!(
            sim.participant_timeout(&id("P0")),
            Some(ThreePhaseParticipantState::Committed)
        );
        assert_eq!(
            sim.participant_timeout(&id("P1")),
            Some(ThreePhaseParticipantState::Aborted)
        );
    }
}
